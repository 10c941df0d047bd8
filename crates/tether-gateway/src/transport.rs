//! Link transport
//!
//! Tracks open links and moves frames in and out of them. Inbound frames and
//! disconnects are published on a single [`TransportEvent`] channel; the
//! holder of the receiver is the only demultiplexer. No retries and no
//! business semantics live here.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::frame::Frame;
use crate::{GatewayError, Result};

/// Outbound buffer per link
const LINK_BUFFER: usize = 256;

/// Unique link identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(pub String);

impl LinkId {
    pub fn new() -> Self {
        Self(format!("link:{}", Uuid::new_v4()))
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of an open link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    pub id: LinkId,
    /// Already-authenticated principal handed over at upgrade time
    pub principal: Option<String>,
    pub opened_at: DateTime<Utc>,
}

/// Something that happened on a link
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A parsed inbound frame
    Frame { link: LinkId, frame: Frame },
    /// The link closed. Published exactly once per link.
    Disconnected { link: LinkId },
}

struct Link {
    info: LinkInfo,
    tx: mpsc::Sender<String>,
}

/// Transport - owns the set of open links
pub struct Transport {
    links: RwLock<HashMap<LinkId, Link>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
    /// Create a transport and the one receiver for its events
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            links: RwLock::new(HashMap::new()),
            events,
        };
        (transport, rx)
    }

    /// Register a new link. The returned receiver feeds the link's writer loop
    /// and ends once the link is closed.
    pub fn open(&self, principal: Option<String>) -> (LinkId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        let info = LinkInfo {
            id: LinkId::new(),
            principal,
            opened_at: Utc::now(),
        };
        let id = info.id.clone();
        self.links.write().insert(id.clone(), Link { info, tx });
        tracing::info!("Link opened: {}", id);
        (id, rx)
    }

    /// Hand an inbound frame to the demultiplexer
    pub fn receive(&self, link: &LinkId, frame: Frame) -> Result<()> {
        if !self.is_open(link) {
            return Err(GatewayError::LinkUnavailable(link.to_string()));
        }
        tracing::debug!("<- {} {}", link, frame.frame_type);
        self.events
            .send(TransportEvent::Frame {
                link: link.clone(),
                frame,
            })
            .map_err(|_| GatewayError::Internal("transport event receiver dropped".to_string()))
    }

    /// Send a frame on one link
    pub async fn send(&self, link: &LinkId, frame: &Frame) -> Result<()> {
        let tx = self
            .links
            .read()
            .get(link)
            .map(|l| l.tx.clone())
            .ok_or_else(|| GatewayError::LinkUnavailable(link.to_string()))?;

        let text = frame.to_text()?;
        tracing::debug!("-> {} {}", link, frame.frame_type);
        if tx.send(text).await.is_err() {
            // writer loop is gone; the link is dead even if nobody noticed yet
            self.close(link);
            return Err(GatewayError::LinkUnavailable(link.to_string()));
        }
        Ok(())
    }

    /// Queue a frame without waiting for buffer space. A full buffer drops
    /// the frame; a link whose writer is gone is closed.
    pub fn try_send(&self, link: &LinkId, frame: &Frame) -> Result<()> {
        let tx = self
            .links
            .read()
            .get(link)
            .map(|l| l.tx.clone())
            .ok_or_else(|| GatewayError::LinkUnavailable(link.to_string()))?;

        let text = frame.to_text()?;
        tracing::debug!("-> {} {}", link, frame.frame_type);
        match tx.try_send(text) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Outbound buffer full on {}, dropped {}", link, frame.frame_type);
                Err(GatewayError::LinkUnavailable(link.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close(link);
                Err(GatewayError::LinkUnavailable(link.to_string()))
            }
        }
    }

    /// Send a frame to every open link matching `predicate`.
    /// Returns the number of links that accepted it.
    pub async fn broadcast<F>(&self, frame: &Frame, predicate: F) -> usize
    where
        F: Fn(&LinkInfo) -> bool,
    {
        let targets: Vec<LinkId> = self
            .links
            .read()
            .values()
            .filter(|l| predicate(&l.info))
            .map(|l| l.info.id.clone())
            .collect();

        let mut delivered = 0;
        for link in targets {
            match self.send(&link, frame).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!("Broadcast skipped {}: {}", link, e),
            }
        }
        delivered
    }

    /// Close a link. Returns false if it was already closed, in which case no
    /// second disconnect event is published.
    pub fn close(&self, link: &LinkId) -> bool {
        let removed = self.links.write().remove(link);
        if removed.is_none() {
            return false;
        }
        tracing::info!("Link closed: {}", link);
        let _ = self.events.send(TransportEvent::Disconnected { link: link.clone() });
        true
    }

    /// Close every link
    pub fn close_all(&self) -> usize {
        let ids: Vec<LinkId> = self.links.read().keys().cloned().collect();
        ids.iter().filter(|id| self.close(id)).count()
    }

    pub fn is_open(&self, link: &LinkId) -> bool {
        self.links.read().contains_key(link)
    }

    pub fn info(&self, link: &LinkId) -> Option<LinkInfo> {
        self.links.read().get(link).map(|l| l.info.clone())
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.links.read().values().map(|l| l.info.clone()).collect()
    }

    pub fn link_count(&self) -> usize {
        self.links.read().len()
    }
}
