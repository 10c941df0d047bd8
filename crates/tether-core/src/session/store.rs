//! Session store
//!
//! Owns every session. The map itself sits behind a `parking_lot` lock that is
//! only held long enough to clone out a handle; each session then has its own
//! async mutex, so appends and prunes on one session are serialized while
//! unrelated sessions proceed in parallel.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::model::{
    ChannelKind, Message, Session, SessionContext, SessionId, SessionInfo, SessionLimits,
    SessionStatus,
};
use crate::{CoreError, Result};

type SessionHandle = Arc<Mutex<Session>>;

/// Result of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendOutcome {
    pub current_tokens: u32,
    pub token_budget: u32,
    pub target_tokens: u32,
}

/// What a single sweep pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub idled: Vec<SessionId>,
    pub closed: Vec<SessionId>,
    /// Sessions skipped because a writer held their lock
    pub busy: usize,
}

/// Session store - handles all sessions
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    defaults: SessionLimits,
}

impl SessionStore {
    pub fn new(defaults: SessionLimits) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    pub fn defaults(&self) -> SessionLimits {
        self.defaults
    }

    /// Create a new session with a generated id
    pub fn create(&self, owner_id: impl Into<String>, channel_kind: ChannelKind) -> SessionId {
        let session = Session::new(owner_id, channel_kind, self.defaults);
        let id = session.id.clone();
        self.sessions
            .write()
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        tracing::info!("Session created: {}", id);
        id
    }

    /// Return the session with this id, creating it on first contact
    pub fn get_or_create(
        &self,
        id: &SessionId,
        owner_id: impl Into<String>,
        channel_kind: ChannelKind,
    ) -> (SessionId, bool) {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(id) {
            return (id.clone(), false);
        }
        let session = Session::with_id(id.clone(), owner_id, channel_kind, self.defaults);
        sessions.insert(id.clone(), Arc::new(Mutex::new(session)));
        tracing::info!("Session created on first contact: {}", id);
        (id.clone(), true)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    fn handle(&self, id: &SessionId) -> Result<SessionHandle> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownSession(id.to_string()))
    }

    /// Take the single-writer lock for a session
    pub async fn lock(&self, id: &SessionId) -> Result<OwnedMutexGuard<Session>> {
        let handle = self.handle(id)?;
        Ok(handle.lock_owned().await)
    }

    /// Append a message to a session's log
    pub async fn append(&self, id: &SessionId, message: Message) -> Result<AppendOutcome> {
        let mut session = self.lock(id).await?;
        let current_tokens = session.append(message)?;
        tracing::debug!(
            "Appended to {}: {} / {} tokens",
            id,
            current_tokens,
            session.limits.token_budget
        );
        Ok(AppendOutcome {
            current_tokens,
            token_budget: session.limits.token_budget,
            target_tokens: session.limits.target_tokens,
        })
    }

    /// Summaries first, then live messages
    pub async fn get_context(&self, id: &SessionId) -> Result<SessionContext> {
        let session = self.lock(id).await?;
        Ok(session.context())
    }

    /// Close a session. Closing twice is harmless.
    pub async fn close(&self, id: &SessionId) -> Result<()> {
        let mut session = self.lock(id).await?;
        if !session.is_closed() {
            session.close();
            tracing::info!("Session closed: {}", id);
        }
        Ok(())
    }

    /// Cloned snapshot of a session
    pub async fn snapshot(&self, id: &SessionId) -> Result<Session> {
        let session = self.lock(id).await?;
        Ok(session.clone())
    }

    pub async fn info(&self, id: &SessionId) -> Result<SessionInfo> {
        let session = self.lock(id).await?;
        Ok(session.info())
    }

    /// Run the idle/lifetime sweep with the current time
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    /// Transition quiet sessions to idle and close those past their lifetime.
    ///
    /// Sessions whose lock is held by a writer are skipped; they are active by
    /// definition and will be looked at again next pass.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let handles: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let mut report = SweepReport::default();
        for (id, handle) in handles {
            let Ok(mut session) = handle.try_lock() else {
                tracing::debug!("Sweep skipped busy session {}", id);
                report.busy += 1;
                continue;
            };

            if session.is_expired_at(now) {
                session.close();
                tracing::info!("Session closed after exceeding max lifetime: {}", id);
                report.closed.push(id);
            } else if session.is_idle_at(now) {
                session.mark_idle();
                tracing::debug!("Session idle: {}", id);
                report.idled.push(id);
            }
        }
        report
    }

    /// Ids of sessions currently in the given status
    pub fn ids_with_status(&self, status: SessionStatus) -> Vec<SessionId> {
        let handles: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();
        handles
            .into_iter()
            .filter(|(_, handle)| {
                handle
                    .try_lock()
                    .map(|s| s.status == status)
                    .unwrap_or(status == SessionStatus::Active)
            })
            .map(|(id, _)| id)
            .collect()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionLimits::default())
    }
}
