//! Node registry
//!
//! Remote endpoints, their capability sets and heartbeat liveness. Each node
//! record sits behind its own lock inside a read-mostly map, so a capability
//! lookup never waits on another node's heartbeat.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::transport::LinkId;
use crate::{GatewayError, Result};

/// Unique node identifier, always namespaced as `node:<name>`. Ids read off
/// the wire are namespaced the same way, so `desk` and `node:desk` are one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(format!("node:{}", Uuid::new_v4()))
    }

    /// Accepts both `node:phone-1` and `phone-1`
    pub fn from_str(s: &str) -> Self {
        if s.starts_with("node:") {
            Self(s.to_string())
        } else {
            Self(format!("node:{}", s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self::from_str(&s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Mobile,
    Desktop,
    Tablet,
    Browser,
    Iot,
    Server,
}

/// Named ability a node advertises, e.g. `screen_capture`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(pub String);

impl Capability {
    pub const SCREEN_CAPTURE: &'static str = "screen_capture";
    pub const POINTER: &'static str = "pointer";
    pub const KEYBOARD: &'static str = "keyboard";
    pub const CLIPBOARD: &'static str = "clipboard";
    pub const FILESYSTEM: &'static str = "filesystem";
    pub const BROWSER: &'static str = "browser";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness derived from heartbeat age
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// What a node sends to register itself
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    /// Stable id chosen by the node; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl NodeDescriptor {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind,
            platform: String::new(),
            capabilities: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(Capability::new(capability));
        self
    }
}

/// A registered remote endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub platform: String,
    pub capabilities: BTreeSet<Capability>,
    pub status: NodeStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Link the node registered over
    #[serde(skip)]
    pub link: Option<LinkId>,
}

impl Node {
    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c.as_str() == capability)
    }
}

/// What a liveness sweep changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSweepReport {
    pub went_offline: Vec<NodeId>,
}

fn capability_set(capabilities: Vec<Capability>) -> Result<BTreeSet<Capability>> {
    let set: BTreeSet<Capability> = capabilities
        .into_iter()
        .map(|c| Capability::new(c.0.trim()))
        .filter(|c| !c.0.is_empty())
        .collect();
    if set.is_empty() {
        return Err(GatewayError::InvalidDescriptor(
            "at least one capability is required".to_string(),
        ));
    }
    Ok(set)
}

/// Node registry
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Arc<Mutex<Node>>>>,
    by_link: RwLock<HashMap<LinkId, HashSet<NodeId>>>,
    heartbeat_timeout: Duration,
}

impl NodeRegistry {
    pub fn new(heartbeat_timeout_ms: u64) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            by_link: RwLock::new(HashMap::new()),
            heartbeat_timeout: Duration::milliseconds(heartbeat_timeout_ms as i64),
        }
    }

    fn handle(&self, id: &NodeId) -> Result<Arc<Mutex<Node>>> {
        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownNode(id.to_string()))
    }

    /// Register a node. Registration counts as the first heartbeat.
    /// Re-registering an existing id replaces its record.
    pub fn register(&self, descriptor: NodeDescriptor, link: Option<LinkId>) -> Result<Node> {
        if descriptor.name.trim().is_empty() {
            return Err(GatewayError::InvalidDescriptor("name is required".to_string()));
        }
        let capabilities = capability_set(descriptor.capabilities)?;

        let now = Utc::now();
        let node = Node {
            id: descriptor
                .id
                .as_deref()
                .map(NodeId::from_str)
                .unwrap_or_default(),
            name: descriptor.name,
            kind: descriptor.kind,
            platform: descriptor.platform,
            capabilities,
            status: NodeStatus::Online,
            registered_at: now,
            last_heartbeat_at: now,
            metadata: descriptor.metadata,
            link: link.clone(),
        };

        let previous = self
            .nodes
            .write()
            .insert(node.id.clone(), Arc::new(Mutex::new(node.clone())));
        if let Some(previous) = previous {
            if let Some(old_link) = previous.lock().link.clone() {
                self.unlink(&old_link, &node.id);
            }
        }
        if let Some(link) = link {
            self.by_link
                .write()
                .entry(link)
                .or_default()
                .insert(node.id.clone());
        }

        tracing::info!(
            "Node registered: {} ({:?}, {} capabilities)",
            node.id,
            node.kind,
            node.capabilities.len()
        );
        Ok(node)
    }

    fn unlink(&self, link: &LinkId, id: &NodeId) {
        let mut by_link = self.by_link.write();
        if let Some(ids) = by_link.get_mut(link) {
            ids.remove(id);
            if ids.is_empty() {
                by_link.remove(link);
            }
        }
    }

    /// Record a heartbeat, merging any metadata patch
    pub fn heartbeat(
        &self,
        id: &NodeId,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Node> {
        self.heartbeat_from(id, metadata, None)
    }

    /// Heartbeat received over `link`. A node whose link closed is rebound to
    /// the link it now speaks on.
    pub fn heartbeat_from(
        &self,
        id: &NodeId,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
        link: Option<LinkId>,
    ) -> Result<Node> {
        let handle = self.handle(id)?;
        let mut node = handle.lock();
        if let (None, Some(link)) = (&node.link, link) {
            self.by_link
                .write()
                .entry(link.clone())
                .or_default()
                .insert(id.clone());
            node.link = Some(link);
        }
        node.last_heartbeat_at = Utc::now();
        if node.status == NodeStatus::Offline {
            node.status = NodeStatus::Online;
            tracing::info!("Node back online: {}", id);
        }
        if let Some(patch) = metadata {
            node.metadata.extend(patch);
        }
        Ok(node.clone())
    }

    /// Replace a node's capability set
    pub fn update_capabilities(&self, id: &NodeId, capabilities: Vec<Capability>) -> Result<Node> {
        let capabilities = capability_set(capabilities)?;
        let handle = self.handle(id)?;
        let mut node = handle.lock();
        node.capabilities = capabilities;
        tracing::info!("Node {} capabilities updated: {:?}", id, node.capabilities);
        Ok(node.clone())
    }

    /// Remove a node. Removing an unknown node is not an error.
    pub fn deregister(&self, id: &NodeId) -> Option<Node> {
        let removed = self.nodes.write().remove(id)?;
        let node = removed.lock().clone();
        if let Some(link) = &node.link {
            self.unlink(link, id);
        }
        tracing::info!("Node deregistered: {}", id);
        Some(node)
    }

    /// Online nodes advertising `capability`, ordered by id
    pub fn find_by_capability(&self, capability: &str) -> Vec<Node> {
        let handles: Vec<Arc<Mutex<Node>>> = self.nodes.read().values().cloned().collect();
        let mut found: Vec<Node> = handles
            .iter()
            .filter_map(|h| {
                let node = h.lock();
                (node.is_online() && node.has_capability(capability)).then(|| node.clone())
            })
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.nodes.read().get(id).map(|h| h.lock().clone())
    }

    /// Link a node is reachable over
    pub fn link_of(&self, id: &NodeId) -> Option<LinkId> {
        self.nodes.read().get(id).and_then(|h| h.lock().link.clone())
    }

    /// Mark every node registered over `link` offline
    pub fn mark_link_offline(&self, link: &LinkId) -> Vec<NodeId> {
        let ids: Vec<NodeId> = self
            .by_link
            .write()
            .remove(link)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default();

        let mut marked = Vec::new();
        for id in ids {
            let Ok(handle) = self.handle(&id) else {
                continue;
            };
            let mut node = handle.lock();
            node.link = None;
            if node.status == NodeStatus::Online {
                node.status = NodeStatus::Offline;
                tracing::info!("Node offline after link close: {}", id);
            }
            marked.push(id);
        }
        marked
    }

    pub fn sweep(&self) -> NodeSweepReport {
        self.sweep_at(Utc::now())
    }

    /// Mark nodes whose last heartbeat is older than the timeout offline.
    /// Only a heartbeat brings a node back online.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> NodeSweepReport {
        let handles: Vec<Arc<Mutex<Node>>> = self.nodes.read().values().cloned().collect();
        let mut report = NodeSweepReport::default();
        for handle in handles {
            let mut node = handle.lock();
            if node.status == NodeStatus::Online && now - node.last_heartbeat_at > self.heartbeat_timeout {
                node.status = NodeStatus::Offline;
                tracing::warn!(
                    "Node {} missed heartbeats, last seen {}",
                    node.id,
                    node.last_heartbeat_at
                );
                report.went_offline.push(node.id.clone());
            }
        }
        report
    }

    pub fn nodes(&self) -> Vec<Node> {
        let handles: Vec<Arc<Mutex<Node>>> = self.nodes.read().values().cloned().collect();
        let mut nodes: Vec<Node> = handles.iter().map(|h| h.lock().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// (online, offline)
    pub fn counts(&self) -> (usize, usize) {
        let nodes = self.nodes();
        let online = nodes.iter().filter(|n| n.is_online()).count();
        (online, nodes.len() - online)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}
