//! Command router
//!
//! Resolves a command's target to a link, sends it, and waits for the
//! correlated `command.ack`. Each attempt has its own timeout; unacknowledged
//! commands are re-sent up to `maxRetries` times before settling `timed_out`.
//! Destructive kinds are parked until confirmed, rejected, or expired.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use tether_core::session::SessionId;

use crate::command::{Command, CommandRequest, CommandStatus, CommandTarget, DispatchOutcome};
use crate::config::CommandSettings;
use crate::frame::{AckPayload, Frame, FrameType};
use crate::nodes::{Node, NodeId, NodeRegistry};
use crate::transport::{LinkId, Transport};
use crate::{GatewayError, Result};

/// How one node is picked among several eligible for a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Always the eligible node with the smallest id
    #[default]
    LowestId,
    /// Rotate through eligible nodes in id order
    RoundRobin,
}

impl SelectionPolicy {
    /// `candidates` must already be sorted by id
    pub fn pick<'a>(&self, candidates: &'a [Node], cursor: &AtomicUsize) -> Option<&'a Node> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            SelectionPolicy::LowestId => candidates.first(),
            SelectionPolicy::RoundRobin => {
                let turn = cursor.fetch_add(1, Ordering::Relaxed);
                candidates.get(turn % candidates.len())
            }
        }
    }
}

/// How an in-flight command was answered
#[derive(Debug)]
enum Reply {
    Ack(serde_json::Value),
    Error(String),
    LinkClosed,
}

struct InFlight {
    command: Command,
    reply: Option<oneshot::Sender<Reply>>,
}

/// A command parked for confirmation and its expiry timer
struct Parked {
    command: Command,
    expiry: AbortHandle,
}

struct RouterInner {
    transport: Arc<Transport>,
    nodes: Arc<NodeRegistry>,
    settings: CommandSettings,
    in_flight: Mutex<HashMap<String, InFlight>>,
    awaiting: Mutex<HashMap<String, Parked>>,
    history: Mutex<VecDeque<Command>>,
    session_links: RwLock<HashMap<SessionId, LinkId>>,
    cursor: AtomicUsize,
}

/// Command router - cheap to clone, all clones share state
#[derive(Clone)]
pub struct CommandRouter {
    inner: Arc<RouterInner>,
}

impl CommandRouter {
    pub fn new(transport: Arc<Transport>, nodes: Arc<NodeRegistry>, settings: CommandSettings) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                transport,
                nodes,
                settings,
                in_flight: Mutex::new(HashMap::new()),
                awaiting: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                session_links: RwLock::new(HashMap::new()),
                cursor: AtomicUsize::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &CommandSettings {
        &self.inner.settings
    }

    /// Route `session:<id>` targets to this link
    pub fn bind_session(&self, session: &SessionId, link: &LinkId) {
        let previous = self
            .inner
            .session_links
            .write()
            .insert(session.clone(), link.clone());
        if previous.as_ref() != Some(link) {
            tracing::debug!("Session {} bound to {}", session, link);
        }
    }

    pub fn session_link(&self, session: &SessionId) -> Option<LinkId> {
        self.inner.session_links.read().get(session).cloned()
    }

    /// Dispatch a command and wait for its outcome.
    ///
    /// Destructive kinds return [`DispatchOutcome::AwaitingConfirmation`]
    /// straight away; everything else resolves once the target acks, fails,
    /// disconnects, or runs out of retries.
    pub async fn dispatch(&self, request: CommandRequest, origin: Option<LinkId>) -> Result<DispatchOutcome> {
        let mut command = Command::from_request(request, origin);
        if self.status(&command.id).is_some() {
            return Err(GatewayError::InvalidFrame(format!(
                "command id {} already in use",
                command.id
            )));
        }

        if !command.kind.requires_confirmation() {
            return self.run(command).await.map(DispatchOutcome::Completed);
        }

        // surface an unroutable command now rather than after confirmation
        if let Err(e) = self.resolve(&command) {
            return Err(self.settle(command, CommandStatus::Failed, e));
        }
        command.status = CommandStatus::PendingConfirmation;
        let command_id = command.id.clone();
        tracing::info!(
            "Command {} ({}) awaiting confirmation for {}ms",
            command_id,
            command.kind,
            self.inner.settings.confirmation_ttl_ms
        );

        let router = self.clone();
        let expiring = command_id.clone();
        let ttl = Duration::from_millis(self.inner.settings.confirmation_ttl_ms);
        {
            // the timer removes under this lock, so it cannot run before the insert
            let mut awaiting = self.inner.awaiting.lock();
            let expiry = tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                router.expire_confirmation(&expiring).await;
            })
            .abort_handle();
            awaiting.insert(command_id.clone(), Parked { command, expiry });
        }

        Ok(DispatchOutcome::AwaitingConfirmation { command_id })
    }

    /// Release a parked command onto the normal dispatch path
    pub async fn confirm(&self, command_id: &str) -> Result<serde_json::Value> {
        let Some(mut command) = self.unpark(command_id) else {
            return Err(self.not_awaiting(command_id));
        };
        tracing::info!("Command {} confirmed", command_id);
        command.status = CommandStatus::Pending;
        self.run(command).await
    }

    /// Refuse a parked command
    pub fn reject(&self, command_id: &str, reason: Option<&str>) -> Result<Command> {
        let Some(mut command) = self.unpark(command_id) else {
            return Err(self.not_awaiting(command_id));
        };
        command.error = Some(format!("rejected: {}", reason.unwrap_or("by user")));
        command.finish(CommandStatus::Failed);
        tracing::info!("Command {} rejected", command_id);
        self.record(command.clone());
        Ok(command)
    }

    /// Take a parked command and stop its expiry timer
    fn unpark(&self, command_id: &str) -> Option<Command> {
        let parked = self.inner.awaiting.lock().remove(command_id)?;
        parked.expiry.abort();
        Some(parked.command)
    }

    /// Stop every expiry timer, failing the parked commands
    pub fn cancel_confirmations(&self) -> usize {
        let parked: Vec<Parked> = self.inner.awaiting.lock().drain().map(|(_, p)| p).collect();
        let count = parked.len();
        for Parked { command, expiry } in parked {
            expiry.abort();
            let id = command.id.clone();
            self.settle(command, CommandStatus::Failed, GatewayError::NotConfirmed(id));
        }
        count
    }

    /// Commands whose expiry timer is still pending
    pub fn pending_expiry_timers(&self) -> usize {
        self.inner
            .awaiting
            .lock()
            .values()
            .filter(|p| !p.expiry.is_finished())
            .count()
    }

    fn not_awaiting(&self, command_id: &str) -> GatewayError {
        match self.status(command_id) {
            Some(c) if c.status == CommandStatus::Failed => {
                GatewayError::NotConfirmed(command_id.to_string())
            }
            Some(c) => GatewayError::InvalidFrame(format!(
                "command {} is {:?}, not awaiting confirmation",
                command_id, c.status
            )),
            None => GatewayError::UnknownCommand(command_id.to_string()),
        }
    }

    async fn expire_confirmation(&self, command_id: &str) {
        let parked = self.inner.awaiting.lock().remove(command_id);
        let Some(Parked { command, .. }) = parked else {
            return;
        };
        let origin = command.origin.clone();
        let err = self.settle(
            command,
            CommandStatus::Failed,
            GatewayError::NotConfirmed(command_id.to_string()),
        );
        if let Some(origin) = origin {
            let frame = result_frame(command_id, &Err(err));
            if let Err(e) = self.inner.transport.send(&origin, &frame).await {
                tracing::debug!("Could not report expiry of {}: {}", command_id, e);
            }
        }
    }

    /// Resolve, send, and wait, re-sending on timeout
    async fn run(&self, mut command: Command) -> Result<serde_json::Value> {
        let (link, node_id) = match self.resolve(&command) {
            Ok(resolved) => resolved,
            Err(e) => return Err(self.settle(command, CommandStatus::Failed, e)),
        };
        command.link = Some(link.clone());
        command.node_id = node_id;

        let timeout = Duration::from_millis(self.inner.settings.command_timeout_ms);
        let max_retries = self.inner.settings.max_retries;

        loop {
            command.attempts += 1;
            command.status = CommandStatus::Sent;

            let (tx, rx) = oneshot::channel();
            self.inner.in_flight.lock().insert(
                command.id.clone(),
                InFlight {
                    command: command.clone(),
                    reply: Some(tx),
                },
            );

            let frame = Frame::new(FrameType::CommandDispatch, command.dispatch_payload())
                .with_id(command.id.clone());
            if let Err(e) = self.inner.transport.send(&link, &frame).await {
                self.inner.in_flight.lock().remove(&command.id);
                let err = GatewayError::NodeUnavailable(format!("{}: {}", command.target, e));
                return Err(self.settle(command, CommandStatus::Failed, err));
            }
            tracing::debug!(
                "Command {} ({}) sent to {} (attempt {})",
                command.id,
                command.kind,
                link,
                command.attempts
            );

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(Reply::Ack(value))) => {
                    command.result = Some(value.clone());
                    command.finish(CommandStatus::Acked);
                    tracing::info!("Command {} acked after {} attempt(s)", command.id, command.attempts);
                    self.record(command);
                    return Ok(value);
                }
                Ok(Ok(Reply::Error(message))) => {
                    return Err(self.settle(command, CommandStatus::Failed, GatewayError::CommandFailed(message)));
                }
                Ok(Ok(Reply::LinkClosed)) | Ok(Err(_)) => {
                    let err = GatewayError::NodeUnavailable(format!("{} disconnected", command.target));
                    return Err(self.settle(command, CommandStatus::Failed, err));
                }
                Err(_) => {
                    self.inner.in_flight.lock().remove(&command.id);
                    if command.attempts <= max_retries {
                        tracing::warn!(
                            "Command {} unacknowledged after {}ms, retrying ({}/{})",
                            command.id,
                            timeout.as_millis(),
                            command.attempts,
                            max_retries
                        );
                        continue;
                    }
                    let err = GatewayError::CommandTimedOut {
                        id: command.id.clone(),
                        attempts: command.attempts,
                    };
                    return Err(self.settle(command, CommandStatus::TimedOut, err));
                }
            }
        }
    }

    /// Find the link a command should go out on
    fn resolve(&self, command: &Command) -> Result<(LinkId, Option<NodeId>)> {
        let required = command.kind.required_capability();
        match &command.target {
            CommandTarget::Session(session) => self
                .session_link(session)
                .map(|link| (link, None))
                .ok_or_else(|| GatewayError::NoEligibleTarget(command.target.to_string())),
            CommandTarget::Node(id) => {
                let node = self
                    .inner
                    .nodes
                    .get(id)
                    .ok_or_else(|| GatewayError::UnknownNode(id.to_string()))?;
                if let Some(capability) = required {
                    if !node.has_capability(capability) {
                        return Err(GatewayError::NoEligibleTarget(format!(
                            "{} lacks {} for {}",
                            id, capability, command.kind
                        )));
                    }
                }
                match (node.is_online(), node.link) {
                    (true, Some(link)) => Ok((link, Some(node.id))),
                    _ => Err(GatewayError::NodeUnavailable(id.to_string())),
                }
            }
            CommandTarget::Capability(capability) => {
                let candidates: Vec<Node> = self
                    .inner
                    .nodes
                    .find_by_capability(capability.as_str())
                    .into_iter()
                    .filter(|n| n.link.is_some())
                    .filter(|n| required.map_or(true, |r| n.has_capability(r)))
                    .collect();
                let node = self
                    .inner
                    .settings
                    .selection_policy
                    .pick(&candidates, &self.inner.cursor)
                    .ok_or_else(|| GatewayError::NoEligibleTarget(command.target.to_string()))?;
                let link = node
                    .link
                    .clone()
                    .ok_or_else(|| GatewayError::NodeUnavailable(node.id.to_string()))?;
                Ok((link, Some(node.id.clone())))
            }
        }
    }

    /// Resolve an in-flight command from its `command.ack`
    pub fn ack(&self, command_id: &str, ack: AckPayload) -> Result<()> {
        let entry = self.inner.in_flight.lock().remove(command_id);
        let Some(mut entry) = entry else {
            return Err(GatewayError::UnknownCommand(command_id.to_string()));
        };
        let reply = match (ack.error, ack.result) {
            (Some(error), _) => Reply::Error(error),
            (None, result) => Reply::Ack(result.unwrap_or(serde_json::Value::Null)),
        };
        if let Some(tx) = entry.reply.take() {
            if tx.send(reply).is_err() {
                tracing::debug!("Ack for {} arrived after its attempt expired", command_id);
            }
        }
        Ok(())
    }

    /// Fail everything in flight on `link` and drop its session bindings
    pub fn on_link_closed(&self, link: &LinkId) -> usize {
        let mut failed = 0;
        {
            let mut in_flight = self.inner.in_flight.lock();
            let ids: Vec<String> = in_flight
                .iter()
                .filter(|(_, f)| f.command.link.as_ref() == Some(link))
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                if let Some(mut entry) = in_flight.remove(&id) {
                    if let Some(tx) = entry.reply.take() {
                        let _ = tx.send(Reply::LinkClosed);
                    }
                    failed += 1;
                }
            }
        }
        self.inner.session_links.write().retain(|_, l| l != link);
        if failed > 0 {
            tracing::warn!("{} in-flight command(s) lost with {}", failed, link);
        }
        failed
    }

    fn settle(&self, mut command: Command, status: CommandStatus, err: GatewayError) -> GatewayError {
        command.error = Some(err.to_string());
        command.finish(status);
        tracing::warn!("Command {} ({}) {:?}: {}", command.id, command.kind, status, err);
        self.record(command);
        err
    }

    fn record(&self, command: Command) {
        let mut history = self.inner.history.lock();
        history.push_back(command);
        while history.len() > self.inner.settings.history_limit.max(1) {
            history.pop_front();
        }
    }

    /// Current record for a command, live or finished
    pub fn status(&self, command_id: &str) -> Option<Command> {
        if let Some(entry) = self.inner.in_flight.lock().get(command_id) {
            return Some(entry.command.clone());
        }
        if let Some(parked) = self.inner.awaiting.lock().get(command_id) {
            return Some(parked.command.clone());
        }
        self.inner
            .history
            .lock()
            .iter()
            .rev()
            .find(|c| c.id == command_id)
            .cloned()
    }

    pub fn history(&self) -> Vec<Command> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    pub fn awaiting_count(&self) -> usize {
        self.inner.awaiting.lock().len()
    }
}

/// Outbound `command.result` for a finished command
pub fn result_frame(command_id: &str, outcome: &Result<serde_json::Value>) -> Frame {
    let payload = match outcome {
        Ok(result) => serde_json::json!({
            "commandId": command_id,
            "status": CommandStatus::Acked,
            "result": result,
        }),
        Err(err) => {
            let status = match err {
                GatewayError::CommandTimedOut { .. } => CommandStatus::TimedOut,
                _ => CommandStatus::Failed,
            };
            serde_json::json!({
                "commandId": command_id,
                "status": status,
                "error": err.to_payload(),
            })
        }
    };
    Frame::new(FrameType::CommandResult, payload).with_id(command_id)
}
