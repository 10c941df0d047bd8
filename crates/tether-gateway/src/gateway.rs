//! Main Gateway implementation
//!
//! Composition root: wires the transport, node registry, session store,
//! pruner and command router together, serves the WebSocket and HTTP
//! surface, and runs the demultiplexer and the periodic sweeps.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use tether_core::compaction::{ExtractiveSummarizer, Pruner};
use tether_core::session::{Message, SessionId, SessionStatus, SessionStore};

use crate::command::{CommandRequest, CommandTarget, DispatchOutcome};
use crate::config::{GatewayConfig, SummarizerKind};
use crate::frame::{
    session_id, AckPayload, CapabilitiesPayload, CommandRef, DispatchPayload, Frame, FrameType,
    HeartbeatPayload, NodeRef, SessionEventPayload, SessionMessagePayload, SessionRef,
};
use crate::nodes::{NodeDescriptor, NodeRegistry};
use crate::router::{result_frame, CommandRouter};
use crate::transport::{LinkId, Transport, TransportEvent};
use crate::{GatewayError, Result};

/// Work for one session, run in arrival order by that session's worker
struct SessionJob {
    link: LinkId,
    request_id: Option<String>,
    op: SessionOp,
}

enum SessionOp {
    Append { message: Message, created: bool },
    Context,
    Close,
}

type SessionQueue = mpsc::UnboundedSender<SessionJob>;

/// Gateway state shared across handlers
pub struct GatewayState {
    pub config: GatewayConfig,
    pub transport: Arc<Transport>,
    pub nodes: Arc<NodeRegistry>,
    pub sessions: Arc<SessionStore>,
    pub pruner: Arc<Pruner>,
    pub router: CommandRouter,
    pub shutdown_tx: broadcast::Sender<()>,
    /// Queues of sessions with a worker running
    session_workers: Mutex<HashMap<SessionId, SessionQueue>>,
}

impl GatewayState {
    /// Build the state and the receiver for transport events
    pub fn new(config: GatewayConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (transport, events) = Transport::new();
        let transport = Arc::new(transport);
        let nodes = Arc::new(NodeRegistry::new(config.nodes.heartbeat_timeout_ms));
        let router = CommandRouter::new(transport.clone(), nodes.clone(), config.commands.clone());

        let pruner = Pruner::new(config.pruning.clone());
        let pruner = match config.summarizer {
            SummarizerKind::None => pruner,
            SummarizerKind::Extractive => pruner.with_summarizer(Arc::new(ExtractiveSummarizer::default())),
        };

        let state = Self {
            sessions: Arc::new(SessionStore::new(config.session.limits())),
            pruner: Arc::new(pruner),
            config,
            transport,
            nodes,
            router,
            shutdown_tx,
            session_workers: Mutex::new(HashMap::new()),
        };
        (state, events)
    }

    /// Parse a text frame from a link and hand it to the demultiplexer
    pub fn accept_text(&self, link: &LinkId, text: &str) {
        let result = Frame::parse(text).and_then(|frame| self.transport.receive(link, frame));
        if let Err(e) = result {
            tracing::debug!("Unreadable frame from {}: {}", link, e);
            self.push(link, Frame::error(&e, None));
        }
    }

    /// Demultiplex one transport event. Never waits: session work goes to
    /// the session's worker and replies are queued without blocking.
    pub fn ingest_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Frame { link, frame } => {
                let id = frame.id.clone();
                let frame_type = frame.frame_type;
                if let Err(e) = self.handle_frame(&link, frame) {
                    tracing::warn!("{} from {} failed: {}", frame_type, link, e);
                    self.push(&link, Frame::error(&e, id));
                }
            }
            TransportEvent::Disconnected { link } => {
                let failed = self.router.on_link_closed(&link);
                let offline = self.nodes.mark_link_offline(&link);
                tracing::debug!(
                    "Cleaned up {}: {} command(s) failed, {} node(s) offline",
                    link,
                    failed,
                    offline.len()
                );
            }
        }
    }

    /// Queue a frame without waiting on the link
    fn push(&self, link: &LinkId, frame: Frame) {
        if let Err(e) = self.transport.try_send(link, &frame) {
            tracing::debug!("Dropped {} for {}: {}", frame.frame_type, link, e);
        }
    }

    async fn send_or_log(&self, link: &LinkId, frame: Frame) {
        if let Err(e) = self.transport.send(link, &frame).await {
            tracing::debug!("Dropped {} for {}: {}", frame.frame_type, link, e);
        }
    }

    fn reply(&self, link: &LinkId, frame_type: FrameType, payload: serde_json::Value, id: Option<String>) {
        self.push(
            link,
            Frame {
                id,
                ..Frame::new(frame_type, payload)
            },
        );
    }

    fn handle_frame(self: &Arc<Self>, link: &LinkId, frame: Frame) -> Result<()> {
        match frame.frame_type {
            FrameType::SessionMessage => self.on_session_message(link, frame),
            FrameType::SessionEvent => {
                let body: SessionEventPayload = frame.payload_as()?;
                let content = match body.event {
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                };
                let op = SessionOp::Append {
                    message: Message::tool(content),
                    created: false,
                };
                self.enqueue_session_job(session_id(&body.session_id), link, frame.id, op);
                Ok(())
            }
            FrameType::SessionContext => {
                let body: SessionRef = frame.payload_as()?;
                self.enqueue_session_job(session_id(&body.session_id), link, frame.id, SessionOp::Context);
                Ok(())
            }
            FrameType::SessionClose => {
                let body: SessionRef = frame.payload_as()?;
                self.enqueue_session_job(session_id(&body.session_id), link, frame.id, SessionOp::Close);
                Ok(())
            }
            FrameType::NodeRegister => {
                let descriptor: NodeDescriptor = frame.payload_as()?;
                let node = self.nodes.register(descriptor, Some(link.clone()))?;
                self.reply(link, FrameType::NodeRegistered, serde_json::json!({ "node": node }), frame.id);
                Ok(())
            }
            FrameType::NodeHeartbeat => {
                let body: HeartbeatPayload = frame.payload_as()?;
                self.nodes
                    .heartbeat_from(&body.node_id, body.metadata, Some(link.clone()))?;
                Ok(())
            }
            FrameType::NodeCapabilities => {
                let body: CapabilitiesPayload = frame.payload_as()?;
                let node = self.nodes.update_capabilities(&body.node_id, body.capabilities)?;
                self.reply(link, FrameType::NodeRegistered, serde_json::json!({ "node": node }), frame.id);
                Ok(())
            }
            FrameType::NodeDeregister => {
                let body: NodeRef = frame.payload_as()?;
                self.nodes.deregister(&body.node_id);
                Ok(())
            }
            FrameType::CommandAck => {
                let ack: AckPayload = frame.payload_as()?;
                let id = frame
                    .id
                    .clone()
                    .or_else(|| ack.command_id.clone())
                    .ok_or_else(|| GatewayError::InvalidFrame("command.ack without id".to_string()))?;
                if let Err(e) = self.router.ack(&id, ack) {
                    // late ack for a command that already settled
                    tracing::debug!("Ignoring ack from {}: {}", link, e);
                }
                Ok(())
            }
            FrameType::CommandDispatch => self.on_command_dispatch(link, frame),
            FrameType::CommandConfirm => {
                let body: CommandRef = frame.payload_as()?;
                let state = self.clone();
                let link = link.clone();
                tokio::spawn(async move {
                    let outcome = state.router.confirm(&body.command_id).await;
                    state
                        .send_or_log(&link, result_frame(&body.command_id, &outcome))
                        .await;
                });
                Ok(())
            }
            FrameType::CommandReject => {
                let body: CommandRef = frame.payload_as()?;
                let command = self.router.reject(&body.command_id, body.reason.as_deref())?;
                let err = GatewayError::CommandFailed(command.error.unwrap_or_default());
                self.push(link, result_frame(&body.command_id, &Err(err)));
                Ok(())
            }
            FrameType::SessionAck
            | FrameType::NodeRegistered
            | FrameType::CommandResult
            | FrameType::CommandPendingConfirmation
            | FrameType::Error => Err(GatewayError::InvalidFrame(format!(
                "{} is not accepted from clients",
                frame.frame_type
            ))),
        }
    }

    fn on_session_message(self: &Arc<Self>, link: &LinkId, frame: Frame) -> Result<()> {
        let body: SessionMessagePayload = frame.payload_as()?;
        let owner = self
            .transport
            .info(link)
            .and_then(|info| info.principal)
            .unwrap_or_else(|| link.to_string());

        let (id, created) = match body.session_id.as_deref() {
            Some(raw) => self.sessions.get_or_create(&session_id(raw), owner, body.channel_kind),
            None => (self.sessions.create(owner, body.channel_kind), true),
        };
        self.router.bind_session(&id, link);

        let mut message = Message::new(body.role, body.content);
        if let Some(tokens) = body.token_count {
            message = message.with_tokens(tokens);
        }
        // validated by the store, not clamped
        message.importance = body.importance;

        self.enqueue_session_job(id, link, frame.id, SessionOp::Append { message, created });
        Ok(())
    }

    /// Hand a job to the session's worker, starting one if none is running
    fn enqueue_session_job(self: &Arc<Self>, id: SessionId, link: &LinkId, request_id: Option<String>, op: SessionOp) {
        let job = SessionJob {
            link: link.clone(),
            request_id,
            op,
        };
        let mut workers = self.session_workers.lock();
        let job = match workers.get(&id) {
            Some(queue) => match queue.send(job) {
                Ok(()) => return,
                // worker died without retiring
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (queue, jobs) = mpsc::unbounded_channel();
        let _ = queue.send(job);
        workers.insert(id.clone(), queue);
        drop(workers);
        tokio::spawn(self.clone().run_session_worker(id, jobs));
    }

    async fn run_session_worker(self: Arc<Self>, id: SessionId, mut jobs: mpsc::UnboundedReceiver<SessionJob>) {
        loop {
            let job = match jobs.try_recv() {
                Ok(job) => job,
                Err(_) => match self.retire_worker(&id, &mut jobs) {
                    Some(job) => job,
                    None => break,
                },
            };
            self.run_session_job(&id, job).await;
        }
    }

    /// Remove the worker's queue unless a job slipped in. Enqueueing holds the
    /// same lock, so no job is left behind in a retired queue.
    fn retire_worker(&self, id: &SessionId, jobs: &mut mpsc::UnboundedReceiver<SessionJob>) -> Option<SessionJob> {
        let mut workers = self.session_workers.lock();
        match jobs.try_recv() {
            Ok(job) => Some(job),
            Err(_) => {
                workers.remove(id);
                None
            }
        }
    }

    async fn run_session_job(self: &Arc<Self>, id: &SessionId, job: SessionJob) {
        let appended = matches!(job.op, SessionOp::Append { .. });
        let frame = match self.session_reply(id, job.op).await {
            Ok((frame_type, payload)) => Frame {
                id: job.request_id,
                ..Frame::new(frame_type, payload)
            },
            Err(e) => {
                tracing::warn!("Session job on {} from {} failed: {}", id, job.link, e);
                Frame::error(&e, job.request_id)
            }
        };
        let ok = frame.frame_type != FrameType::Error;
        self.send_or_log(&job.link, frame).await;
        if appended && ok {
            self.schedule_prune(id.clone());
        }
    }

    async fn session_reply(&self, id: &SessionId, op: SessionOp) -> Result<(FrameType, serde_json::Value)> {
        match op {
            SessionOp::Append { message, created } => {
                let outcome = self.sessions.append(id, message).await?;
                Ok((
                    FrameType::SessionAck,
                    serde_json::json!({
                        "sessionId": id,
                        "created": created,
                        "currentTokens": outcome.current_tokens,
                        "tokenBudget": outcome.token_budget,
                    }),
                ))
            }
            SessionOp::Context => {
                let context = self.sessions.get_context(id).await?;
                Ok((FrameType::SessionContext, serde_json::to_value(context)?))
            }
            SessionOp::Close => {
                self.sessions.close(id).await?;
                let info = self.sessions.info(id).await?;
                Ok((
                    FrameType::SessionAck,
                    serde_json::json!({
                        "sessionId": info.id,
                        "status": info.status,
                        "currentTokens": info.current_tokens,
                    }),
                ))
            }
        }
    }

    /// Sessions with a worker running
    pub fn active_session_workers(&self) -> usize {
        self.session_workers.lock().len()
    }

    /// Prune in the background; the session lock serializes it with appends
    fn schedule_prune(self: &Arc<Self>, id: SessionId) {
        let state = self.clone();
        tokio::spawn(async move {
            match state.pruner.prune_if_needed(&state.sessions, &id).await {
                Ok(Some((reason, result))) => tracing::debug!(
                    "Pruned {} on {:?}: {} -> {} tokens",
                    id,
                    reason,
                    result.final_token_count.saturating_add(result.removed_tokens),
                    result.final_token_count
                ),
                Ok(None) => {}
                Err(e) => tracing::warn!("Prune of {} failed: {}", id, e),
            }
        });
    }

    fn on_command_dispatch(self: &Arc<Self>, link: &LinkId, frame: Frame) -> Result<()> {
        let body: DispatchPayload = frame.payload_as()?;
        let target: CommandTarget = body.target.parse()?;
        let command_id = frame.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let request = CommandRequest::new(body.kind, target)
            .with_id(command_id.clone())
            .with_args(body.args);

        let state = self.clone();
        let link = link.clone();
        tokio::spawn(async move {
            let reply = match state.router.dispatch(request, Some(link.clone())).await {
                Ok(DispatchOutcome::Completed(value)) => result_frame(&command_id, &Ok(value)),
                Ok(DispatchOutcome::AwaitingConfirmation { command_id }) => {
                    let record = state.router.status(&command_id);
                    Frame::new(
                        FrameType::CommandPendingConfirmation,
                        serde_json::json!({
                            "commandId": command_id,
                            "command": record,
                            "ttlMs": state.config.commands.confirmation_ttl_ms,
                        }),
                    )
                    .with_id(command_id)
                }
                Err(e) => result_frame(&command_id, &Err(e)),
            };
            state.send_or_log(&link, reply).await;
        });
        Ok(())
    }

    /// Idle/lifetime sweep followed by idle-aware pruning
    pub async fn sweep_sessions(&self) {
        let report = self.sessions.sweep();
        if !report.idled.is_empty() || !report.closed.is_empty() {
            tracing::debug!(
                "Session sweep: {} idle, {} closed, {} busy",
                report.idled.len(),
                report.closed.len(),
                report.busy
            );
        }
        for id in self.sessions.ids_with_status(SessionStatus::Idle) {
            match self.pruner.prune_if_needed(&self.sessions, &id).await {
                Ok(Some((_, result))) => tracing::info!(
                    "Idle session {} pruned to {} tokens",
                    id,
                    result.final_token_count
                ),
                Ok(None) => {}
                Err(e) => tracing::warn!("Idle prune of {} failed: {}", id, e),
            }
        }
    }

    pub fn status_json(&self) -> serde_json::Value {
        let (online, offline) = self.nodes.counts();
        serde_json::json!({
            "version": crate::VERSION,
            "links": self.transport.link_count(),
            "nodes": { "online": online, "offline": offline },
            "sessions": self.sessions.session_count(),
            "commands": {
                "inFlight": self.router.in_flight_count(),
                "awaitingConfirmation": self.router.awaiting_count(),
            },
            "pruning": {
                "strategy": self.config.pruning.strategy,
                "summarizer": self.config.summarizer,
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    principal: Option<String>,
}

/// Main Gateway
pub struct GatewayServer {
    state: Arc<GatewayState>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayServer {
    /// Create a new gateway with configuration
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let (state, events) = GatewayState::new(config);
        Ok(Self {
            state: Arc::new(state),
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Get gateway state
    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Build the Axum router
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/ws", get(Self::handle_ws_upgrade))
            .route("/health", get(Self::handle_health))
            .route("/status", get(Self::handle_status))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(self.state.clone())
    }

    /// Start the demultiplexer and the sweeps. Only the first call does anything.
    pub fn spawn_background(&self) {
        let Some(events) = self.events.lock().take() else {
            return;
        };
        let state = self.state.clone();
        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(Self::run_demux(
            state.clone(),
            events,
            state.shutdown_tx.subscribe(),
        )));

        let sweeper = state.clone();
        tasks.push(Self::every(
            Duration::from_millis(state.config.session.sweep_interval_ms),
            state.shutdown_tx.subscribe(),
            move || {
                let state = sweeper.clone();
                async move { state.sweep_sessions().await }
            },
        ));

        let liveness = state.clone();
        tasks.push(Self::every(
            Duration::from_millis(state.config.nodes.sweep_interval_ms),
            state.shutdown_tx.subscribe(),
            move || {
                let state = liveness.clone();
                async move {
                    state.nodes.sweep();
                }
            },
        ));
    }

    async fn run_demux(
        state: Arc<GatewayState>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => state.ingest_event(event),
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("Demultiplexer stopped");
    }

    fn every<F, Fut>(period: Duration, mut shutdown: broadcast::Receiver<()>, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<tokio::net::TcpListener> {
        let addr = self.state.config.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Tether gateway listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Serve on an already-bound listener until shutdown
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<()> {
        self.spawn_background();
        let router = self.build_router();
        let mut shutdown = self.state.shutdown_tx.subscribe();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Start the gateway server
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Stop background loops, then close every link
    pub async fn shutdown(&self) {
        tracing::info!("Gateway shutdown initiated");
        let _ = self.state.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }

        let cancelled = self.state.router.cancel_confirmations();
        if cancelled > 0 {
            tracing::info!("Dropped {} command(s) awaiting confirmation", cancelled);
        }
        let closed = self.state.transport.close_all();
        tracing::info!("Gateway stopped, {} link(s) closed", closed);
    }

    // HTTP handlers

    async fn handle_health() -> impl IntoResponse {
        axum::Json(serde_json::json!({
            "status": "healthy",
            "version": crate::VERSION
        }))
    }

    async fn handle_status(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
        axum::Json(state.status_json())
    }

    async fn handle_ws_upgrade(
        ws: WebSocketUpgrade,
        Query(params): Query<ConnectParams>,
        State(state): State<Arc<GatewayState>>,
    ) -> Response {
        if state.transport.link_count() >= state.config.max_connections {
            tracing::warn!("Refusing connection: {} links open", state.config.max_connections);
            return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
        }
        ws.on_upgrade(move |socket| Self::handle_ws_connection(socket, state, params.principal))
    }

    async fn handle_ws_connection(socket: WebSocket, state: Arc<GatewayState>, principal: Option<String>) {
        let (mut sink, mut stream) = socket.split();
        let (link, mut outbound) = state.transport.open(principal);

        // ends once the transport drops the link's sender
        let writer_link = link.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound.recv().await {
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
            tracing::debug!("Writer stopped for {}", writer_link);
        });

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => state.accept_text(&link, &text),
                Ok(WsMessage::Binary(data)) => {
                    tracing::debug!("Ignoring {} binary bytes from {}", data.len(), link);
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Read error on {}: {}", link, e);
                    break;
                }
            }
            if !state.transport.is_open(&link) {
                break;
            }
        }

        state.transport.close(&link);
        let _ = writer.await;
    }
}
