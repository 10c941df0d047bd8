//! Tether Gateway - control plane for remote nodes and agent sessions
//!
//! Terminates WebSocket links, keeps a registry of remote nodes and their
//! capabilities, routes typed commands to them with retries and
//! confirmation, and feeds conversational traffic into the session store
//! from `tether-core`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Tether Gateway                      │
//! ├─────────────────────────────────────────────────────────┤
//! │   ┌──────────┐   ┌──────────┐   ┌──────────────────┐    │
//! │   │  Nodes   │   │ Front-end│   │   HTTP /status   │    │
//! │   │ (links)  │   │ (links)  │   │   /health        │    │
//! │   └────┬─────┘   └────┬─────┘   └──────────────────┘    │
//! │        └───────┬──────┘                                 │
//! │         ┌──────▼──────┐                                 │
//! │         │  Transport  │  one event stream               │
//! │         └──────┬──────┘                                 │
//! │         ┌──────▼──────┐                                 │
//! │         │   Demux     │                                 │
//! │         └──┬───────┬──┘                                 │
//! │   ┌────────▼──┐ ┌──▼──────────┐ ┌──────────────────┐    │
//! │   │  Command  │ │  Session    │ │  Pruner          │    │
//! │   │  Router   │ │  Store      │◄┤  (tether-core)   │    │
//! │   └────┬──────┘ └─────────────┘ └──────────────────┘    │
//! │   ┌────▼──────────┐                                     │
//! │   │ Node Registry │                                     │
//! │   └───────────────┘                                     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Capability routing**: commands address a node, a capability or a session
//! - **Retries and timeouts**: per-attempt timeout, bounded retries
//! - **Confirmation**: destructive commands wait for an explicit confirm
//! - **Liveness**: heartbeats and link loss mark nodes offline
//! - **Pruning**: sessions are compacted after appends and while idle

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod nodes;
pub mod router;
pub mod transport;

pub use client::{GatewayClient, GatewayConnection};
pub use command::{Command, CommandKind, CommandRequest, CommandStatus, CommandTarget, DispatchOutcome};
pub use config::GatewayConfig;
pub use error::{ErrorKind, GatewayError, Result};
pub use frame::{Frame, FrameType};
pub use gateway::{GatewayServer, GatewayState};
pub use nodes::{Capability, Node, NodeDescriptor, NodeId, NodeKind, NodeRegistry, NodeStatus};
pub use router::{CommandRouter, SelectionPolicy};
pub use transport::{LinkId, Transport, TransportEvent};

/// Gateway version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 18789;

/// Default host
pub const DEFAULT_HOST: &str = "127.0.0.1";
