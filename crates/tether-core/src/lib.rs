//! Tether Core - sessions and token-budget compaction
//!
//! Tether Core holds the conversational state of the control plane: bounded
//! sessions with append-only message logs, and the pruner that keeps every
//! session under its token budget.
//!
//! # Architecture
//!
//! 1. **Sessions** (`session`): session model, per-session single-writer store,
//!    idle and lifetime sweeps
//! 2. **Compaction** (`compaction`): trigger policy, the four pruning
//!    strategies, importance scoring and the summarizer contract
//! 3. **Tokens** (`tokens`): the token estimator shared by both
//!
//! # Quick Start
//!
//! ```
//! use tether_core::compaction::{PruneConfig, PruneStrategy, Pruner};
//! use tether_core::session::{ChannelKind, Message, SessionLimits, SessionStore};
//!
//! # tokio_test::block_on(async {
//! let store = SessionStore::new(SessionLimits {
//!     token_budget: 1_000,
//!     target_tokens: 600,
//!     ..Default::default()
//! });
//! let id = store.create("user-1", ChannelKind::Direct);
//! for i in 0..5 {
//!     store
//!         .append(&id, Message::user(format!("turn {}", i)).with_tokens(180))
//!         .await
//!         .unwrap();
//! }
//!
//! let pruner = Pruner::new(PruneConfig::default().with_strategy(PruneStrategy::SlidingWindow));
//! let result = pruner.prune(&store, &id).await.unwrap();
//! assert_eq!(result.final_token_count, 540);
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod compaction;
pub mod error;
pub mod session;
pub mod tokens;

// Re-export commonly used types for convenience
pub use compaction::{PruneConfig, PruneResult, PruneStrategy, Pruner, Summarizer};
pub use error::{CoreError, Result};
pub use session::{
    ChannelKind, Message, Role, Session, SessionContext, SessionId, SessionLimits, SessionStatus,
    SessionStore,
};
pub use tokens::{estimate_tokens, total_tokens};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
