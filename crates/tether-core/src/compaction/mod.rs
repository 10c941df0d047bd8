//! # Context Compaction
//!
//! Keeps session logs inside their token budgets.
//!
//! Four strategies are available:
//! - sliding-window: drop the oldest non-system messages
//! - summarize: fold the oldest block into a [`Summary`](crate::session::Summary)
//! - importance-based: drop the lowest-scoring messages first
//! - hybrid: protect recent messages, summarize when a summarizer is wired up,
//!   otherwise fall back to scoring and then to the window
//!
//! System messages are never removed by any strategy.

pub mod engine;
pub mod policy;
pub mod scoring;
pub mod summarizer;

pub use engine::{PruneResult, Pruner};
pub use policy::{PruneConfig, PruneStrategy, PruneTrigger, TriggerReason};
pub use scoring::{ImportanceScorer, RecencyDecayScorer};
pub use summarizer::{ExtractiveSummarizer, Summarizer};
