//! # Pruning Policy
//!
//! Defines when pruning fires and which strategy it uses.

use serde::{Deserialize, Serialize};

use crate::session::{Session, SessionStatus};

/// Strategy used to bring a session back under its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PruneStrategy {
    /// Drop the oldest non-system messages
    SlidingWindow,
    /// Replace the oldest block with a summary
    Summarize,
    /// Drop the lowest-scoring messages
    ImportanceBased,
    /// Protect recent and system messages, summarize the rest when possible
    #[default]
    Hybrid,
}

impl std::fmt::Display for PruneStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PruneStrategy::SlidingWindow => write!(f, "sliding-window"),
            PruneStrategy::Summarize => write!(f, "summarize"),
            PruneStrategy::ImportanceBased => write!(f, "importance-based"),
            PruneStrategy::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl std::str::FromStr for PruneStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sliding-window" => Ok(Self::SlidingWindow),
            "summarize" => Ok(Self::Summarize),
            "importance-based" => Ok(Self::ImportanceBased),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown prune strategy: {}", other)),
        }
    }
}

/// Configuration for pruning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PruneConfig {
    /// Strategy applied on every prune
    pub strategy: PruneStrategy,

    /// Fraction of the token budget at which an append triggers pruning
    pub warning_threshold: f32,

    /// Most recent messages the hybrid strategy keeps verbatim
    pub preserve_recent_count: usize,

    /// Upper bound on a single summarizer call
    pub summarizer_timeout_ms: u64,

    /// Smallest block worth summarizing
    pub min_summary_messages: usize,

    /// Idle sessions are pruned down to this fraction of their target
    pub idle_target_ratio: f32,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            strategy: PruneStrategy::Hybrid,
            warning_threshold: 0.8,
            preserve_recent_count: 6,
            summarizer_timeout_ms: 5_000,
            min_summary_messages: 2,
            idle_target_ratio: 0.5,
        }
    }
}

impl PruneConfig {
    /// Create config for standard usage
    pub fn standard() -> Self {
        Self::default()
    }

    /// Create config for memory-constrained deployments
    pub fn memory_constrained() -> Self {
        Self {
            strategy: PruneStrategy::SlidingWindow,
            warning_threshold: 0.7,
            preserve_recent_count: 2,
            summarizer_timeout_ms: 1_000,
            min_summary_messages: 2,
            idle_target_ratio: 0.25,
        }
    }

    pub fn with_strategy(mut self, strategy: PruneStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_preserve_recent(mut self, count: usize) -> Self {
        self.preserve_recent_count = count;
        self
    }
}

/// Pruning trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum TriggerReason {
    /// Token count exceeds the full budget
    OverBudget { current: u32, budget: u32 },

    /// Token count crossed the warning threshold
    WarningThreshold { current: u32, threshold: u32 },

    /// Idle session above its reduced target
    IdleSession { current: u32, target: u32 },

    /// Manual trigger
    Manual,
}

/// Pruning trigger policy
///
/// Evaluates whether a session should be pruned after a mutation or sweep.
#[derive(Debug, Clone)]
pub struct PruneTrigger {
    config: PruneConfig,
}

impl PruneTrigger {
    pub fn from_config(config: &PruneConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Token count at which the warning threshold trips
    pub fn threshold_tokens(&self, session: &Session) -> u32 {
        (session.limits.token_budget as f64 * self.config.warning_threshold as f64).floor() as u32
    }

    /// Target the next prune should reach
    pub fn target_for(&self, session: &Session) -> u32 {
        let target = session.limits.target_tokens;
        if session.status == SessionStatus::Idle {
            (target as f64 * self.config.idle_target_ratio as f64).floor() as u32
        } else {
            target
        }
    }

    /// Check if any trigger condition is met
    pub fn should_trigger(&self, session: &Session) -> Option<TriggerReason> {
        if session.is_closed() {
            return None;
        }

        let current = session.current_tokens();
        let budget = session.limits.token_budget;
        if current > budget {
            return Some(TriggerReason::OverBudget { current, budget });
        }

        let threshold = self.threshold_tokens(session);
        if current > threshold {
            return Some(TriggerReason::WarningThreshold { current, threshold });
        }

        if session.status == SessionStatus::Idle {
            let target = self.target_for(session);
            if current > target {
                return Some(TriggerReason::IdleSession { current, target });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ChannelKind, Message, SessionLimits};

    fn session_with(tokens: u32) -> Session {
        let limits = SessionLimits {
            token_budget: 1_000,
            target_tokens: 600,
            ..Default::default()
        };
        let mut session = Session::new("owner", ChannelKind::Direct, limits);
        if tokens > 0 {
            session.append(Message::user("x").with_tokens(tokens)).unwrap();
        }
        session
    }

    #[test]
    fn test_default_config() {
        let config = PruneConfig::default();
        assert_eq!(config.strategy, PruneStrategy::Hybrid);
        assert!((config.warning_threshold - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn test_strategy_names_round_trip_through_serde() {
        let json = serde_json::to_string(&PruneStrategy::SlidingWindow).unwrap();
        assert_eq!(json, "\"sliding-window\"");
        let parsed: PruneStrategy = serde_json::from_str("\"importance-based\"").unwrap();
        assert_eq!(parsed, PruneStrategy::ImportanceBased);
        assert_eq!("summarize".parse::<PruneStrategy>().unwrap(), PruneStrategy::Summarize);
        assert!("lru".parse::<PruneStrategy>().is_err());
    }

    #[test]
    fn test_below_threshold_does_not_trigger() {
        let trigger = PruneTrigger::from_config(&PruneConfig::default());
        assert_eq!(trigger.should_trigger(&session_with(800)), None);
    }

    #[test]
    fn test_warning_threshold_trigger() {
        let trigger = PruneTrigger::from_config(&PruneConfig::default());
        assert_eq!(
            trigger.should_trigger(&session_with(850)),
            Some(TriggerReason::WarningThreshold {
                current: 850,
                threshold: 800
            })
        );
    }

    #[test]
    fn test_over_budget_trigger() {
        let trigger = PruneTrigger::from_config(&PruneConfig::default());
        assert!(matches!(
            trigger.should_trigger(&session_with(1_200)),
            Some(TriggerReason::OverBudget { .. })
        ));
    }

    #[test]
    fn test_idle_session_uses_reduced_target() {
        let trigger = PruneTrigger::from_config(&PruneConfig::default());
        let mut session = session_with(400);
        session.mark_idle();

        assert_eq!(trigger.target_for(&session), 300);
        assert_eq!(
            trigger.should_trigger(&session),
            Some(TriggerReason::IdleSession {
                current: 400,
                target: 300
            })
        );
    }

    #[test]
    fn test_closed_session_never_triggers() {
        let trigger = PruneTrigger::from_config(&PruneConfig::default());
        let mut session = session_with(2_000);
        session.close();
        assert_eq!(trigger.should_trigger(&session), None);
    }
}
