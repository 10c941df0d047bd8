//! Importance scoring for the importance-based strategy
//!
//! Explicit scores on a message always win. Everything else goes through an
//! [`ImportanceScorer`], which callers can swap out.

use crate::session::LoggedMessage;

/// Scores how much a message is worth keeping, in [0, 1]
pub trait ImportanceScorer: Send + Sync {
    /// `newest_index` is the logical index of the newest live message
    fn score(&self, message: &LoggedMessage, newest_index: u64) -> f32;
}

/// Exponential decay by distance from the newest message
#[derive(Debug, Clone, Copy)]
pub struct RecencyDecayScorer {
    /// Messages after which an unscored message's weight halves
    pub half_life: f32,
}

impl RecencyDecayScorer {
    pub fn new(half_life: f32) -> Self {
        Self {
            half_life: half_life.max(f32::EPSILON),
        }
    }
}

impl Default for RecencyDecayScorer {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl ImportanceScorer for RecencyDecayScorer {
    fn score(&self, message: &LoggedMessage, newest_index: u64) -> f32 {
        if let Some(importance) = message.message.importance {
            return importance;
        }
        let age = newest_index.saturating_sub(message.index) as f32;
        0.5_f32.powf(age / self.half_life)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Message;

    fn logged(index: u64, message: Message) -> LoggedMessage {
        LoggedMessage { index, message }
    }

    #[test]
    fn test_newest_message_scores_one() {
        let scorer = RecencyDecayScorer::default();
        let score = scorer.score(&logged(9, Message::user("x")), 9);
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_half_life() {
        let scorer = RecencyDecayScorer::new(4.0);
        let score = scorer.score(&logged(0, Message::user("x")), 4);
        assert!((score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_explicit_importance_wins() {
        let scorer = RecencyDecayScorer::default();
        let old_but_important = logged(0, Message::user("keep").with_importance(0.95));
        let old_unscored = logged(1, Message::user("chatter"));

        assert!((scorer.score(&old_but_important, 20) - 0.95).abs() < 1e-6);
        assert!(scorer.score(&old_unscored, 20) < 0.5);
    }
}
