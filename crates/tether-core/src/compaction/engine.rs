//! # Pruning Engine
//!
//! Brings a session back under its token target. Runs with the session's
//! single-writer lock held, so an append can never observe a half-pruned log.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::compaction::policy::{PruneConfig, PruneStrategy, PruneTrigger, TriggerReason};
use crate::compaction::scoring::{ImportanceScorer, RecencyDecayScorer};
use crate::compaction::summarizer::Summarizer;
use crate::session::{CoverRange, LoggedMessage, Message, Session, SessionId, SessionStore, Summary};
use crate::tokens::total_tokens;
use crate::{CoreError, Result};

/// Outcome of one prune invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneResult {
    /// Messages taken out of the live log, oldest first
    pub removed_messages: Vec<LoggedMessage>,
    /// Tokens freed by removing those messages
    pub removed_tokens: u32,
    /// Summary installed in place of part of the removed messages
    pub new_summary: Option<Summary>,
    pub final_token_count: u32,
    /// Configured strategy for this invocation
    pub strategy_used: PruneStrategy,
    /// Strategies that actually changed the log, in the order they ran
    pub applied: Vec<PruneStrategy>,
}

impl PruneResult {
    fn unchanged(final_token_count: u32, strategy_used: PruneStrategy) -> Self {
        Self {
            removed_messages: Vec::new(),
            removed_tokens: 0,
            new_summary: None,
            final_token_count,
            strategy_used,
            applied: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.removed_messages.is_empty() && self.new_summary.is_none()
    }
}

/// Accumulates what a single prune did across strategy steps
#[derive(Default)]
struct PrunePass {
    removed: Vec<LoggedMessage>,
    summary: Option<Summary>,
    applied: Vec<PruneStrategy>,
}

impl PrunePass {
    fn record(&mut self, strategy: PruneStrategy, removed: Vec<LoggedMessage>) {
        if removed.is_empty() {
            return;
        }
        self.removed.extend(removed);
        if !self.applied.contains(&strategy) {
            self.applied.push(strategy);
        }
    }

    fn finish(mut self, final_token_count: u32, strategy_used: PruneStrategy) -> PruneResult {
        self.removed.sort_by_key(|m| m.index);
        PruneResult {
            removed_tokens: total_tokens(self.removed.iter().map(|m| m.message.token_count)),
            removed_messages: self.removed,
            new_summary: self.summary,
            final_token_count,
            strategy_used,
            applied: self.applied,
        }
    }
}

/// Pruning Engine
///
/// Applies the configured [`PruneStrategy`] to one session at a time.
pub struct Pruner {
    config: PruneConfig,
    trigger: PruneTrigger,
    summarizer: Option<Arc<dyn Summarizer>>,
    scorer: Option<Arc<dyn ImportanceScorer>>,
    /// Tokens set aside for the summary text when sizing a block
    summary_reserve_tokens: u32,
}

impl Pruner {
    pub fn new(config: PruneConfig) -> Self {
        Self {
            trigger: PruneTrigger::from_config(&config),
            config,
            summarizer: None,
            scorer: Some(Arc::new(RecencyDecayScorer::default())),
            summary_reserve_tokens: 64,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ImportanceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Drop the scorer so hybrid falls through to sliding-window
    pub fn without_scorer(mut self) -> Self {
        self.scorer = None;
        self
    }

    pub fn with_summary_reserve(mut self, tokens: u32) -> Self {
        self.summary_reserve_tokens = tokens;
        self
    }

    pub fn config(&self) -> &PruneConfig {
        &self.config
    }

    pub fn trigger(&self) -> &PruneTrigger {
        &self.trigger
    }

    pub fn has_summarizer(&self) -> bool {
        self.summarizer.is_some()
    }

    /// Prune a stored session under its lock
    pub async fn prune(&self, store: &SessionStore, id: &SessionId) -> Result<PruneResult> {
        let mut session = store.lock(id).await?;
        self.prune_session(&mut session).await
    }

    /// Prune only if the trigger policy fires. Check and prune share one lock.
    pub async fn prune_if_needed(
        &self,
        store: &SessionStore,
        id: &SessionId,
    ) -> Result<Option<(TriggerReason, PruneResult)>> {
        let mut session = store.lock(id).await?;
        let Some(reason) = self.trigger.should_trigger(&session) else {
            return Ok(None);
        };
        tracing::debug!("Pruning {} ({:?})", id, reason);
        let result = self.prune_session(&mut session).await?;
        Ok(Some((reason, result)))
    }

    /// Prune to the session's effective target
    pub async fn prune_session(&self, session: &mut Session) -> Result<PruneResult> {
        let target = self.trigger.target_for(session);
        self.prune_to(session, target).await
    }

    /// Reduce the session to at most `target` tokens
    pub async fn prune_to(&self, session: &mut Session, target: u32) -> Result<PruneResult> {
        if session.is_closed() {
            return Err(CoreError::SessionClosed(session.id.to_string()));
        }

        let before = session.current_tokens();
        if before <= target {
            return Ok(PruneResult::unchanged(before, self.config.strategy));
        }

        let mut pass = PrunePass::default();
        match self.config.strategy {
            PruneStrategy::SlidingWindow => {
                self.sliding_window(session, target, 0, &mut pass);
            }
            PruneStrategy::ImportanceBased => {
                self.importance_based(session, target, 0, &mut pass);
                self.sliding_window(session, target, 0, &mut pass);
            }
            PruneStrategy::Summarize => {
                self.summarize(session, target, 0, &mut pass).await;
                self.sliding_window(session, target, 0, &mut pass);
            }
            PruneStrategy::Hybrid => {
                let protect = self.config.preserve_recent_count;
                self.summarize(session, target, protect, &mut pass).await;
                self.importance_based(session, target, protect, &mut pass);
                self.sliding_window(session, target, protect, &mut pass);
            }
        }

        let result = pass.finish(session.current_tokens(), self.config.strategy);
        if result.final_token_count > target {
            tracing::warn!(
                "Session {} still at {} tokens (target {}); remaining messages are protected",
                session.id,
                result.final_token_count,
                target
            );
        }
        tracing::info!(
            "Pruned {}: removed {} messages ({} tokens), {} -> {} tokens via {:?}",
            session.id,
            result.removed_messages.len(),
            result.removed_tokens,
            before,
            result.final_token_count,
            result.applied
        );
        Ok(result)
    }

    /// Live messages eligible for removal, oldest first. System messages and
    /// the newest `protect` messages are never eligible.
    fn removable(session: &Session, protect: usize) -> impl Iterator<Item = &LoggedMessage> {
        let limit = session.messages().len().saturating_sub(protect);
        session.messages()[..limit]
            .iter()
            .filter(|m| !m.message.is_system())
    }

    fn sliding_window(&self, session: &mut Session, target: u32, protect: usize, pass: &mut PrunePass) {
        let mut projected = session.current_tokens();
        if projected <= target {
            return;
        }

        let mut doomed = Vec::new();
        for logged in Self::removable(session, protect) {
            if projected <= target {
                break;
            }
            doomed.push(logged.index);
            projected = projected.saturating_sub(logged.message.token_count);
        }

        let removed = session.remove_messages(&doomed);
        pass.record(PruneStrategy::SlidingWindow, removed);
    }

    fn importance_based(&self, session: &mut Session, target: u32, protect: usize, pass: &mut PrunePass) {
        let Some(scorer) = self.scorer.as_ref() else {
            return;
        };
        let mut projected = session.current_tokens();
        if projected <= target {
            return;
        }

        let newest = session.messages().last().map(|m| m.index).unwrap_or_default();
        let mut ranked: Vec<(f32, u64, u32)> = Self::removable(session, protect)
            .map(|m| (scorer.score(m, newest), m.index, m.message.token_count))
            .collect();
        // lowest score first, older first on ties
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut doomed = Vec::new();
        for (_, index, tokens) in ranked {
            if projected <= target {
                break;
            }
            doomed.push(index);
            projected = projected.saturating_sub(tokens);
        }

        let removed = session.remove_messages(&doomed);
        pass.record(PruneStrategy::ImportanceBased, removed);
    }

    /// Oldest contiguous run of removable messages, just long enough to reach
    /// the target once the summary reserve is paid for.
    fn select_block(&self, session: &Session, target: u32, protect: usize) -> Vec<LoggedMessage> {
        let limit = session.messages().len().saturating_sub(protect);
        let mut projected = session.current_tokens().saturating_add(self.summary_reserve_tokens);
        let mut block: Vec<LoggedMessage> = Vec::new();

        for logged in &session.messages()[..limit] {
            if logged.message.is_system() {
                if block.is_empty() {
                    continue;
                }
                break;
            }
            let start = block.first().map(|m| m.index).unwrap_or(logged.index);
            if !session.range_is_free(&CoverRange::new(start, logged.index)) {
                if block.is_empty() {
                    continue;
                }
                break;
            }

            projected = projected.saturating_sub(logged.message.token_count);
            block.push(logged.clone());
            if projected <= target {
                break;
            }
        }
        block
    }

    async fn request_summary(&self, summarizer: &dyn Summarizer, block: &[LoggedMessage]) -> Result<String> {
        let messages: Vec<Message> = block.iter().map(|m| m.message.clone()).collect();
        let timeout = Duration::from_millis(self.config.summarizer_timeout_ms);
        match tokio::time::timeout(timeout, summarizer.summarize(&messages)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(Ok(_)) => Err(CoreError::SummarizerFailure("empty summary".to_string())),
            Ok(Err(e)) => Err(CoreError::SummarizerFailure(e.to_string())),
            Err(_) => Err(CoreError::SummarizerFailure(format!(
                "timed out after {}ms",
                self.config.summarizer_timeout_ms
            ))),
        }
    }

    /// Replace the oldest eligible block with a summary. Any failure leaves
    /// the session untouched so a later step can fall back to deletion.
    async fn summarize(&self, session: &mut Session, target: u32, protect: usize, pass: &mut PrunePass) {
        let Some(summarizer) = self.summarizer.as_ref() else {
            return;
        };
        if session.current_tokens() <= target {
            return;
        }

        let block = self.select_block(session, target, protect);
        if block.len() < self.config.min_summary_messages.max(1) {
            tracing::debug!(
                "Session {}: block of {} messages too small to summarize",
                session.id,
                block.len()
            );
            return;
        }

        let (first, last) = match (block.first(), block.last()) {
            (Some(first), Some(last)) => (first.index, last.index),
            _ => return,
        };
        let block_tokens = total_tokens(block.iter().map(|m| m.message.token_count));

        let summary = self
            .request_summary(summarizer.as_ref(), &block)
            .await
            .map(|text| Summary::new(text, CoverRange::new(first, last)))
            .and_then(|summary| {
                if summary.token_count >= block_tokens {
                    Err(CoreError::SummarizerFailure(format!(
                        "summary of {} tokens does not shrink a {}-token block",
                        summary.token_count, block_tokens
                    )))
                } else {
                    Ok(summary)
                }
            });

        match summary {
            Ok(summary) => {
                let indices: Vec<u64> = block.iter().map(|m| m.index).collect();
                let removed = session.remove_messages(&indices);
                session.install_summary(summary.clone());
                pass.record(PruneStrategy::Summarize, removed);
                pass.summary = Some(summary);
            }
            Err(e) => {
                tracing::warn!("Summarization skipped for {}: {}; falling back", session.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::summarizer::ExtractiveSummarizer;
    use crate::session::{ChannelKind, Role, SessionLimits};
    use async_trait::async_trait;

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _messages: &[Message]) -> Result<String> {
            Err(CoreError::SummarizerFailure("model offline".to_string()))
        }
    }

    struct FixedSummarizer(&'static str);

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _messages: &[Message]) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn session(budget: u32, target: u32) -> Session {
        let limits = SessionLimits {
            token_budget: budget,
            target_tokens: target,
            ..Default::default()
        };
        Session::new("owner", ChannelKind::Direct, limits)
    }

    fn fill(session: &mut Session, count: usize, tokens: u32) {
        for i in 0..count {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            session
                .append(Message::new(role, format!("message number {}", i)).with_tokens(tokens))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_sliding_window_drops_oldest_until_target() {
        let mut s = session(1_000, 600);
        fill(&mut s, 5, 180);
        let pruner = Pruner::new(PruneConfig::default().with_strategy(PruneStrategy::SlidingWindow));

        let result = pruner.prune_session(&mut s).await.unwrap();

        let removed: Vec<u64> = result.removed_messages.iter().map(|m| m.index).collect();
        assert_eq!(removed, vec![0, 1]);
        assert_eq!(result.final_token_count, 540);
        assert_eq!(result.removed_tokens, 360);
        assert_eq!(s.current_tokens(), s.recomputed_tokens());
    }

    #[tokio::test]
    async fn test_prune_under_target_is_noop() {
        let mut s = session(1_000, 600);
        fill(&mut s, 3, 100);
        let pruner = Pruner::new(PruneConfig::default());

        let result = pruner.prune_session(&mut s).await.unwrap();
        assert!(result.is_noop());
        assert!(result.removed_messages.is_empty());
        assert_eq!(s.messages().len(), 3);
    }

    #[tokio::test]
    async fn test_system_messages_survive_every_strategy() {
        for strategy in [
            PruneStrategy::SlidingWindow,
            PruneStrategy::ImportanceBased,
            PruneStrategy::Summarize,
            PruneStrategy::Hybrid,
        ] {
            let mut s = session(1_000, 300);
            s.append(Message::system("You drive the desktop").with_tokens(100)).unwrap();
            fill(&mut s, 6, 150);

            let pruner = Pruner::new(
                PruneConfig::default()
                    .with_strategy(strategy)
                    .with_preserve_recent(1),
            )
            .with_summarizer(Arc::new(ExtractiveSummarizer::default()));
            pruner.prune_session(&mut s).await.unwrap();

            assert!(
                s.messages().iter().any(|m| m.message.role == Role::System),
                "{} removed the system prompt",
                strategy
            );
            assert_eq!(s.current_tokens(), s.recomputed_tokens());
        }
    }

    #[tokio::test]
    async fn test_summarize_replaces_oldest_block() {
        let mut s = session(1_000, 600);
        fill(&mut s, 5, 180);
        let pruner = Pruner::new(PruneConfig::default().with_strategy(PruneStrategy::Summarize))
            .with_summarizer(Arc::new(FixedSummarizer("user asked for files; assistant listed them")))
            .with_summary_reserve(20);

        let result = pruner.prune_session(&mut s).await.unwrap();

        let summary = result.new_summary.expect("summary installed");
        assert_eq!(summary.covers_range, CoverRange::new(0, 1));
        assert_eq!(s.summaries().len(), 1);
        assert!(result.final_token_count <= 600);
        assert_eq!(result.applied, vec![PruneStrategy::Summarize]);
        assert_eq!(s.current_tokens(), s.recomputed_tokens());
    }

    #[tokio::test]
    async fn test_summarizer_failure_falls_back_to_sliding_window() {
        let mut s = session(1_000, 600);
        fill(&mut s, 5, 180);
        let pruner = Pruner::new(PruneConfig::default().with_strategy(PruneStrategy::Summarize))
            .with_summarizer(Arc::new(FailingSummarizer));

        let result = pruner.prune_session(&mut s).await.unwrap();

        assert!(result.new_summary.is_none());
        assert_eq!(result.applied, vec![PruneStrategy::SlidingWindow]);
        assert_eq!(result.final_token_count, 540);
    }

    #[tokio::test]
    async fn test_oversized_summary_is_discarded() {
        let mut s = session(20, 10);
        fill(&mut s, 4, 4);
        let long = "far too long to be a useful summary of anything at all, really";
        let pruner = Pruner::new(PruneConfig::default().with_strategy(PruneStrategy::Summarize))
            .with_summarizer(Arc::new(FixedSummarizer(long)))
            .with_summary_reserve(0);

        let result = pruner.prune_session(&mut s).await.unwrap();
        assert!(result.new_summary.is_none());
        assert!(s.summaries().is_empty());
        assert_eq!(result.final_token_count, 8);
    }

    #[tokio::test]
    async fn test_importance_drops_lowest_scores_first() {
        let mut s = session(1_000, 300);
        s.append(Message::user("critical credentials location").with_tokens(100).with_importance(1.0))
            .unwrap();
        s.append(Message::user("small talk").with_tokens(100).with_importance(0.1))
            .unwrap();
        s.append(Message::assistant("more small talk").with_tokens(100).with_importance(0.2))
            .unwrap();
        s.append(Message::user("current request").with_tokens(100).with_importance(0.9))
            .unwrap();

        let pruner = Pruner::new(PruneConfig::default().with_strategy(PruneStrategy::ImportanceBased));
        let result = pruner.prune_session(&mut s).await.unwrap();

        let removed: Vec<u64> = result.removed_messages.iter().map(|m| m.index).collect();
        assert_eq!(removed, vec![1]);
        assert_eq!(result.final_token_count, 300);
        assert!(s.messages().iter().any(|m| m.index == 0));
    }

    #[tokio::test]
    async fn test_hybrid_preserves_recent_messages() {
        let mut s = session(1_000, 400);
        fill(&mut s, 8, 100);
        let pruner = Pruner::new(PruneConfig::default().with_preserve_recent(3));

        let result = pruner.prune_session(&mut s).await.unwrap();

        let kept: Vec<u64> = s.messages().iter().map(|m| m.index).collect();
        for index in [5, 6, 7] {
            assert!(kept.contains(&index), "recent message {} was pruned", index);
        }
        assert!(result.final_token_count <= 400);
        assert_eq!(result.applied, vec![PruneStrategy::ImportanceBased]);
    }

    #[tokio::test]
    async fn test_hybrid_prefers_summary_when_available() {
        let mut s = session(1_000, 400);
        fill(&mut s, 8, 100);
        let pruner = Pruner::new(PruneConfig::default().with_preserve_recent(2))
            .with_summarizer(Arc::new(FixedSummarizer("earlier: setup chatter")))
            .with_summary_reserve(10);

        let result = pruner.prune_session(&mut s).await.unwrap();
        assert!(result.new_summary.is_some());
        assert_eq!(result.applied.first(), Some(&PruneStrategy::Summarize));
        assert!(result.final_token_count <= 400);
    }

    #[tokio::test]
    async fn test_hybrid_without_scorer_uses_sliding_window() {
        let mut s = session(1_000, 400);
        fill(&mut s, 8, 100);
        let pruner = Pruner::new(PruneConfig::default().with_preserve_recent(2)).without_scorer();

        let result = pruner.prune_session(&mut s).await.unwrap();
        assert_eq!(result.applied, vec![PruneStrategy::SlidingWindow]);
        let removed: Vec<u64> = result.removed_messages.iter().map(|m| m.index).collect();
        assert_eq!(removed, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_repeated_summaries_never_overlap() {
        let mut s = session(10_000, 300);
        let pruner = Pruner::new(PruneConfig::default().with_strategy(PruneStrategy::Summarize))
            .with_summarizer(Arc::new(FixedSummarizer("recap")))
            .with_summary_reserve(5);

        for round in 0..5 {
            fill(&mut s, 4, 100);
            pruner.prune_session(&mut s).await.unwrap();
            let ranges: Vec<CoverRange> = s.summaries().iter().map(|x| x.covers_range).collect();
            for (i, a) in ranges.iter().enumerate() {
                for b in &ranges[i + 1..] {
                    assert!(!a.overlaps(b), "round {}: {:?} overlaps {:?}", round, a, b);
                }
            }
            assert_eq!(s.current_tokens(), s.recomputed_tokens());
        }
    }

    #[tokio::test]
    async fn test_closed_session_cannot_be_pruned() {
        let mut s = session(100, 50);
        fill(&mut s, 3, 40);
        s.close();
        let err = Pruner::new(PruneConfig::default())
            .prune_session(&mut s)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn test_maximal_message_prunes_without_overflow() {
        let mut s = session(u32::MAX, 10);
        s.append(Message::user("enormous paste").with_tokens(u32::MAX)).unwrap();

        let pruner = Pruner::new(PruneConfig::default().with_strategy(PruneStrategy::Summarize))
            .with_summarizer(Arc::new(ExtractiveSummarizer::default()));
        let result = pruner.prune_session(&mut s).await.unwrap();

        assert_eq!(result.removed_tokens, u32::MAX);
        assert_eq!(result.final_token_count, 0);
        assert_eq!(s.current_tokens(), s.recomputed_tokens());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_summarizer_times_out() {
        struct SlowSummarizer;

        #[async_trait]
        impl Summarizer for SlowSummarizer {
            async fn summarize(&self, _messages: &[Message]) -> Result<String> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("too late".to_string())
            }
        }

        let mut s = session(1_000, 600);
        fill(&mut s, 5, 180);
        let config = PruneConfig {
            strategy: PruneStrategy::Summarize,
            summarizer_timeout_ms: 100,
            ..Default::default()
        };
        let pruner = Pruner::new(config).with_summarizer(Arc::new(SlowSummarizer));

        let result = pruner.prune_session(&mut s).await.unwrap();
        assert!(result.new_summary.is_none());
        assert_eq!(result.final_token_count, 540);
    }
}
