//! E2E Test: Session pruning
//!
//! Drives the session store and pruner together the way the gateway does.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use tether_core::compaction::{ExtractiveSummarizer, PruneConfig, PruneStrategy, Pruner, Summarizer};
use tether_core::session::{ChannelKind, Message, Role, Session, SessionLimits, SessionStore};

fn limits(budget: u32, target: u32) -> SessionLimits {
    SessionLimits {
        token_budget: budget,
        target_tokens: target,
        ..Default::default()
    }
}

struct SlowSummarizer(Duration);

#[async_trait]
impl Summarizer for SlowSummarizer {
    async fn summarize(&self, messages: &[Message]) -> tether_core::Result<String> {
        tokio::time::sleep(self.0).await;
        Ok(format!("{} messages folded", messages.len()))
    }
}

/// E2E test: five 180-token messages against a 600-token target
#[tokio::test]
async fn e2e_sliding_window_reaches_target() -> anyhow::Result<()> {
    let store = SessionStore::new(limits(1_000, 600));
    let id = store.create("user-1", ChannelKind::Direct);
    for i in 0..5 {
        store
            .append(&id, Message::user(format!("step {}", i)).with_tokens(180))
            .await?;
    }

    let pruner = Pruner::new(PruneConfig::default().with_strategy(PruneStrategy::SlidingWindow));
    let result = pruner.prune(&store, &id).await?;

    assert_eq!(result.removed_messages.len(), 2);
    assert_eq!(result.final_token_count, 540);

    let context = store.get_context(&id).await?;
    let indices: Vec<u64> = context.messages.iter().map(|m| m.index).collect();
    assert_eq!(indices, vec![2, 3, 4]);
    assert_eq!(context.current_tokens, 540);
    Ok(())
}

/// E2E test: pruning an already-pruned session changes nothing
#[tokio::test]
async fn e2e_prune_is_idempotent() -> anyhow::Result<()> {
    let store = SessionStore::new(limits(1_000, 600));
    let id = store.create("user-1", ChannelKind::Direct);
    for i in 0..8 {
        store
            .append(&id, Message::assistant(format!("reply {}", i)).with_tokens(120))
            .await?;
    }

    let pruner = Pruner::new(PruneConfig::default());
    let first = pruner.prune(&store, &id).await?;
    assert!(!first.is_noop());

    let before = store.get_context(&id).await?;
    let second = pruner.prune(&store, &id).await?;
    let after = store.get_context(&id).await?;

    assert!(second.is_noop());
    assert_eq!(before, after);
    Ok(())
}

/// E2E test: the trigger fires from the warning threshold after an append
#[tokio::test]
async fn e2e_prune_if_needed_respects_threshold() -> anyhow::Result<()> {
    let store = SessionStore::new(limits(1_000, 600));
    let id = store.create("user-1", ChannelKind::Automation);
    let pruner = Pruner::new(PruneConfig::default().with_strategy(PruneStrategy::SlidingWindow));

    store.append(&id, Message::user("a").with_tokens(400)).await?;
    assert!(pruner.prune_if_needed(&store, &id).await?.is_none());

    store.append(&id, Message::user("b").with_tokens(450)).await?;
    let (_, result) = pruner
        .prune_if_needed(&store, &id)
        .await?
        .expect("threshold crossed");
    assert_eq!(result.final_token_count, 450);
    Ok(())
}

/// E2E test: an append issued mid-prune waits and lands after it
#[tokio::test]
async fn e2e_append_during_prune_is_serialized() -> anyhow::Result<()> {
    let store = Arc::new(SessionStore::new(limits(1_000, 600)));
    let id = store.create("user-1", ChannelKind::Direct);
    for i in 0..5 {
        store
            .append(&id, Message::user(format!("step {}", i)).with_tokens(180))
            .await?;
    }

    let pruner = Arc::new(
        Pruner::new(PruneConfig::default().with_strategy(PruneStrategy::Summarize))
            .with_summarizer(Arc::new(SlowSummarizer(Duration::from_millis(100)))),
    );

    let prune = {
        let store = store.clone();
        let pruner = pruner.clone();
        let id = id.clone();
        tokio::spawn(async move { pruner.prune(&store, &id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let outcome = store.append(&id, Message::user("late arrival").with_tokens(50)).await?;

    let result = prune.await??;
    assert!(result.new_summary.is_some());

    let session = store.snapshot(&id).await?;
    assert_eq!(session.current_tokens(), session.recomputed_tokens());
    assert_eq!(outcome.current_tokens, session.current_tokens());
    let last = session.messages().last().expect("late message kept");
    assert_eq!(last.message.content, "late arrival");
    assert_eq!(last.index, 5);
    Ok(())
}

/// E2E test: a system prompt outlives heavy pruning
#[tokio::test]
async fn e2e_system_prompt_is_pinned() -> anyhow::Result<()> {
    let store = SessionStore::new(limits(500, 200));
    let id = store.create("user-1", ChannelKind::Direct);
    store
        .append(&id, Message::system("You operate the desktop node").with_tokens(150))
        .await?;
    for i in 0..10 {
        store
            .append(&id, Message::user(format!("request {}", i)).with_tokens(60))
            .await?;
    }

    let pruner = Pruner::new(PruneConfig::default().with_strategy(PruneStrategy::ImportanceBased));
    let result = pruner.prune(&store, &id).await?;

    assert!(result.final_token_count <= 200);
    let context = store.get_context(&id).await?;
    assert_eq!(context.messages[0].message.role, Role::System);
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Append { tokens: u32, system: bool },
    Prune(PruneStrategy),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u32..200, prop::bool::weighted(0.1))
            .prop_map(|(tokens, system)| Op::Append { tokens, system }),
        1 => prop_oneof![
            Just(PruneStrategy::SlidingWindow),
            Just(PruneStrategy::Summarize),
            Just(PruneStrategy::ImportanceBased),
            Just(PruneStrategy::Hybrid),
        ]
        .prop_map(Op::Prune),
    ]
}

proptest! {
    #[test]
    fn prop_token_count_never_drifts(ops in prop::collection::vec(op(), 1..60)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        runtime.block_on(async {
            let mut session = Session::new("owner", ChannelKind::Direct, limits(1_000, 400));
            let mut system_count = 0;

            for (step, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Append { tokens, system } => {
                        let message = if system {
                            system_count += 1;
                            Message::system(format!("rule {}", step))
                        } else {
                            Message::user(format!("message {}", step))
                        };
                        session.append(message.with_tokens(tokens)).unwrap();
                    }
                    Op::Prune(strategy) => {
                        let pruner = Pruner::new(
                            PruneConfig::default()
                                .with_strategy(strategy)
                                .with_preserve_recent(2),
                        )
                        .with_summarizer(Arc::new(ExtractiveSummarizer::default()));
                        pruner.prune_session(&mut session).await.unwrap();
                    }
                }

                assert_eq!(session.current_tokens(), session.recomputed_tokens());
                let systems = session.messages().iter().filter(|m| m.message.is_system()).count();
                assert_eq!(systems, system_count);

                let ranges: Vec<_> = session.summaries().iter().map(|s| s.covers_range).collect();
                for (i, a) in ranges.iter().enumerate() {
                    for b in &ranges[i + 1..] {
                        assert!(!a.overlaps(b));
                    }
                }
            }
        });
    }
}
