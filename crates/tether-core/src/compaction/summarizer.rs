//! Summarizer collaborator contract
//!
//! The pruner never assumes a summarizer is reachable: every call is wrapped
//! in a timeout and any failure falls back to deletion.

use async_trait::async_trait;

use crate::session::Message;
use crate::{CoreError, Result};

/// External summarization collaborator
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a summary for a contiguous block of messages
    async fn summarize(&self, messages: &[Message]) -> Result<String>;
}

/// Local summarizer that keeps the leading text of each message.
///
/// Not a language model. Useful when no remote summarizer is wired up but a
/// lossy trace of the removed block is still preferable to dropping it.
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    /// Characters kept per message
    pub max_chars_per_message: usize,
    /// Upper bound on the whole summary
    pub max_summary_chars: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            max_chars_per_message: 60,
            max_summary_chars: 400,
        }
    }
}

impl ExtractiveSummarizer {
    fn clip(text: &str, max: usize) -> String {
        if text.chars().count() <= max {
            return text.to_string();
        }
        let mut clipped: String = text.chars().take(max).collect();
        if let Some(pos) = clipped.rfind(' ') {
            clipped.truncate(pos);
        }
        clipped + "..."
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        if messages.is_empty() {
            return Err(CoreError::SummarizerFailure("nothing to summarize".to_string()));
        }

        let mut lines = Vec::with_capacity(messages.len());
        for message in messages {
            let first_line = message.content.lines().next().unwrap_or_default().trim();
            if first_line.is_empty() {
                continue;
            }
            lines.push(format!(
                "{}: {}",
                message.role,
                Self::clip(first_line, self.max_chars_per_message)
            ));
        }

        let summary = Self::clip(&lines.join(" | "), self.max_summary_chars);
        Ok(format!("[{} earlier messages] {}", messages.len(), summary))
    }
}
