//! Session, message and summary types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tokens::{estimate_tokens, total_tokens};
use crate::{CoreError, Result};

/// Unique session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("session:{}", Uuid::new_v4()))
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of conversation a session belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// One-to-one conversation with a user
    #[default]
    Direct,
    /// Shared conversation
    Group,
    /// Driven by an automation rather than a person
    Automation,
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Receiving messages
    Active,
    /// No activity for longer than the idle timeout
    Idle,
    /// Terminal, the log is read-only
    Closed,
}

/// Message author role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A single conversational message. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub token_count: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f32>,
}

impl Message {
    /// Create a message with an estimated token count
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            role,
            token_count: estimate_tokens(&content),
            content,
            timestamp: Utc::now(),
            importance: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    /// Override the estimated token count with an exact one
    pub fn with_tokens(mut self, token_count: u32) -> Self {
        self.token_count = token_count;
        self
    }

    /// Attach an importance score, clamped to [0, 1]
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance.clamp(0.0, 1.0));
        self
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

/// A message as stored in a session log, tagged with its position in the
/// original conversation. The index survives removal of earlier messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedMessage {
    pub index: u64,
    #[serde(flatten)]
    pub message: Message,
}

/// Inclusive range of logical message indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoverRange {
    pub start: u64,
    pub end: u64,
}

impl CoverRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn contains(&self, index: u64) -> bool {
        self.start <= index && index <= self.end
    }

    pub fn overlaps(&self, other: &CoverRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Compacted stand-in for a block of removed messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub text: String,
    pub covers_range: CoverRange,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Summary {
    pub fn new(text: impl Into<String>, covers_range: CoverRange) -> Self {
        let text = text.into();
        Self {
            token_count: estimate_tokens(&text),
            text,
            covers_range,
            created_at: Utc::now(),
        }
    }
}

/// Per-session limits, copied from the store defaults at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLimits {
    pub token_budget: u32,
    pub target_tokens: u32,
    pub idle_timeout_ms: u64,
    /// Sessions older than this are closed by the sweep. `None` disables it.
    pub max_lifetime_ms: Option<u64>,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            token_budget: 8_000,
            target_tokens: 6_000,
            idle_timeout_ms: 15 * 60 * 1000,
            max_lifetime_ms: Some(24 * 60 * 60 * 1000),
        }
    }
}

/// A bounded conversational context with its own log and token budget
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub owner_id: String,
    pub channel_kind: ChannelKind,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub limits: SessionLimits,
    current_tokens: u32,
    messages: Vec<LoggedMessage>,
    summaries: Vec<Summary>,
    next_index: u64,
}

impl Session {
    pub fn new(owner_id: impl Into<String>, channel_kind: ChannelKind, limits: SessionLimits) -> Self {
        Self::with_id(SessionId::new(), owner_id, channel_kind, limits)
    }

    pub fn with_id(
        id: SessionId,
        owner_id: impl Into<String>,
        channel_kind: ChannelKind,
        limits: SessionLimits,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id: owner_id.into(),
            channel_kind,
            status: SessionStatus::Active,
            created_at: now,
            last_active_at: now,
            limits,
            current_tokens: 0,
            messages: Vec::new(),
            summaries: Vec::new(),
            next_index: 0,
        }
    }

    /// Append a message, returning the new token total
    pub fn append(&mut self, message: Message) -> Result<u32> {
        if self.status == SessionStatus::Closed {
            return Err(CoreError::SessionClosed(self.id.to_string()));
        }
        if let Some(importance) = message.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(CoreError::InvalidMessage(format!(
                    "importance must be within [0, 1], got {}",
                    importance
                )));
            }
        }

        if message.token_count > self.limits.token_budget {
            return Err(CoreError::InvalidMessage(format!(
                "message of {} tokens exceeds the session budget of {}",
                message.token_count, self.limits.token_budget
            )));
        }
        self.current_tokens = self
            .current_tokens
            .checked_add(message.token_count)
            .ok_or_else(|| CoreError::InvalidMessage("session token total overflows".to_string()))?;
        self.messages.push(LoggedMessage {
            index: self.next_index,
            message,
        });
        self.next_index += 1;
        self.touch();
        if self.status == SessionStatus::Idle {
            self.status = SessionStatus::Active;
        }
        Ok(self.current_tokens)
    }

    /// Close the session. Terminal.
    pub fn close(&mut self) {
        self.status = SessionStatus::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }

    pub fn current_tokens(&self) -> u32 {
        self.current_tokens
    }

    pub fn messages(&self) -> &[LoggedMessage] {
        &self.messages
    }

    pub fn summaries(&self) -> &[Summary] {
        &self.summaries
    }

    /// Sum of live message and summary token counts
    pub fn recomputed_tokens(&self) -> u32 {
        let messages = self.messages.iter().map(|m| m.message.token_count);
        let summaries = self.summaries.iter().map(|s| s.token_count);
        total_tokens(messages.chain(summaries))
    }

    /// Whether the session has gone quiet for longer than its idle timeout
    pub fn is_idle_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active
            && now - self.last_active_at > Duration::milliseconds(self.limits.idle_timeout_ms as i64)
    }

    /// Whether the session has outlived its maximum lifetime
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.limits.max_lifetime_ms {
            Some(max) => !self.is_closed() && now - self.created_at > Duration::milliseconds(max as i64),
            None => false,
        }
    }

    pub(crate) fn mark_idle(&mut self) {
        if self.status == SessionStatus::Active {
            self.status = SessionStatus::Idle;
        }
    }

    /// Whether no existing summary covers any index in `range`
    pub fn range_is_free(&self, range: &CoverRange) -> bool {
        !self.summaries.iter().any(|s| s.covers_range.overlaps(range))
    }

    /// Remove the messages with the given indices, keeping token accounting in step
    pub(crate) fn remove_messages(&mut self, indices: &[u64]) -> Vec<LoggedMessage> {
        let mut removed = Vec::with_capacity(indices.len());
        let mut kept = Vec::with_capacity(self.messages.len());
        for logged in self.messages.drain(..) {
            if indices.contains(&logged.index) {
                removed.push(logged);
            } else {
                kept.push(logged);
            }
        }
        self.messages = kept;
        let freed = total_tokens(removed.iter().map(|m| m.message.token_count));
        self.current_tokens = self.current_tokens.saturating_sub(freed);
        removed
    }

    /// Insert a summary in chronological order
    pub(crate) fn install_summary(&mut self, summary: Summary) {
        debug_assert!(self.range_is_free(&summary.covers_range));
        self.current_tokens = self.current_tokens.saturating_add(summary.token_count);
        let position = self
            .summaries
            .iter()
            .position(|s| s.covers_range.start > summary.covers_range.start)
            .unwrap_or(self.summaries.len());
        self.summaries.insert(position, summary);
    }

    /// Materialized view for downstream consumers
    pub fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.id.clone(),
            status: self.status,
            summaries: self.summaries.clone(),
            messages: self.messages.clone(),
            current_tokens: self.current_tokens,
            token_budget: self.limits.token_budget,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            channel_kind: self.channel_kind,
            status: self.status,
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            current_tokens: self.current_tokens,
            token_budget: self.limits.token_budget,
            message_count: self.messages.len(),
            summary_count: self.summaries.len(),
        }
    }
}

/// Summaries first, then live messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub summaries: Vec<Summary>,
    pub messages: Vec<LoggedMessage>,
    pub current_tokens: u32,
    pub token_budget: u32,
}

/// Session summary info
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub owner_id: String,
    pub channel_kind: ChannelKind,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub current_tokens: u32,
    pub token_budget: u32,
    pub message_count: usize,
    pub summary_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("user-1", ChannelKind::Direct, SessionLimits::default())
    }

    #[test]
    fn test_session_creation() {
        let session = session();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.current_tokens(), 0);
        assert!(session.id.as_str().starts_with("session:"));
    }

    #[test]
    fn test_append_assigns_increasing_indices() {
        let mut session = session();
        session.append(Message::user("hello").with_tokens(10)).unwrap();
        session.append(Message::assistant("hi").with_tokens(5)).unwrap();

        let indices: Vec<u64> = session.messages().iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(session.current_tokens(), 15);
        assert_eq!(session.recomputed_tokens(), 15);
    }

    #[test]
    fn test_append_reactivates_idle_session() {
        let mut session = session();
        session.mark_idle();
        assert_eq!(session.status, SessionStatus::Idle);

        session.append(Message::user("back")).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[test]
    fn test_oversized_token_count_is_rejected() {
        let mut session = session();
        let budget = session.limits.token_budget;
        session.append(Message::user("fits").with_tokens(budget)).unwrap();

        let err = session
            .append(Message::user("huge").with_tokens(u32::MAX))
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidMessage(_)));
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.current_tokens(), budget);
    }

    #[test]
    fn test_token_total_never_wraps() {
        let limits = SessionLimits {
            token_budget: u32::MAX,
            target_tokens: 10,
            ..SessionLimits::default()
        };
        let mut session = Session::new("user-1", ChannelKind::Direct, limits);
        session.append(Message::user("a").with_tokens(u32::MAX)).unwrap();

        let err = session.append(Message::user("b").with_tokens(1)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidMessage(_)));
        assert_eq!(session.current_tokens(), u32::MAX);
        assert_eq!(session.recomputed_tokens(), u32::MAX);
    }

    #[test]
    fn test_closed_session_rejects_append() {
        let mut session = session();
        session.append(Message::user("one")).unwrap();
        session.close();

        let err = session.append(Message::user("two")).unwrap_err();
        assert!(matches!(err, CoreError::SessionClosed(_)));
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn test_remove_and_summarize_keep_tokens_in_step() {
        let mut session = session();
        for i in 0..4 {
            session.append(Message::user(format!("m{}", i)).with_tokens(100)).unwrap();
        }

        let removed = session.remove_messages(&[0, 1]);
        assert_eq!(removed.len(), 2);
        assert_eq!(session.current_tokens(), 200);

        let mut summary = Summary::new("first two", CoverRange::new(0, 1));
        summary.token_count = 20;
        session.install_summary(summary);
        assert_eq!(session.current_tokens(), 220);
        assert_eq!(session.current_tokens(), session.recomputed_tokens());
        assert!(!session.range_is_free(&CoverRange::new(1, 3)));
        assert!(session.range_is_free(&CoverRange::new(2, 3)));
    }

    #[test]
    fn test_idle_and_expiry_checks() {
        let mut session = session();
        session.limits.idle_timeout_ms = 1_000;
        session.limits.max_lifetime_ms = Some(10_000);

        let soon = session.last_active_at + Duration::milliseconds(500);
        let later = session.last_active_at + Duration::milliseconds(2_000);
        let much_later = session.created_at + Duration::milliseconds(20_000);

        assert!(!session.is_idle_at(soon));
        assert!(session.is_idle_at(later));
        assert!(session.is_expired_at(much_later));
    }

    #[test]
    fn test_importance_is_clamped() {
        let msg = Message::user("x").with_importance(3.0);
        assert_eq!(msg.importance, Some(1.0));
    }

    #[test]
    fn test_cover_range_overlap() {
        let a = CoverRange::new(0, 4);
        assert!(a.overlaps(&CoverRange::new(4, 6)));
        assert!(!a.overlaps(&CoverRange::new(5, 6)));
        assert!(a.contains(2));
    }
}
