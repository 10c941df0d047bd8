//! Typed commands
//!
//! The catalogue of actions a front-end can ask a node to perform, how a
//! command names its target, and the record the router keeps per command.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tether_core::session::SessionId;

use crate::nodes::{Capability, NodeId};
use crate::transport::LinkId;
use crate::{GatewayError, Result};

/// Command catalogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    #[serde(rename = "display.view")]
    DisplayView,
    #[serde(rename = "display.bounds")]
    DisplayBounds,
    #[serde(rename = "display.find")]
    DisplayFind,
    #[serde(rename = "display.find_icons")]
    DisplayFindIcons,
    #[serde(rename = "display.register_icon")]
    DisplayRegisterIcon,
    #[serde(rename = "mouse.click")]
    MouseClick,
    #[serde(rename = "mouse.double_click")]
    MouseDoubleClick,
    #[serde(rename = "mouse.right_click")]
    MouseRightClick,
    #[serde(rename = "mouse.move")]
    MouseMove,
    #[serde(rename = "mouse.drag")]
    MouseDrag,
    #[serde(rename = "mouse.scroll")]
    MouseScroll,
    #[serde(rename = "keyboard.write")]
    KeyboardWrite,
    #[serde(rename = "keyboard.press")]
    KeyboardPress,
    #[serde(rename = "keyboard.hotkey")]
    KeyboardHotkey,
    #[serde(rename = "clipboard.view")]
    ClipboardView,
    #[serde(rename = "clipboard.copy")]
    ClipboardCopy,
    #[serde(rename = "os.selected_text")]
    OsSelectedText,
    #[serde(rename = "files.read")]
    FilesRead,
    #[serde(rename = "files.write")]
    FilesWrite,
    #[serde(rename = "files.list")]
    FilesList,
    #[serde(rename = "browser.navigate")]
    BrowserNavigate,
    #[serde(rename = "browser.evaluate")]
    BrowserEvaluate,
    /// Free-form invocation; the target alone decides eligibility
    #[serde(rename = "node.invoke")]
    NodeInvoke,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::DisplayView => "display.view",
            CommandKind::DisplayBounds => "display.bounds",
            CommandKind::DisplayFind => "display.find",
            CommandKind::DisplayFindIcons => "display.find_icons",
            CommandKind::DisplayRegisterIcon => "display.register_icon",
            CommandKind::MouseClick => "mouse.click",
            CommandKind::MouseDoubleClick => "mouse.double_click",
            CommandKind::MouseRightClick => "mouse.right_click",
            CommandKind::MouseMove => "mouse.move",
            CommandKind::MouseDrag => "mouse.drag",
            CommandKind::MouseScroll => "mouse.scroll",
            CommandKind::KeyboardWrite => "keyboard.write",
            CommandKind::KeyboardPress => "keyboard.press",
            CommandKind::KeyboardHotkey => "keyboard.hotkey",
            CommandKind::ClipboardView => "clipboard.view",
            CommandKind::ClipboardCopy => "clipboard.copy",
            CommandKind::OsSelectedText => "os.selected_text",
            CommandKind::FilesRead => "files.read",
            CommandKind::FilesWrite => "files.write",
            CommandKind::FilesList => "files.list",
            CommandKind::BrowserNavigate => "browser.navigate",
            CommandKind::BrowserEvaluate => "browser.evaluate",
            CommandKind::NodeInvoke => "node.invoke",
        }
    }

    /// Capability a node needs to run this kind
    pub fn required_capability(&self) -> Option<&'static str> {
        use CommandKind::*;
        match self {
            DisplayView | DisplayBounds | DisplayFind | DisplayFindIcons | DisplayRegisterIcon => {
                Some(Capability::SCREEN_CAPTURE)
            }
            MouseClick | MouseDoubleClick | MouseRightClick | MouseMove | MouseDrag | MouseScroll => {
                Some(Capability::POINTER)
            }
            KeyboardWrite | KeyboardPress | KeyboardHotkey => Some(Capability::KEYBOARD),
            ClipboardView | ClipboardCopy | OsSelectedText => Some(Capability::CLIPBOARD),
            FilesRead | FilesWrite | FilesList => Some(Capability::FILESYSTEM),
            BrowserNavigate | BrowserEvaluate => Some(Capability::BROWSER),
            NodeInvoke => None,
        }
    }

    /// Destructive kinds wait for an explicit confirmation before dispatch
    pub fn requires_confirmation(&self) -> bool {
        matches!(
            self,
            CommandKind::FilesWrite | CommandKind::KeyboardHotkey | CommandKind::BrowserEvaluate
        )
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a command goes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CommandTarget {
    /// The front-end link bound to a session
    Session(SessionId),
    /// One specific node
    Node(NodeId),
    /// Any online node advertising the capability
    Capability(Capability),
}

impl std::str::FromStr for CommandTarget {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || GatewayError::InvalidFrame(format!("bad command target: {:?}", s));
        let (scheme, rest) = s.split_once(':').ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }
        match scheme {
            "session" => Ok(CommandTarget::Session(SessionId::from_str(s))),
            "node" => Ok(CommandTarget::Node(NodeId::from_str(s))),
            "capability" => Ok(CommandTarget::Capability(Capability::new(rest))),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for CommandTarget {
    type Error = GatewayError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CommandTarget> for String {
    fn from(target: CommandTarget) -> Self {
        target.to_string()
    }
}

impl std::fmt::Display for CommandTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandTarget::Session(id) => write!(f, "{}", id),
            CommandTarget::Node(id) => write!(f, "{}", id),
            CommandTarget::Capability(cap) => write!(f, "capability:{}", cap),
        }
    }
}

/// Command lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    PendingConfirmation,
    Sent,
    Acked,
    TimedOut,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Acked | CommandStatus::TimedOut | CommandStatus::Failed
        )
    }
}

/// A dispatch request before the router owns it
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Correlation id; generated when absent
    pub id: Option<String>,
    pub kind: CommandKind,
    pub target: CommandTarget,
    pub args: serde_json::Value,
}

impl CommandRequest {
    pub fn new(kind: CommandKind, target: CommandTarget) -> Self {
        Self {
            id: None,
            kind,
            target,
            args: serde_json::json!({}),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

/// Router-owned command record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    pub kind: CommandKind,
    pub target: CommandTarget,
    pub args: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: CommandStatus,
    /// Sends so far, including the first
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(skip)]
    pub link: Option<LinkId>,
    /// Link that asked for the command, if it came over the wire
    #[serde(skip)]
    pub origin: Option<LinkId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Command {
    pub fn from_request(request: CommandRequest, origin: Option<LinkId>) -> Self {
        Self {
            id: request.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind: request.kind,
            target: request.target,
            args: request.args,
            created_at: Utc::now(),
            status: CommandStatus::Pending,
            attempts: 0,
            node_id: None,
            link: None,
            origin,
            result: None,
            error: None,
            finished_at: None,
        }
    }

    /// Outbound `command.dispatch` payload
    pub fn dispatch_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "args": self.args,
            "attempt": self.attempts,
        })
    }

    /// Move to a terminal status. Terminal records never change again.
    pub(crate) fn finish(&mut self, status: CommandStatus) {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// What `dispatch` returns
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The target acknowledged with this result
    Completed(serde_json::Value),
    /// Parked until `confirm` or `reject`
    AwaitingConfirmation { command_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_match_wire() {
        let json = serde_json::to_string(&CommandKind::DisplayFindIcons).unwrap();
        assert_eq!(json, "\"display.find_icons\"");
        let kind: CommandKind = serde_json::from_str("\"os.selected_text\"").unwrap();
        assert_eq!(kind, CommandKind::OsSelectedText);
        assert_eq!(kind.to_string(), "os.selected_text");
        assert!(serde_json::from_str::<CommandKind>("\"mouse.teleport\"").is_err());
    }

    #[test]
    fn test_required_capabilities() {
        assert_eq!(CommandKind::DisplayView.required_capability(), Some("screen_capture"));
        assert_eq!(CommandKind::MouseDrag.required_capability(), Some("pointer"));
        assert_eq!(CommandKind::FilesList.required_capability(), Some("filesystem"));
        assert_eq!(CommandKind::NodeInvoke.required_capability(), None);
    }

    #[test]
    fn test_destructive_kinds_need_confirmation() {
        assert!(CommandKind::FilesWrite.requires_confirmation());
        assert!(CommandKind::KeyboardHotkey.requires_confirmation());
        assert!(CommandKind::BrowserEvaluate.requires_confirmation());
        assert!(!CommandKind::FilesRead.requires_confirmation());
        assert!(!CommandKind::MouseClick.requires_confirmation());
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!(
            "capability:screen_capture".parse::<CommandTarget>().unwrap(),
            CommandTarget::Capability(Capability::new("screen_capture"))
        );
        assert_eq!(
            "node:office".parse::<CommandTarget>().unwrap(),
            CommandTarget::Node(NodeId::from_str("office"))
        );
        assert_eq!(
            "session:abc".parse::<CommandTarget>().unwrap(),
            CommandTarget::Session(SessionId::from_str("session:abc"))
        );
        assert!("printer:1".parse::<CommandTarget>().is_err());
        assert!("capability:".parse::<CommandTarget>().is_err());
        assert!("nocolon".parse::<CommandTarget>().is_err());
    }

    #[test]
    fn test_target_serializes_as_string() {
        let target = CommandTarget::Capability(Capability::new("pointer"));
        assert_eq!(serde_json::to_string(&target).unwrap(), "\"capability:pointer\"");
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut command = Command::from_request(
            CommandRequest::new(CommandKind::MouseClick, "node:a".parse().unwrap()),
            None,
        );
        command.finish(CommandStatus::Acked);
        command.finish(CommandStatus::Failed);
        assert_eq!(command.status, CommandStatus::Acked);
        assert!(command.finished_at.is_some());
    }
}
