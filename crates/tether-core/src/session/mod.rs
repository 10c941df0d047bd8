//! Sessions and their append-only message logs

pub mod model;
pub mod store;

pub use model::{
    ChannelKind, CoverRange, LoggedMessage, Message, Role, Session, SessionContext, SessionId,
    SessionInfo, SessionLimits, SessionStatus, Summary,
};
pub use store::{AppendOutcome, SessionStore, SweepReport};
