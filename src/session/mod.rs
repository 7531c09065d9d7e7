//! 会话管理状态机。
//!
//! [`transition`] is a pure `(session, input) -> (session, step)` reduction.
//! [`SessionMachine`] owns the only [`Session`] value and hands out
//! [`SessionSnapshot`]s to everyone else.

pub mod machine;
pub mod types;

pub use machine::{transition, Session, SessionMachine, SessionSnapshot};
pub use types::{
    DropReason, Effect, Outcome, PendingRequest, SessionId, SessionInput, SessionPolicy,
    SessionState, Step,
};
