use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::SessionSettings;
use crate::router::{Command, Event, RequestId};

/// 会话状态机的阶段划分。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    Thinking,
    Responding,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Active => "active",
            SessionState::Thinking => "thinking",
            SessionState::Responding => "responding",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "idle" => Some(SessionState::Idle),
            "active" => Some(SessionState::Active),
            "thinking" => Some(SessionState::Thinking),
            "responding" => Some(SessionState::Responding),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one wake-to-idle conversation.
///
/// The boot id changes on every process start, so ids minted before a
/// restart never match a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    boot: Uuid,
    seq: u64,
}

impl SessionId {
    pub fn new(boot: Uuid, seq: u64) -> Self {
        Self { boot, seq }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}-{}", self.boot.as_fields().0, self.seq)
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub question: String,
    pub issued_at: Instant,
}

/// Tunables consulted by the transition function.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    pub idle_timeout: Duration,
    pub min_wake_confidence: f32,
    /// Lowercase phrases that end the conversation when heard.
    pub goodbye_phrases: Vec<String>,
    pub follow_up: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        SessionSettings::default().policy()
    }
}

impl SessionPolicy {
    pub fn is_goodbye(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.goodbye_phrases
            .iter()
            .any(|phrase| lowered.contains(phrase.as_str()))
    }
}

/// Everything the state machine consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Bus { event: Event, received_at: Instant },
    IdleTimeout { session_id: SessionId },
}

impl SessionInput {
    pub fn label(&self) -> &'static str {
        match self {
            SessionInput::Bus { event, .. } => event.kind().as_str(),
            SessionInput::IdleTimeout { .. } => "idle_timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Publish(Command),
    ArmTimer {
        session_id: SessionId,
        after: Duration,
    },
    CancelTimer {
        session_id: SessionId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Only a wake word can open a session.
    NoSession,
    LowConfidence,
    AlreadyActive,
    /// Message predates the current session.
    StaleSession,
    StaleRequest,
    StaleTimer,
    UnexpectedInState,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::NoSession => "no_session",
            DropReason::LowConfidence => "low_confidence",
            DropReason::AlreadyActive => "already_active",
            DropReason::StaleSession => "stale_session",
            DropReason::StaleRequest => "stale_request",
            DropReason::StaleTimer => "stale_timer",
            DropReason::UnexpectedInState => "unexpected_in_state",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Dropped(DropReason),
}

/// Result of applying one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub from: SessionState,
    pub to: SessionState,
    pub effects: Vec<Effect>,
    pub outcome: Outcome,
}

impl Step {
    pub fn is_accepted(&self) -> bool {
        matches!(self.outcome, Outcome::Accepted)
    }

    pub fn published(&self) -> impl Iterator<Item = &Command> {
        self.effects.iter().filter_map(|effect| match effect {
            Effect::Publish(command) => Some(command),
            _ => None,
        })
    }
}
