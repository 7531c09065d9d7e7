use std::fmt;

use serde::{Deserialize, Serialize};

use crate::session::{SessionId, SessionState};

/// Correlation id of one LLM request within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalCommand {
    End,
    Reset,
}

impl ExternalCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalCommand::End => "end",
            ExternalCommand::Reset => "reset",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "end" | "cancel" => Some(ExternalCommand::End),
            "reset" => Some(ExternalCommand::Reset),
            _ => None,
        }
    }
}

/// Inbound message classes.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    WakeDetected { confidence: f32 },
    Transcription { text: String },
    /// `request_id` is only present when the LLM peer echoes one back.
    LlmResponse {
        request_id: Option<RequestId>,
        text: String,
    },
    /// TTS peer started (`true`) or finished (`false`) speaking.
    Speaking { active: bool },
    External(ExternalCommand),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::WakeDetected { .. } => EventKind::WakeDetected,
            Event::Transcription { .. } => EventKind::Transcription,
            Event::LlmResponse { .. } => EventKind::LlmResponse,
            Event::Speaking { .. } => EventKind::Speaking,
            Event::External(_) => EventKind::External,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    WakeDetected,
    Transcription,
    LlmResponse,
    Speaking,
    External,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WakeDetected => "wake_detected",
            EventKind::Transcription => "transcription",
            EventKind::LlmResponse => "llm_response",
            EventKind::Speaking => "speaking",
            EventKind::External => "external_command",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmRequest {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub text: String,
}

/// Outbound message classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StateChanged(SessionState),
    Emotion(SessionState),
    LlmRequest(LlmRequest),
    External(ExternalCommand),
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Command::StateChanged(_) => "state_changed",
            Command::Emotion(_) => "emotion",
            Command::LlmRequest(_) => "llm_request",
            Command::External(_) => "external_command",
        }
    }
}
