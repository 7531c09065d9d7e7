use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no route for topic {0}")]
    UnknownTopic(String),
    #[error("payload on {topic} is not valid UTF-8")]
    InvalidUtf8 { topic: String },
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

impl DecodeError {
    pub fn code(&self) -> &'static str {
        match self {
            DecodeError::UnknownTopic(_) => "unknown_topic",
            DecodeError::InvalidUtf8 { .. } => "invalid_utf8",
            DecodeError::Malformed { .. } => "malformed",
        }
    }
}
