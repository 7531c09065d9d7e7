use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("broker connection failed: {reason}")]
    Connect { reason: String },
    #[error("failed to publish on {topic}: {reason}")]
    Publish { topic: String, reason: String },
    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("broker unreachable after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("bus connection closed")]
    Closed,
}

impl BusError {
    /// Errors that the orchestrator cannot recover from locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::ReconnectExhausted { .. } | BusError::Closed)
    }
}
