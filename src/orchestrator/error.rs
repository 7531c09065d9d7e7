use thiserror::Error;

use crate::bus::BusError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("failed to subscribe to inbound topics: {0}")]
    Subscribe(#[source] BusError),
    #[error("bus transport failed: {0}")]
    Transport(#[source] BusError),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Subscribe(_) => "subscribe_failed",
            OrchestratorError::Transport(_) => "transport_failed",
        }
    }
}
