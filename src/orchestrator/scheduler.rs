use std::future::pending;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::session::{SessionId, SessionInput};

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Fired when the armed session saw no activity for its idle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimeout {
    pub session_id: SessionId,
    pub deadline: Instant,
}

impl From<IdleTimeout> for SessionInput {
    fn from(timeout: IdleTimeout) -> Self {
        SessionInput::IdleTimeout {
            session_id: timeout.session_id,
        }
    }
}

/// Single-slot deadline for the one live session.
#[derive(Debug, Default)]
pub struct TimeoutScheduler {
    armed: Option<IdleTimeout>,
}

impl TimeoutScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever deadline was armed before. Deadlines past the
    /// clock's range are clamped to a far-future instant.
    pub fn arm(&mut self, session_id: SessionId, after: Duration, now: Instant) -> Instant {
        let deadline = now
            .checked_add(after.min(FAR_FUTURE))
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.armed = Some(IdleTimeout {
            session_id,
            deadline,
        });
        deadline
    }

    pub fn cancel(&mut self, session_id: SessionId) -> bool {
        match self.armed {
            Some(armed) if armed.session_id == session_id => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.armed.map(|armed| armed.deadline)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Resolves once the armed deadline passes, then disarms. Pends forever
    /// while nothing is armed.
    ///
    /// Cancel safe: dropping the future before it resolves leaves the
    /// deadline armed.
    pub async fn expired(&mut self) -> IdleTimeout {
        let Some(armed) = self.armed else {
            return pending().await;
        };

        sleep_until(armed.deadline).await;
        self.armed = None;
        armed
    }
}
