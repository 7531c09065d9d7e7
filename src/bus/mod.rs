//! 消息总线连接器。

pub mod backoff;
pub mod error;
pub mod memory;
pub mod mqtt;

pub use backoff::{BackoffPolicy, JitterPolicy, ReconnectPolicy};
pub use error::BusError;
pub use memory::{MemoryBroker, MemoryBus};
pub use mqtt::MqttBus;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

/// A message delivered by the broker.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: Instant,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Instant::now(),
        }
    }
}

/// A message ready to hand to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Connection transitions reported by bus drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

#[async_trait]
pub trait BusClient: Send + Sync {
    /// Adds `topics` to the subscription set. The set survives reconnects.
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BusError>;

    /// Publishes one message. Messages published while the transport is down
    /// are dropped.
    async fn publish(&self, message: OutboundMessage) -> Result<(), BusError>;

    /// Waits at most `wait` for the next message; `Ok(None)` on timeout.
    async fn recv(&mut self, wait: Duration) -> Result<Option<BusMessage>, BusError>;

    /// Flushes queued publishes and closes the connection.
    async fn disconnect(&mut self) -> Result<(), BusError>;
}
