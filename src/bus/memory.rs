//! In-process broker used by tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::bus::error::BusError;
use crate::bus::{BusClient, BusMessage, OutboundMessage};
use crate::telemetry::events::record_publish_dropped;

const TARGET: &str = "memory_bus";

struct BrokerInner {
    tx: broadcast::Sender<BusMessage>,
    online: AtomicBool,
    retained: Mutex<HashMap<String, Bytes>>,
}

/// Fans every published message out to all clients subscribed to its topic.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BrokerInner {
                tx,
                online: AtomicBool::new(true),
                retained: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn client(&self) -> MemoryBus {
        MemoryBus {
            broker: self.clone(),
            rx: self.inner.tx.subscribe(),
            topics: HashSet::new(),
            closed: false,
        }
    }

    /// Every message that passes through the broker, regardless of topic.
    pub fn tap(&self) -> broadcast::Receiver<BusMessage> {
        self.inner.tx.subscribe()
    }

    /// Publishes on behalf of a peer service.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        self.route(BusMessage::new(topic, payload));
    }

    /// Simulates broker loss: while offline every publish is dropped.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Last retained payload on `topic`.
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.inner
            .retained
            .lock()
            .ok()
            .and_then(|retained| retained.get(topic).cloned())
    }

    fn route(&self, message: BusMessage) {
        if !self.is_online() {
            record_publish_dropped(&message.topic, "broker offline");
            return;
        }
        // No receivers is not an error for a broker.
        let _ = self.inner.tx.send(message);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

pub struct MemoryBus {
    broker: MemoryBroker,
    rx: broadcast::Receiver<BusMessage>,
    topics: HashSet<String>,
    closed: bool,
}

#[async_trait]
impl BusClient for MemoryBus {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }
        self.topics.extend(topics.iter().cloned());
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Publish {
                topic: message.topic,
                reason: "client disconnected".to_string(),
            });
        }
        if message.retain && self.broker.is_online() {
            if let Ok(mut retained) = self.broker.inner.retained.lock() {
                retained.insert(message.topic.clone(), message.payload.clone());
            }
        }
        self.broker
            .route(BusMessage::new(message.topic, message.payload));
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<BusMessage>, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }

        let deadline = Instant::now() + wait;
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(message)) => {
                    if self.topics.contains(&message.topic) {
                        return Ok(Some(message));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(target: TARGET, skipped, "memory bus receiver lagged");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(BusError::Closed),
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), BusError> {
        self.closed = true;
        Ok(())
    }
}
