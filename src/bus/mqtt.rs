use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::backoff::ReconnectPolicy;
use crate::bus::error::BusError;
use crate::bus::{BusClient, BusMessage, ConnectionState, OutboundMessage};
use crate::config::BrokerConfig;
use crate::telemetry::events::{record_bus_connection, record_publish_dropped};

const TARGET: &str = "mqtt_bus";
const CONNECT_POLL: Duration = Duration::from_millis(50);

/// MQTT transport backed by rumqttc.
///
/// The event loop is driven by a dedicated task that forwards publishes to
/// the owner through a bounded queue and re-subscribes after each reconnect.
pub struct MqttBus {
    client: AsyncClient,
    inbound_rx: mpsc::Receiver<Result<BusMessage, BusError>>,
    topics: Arc<Mutex<Vec<String>>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    driver: Option<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl MqttBus {
    pub fn connect(config: &BrokerConfig, policy: ReconnectPolicy) -> Result<Self, BusError> {
        if config.host.trim().is_empty() {
            return Err(BusError::Connect {
                reason: "broker host is empty".to_string(),
            });
        }
        if config.port == 0 {
            return Err(BusError::Connect {
                reason: "broker port must be non-zero".to_string(),
            });
        }
        if config.client_id.trim().is_empty() {
            return Err(BusError::Connect {
                reason: "client id is empty".to_string(),
            });
        }

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let capacity = config.queue_capacity.max(8);
        let (client, eventloop) = AsyncClient::new(options, capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let topics = Arc::new(Mutex::new(Vec::new()));
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let driver = MqttDriver {
            broker: config.address(),
            client: client.clone(),
            eventloop,
            inbound_tx,
            topics: Arc::clone(&topics),
            connected: Arc::clone(&connected),
            policy,
            shutdown: shutdown.clone(),
        };

        info!(target: TARGET, broker = %config.address(), client_id = %config.client_id, "connecting to broker");
        let driver = tokio::spawn(driver.run());

        Ok(Self {
            client,
            inbound_rx,
            topics,
            connected,
            shutdown,
            driver: Some(driver),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Waits for the first ConnAck, for one-shot publishers.
    pub async fn wait_connected(&self, limit: Duration) -> Result<(), BusError> {
        let deadline = Instant::now() + limit;
        while !self.is_connected() {
            if Instant::now() >= deadline {
                return Err(BusError::Connect {
                    reason: format!("no connection within {limit:?}"),
                });
            }
            sleep(CONNECT_POLL).await;
        }
        Ok(())
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BusError> {
        let mut known = self.topics.lock().await;
        for topic in topics {
            if known.contains(topic) {
                continue;
            }
            known.push(topic.clone());

            // Before the first ConnAck the driver subscribes for us.
            if self.is_connected() {
                self.client
                    .try_subscribe(topic.clone(), QoS::AtLeastOnce)
                    .map_err(|err| BusError::Subscribe {
                        topic: topic.clone(),
                        reason: err.to_string(),
                    })?;
            }
        }
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), BusError> {
        if !self.is_connected() {
            record_publish_dropped(&message.topic, "disconnected");
            return Ok(());
        }

        // Never wait on the request queue: the driver may itself be waiting
        // for us to drain inbound messages.
        match self.client.try_publish(
            message.topic.clone(),
            QoS::AtLeastOnce,
            message.retain,
            message.payload.to_vec(),
        ) {
            Ok(()) => Ok(()),
            Err(ClientError::TryRequest(_)) => {
                record_publish_dropped(&message.topic, "request queue full");
                Ok(())
            }
            Err(err) => Err(BusError::Publish {
                topic: message.topic,
                reason: err.to_string(),
            }),
        }
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<BusMessage>, BusError> {
        match timeout(wait, self.inbound_rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(Ok(message))) => Ok(Some(message)),
            Ok(Some(Err(err))) => Err(err),
            Ok(None) => Err(BusError::Closed),
        }
    }

    async fn disconnect(&mut self) -> Result<(), BusError> {
        // Lets the driver discard inbound traffic and keep flushing.
        self.inbound_rx.close();
        if let Err(err) = self.client.try_disconnect() {
            debug!(target: TARGET, %err, "disconnect request not delivered");
        }

        if let Some(driver) = self.driver.take() {
            match timeout(self.drain_timeout, driver).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(target: TARGET, %err, "mqtt driver task failed"),
                Err(_) => {
                    warn!(
                        target: TARGET,
                        timeout = ?self.drain_timeout,
                        "publishes not flushed before drain deadline"
                    );
                    self.shutdown.cancel();
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct MqttDriver {
    broker: String,
    client: AsyncClient,
    eventloop: EventLoop,
    inbound_tx: mpsc::Sender<Result<BusMessage, BusError>>,
    topics: Arc<Mutex<Vec<String>>>,
    connected: Arc<AtomicBool>,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
}

impl MqttDriver {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        record_bus_connection(&self.broker, ConnectionState::Connecting, failures);

        loop {
            let polled = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    failures = 0;
                    self.connected.store(true, Ordering::SeqCst);
                    record_bus_connection(&self.broker, ConnectionState::Connected, failures);
                    resubscribe(&self.client, &self.topics).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = BusMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                        received_at: Instant::now(),
                    };
                    let sent = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        sent = self.inbound_tx.send(Ok(message)) => sent,
                    };
                    if let Err(mpsc::error::SendError(dropped)) = sent {
                        if let Ok(message) = dropped {
                            record_publish_dropped(&message.topic, "receiver closed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        record_bus_connection(
                            &self.broker,
                            ConnectionState::Disconnected,
                            failures,
                        );
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    record_bus_connection(&self.broker, ConnectionState::Disconnected, failures);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        record_bus_connection(
                            &self.broker,
                            ConnectionState::Disconnected,
                            failures,
                        );
                    }

                    if self.policy.is_exhausted(failures) {
                        warn!(
                            target: TARGET,
                            %err,
                            attempts = failures,
                            "giving up on broker connection"
                        );
                        let _ = self
                            .inbound_tx
                            .send(Err(BusError::ReconnectExhausted { attempts: failures }))
                            .await;
                        break;
                    }

                    let delay = self.policy.backoff.next(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        target: TARGET,
                        %err,
                        attempt = failures,
                        ?delay,
                        "broker connection lost, backing off"
                    );

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                    record_bus_connection(&self.broker, ConnectionState::Connecting, failures);
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Re-issues every known subscription after a ConnAck.
async fn resubscribe(client: &AsyncClient, topics: &Mutex<Vec<String>>) {
    let topics = topics.lock().await.clone();
    for topic in &topics {
        if let Err(err) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
            warn!(target: TARGET, %err, topic = %topic, "failed to restore subscription");
        }
    }
    debug!(target: TARGET, count = topics.len(), "subscriptions restored");
}

#[cfg(test)]
mod tests;
