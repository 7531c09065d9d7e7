use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusClient, BusMessage};
use crate::config::AppConfig;
use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::scheduler::TimeoutScheduler;
use crate::router::{Command, TopicRouter};
use crate::session::{Effect, SessionInput, SessionMachine, SessionSnapshot, Step};
use crate::telemetry::events::{
    duration_to_ms, record_decode_failure, record_loop_stats, LoopStats, TARGET_ORCHESTRATOR,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Upper bound on one receive wait.
    pub poll_interval: Duration,
    pub publish_emotion: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            publish_emotion: true,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            publish_emotion: config.session.publish_emotion,
        }
    }
}

/// Drives the session machine from the bus and the idle timer.
///
/// Inputs are handled strictly one at a time: every effect of a step is
/// executed before the next message or timer expiry is looked at.
pub struct SessionOrchestrator<B: BusClient> {
    bus: B,
    router: TopicRouter,
    machine: SessionMachine,
    scheduler: TimeoutScheduler,
    settings: OrchestratorSettings,
    status_tx: watch::Sender<SessionSnapshot>,
    stats: LoopStats,
}

impl<B: BusClient + 'static> SessionOrchestrator<B> {
    pub fn new(
        bus: B,
        router: TopicRouter,
        machine: SessionMachine,
        settings: OrchestratorSettings,
    ) -> Self {
        let (status_tx, _) = watch::channel(machine.snapshot(Instant::now()));
        Self {
            bus,
            router,
            machine,
            scheduler: TimeoutScheduler::new(),
            settings,
            status_tx,
            stats: LoopStats::default(),
        }
    }

    /// Receives a snapshot whenever the state, session or pending request
    /// changes.
    pub fn status(&self) -> watch::Receiver<SessionSnapshot> {
        self.status_tx.subscribe()
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<LoopStats, OrchestratorError> {
        let started_at = Instant::now();
        let result = self.event_loop(&shutdown).await;

        match &result {
            Ok(()) => info!(target: TARGET_ORCHESTRATOR, "shutting down session orchestrator"),
            Err(err) => warn!(
                target: TARGET_ORCHESTRATOR,
                code = err.code(),
                %err,
                "session orchestrator stopped on error"
            ),
        }

        let now = Instant::now();
        let step = self.machine.shutdown();
        if let Err(err) = self.execute(step, now).await {
            debug!(target: TARGET_ORCHESTRATOR, %err, "idle notification not delivered on shutdown");
        }
        if let Err(err) = self.bus.disconnect().await {
            warn!(target: TARGET_ORCHESTRATOR, %err, "bus disconnect failed");
        }

        self.stats.uptime_ms = duration_to_ms(started_at.elapsed());
        record_loop_stats(&self.stats);
        let stats = std::mem::take(&mut self.stats);
        result.map(|()| stats)
    }

    async fn event_loop(&mut self, shutdown: &CancellationToken) -> Result<(), OrchestratorError> {
        let topics = self.router.inbound_topics();
        self.bus
            .subscribe(&topics)
            .await
            .map_err(OrchestratorError::Subscribe)?;
        info!(
            target: TARGET_ORCHESTRATOR,
            topics = ?topics,
            idle_timeout = ?self.machine.policy().idle_timeout,
            "session orchestrator started"
        );

        // A restart always announces Idle, whatever was retained before.
        self.publish(Command::StateChanged(self.machine.state()))
            .await?;
        self.refresh_status(Instant::now());

        let poll_interval = self.settings.poll_interval;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                fired = self.scheduler.expired() => {
                    self.stats.timeouts += 1;
                    let now = Instant::now();
                    debug!(
                        target: TARGET_ORCHESTRATOR,
                        session_id = %fired.session_id,
                        "idle deadline reached"
                    );
                    let step = self.machine.apply(SessionInput::from(fired), now);
                    self.execute(step, now).await?;
                }
                received = self.bus.recv(poll_interval) => match received {
                    Ok(Some(message)) => self.handle_message(message).await?,
                    Ok(None) => {}
                    Err(err) if err.is_fatal() => return Err(OrchestratorError::Transport(err)),
                    Err(err) => warn!(target: TARGET_ORCHESTRATOR, %err, "bus receive failed"),
                },
            }
        }
    }

    async fn handle_message(&mut self, message: BusMessage) -> Result<(), OrchestratorError> {
        self.stats.received += 1;
        let event = match self.router.decode(&message.topic, &message.payload) {
            Ok(event) => event,
            Err(err) => {
                self.stats.decode_failures += 1;
                record_decode_failure(&message.topic, &err);
                return Ok(());
            }
        };

        let now = Instant::now();
        let input = SessionInput::Bus {
            event,
            received_at: message.received_at,
        };
        let step = self.machine.apply(input, now);
        self.execute(step, now).await
    }

    async fn execute(&mut self, step: Step, now: Instant) -> Result<(), OrchestratorError> {
        if step.is_accepted() {
            self.stats.accepted += 1;
        } else {
            self.stats.dropped += 1;
        }

        for effect in step.effects {
            match effect {
                Effect::Publish(command) => self.publish(command).await?,
                Effect::ArmTimer { session_id, after } => {
                    self.scheduler.arm(session_id, after, now);
                }
                Effect::CancelTimer { session_id } => {
                    self.scheduler.cancel(session_id);
                }
            }
        }

        self.refresh_status(now);
        Ok(())
    }

    async fn publish(&mut self, command: Command) -> Result<(), OrchestratorError> {
        self.publish_one(&command).await?;
        if let Command::StateChanged(state) = command {
            if self.settings.publish_emotion {
                self.publish_one(&Command::Emotion(state)).await?;
            }
        }
        Ok(())
    }

    async fn publish_one(&mut self, command: &Command) -> Result<(), OrchestratorError> {
        let message = self.router.encode(command);
        let topic = message.topic.clone();
        match self.bus.publish(message).await {
            Ok(()) => {
                self.stats.published += 1;
                debug!(target: TARGET_ORCHESTRATOR, command = command.label(), topic = %topic, "published");
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(OrchestratorError::Transport(err)),
            Err(err) => {
                warn!(
                    target: TARGET_ORCHESTRATOR,
                    command = command.label(),
                    %err,
                    "publish failed"
                );
                Ok(())
            }
        }
    }

    fn refresh_status(&self, now: Instant) {
        let snapshot = self.machine.snapshot(now);
        self.status_tx.send_if_modified(|current| {
            let changed = current.state != snapshot.state
                || current.session_id != snapshot.session_id
                || current.pending_request != snapshot.pending_request;
            if changed {
                *current = snapshot;
            }
            changed
        });
    }
}
