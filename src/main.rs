use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use voicebus_core::bus::{BusClient, MqttBus};
use voicebus_core::config::AppConfig;
use voicebus_core::orchestrator::{OrchestratorSettings, SessionOrchestrator};
use voicebus_core::router::{Command, ExternalCommand, TopicRouter};
use voicebus_core::session::{SessionMachine, SessionSnapshot};
use voicebus_core::telemetry::init_tracing;

const SEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(
    name = "voicebus",
    version,
    about = "Session orchestrator for the voice pipeline bus"
)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Where the running orchestrator mirrors its session snapshot.
    #[arg(long, global = true)]
    status_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run the orchestrator until interrupted (default).
    Run,
    /// Publish an external session command and exit.
    Send {
        #[arg(value_enum)]
        command: SendCommand,
    },
    /// Print the snapshot written by a running orchestrator.
    Status,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SendCommand {
    End,
    Reset,
}

impl From<SendCommand> for ExternalCommand {
    fn from(command: SendCommand) -> Self {
        match command {
            SendCommand::End => ExternalCommand::End,
            SendCommand::Reset => ExternalCommand::Reset,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(CliCommand::Status) = cli.command {
        let path = cli
            .status_file
            .as_deref()
            .context("status requires --status-file")?;
        return print_status(path);
    }

    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let _log_guard = init_tracing(&config.log)?;

    match cli.command {
        Some(CliCommand::Send { command }) => send_command(&config, command.into()).await,
        _ => run(config, cli.status_file).await,
    }
}

async fn run(config: AppConfig, status_file: Option<PathBuf>) -> Result<()> {
    let bus = MqttBus::connect(&config.broker, config.reconnect.policy())
        .context("failed to start broker connection")?;
    let router = TopicRouter::new(config.topics.clone(), config.session.tag_requests);
    let machine = SessionMachine::new(config.session.policy());
    let orchestrator = SessionOrchestrator::new(
        bus,
        router,
        machine,
        OrchestratorSettings::from_config(&config),
    );

    let shutdown = CancellationToken::new();
    if let Some(path) = status_file {
        tokio::spawn(mirror_status(orchestrator.status(), path, shutdown.clone()));
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => info!(target: "voicebus", "shutdown signal received"),
            Err(err) => warn!(target: "voicebus", %err, "failed to install signal handlers"),
        }
        signal_token.cancel();
    });

    info!(
        target: "voicebus",
        broker = %config.broker.address(),
        client_id = %config.broker.client_id,
        "starting voicebus"
    );
    let stats = orchestrator.run(shutdown.clone()).await;
    shutdown.cancel();

    let stats = stats.context("session orchestrator failed")?;
    info!(
        target: "voicebus",
        received = stats.received,
        published = stats.published,
        "voicebus stopped"
    );
    Ok(())
}

async fn send_command(config: &AppConfig, command: ExternalCommand) -> Result<()> {
    let mut broker = config.broker.clone();
    let suffix = Uuid::new_v4().simple().to_string();
    broker.client_id = format!("{}-cli-{}", broker.client_id, &suffix[..8]);

    let mut bus = MqttBus::connect(&broker, config.reconnect.policy())
        .context("failed to start broker connection")?;
    bus.wait_connected(SEND_CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("broker {} unreachable", broker.address()))?;

    let router = TopicRouter::new(config.topics.clone(), config.session.tag_requests);
    let message = router.encode(&Command::External(command));
    let topic = message.topic.clone();
    bus.publish(message)
        .await
        .with_context(|| format!("failed to publish to {topic}"))?;
    bus.disconnect().await.context("failed to disconnect")?;

    println!("sent {} to {}", command.as_str(), topic);
    Ok(())
}

fn print_status(path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read status file {}", path.display()))?;
    let snapshot: serde_json::Value =
        serde_json::from_str(&raw).context("status file is not valid JSON")?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn mirror_status(
    mut status: watch::Receiver<SessionSnapshot>,
    path: PathBuf,
    shutdown: CancellationToken,
) {
    loop {
        let snapshot = status.borrow_and_update().clone();
        if let Err(err) = write_status(&path, &snapshot) {
            warn!(target: "voicebus", %err, path = %path.display(), "failed to write status file");
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

fn write_status(path: &Path, snapshot: &SessionSnapshot) -> Result<()> {
    let encoded = serde_json::to_vec_pretty(snapshot)?;
    let staging = path.with_extension("tmp");
    std::fs::write(&staging, encoded)
        .with_context(|| format!("failed to write {}", staging.display()))?;
    std::fs::rename(&staging, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
