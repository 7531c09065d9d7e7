//! 观测性初始化脚手架。

pub mod events;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::config::LogSettings;

const LOG_FILE_PREFIX: &str = "voicebus.log";

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. The returned guard must outlive the process when logging to a
/// directory, otherwise buffered lines are lost.
pub fn init_tracing(settings: &LogSettings) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = match &settings.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (fmt::writer::BoxMakeWriter::new(writer), Some(guard))
        }
        None => (fmt::writer::BoxMakeWriter::new(std::io::stderr), None),
    };

    let fmt_layer = if settings.json {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_ansi(settings.directory.is_none())
            .with_writer(writer)
            .boxed()
    };

    let subscriber = Registry::default().with(env_filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global subscriber")?;

    Ok(guard)
}
