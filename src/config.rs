//! 服务配置：TOML 文件 + 环境变量覆盖。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{BackoffPolicy, JitterPolicy, ReconnectPolicy};
use crate::session::SessionPolicy;

pub const ENV_BROKER_HOST: &str = "VOICEBUS_BROKER_HOST";
pub const ENV_BROKER_PORT: &str = "VOICEBUS_BROKER_PORT";
pub const ENV_IDLE_TIMEOUT_SECS: &str = "VOICEBUS_IDLE_TIMEOUT_SECS";
pub const ENV_USERNAME: &str = "VOICEBUS_USERNAME";
pub const ENV_PASSWORD: &str = "VOICEBUS_PASSWORD";

/// One day.
pub const MAX_IDLE_TIMEOUT_SECS: u64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    Env { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub topics: TopicMap,
    pub session: SessionSettings,
    pub reconnect: ReconnectSettings,
    pub runtime: RuntimeSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Bound of the request and inbound queues.
    pub queue_capacity: usize,
    /// How long `disconnect` waits for queued publishes.
    pub drain_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "session_manager".to_string(),
            keep_alive_secs: 60,
            username: None,
            password: None,
            queue_capacity: 64,
            drain_timeout_ms: 2_000,
        }
    }
}

impl BrokerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Topic name for every message class the orchestrator touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicMap {
    pub wake_detected: String,
    pub transcription: String,
    pub llm_response: String,
    pub speaking: String,
    pub command: String,
    pub state: String,
    pub llm_request: String,
    pub emotion: String,
}

impl Default for TopicMap {
    fn default() -> Self {
        Self {
            wake_detected: "session/wake_detected".to_string(),
            transcription: "audio/transcription".to_string(),
            llm_response: "llm/response".to_string(),
            speaking: "robot/speaking".to_string(),
            command: "session/command".to_string(),
            state: "session/state".to_string(),
            llm_request: "llm/request".to_string(),
            emotion: "robot/emotion".to_string(),
        }
    }
}

impl TopicMap {
    pub fn inbound(&self) -> Vec<String> {
        vec![
            self.wake_detected.clone(),
            self.transcription.clone(),
            self.llm_response.clone(),
            self.speaking.clone(),
            self.command.clone(),
        ]
    }

    fn all(&self) -> [(&'static str, &str); 8] {
        [
            ("wake_detected", self.wake_detected.as_str()),
            ("transcription", self.transcription.as_str()),
            ("llm_response", self.llm_response.as_str()),
            ("speaking", self.speaking.as_str()),
            ("command", self.command.as_str()),
            ("state", self.state.as_str()),
            ("llm_request", self.llm_request.as_str()),
            ("emotion", self.emotion.as_str()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub idle_timeout_secs: u64,
    pub min_wake_confidence: f32,
    pub goodbye_phrases: Vec<String>,
    /// Return to listening after the robot finished speaking instead of idling.
    pub follow_up: bool,
    pub publish_emotion: bool,
    /// Wrap outgoing LLM requests in a JSON envelope carrying correlation ids.
    pub tag_requests: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            min_wake_confidence: 0.0,
            goodbye_phrases: ["goodbye", "bye", "see you", "that's all", "stop listening"]
                .into_iter()
                .map(String::from)
                .collect(),
            follow_up: false,
            publish_emotion: true,
            tag_requests: false,
        }
    }
}

impl SessionSettings {
    pub fn policy(&self) -> SessionPolicy {
        SessionPolicy {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            min_wake_confidence: self.min_wake_confidence,
            goodbye_phrases: self
                .goodbye_phrases
                .iter()
                .map(|phrase| phrase.trim().to_lowercase())
                .filter(|phrase| !phrase.is_empty())
                .collect(),
            follow_up: self.follow_up,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    pub jitter: JitterPolicy,
    /// Consecutive failures tolerated before exiting; absent means forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: JitterPolicy::Equal,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectSettings {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: BackoffPolicy {
                first: Duration::from_millis(self.initial_delay_ms),
                max: Duration::from_millis(self.max_delay_ms),
                factor: self.factor,
                jitter: self.jitter,
            },
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Upper bound of a single bus receive wait.
    pub poll_interval_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub json: bool,
    /// Also write a daily rolling log file here.
    pub directory: Option<PathBuf>,
}

impl AppConfig {
    /// Reads `path` when given, applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_BROKER_HOST) {
            self.broker.host = host;
        }
        if let Some(port) = lookup(ENV_BROKER_PORT) {
            self.broker.port = port.trim().parse().map_err(|_| ConfigError::Env {
                key: ENV_BROKER_PORT,
                value: port.clone(),
            })?;
        }
        if let Some(secs) = lookup(ENV_IDLE_TIMEOUT_SECS) {
            self.session.idle_timeout_secs =
                secs.trim().parse().map_err(|_| ConfigError::Env {
                    key: ENV_IDLE_TIMEOUT_SECS,
                    value: secs.clone(),
                })?;
        }
        if let Some(username) = lookup(ENV_USERNAME) {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.broker.password = Some(password);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.host is empty".into()));
        }
        if self.session.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.idle_timeout_secs must be at least 1".into(),
            ));
        }
        if self.session.idle_timeout_secs > MAX_IDLE_TIMEOUT_SECS {
            return Err(ConfigError::Invalid(format!(
                "session.idle_timeout_secs must be at most {MAX_IDLE_TIMEOUT_SECS}"
            )));
        }
        if self.runtime.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "runtime.poll_interval_ms must be non-zero".into(),
            ));
        }
        if !self.session.min_wake_confidence.is_finite() {
            return Err(ConfigError::Invalid(
                "session.min_wake_confidence must be finite".into(),
            ));
        }
        if self.reconnect.factor < 1.0 || !self.reconnect.factor.is_finite() {
            return Err(ConfigError::Invalid("reconnect.factor must be >= 1.0".into()));
        }

        for (name, topic) in self.topics.all() {
            if topic.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("topics.{name} is empty")));
            }
        }

        let inbound = self.topics.inbound();
        let unique: HashSet<&String> = inbound.iter().collect();
        if unique.len() != inbound.len() {
            return Err(ConfigError::Invalid(
                "inbound topics must be distinct".into(),
            ));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.runtime.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_match_deployed_robot() {
        let config = AppConfig::default();
        assert_eq!(config.broker.address(), "localhost:1883");
        assert_eq!(config.broker.client_id, "session_manager");
        assert_eq!(config.session.idle_timeout_secs, 30);
        assert_eq!(config.topics.state, "session/state");
        assert_eq!(config.topics.inbound().len(), 5);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [broker]
            host = "mqtt.local"

            [session]
            idle_timeout_secs = 45
            follow_up = true

            [reconnect]
            jitter = "full"
            max_attempts = 3
            "#,
        )
        .expect("parse");

        assert_eq!(config.broker.host, "mqtt.local");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.session.idle_timeout_secs, 45);
        assert!(config.session.follow_up);
        assert_eq!(config.topics, TopicMap::default());

        let policy = config.reconnect.policy();
        assert_eq!(policy.backoff.jitter, JitterPolicy::Full);
        assert_eq!(policy.max_attempts, Some(3));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[topics]\nstate = \"robot/session_state\"").expect("write");

        let config = AppConfig::load(Some(file.path())).expect("load");
        assert_eq!(config.topics.state, "robot/session_state");
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_BROKER_HOST, "10.0.0.5"),
            (ENV_BROKER_PORT, "8883"),
            (ENV_IDLE_TIMEOUT_SECS, "12"),
            (ENV_USERNAME, "robot"),
        ]);
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|value| value.to_string()))
            .expect("overrides");

        assert_eq!(config.broker.address(), "10.0.0.5:8883");
        assert_eq!(config.session.idle_timeout_secs, 12);
        assert_eq!(config.broker.username.as_deref(), Some("robot"));
        assert!(config.broker.password.is_none());
    }

    #[test]
    fn bad_env_port_is_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == ENV_BROKER_PORT).then(|| "mqtt".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { key: ENV_BROKER_PORT, .. }));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.session.idle_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.topics.transcription = config.topics.wake_detected.clone();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.topics.emotion = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_idle_timeout_is_rejected() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(|key| {
                (key == ENV_IDLE_TIMEOUT_SECS).then(|| u64::MAX.to_string())
            })
            .expect("override parses");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.session.idle_timeout_secs = MAX_IDLE_TIMEOUT_SECS;
        config.validate().expect("one day is allowed");
    }

    #[test]
    fn session_policy_normalizes_phrases() {
        let mut settings = SessionSettings::default();
        settings.goodbye_phrases = vec!["  Good Night ".into(), "".into()];
        let policy = settings.policy();
        assert_eq!(policy.goodbye_phrases, vec!["good night".to_string()]);
        assert_eq!(policy.idle_timeout, Duration::from_secs(30));
    }
}
