//! # Agent Configuration
//!
//! Typed configuration for the agent service: buffer sizing, the REST
//! endpoint, per-adapter connection settings, upstream agent sources, and
//! the optional MQTT publisher. Loaded from a TOML file with environment
//! overrides for the well-known `MTC_*` paths.

mod error;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

pub use error::ConfigError;

/// Result type for configuration loading
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Environment variable overriding the configuration file path
pub const ENV_CONFIG_PATH: &str = "MTC_CONFIG_PATH";
/// Environment variable overriding the data directory
pub const ENV_DATA_PATH: &str = "MTC_DATA_PATH";
/// Environment variable overriding the plugin directory
pub const ENV_PLUGIN_PATH: &str = "MTC_PLUGIN_PATH";

fn default_buffer_size() -> usize {
    131_072
}

fn default_checkpoint_frequency() -> u64 {
    1000
}

fn default_max_assets() -> usize {
    1024
}

fn default_worker_threads() -> usize {
    2
}

fn default_port() -> u16 {
    5000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

fn default_legacy_timeout_ms() -> u64 {
    60_000
}

fn default_reconnect_interval_ms() -> u64 {
    10_000
}

fn default_shdr_port() -> u16 {
    7878
}

fn default_true() -> bool {
    true
}

fn default_count() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_qos() -> u8 {
    0
}

fn default_mqtt_interval_ms() -> u64 {
    10_000
}

/// Top-level agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AgentConfig {
    /// REST endpoint
    pub server: ServerConfig,
    /// Observation ring capacity
    pub buffer_size: usize,
    /// Observations between Current checkpoints
    pub checkpoint_frequency: u64,
    /// Asset buffer capacity
    pub max_assets: usize,
    /// Tokio worker threads
    pub worker_threads: usize,
    /// Accept PUT/POST observation and asset writes
    pub allow_put: bool,
    /// Value reported in document headers
    pub sender: Option<String>,
    /// Device model file (JSON)
    pub devices: PathBuf,
    /// Directory for runtime data
    pub data_path: Option<PathBuf>,
    /// Directory for plugins
    pub plugin_path: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    /// SHDR adapters to connect to
    pub adapters: Vec<AdapterConfig>,
    /// Upstream agents to ingest from
    pub agents: Vec<UpstreamConfig>,
    /// Optional MQTT publisher
    pub mqtt: Option<MqttConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            buffer_size: default_buffer_size(),
            checkpoint_frequency: default_checkpoint_frequency(),
            max_assets: default_max_assets(),
            worker_threads: default_worker_threads(),
            allow_put: false,
            sender: None,
            devices: PathBuf::from("devices.json"),
            data_path: None,
            plugin_path: None,
            pid_file: None,
            adapters: Vec::new(),
            agents: Vec::new(),
            mqtt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// One SHDR adapter connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub host: String,
    #[serde(default = "default_shdr_port")]
    pub port: u16,
    /// Device bare data-item keys resolve against
    pub device: Option<String>,
    /// Topic list folded into the adapter identity
    pub topics: Vec<String>,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_legacy_timeout_ms")]
    pub legacy_timeout_ms: u64,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_true")]
    pub conversion_required: bool,
    pub relative_time: bool,
    pub real_time: bool,
    pub upcase_values: bool,
    /// Assert AVAILABILITY on connect
    pub auto_available: bool,
    pub shdr_version: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_shdr_port(),
            device: None,
            topics: Vec::new(),
            heartbeat_ms: default_heartbeat_ms(),
            legacy_timeout_ms: default_legacy_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            conversion_required: true,
            relative_time: false,
            real_time: false,
            upcase_values: false,
            auto_available: false,
            shdr_version: 1,
        }
    }
}

impl AdapterConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn legacy_timeout(&self) -> Duration {
        Duration::from_millis(self.legacy_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// One upstream agent to mirror
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the peer agent, e.g. `http://upstream:5000/`
    pub url: String,
    pub device: Option<String>,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            device: None,
            count: default_count(),
            poll_interval_ms: default_poll_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl UpstreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// MQTT publishing service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub client_id: Option<String>,
    #[serde(default = "default_qos")]
    pub qos: u8,
    pub retain: bool,
    pub probe_topic: String,
    pub current_topic: String,
    pub sample_topic: String,
    pub asset_topic: String,
    pub device_topic: String,
    pub observation_topic: String,
    #[serde(default = "default_mqtt_interval_ms")]
    pub current_interval_ms: u64,
    #[serde(default = "default_mqtt_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_count")]
    pub sample_count: usize,
    #[serde(default = "default_reconnect_interval_ms")]
    pub connect_interval_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_mqtt_port(),
            client_id: None,
            qos: 0,
            retain: false,
            probe_topic: "MTConnect/Probe".to_string(),
            current_topic: "MTConnect/Current".to_string(),
            sample_topic: "MTConnect/Sample".to_string(),
            asset_topic: "MTConnect/Asset".to_string(),
            device_topic: "MTConnect/Device".to_string(),
            observation_topic: "MTConnect/Observation".to_string(),
            current_interval_ms: default_mqtt_interval_ms(),
            sample_interval_ms: default_mqtt_interval_ms(),
            sample_count: default_count(),
            connect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file, then apply `MTC_*` environment
    /// overrides and validate.
    pub fn load(path: &Path) -> Result<AgentConfig> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AgentConfig = toml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Resolve the configuration path: explicit flag, `MTC_CONFIG_PATH`, or
    /// the default `agent.toml` in the working directory.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }
        PathBuf::from("agent.toml")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ENV_DATA_PATH) {
            self.data_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var(ENV_PLUGIN_PATH) {
            self.plugin_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: "must be nonzero".to_string(),
            });
        }
        if self.checkpoint_frequency == 0 {
            return Err(ConfigError::Invalid {
                field: "checkpoint_frequency",
                reason: "must be nonzero".to_string(),
            });
        }
        if self.max_assets == 0 {
            return Err(ConfigError::Invalid {
                field: "max_assets",
                reason: "must be nonzero".to_string(),
            });
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "worker_threads",
                reason: "must be nonzero".to_string(),
            });
        }
        for adapter in &self.adapters {
            if adapter.host.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "adapters.host",
                    reason: "adapter host must not be empty".to_string(),
                });
            }
        }
        for agent in &self.agents {
            if agent.url.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "agents.url",
                    reason: "upstream agent url must not be empty".to_string(),
                });
            }
        }
        if let Some(mqtt) = &self.mqtt {
            if mqtt.qos > 2 {
                return Err(ConfigError::Invalid {
                    field: "mqtt.qos",
                    reason: format!("qos {} is not one of 0, 1, 2", mqtt.qos),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = AgentConfig::default();
        assert_eq!(131_072, config.buffer_size);
        assert_eq!(1000, config.checkpoint_frequency);
        assert_eq!(1024, config.max_assets);
        assert_eq!(2, config.worker_threads);
        assert!(!config.allow_put);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_toml_with_adapters() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
buffer_size = 4096
allow_put = true
devices = "model.json"

[server]
port = 5001

[[adapters]]
host = "machine-1"
port = 7878
device = "Mill-1"
heartbeat_ms = 5000

[[agents]]
url = "http://upstream:5000/"
count = 50

[mqtt]
host = "broker"
qos = 1
"#
        )
        .unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(4096, config.buffer_size);
        assert_eq!(5001, config.server.port);
        assert_eq!(1, config.adapters.len());
        assert_eq!("machine-1", config.adapters[0].host);
        assert_eq!(Duration::from_secs(5), config.adapters[0].heartbeat());
        assert_eq!(Duration::from_secs(60), config.adapters[0].legacy_timeout());
        assert_eq!(1, config.agents.len());
        assert_eq!(50, config.agents[0].count);
        assert_eq!(1, config.mqtt.as_ref().unwrap().qos);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = AgentConfig::default();
        config.buffer_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "buffer_size", .. })
        ));

        let mut config = AgentConfig::default();
        config.mqtt = Some(MqttConfig { qos: 3, ..MqttConfig::default() });
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = AgentConfig::load(Path::new("/nonexistent/agent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
