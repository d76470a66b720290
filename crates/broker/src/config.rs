use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use jsonc_parser::{parse_to_serde_value, ParseOptions};
use serde::Deserialize;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, message: String },
    Parse { path: PathBuf, message: String },
    UnknownBackend(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, message } => {
                write!(f, "read config {}: {message}", path.display())
            }
            Self::Parse { path, message } => {
                write!(f, "parse config {}: {message}", path.display())
            }
            Self::UnknownBackend(backend) => {
                write!(
                    f,
                    "unknown storage backend: {backend} (use 'sqlite' or 'sqlite:memory')"
                )
            }
        }
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Disk,
    Memory,
}

impl StorageBackend {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "sqlite" | "sqlite:disk" => Ok(Self::Disk),
            "sqlite:memory" => Ok(Self::Memory),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub max_age: Duration,
    pub check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct GroupsConfig {
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_connections: usize,
    pub max_message_size: usize,
    pub max_fetch_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub kafka_addr: String,
    pub data_dir: PathBuf,
    pub backend: StorageBackend,
    pub log_level: String,
    pub auto_create_topics: bool,
    pub scheduler: SchedulerConfig,
    pub retention: RetentionConfig,
    pub groups: GroupsConfig,
    pub limits: LimitsConfig,
    /// When set, the SASL PLAIN gate is enabled and this is the password.
    pub auth_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kafka_addr: ":9092".to_string(),
            data_dir: PathBuf::from("./data"),
            backend: StorageBackend::Disk,
            log_level: "info".to_string(),
            auto_create_topics: true,
            scheduler: SchedulerConfig {
                tick_interval: Duration::from_millis(100),
            },
            retention: RetentionConfig {
                enabled: true,
                max_age: Duration::from_secs(24 * 60 * 60),
                check_interval: Duration::from_secs(60),
            },
            groups: GroupsConfig {
                session_timeout: Duration::from_secs(30),
                heartbeat_interval: Duration::from_secs(3),
            },
            limits: LimitsConfig {
                max_connections: 100,
                max_message_size: 1 << 20,
                max_fetch_bytes: 10 << 20,
            },
            auth_token: None,
        }
    }
}

/// Optional overrides as they appear in a JSONC config file.  Durations are
/// plain millisecond counts.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    kafka_addr: Option<String>,
    data_dir: Option<PathBuf>,
    storage_backend: Option<String>,
    log_level: Option<String>,
    auto_create_topics: Option<bool>,
    scheduler_tick_interval_ms: Option<u64>,
    retention_enabled: Option<bool>,
    retention_max_age_ms: Option<u64>,
    retention_check_interval_ms: Option<u64>,
    group_session_timeout_ms: Option<u64>,
    group_heartbeat_interval_ms: Option<u64>,
    max_connections: Option<usize>,
    max_message_size: Option<usize>,
    max_fetch_bytes: Option<usize>,
    auth_token: Option<String>,
}

impl Config {
    /// Defaults, overlaid with the config file (when given) and then the
    /// `MONOLOG_*` environment.  Flags are applied by the caller on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            config.apply_file(path)?;
        }
        config.apply_env()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let value = parse_to_serde_value(&raw, &ParseOptions::default())
            .map_err(|err| ConfigError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?
            .unwrap_or(serde_json::Value::Null);
        let file: ConfigFile =
            serde_json::from_value(value).map_err(|err| ConfigError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;

        if let Some(kafka_addr) = file.kafka_addr {
            self.kafka_addr = kafka_addr;
        }
        if let Some(data_dir) = file.data_dir {
            self.data_dir = data_dir;
        }
        if let Some(backend) = file.storage_backend {
            self.backend = StorageBackend::parse(&backend)?;
        }
        if let Some(log_level) = file.log_level {
            self.log_level = log_level;
        }
        if let Some(auto_create) = file.auto_create_topics {
            self.auto_create_topics = auto_create;
        }
        if let Some(ms) = file.scheduler_tick_interval_ms {
            self.scheduler.tick_interval = Duration::from_millis(ms);
        }
        if let Some(enabled) = file.retention_enabled {
            self.retention.enabled = enabled;
        }
        if let Some(ms) = file.retention_max_age_ms {
            self.retention.max_age = Duration::from_millis(ms);
        }
        if let Some(ms) = file.retention_check_interval_ms {
            self.retention.check_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.group_session_timeout_ms {
            self.groups.session_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.group_heartbeat_interval_ms {
            self.groups.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(max) = file.max_connections {
            self.limits.max_connections = max;
        }
        if let Some(max) = file.max_message_size {
            self.limits.max_message_size = max;
        }
        if let Some(max) = file.max_fetch_bytes {
            self.limits.max_fetch_bytes = max;
        }
        if let Some(token) = file.auth_token {
            self.auth_token = Some(token);
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = std::env::var("MONOLOG_KAFKA_ADDR") {
            if !addr.is_empty() {
                self.kafka_addr = addr;
            }
        }
        if let Ok(dir) = std::env::var("MONOLOG_DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(backend) = std::env::var("MONOLOG_STORAGE_BACKEND") {
            if !backend.is_empty() {
                self.backend = StorageBackend::parse(&backend)?;
            }
        }
        if let Ok(level) = std::env::var("MONOLOG_LOG_LEVEL") {
            if !level.is_empty() {
                self.log_level = level;
            }
        }
        if let Ok(token) = std::env::var("MONOLOG_AUTH_TOKEN") {
            if !token.is_empty() {
                self.auth_token = Some(token);
            }
        }
        Ok(())
    }

    /// Host and port a client should use to reach this broker, derived from
    /// the listen address.  A wildcard or empty host becomes `localhost`.
    pub fn advertised_host_port(&self) -> (String, i32) {
        advertised_host_port(&self.kafka_addr)
    }

    /// Address to hand to the socket API.  The Go-style `:9092` shorthand
    /// binds every interface.
    pub fn listen_addr(&self) -> String {
        match self.kafka_addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.kafka_addr.clone(),
        }
    }
}

pub(crate) fn advertised_host_port(addr: &str) -> (String, i32) {
    let (host, port) = match addr.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<i32>().unwrap_or(9092)),
        None => (addr, 9092),
    };
    let host = match host {
        "" | "0.0.0.0" | "::" | "[::]" => "localhost",
        other => other,
    };
    (host.to_string(), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = Config::default();
        assert_eq!(config.kafka_addr, ":9092");
        assert_eq!(config.backend, StorageBackend::Disk);
        assert!(config.auto_create_topics);
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(100));
        assert_eq!(config.retention.max_age, Duration::from_secs(86_400));
        assert_eq!(config.retention.check_interval, Duration::from_secs(60));
        assert_eq!(config.groups.session_timeout, Duration::from_secs(30));
        assert_eq!(config.limits.max_connections, 100);
        assert_eq!(config.limits.max_message_size, 1 << 20);
        assert_eq!(config.limits.max_fetch_bytes, 10 << 20);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn jsonc_file_overrides_defaults() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!(
            "monolog-config-unit-{}-{}.jsonc",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("system clock after unix epoch")
                .as_nanos()
        ));
        std::fs::write(
            &path,
            r#"{
  // local test overrides
  "kafka_addr": "127.0.0.1:19092",
  "storage_backend": "sqlite:memory",
  "retention_max_age_ms": 1000,
  "auth_token": "secret",
}"#,
        )
        .expect("write config");

        let mut config = Config::default();
        config.apply_file(&path).expect("apply");
        assert_eq!(config.kafka_addr, "127.0.0.1:19092");
        assert_eq!(config.backend, StorageBackend::Memory);
        assert_eq!(config.retention.max_age, Duration::from_millis(1000));
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        // Untouched keys keep their defaults.
        assert_eq!(config.limits.max_connections, 100);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(matches!(
            StorageBackend::parse("postgres"),
            Err(ConfigError::UnknownBackend(_))
        ));
        assert_eq!(
            StorageBackend::parse("sqlite:disk").expect("disk"),
            StorageBackend::Disk
        );
    }

    #[test]
    fn listen_addr_expands_the_port_shorthand() {
        let mut config = Config::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:9092");
        config.kafka_addr = "127.0.0.1:19092".to_string();
        assert_eq!(config.listen_addr(), "127.0.0.1:19092");
    }

    #[test]
    fn advertised_host_port_fills_gaps() {
        assert_eq!(advertised_host_port(":9092"), ("localhost".to_string(), 9092));
        assert_eq!(
            advertised_host_port("0.0.0.0:1234"),
            ("localhost".to_string(), 1234)
        );
        assert_eq!(
            advertised_host_port("broker.internal:9092"),
            ("broker.internal".to_string(), 9092)
        );
    }
}
