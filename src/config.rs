use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs, io};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "vigia.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_seconds: u64,
    /// A stored heartbeat younger than this blocks a new session on the post.
    pub takeover_threshold_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            takeover_threshold_seconds: 45,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ComplianceConfigSection {
    pub tick_seconds: u64,
    pub grace_minutes: u32,
}

impl Default for ComplianceConfigSection {
    fn default() -> Self {
        Self {
            tick_seconds: 60,
            grace_minutes: 5,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Polled to decide online/offline. Without it the client stays online.
    pub probe_url: Option<String>,
    pub probe_interval_seconds: u64,
    pub probe_timeout_seconds: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_url: None,
            probe_interval_seconds: 10,
            probe_timeout_seconds: 5,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MailProvider {
    #[default]
    Relay,
    SendGrid,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MailConfig {
    pub provider: MailProvider,
    pub relay_url: Option<String>,
    pub sendgrid_api_key: Option<String>,
    pub from: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            provider: MailProvider::Relay,
            relay_url: None,
            sendgrid_api_key: None,
            from: "noreply@deltanuvem.com".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Holds the offline queue and the hidden-events set.
    pub data_dir: PathBuf,
    pub database: DatabaseConfig,
    pub heartbeat: HeartbeatConfig,
    pub compliance: ComplianceConfigSection,
    pub connectivity: ConnectivityConfig,
    pub mail: MailConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database: DatabaseConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            compliance: ComplianceConfigSection::default(),
            connectivity: ConnectivityConfig::default(),
            mail: MailConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Reads the TOML file (defaults when it does not exist), then applies
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults.");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        config.apply_env(|key| env::var(key).ok());
        config.validate()?;
        info!(path = %path.display(), data_dir = %config.data_dir.display(), "Configuration loaded.");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(key) = lookup("SENDGRID_API_KEY") {
            self.mail.sendgrid_api_key = Some(key);
        }
        if let Some(url) = lookup("VIGIA_MAIL_RELAY_URL") {
            self.mail.relay_url = Some(url);
        }
        if let Some(dir) = lookup("VIGIA_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_seconds must be positive".to_string(),
            ));
        }
        if self.heartbeat.takeover_threshold_seconds <= self.heartbeat.interval_seconds {
            return Err(ConfigError::Invalid(format!(
                "heartbeat.takeover_threshold_seconds ({}) must exceed heartbeat.interval_seconds ({})",
                self.heartbeat.takeover_threshold_seconds, self.heartbeat.interval_seconds
            )));
        }
        if self.compliance.tick_seconds == 0 || self.connectivity.probe_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "tick and probe intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_seconds)
    }

    pub fn takeover_threshold(&self) -> Duration {
        Duration::from_secs(self.heartbeat.takeover_threshold_seconds)
    }

    pub fn grace_minutes(&self) -> u32 {
        self.compliance.grace_minutes
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database
            .url
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("DATABASE_URL must be set".to_string()))
    }
}
