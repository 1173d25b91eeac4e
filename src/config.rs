use crate::parser::SERVING_CELL_COMMAND;
use crate::query::{DEFAULT_MAX_READ_ATTEMPTS, MAX_READ_ATTEMPTS};
use crate::store::DEFAULT_RETENTION_DAYS;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "MODEM_POLLER";
pub const MAX_READ_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PollerConfig {
    pub device: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub max_read_attempts: usize,
    pub tick_interval_ms: u64,
    pub maintenance_every_ticks: u64,
    pub retention_days: i64,
    pub snapshot_path: PathBuf,
    pub serving_cell_command: String,
    pub export_command: Option<Vec<String>>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB2".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 1000,
            max_read_attempts: DEFAULT_MAX_READ_ATTEMPTS,
            tick_interval_ms: 1000,
            maintenance_every_ticks: 300,
            retention_days: DEFAULT_RETENTION_DAYS,
            snapshot_path: PathBuf::from("modem_status.json"),
            serving_cell_command: SERVING_CELL_COMMAND.to_string(),
            export_command: None,
        }
    }
}

impl PollerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let invalid = |msg: &str| -> Result<(), config::ConfigError> {
            Err(config::ConfigError::Message(msg.to_string()))
        };

        if self.baud_rate == 0 {
            return invalid("baud_rate must be greater than zero");
        }
        if self.read_timeout_ms == 0 || self.read_timeout_ms > MAX_READ_TIMEOUT_MS {
            return invalid("read_timeout_ms must be between 1 and 60000");
        }
        if self.tick_interval_ms == 0 {
            return invalid("tick_interval_ms must be greater than zero");
        }
        if self.maintenance_every_ticks == 0 {
            return invalid("maintenance_every_ticks must be greater than zero");
        }
        if self.max_read_attempts == 0 || self.max_read_attempts > MAX_READ_ATTEMPTS {
            return invalid("max_read_attempts must be between 1 and 32");
        }
        if self.retention_days <= 0 {
            return invalid("retention_days must be positive");
        }
        if self.serving_cell_command.trim().is_empty() {
            return invalid("serving_cell_command must not be empty");
        }
        if matches!(&self.export_command, Some(argv) if argv.is_empty()) {
            return invalid("export_command must name a program");
        }
        Ok(())
    }
}

/// Load settings from an optional TOML file, then `MODEM_POLLER_*` variables.
///
/// An explicitly given file must exist; without one only the environment and
/// built-in defaults apply. `MODEM_POLLER_EXPORT_COMMAND` is split on spaces.
pub fn load_config(path: Option<&Path>) -> Result<PollerConfig, config::ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }
    let settings = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(" ")
                .with_list_parse_key("export_command"),
        )
        .build()?;

    let config: PollerConfig = settings.try_deserialize()?;
    config.validate()?;
    Ok(config)
}
