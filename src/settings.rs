use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::retry::RetryPolicy;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// IANA name; local class and appointment times are read in this zone.
    pub timezone: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub admin_token: String,
    /// JSON array of `{token, member_id, tier, active}` for the bundled identity provider.
    pub members_file: Option<PathBuf>,
    pub lock_timeout_ms: u64,
    /// Retries after the first attempt when a lock wait or WAL write fails.
    pub retry_max_attempts: usize,
    pub retry_initial_delay_ms: u64,
    pub reaper_interval_secs: u64,
    pub log_level: String,
}

impl Settings {
    /// Defaults, then `roster.toml` if present, then `ROSTER_*` variables
    /// (a `.env` file is loaded into the environment first).
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let config = Config::builder()
            .set_default("bind", "0.0.0.0")?
            .set_default("port", 7070)?
            .set_default("data_dir", "./data")?
            .set_default("timezone", "UTC")?
            .set_default("max_connections", 256)?
            .set_default("admin_token", "change-me")?
            .set_default("lock_timeout_ms", 2_000)?
            .set_default("retry_max_attempts", 3)?
            .set_default("retry_initial_delay_ms", 25)?
            .set_default("reaper_interval_secs", 30)?
            .set_default("log_level", "info")?
            .add_source(File::with_name("roster").required(false))
            .add_source(Environment::with_prefix("ROSTER").try_parsing(true))
            .build()?;

        config.try_deserialize()
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| ConfigError::Message(format!("timezone {:?}: {e}", self.timezone)))
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roster.wal")
    }

    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        Ok(EngineConfig {
            wal_path: self.wal_path(),
            timezone: self.timezone()?,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            retry: RetryPolicy::new(
                self.retry_max_attempts,
                Duration::from_millis(self.retry_initial_delay_ms),
            ),
        })
    }
}
