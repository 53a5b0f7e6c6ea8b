//! Configuration management for the enrichment service.
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Default configuration (embedded in binary)
//! 2. `config/local.toml` in the working directory, if present
//! 3. User-specified configuration file (`--config`)
//! 4. Environment variables prefixed with `ENRICHER_`, nested keys joined
//!    with `__` (e.g. `ENRICHER_ENGINE__POLL_INTERVAL_SECS=60`)
//! 5. Command-line arguments, each of which also reads the flat variable
//!    names used by the Garmin collector stack (`INFLUXDB_HOST`,
//!    `ENRICH_CHECK_INTERVAL_SECONDS`, ...)
//!
//! [`load_environment`] should run before parsing so that `.env` files feed
//! both the `ENRICHER_` layer and the flat variables.

use crate::error::EnricherError;
use clap::Parser;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const LOCAL_CONFIG_PATH: &str = "config/local.toml";
const OVERRIDE_ENV_FILE: &str = "override-default-vars.env";

/// Longest accepted first-run lookback, roughly a century.
pub const MAX_LOOKBACK_DAYS: i64 = 36_500;

/// Command-line arguments.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Store host name
    #[arg(long, env = "INFLUXDB_HOST")]
    pub host: Option<String>,

    /// Store port
    #[arg(long, env = "INFLUXDB_PORT")]
    pub port: Option<u16>,

    /// Store username (InfluxDB 1.x)
    #[arg(long, env = "INFLUXDB_USERNAME")]
    pub username: Option<String>,

    /// Store password (InfluxDB 1.x)
    #[arg(long, env = "INFLUXDB_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Access token (InfluxDB 3.x)
    #[arg(long, env = "INFLUXDB_V3_ACCESS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Database holding the raw input streams
    #[arg(long, env = "INFLUXDB_DATABASE")]
    pub database: Option<String>,

    /// Database receiving enriched streams
    #[arg(long, env = "INFLUXDB_ENRICHED_DATABASE")]
    pub output_database: Option<String>,

    /// Talk plain HTTP instead of HTTPS ("true", "t", "yes", "1")
    #[arg(long, env = "INFLUXDB_ENDPOINT_IS_HTTP")]
    pub endpoint_is_http: Option<String>,

    /// Seconds between polling cycles
    #[arg(long, env = "ENRICH_CHECK_INTERVAL_SECONDS")]
    pub poll_interval: Option<u64>,

    /// Days to scan back when an output stream has no data yet
    #[arg(long, env = "ENRICH_INITIAL_LOOKBACK_DAYS")]
    pub lookback_days: Option<i64>,

    /// Biological sex used to select reference grids
    #[arg(long, env = "GENDER")]
    pub sex: Option<String>,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Complete service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub store: StoreSettings,
    pub engine: EngineSettings,
    pub reference: ReferenceSettings,
    pub subject: SubjectSettings,
    pub logging: LoggingSettings,
}

/// Time-series store connection.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub use_https: bool,
    /// Database holding the raw input streams
    pub database: String,
    /// Database receiving enriched streams; `database` when unset
    #[serde(default)]
    pub output_database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub create_output_database: bool,
}

/// Authentication for the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    Token(String),
    Basic { username: String, password: String },
}

fn default_timeout_secs() -> u64 {
    30
}

impl StoreSettings {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn output_database(&self) -> &str {
        self.output_database
            .as_deref()
            .filter(|db| !db.is_empty())
            .unwrap_or(&self.database)
    }

    /// A token wins over username/password; empty values count as unset.
    pub fn credentials(&self) -> Option<Credentials> {
        if let Some(token) = self.token.as_ref().filter(|t| !t.is_empty()) {
            return Some(Credentials::Token(token.clone()));
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) if !username.is_empty() => Some(Credentials::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Polling engine timing.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    pub poll_interval_secs: u64,
    pub initial_lookback_days: i64,
    /// Backoff after a failed cycle; must exceed the poll interval
    pub recovery_delay_secs: u64,
    pub write_batch_size: usize,
    #[serde(default)]
    pub startup_delay_secs: u64,
}

/// Locations of the reference tables.
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceSettings {
    pub data_dir: PathBuf,
    pub sleep_scores_file: PathBuf,
    pub sleep_hr_file: PathBuf,
    pub vo2_hr_file: PathBuf,
}

impl ReferenceSettings {
    pub fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.data_dir.join(file)
        }
    }

    pub fn sleep_scores_path(&self) -> PathBuf {
        self.resolve(&self.sleep_scores_file)
    }

    pub fn sleep_hr_path(&self) -> PathBuf {
        self.resolve(&self.sleep_hr_file)
    }

    pub fn vo2_hr_path(&self) -> PathBuf {
        self.resolve(&self.vo2_hr_file)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubjectSettings {
    pub sex: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Settings {
    /// Loads configuration from all available sources.
    pub fn new(cli: &CliArgs) -> Result<Self, EnricherError> {
        let mut builder = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::from(PathBuf::from(LOCAL_CONFIG_PATH)).required(false));

        if let Some(ref config_path) = cli.config {
            builder = builder.add_source(File::from(config_path.clone()));
        }

        builder = builder.add_source(
            Environment::with_prefix("ENRICHER")
                .prefix_separator("_")
                .separator("__"),
        );

        if let Some(ref host) = cli.host {
            builder = builder.set_override("store.host", host.as_str())?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("store.port", port)?;
        }
        if let Some(ref username) = cli.username {
            builder = builder.set_override("store.username", username.as_str())?;
        }
        if let Some(ref password) = cli.password {
            builder = builder.set_override("store.password", password.as_str())?;
        }
        if let Some(ref token) = cli.token {
            builder = builder.set_override("store.token", token.as_str())?;
        }
        if let Some(ref database) = cli.database {
            builder = builder.set_override("store.database", database.as_str())?;
        }
        if let Some(ref database) = cli.output_database {
            builder = builder.set_override("store.output_database", database.as_str())?;
        }
        if let Some(ref is_http) = cli.endpoint_is_http {
            builder = builder.set_override("store.use_https", !parse_flag(is_http))?;
        }
        if let Some(interval) = cli.poll_interval {
            builder = builder.set_override("engine.poll_interval_secs", interval)?;
        }
        if let Some(days) = cli.lookback_days {
            builder = builder.set_override("engine.initial_lookback_days", days)?;
        }
        if let Some(ref sex) = cli.sex {
            builder = builder.set_override("subject.sex", sex.as_str())?;
        }
        if let Some(ref level) = cli.log_level {
            builder = builder.set_override("logging.level", level.as_str())?;
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), EnricherError> {
        let invalid = |key: &str, reason: &str| EnricherError::InvalidSetting {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if self.engine.poll_interval_secs == 0 {
            return Err(invalid("engine.poll_interval_secs", "must be positive"));
        }
        if self.engine.recovery_delay_secs <= self.engine.poll_interval_secs {
            return Err(invalid(
                "engine.recovery_delay_secs",
                "must be longer than engine.poll_interval_secs",
            ));
        }
        if self.engine.initial_lookback_days < 0 {
            return Err(invalid("engine.initial_lookback_days", "must not be negative"));
        }
        if self.engine.initial_lookback_days > MAX_LOOKBACK_DAYS {
            return Err(invalid(
                "engine.initial_lookback_days",
                &format!("must be at most {MAX_LOOKBACK_DAYS}"),
            ));
        }
        if self.engine.write_batch_size == 0 {
            return Err(invalid("engine.write_batch_size", "must be positive"));
        }
        if self.store.database.is_empty() {
            return Err(invalid("store.database", "must not be empty"));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "t" | "yes" | "1"
    )
}

/// Loads `.env` from the working directory, then applies
/// `override-default-vars.env` on top of the process environment.
///
/// Returns true when the override file was found.
pub fn load_environment() -> Result<bool, ConfigError> {
    dotenvy::dotenv().ok();

    match dotenvy::from_filename_override(OVERRIDE_ENV_FILE) {
        Ok(_) => Ok(true),
        Err(e) if e.not_found() => Ok(false),
        Err(e) => Err(ConfigError::Message(format!("{OVERRIDE_ENV_FILE}: {e}"))),
    }
}
