//! Server configuration.
//!
//! Loaded from a JSON file named by `--config` (or the `CONFIG` env var),
//! falling back to environment variables and then hardcoded defaults for
//! every field. A missing config file is not an error; the environment and
//! defaults carry a full configuration.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;

/// CLI arguments for the checkout server.
#[derive(Parser, Debug)]
#[command(name = "checkout-rs")]
#[command(about = "Crypto checkout HTTP server")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default = "config_defaults::default_log_level")]
    log_level: LogLevel,
    /// Connection string for a SQL-backed event log and credential store.
    /// Unset runs the in-memory reference stores.
    #[serde(default = "config_defaults::default_database_url")]
    database_url: Option<String>,
    /// Streaming bus brokers. Unset runs the in-memory reference bus.
    #[serde(default)]
    brokers: Vec<String>,
    /// Event-type (or family) to topic overrides.
    #[serde(default)]
    topics: HashMap<String, String>,
    #[serde(default = "config_defaults::default_jwt_secret")]
    jwt_secret: String,
    /// Bearer expected on administrative endpoints.
    #[serde(default = "config_defaults::default_admin_token")]
    admin_token: Option<String>,
    #[serde(default = "config_defaults::default_webhook_workers")]
    webhook_workers: usize,
    #[serde(default = "config_defaults::default_sweeper_interval_secs")]
    sweeper_interval_secs: u64,
    #[serde(default = "config_defaults::default_confirmation_timeout_minutes")]
    confirmation_timeout_minutes: u64,
    #[serde(default = "config_defaults::default_outbox_batch")]
    outbox_batch: usize,
    #[serde(default = "config_defaults::default_shutdown_grace_secs")]
    shutdown_grace_secs: u64,
}

pub mod config_defaults {
    use super::LogLevel;
    use std::env;
    use std::net::IpAddr;

    pub const DEFAULT_PORT: u16 = 8080;

    /// $PORT env var -> 8080
    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// $HOST env var -> "0.0.0.0"
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4([0, 0, 0, 0].into()))
    }

    /// $LOG_LEVEL env var -> info
    pub fn default_log_level() -> LogLevel {
        match env::var("LOG_LEVEL").ok().as_deref() {
            Some("debug") => LogLevel::Debug,
            Some("warn") => LogLevel::Warn,
            Some("error") => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn default_database_url() -> Option<String> {
        env::var("DATABASE_URL").ok()
    }

    /// $JWT_SECRET env var; the fallback is development-only.
    pub fn default_jwt_secret() -> String {
        env::var("JWT_SECRET").unwrap_or_else(|_| "development-signing-secret".to_string())
    }

    pub fn default_admin_token() -> Option<String> {
        env::var("ADMIN_TOKEN").ok()
    }

    pub fn default_webhook_workers() -> usize {
        env::var("WEBHOOK_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8)
    }

    pub fn default_sweeper_interval_secs() -> u64 {
        env::var("SWEEPER_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30)
    }

    pub fn default_confirmation_timeout_minutes() -> u64 {
        env::var("CONFIRMATION_TIMEOUT_MINUTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60)
    }

    pub fn default_outbox_batch() -> usize {
        64
    }

    pub fn default_shutdown_grace_secs() -> u64 {
        10
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            log_level: config_defaults::default_log_level(),
            database_url: config_defaults::default_database_url(),
            brokers: Vec::new(),
            topics: HashMap::new(),
            jwt_secret: config_defaults::default_jwt_secret(),
            admin_token: config_defaults::default_admin_token(),
            webhook_workers: config_defaults::default_webhook_workers(),
            sweeper_interval_secs: config_defaults::default_sweeper_interval_secs(),
            confirmation_timeout_minutes: config_defaults::default_confirmation_timeout_minutes(),
            outbox_batch: config_defaults::default_outbox_batch(),
            shutdown_grace_secs: config_defaults::default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref()
    }

    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    pub fn topics(&self) -> &HashMap<String, String> {
        &self.topics
    }

    pub fn jwt_secret(&self) -> &str {
        &self.jwt_secret
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    pub fn webhook_workers(&self) -> usize {
        self.webhook_workers
    }

    pub fn sweeper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweeper_interval_secs)
    }

    pub fn confirmation_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.confirmation_timeout_minutes as i64)
    }

    pub fn outbox_batch(&self) -> usize {
        self.outbox_batch
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Loads configuration from the CLI-selected file. A missing file yields
    /// the environment-and-defaults configuration.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        Self::load_from_path(cli_args.config)
    }

    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}
