use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::circuit::FailureKind;
use crate::rules::RuleThresholds;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Fleet explanation gatekeeper")]
pub struct Config {
    /// Enable debug mode
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Usage flush interval in milliseconds
    #[arg(short = 'i', long, global = true)]
    pub flush_interval_ms: Option<u64>,

    /// Pending (tenant, day) entries that trigger an early flush
    #[arg(short = 'b', long, global = true)]
    pub max_batch_size: Option<usize>,

    /// Status API port
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// SQLite database for usage counters
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Keep usage counters in memory only (nothing survives a restart)
    #[arg(long, global = true)]
    pub memory_store: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the gatekeeper service (default)
    Serve,
    /// Evaluate a metric snapshot JSON file ("-" for stdin) and print findings
    Evaluate {
        /// Snapshot file
        path: PathBuf,
    },
}

impl Config {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Application settings (from config file, environment, and CLI)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Circuit breaker thresholds and eviction
    #[serde(default)]
    pub circuit: CircuitSettings,

    /// Usage aggregation and flushing
    #[serde(default)]
    pub usage: UsageSettings,

    /// Telemetry rule thresholds
    #[serde(default)]
    pub rules: RuleThresholds,

    /// Counter store settings
    #[serde(default)]
    pub store: StoreSettings,

    /// Status API settings
    #[serde(default)]
    pub web: WebSettings,
}

/// Failure budget for one (scope, failure kind)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold {
    /// Failures that open the circuit
    pub failures: u32,
    /// How long the circuit stays open after the last failure
    pub timeout_secs: u64,
}

impl Threshold {
    pub const fn new(failures: u32, timeout_secs: u64) -> Self {
        Self {
            failures,
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_tenant_rate_limit")]
    pub tenant_rate_limit: Threshold,

    #[serde(default = "default_tenant_server_error")]
    pub tenant_server_error: Threshold,

    #[serde(default = "default_tenant_data_error")]
    pub tenant_data_error: Threshold,

    #[serde(default = "default_global_server_error")]
    pub global_server_error: Threshold,

    #[serde(default = "default_global_rate_limit")]
    pub global_rate_limit: Threshold,

    /// Failure kinds that also count toward the global circuit
    #[serde(default = "default_global_mirrored_kinds")]
    pub global_mirrored_kinds: Vec<FailureKind>,

    /// Drop quiescent tenant entries idle for this long
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// Upper bound on tenant entries held in memory
    #[serde(default = "default_max_tenants")]
    pub max_tenants: usize,

    /// How often the idle sweep runs
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_tenant_rate_limit() -> Threshold {
    Threshold::new(2, 60)
}

fn default_tenant_server_error() -> Threshold {
    Threshold::new(3, 300)
}

fn default_tenant_data_error() -> Threshold {
    Threshold::new(5, 180)
}

fn default_global_server_error() -> Threshold {
    Threshold::new(10, 600)
}

fn default_global_rate_limit() -> Threshold {
    Threshold::new(5, 300)
}

fn default_global_mirrored_kinds() -> Vec<FailureKind> {
    vec![FailureKind::ServerError]
}

fn default_idle_ttl() -> u64 {
    3600
}

fn default_max_tenants() -> usize {
    10_000
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            tenant_rate_limit: default_tenant_rate_limit(),
            tenant_server_error: default_tenant_server_error(),
            tenant_data_error: default_tenant_data_error(),
            global_server_error: default_global_server_error(),
            global_rate_limit: default_global_rate_limit(),
            global_mirrored_kinds: default_global_mirrored_kinds(),
            idle_ttl_secs: default_idle_ttl(),
            max_tenants: default_max_tenants(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CircuitSettings {
    /// Threshold for a tenant circuit
    pub fn tenant_threshold(&self, kind: FailureKind) -> Threshold {
        match kind {
            FailureKind::RateLimit => self.tenant_rate_limit,
            FailureKind::ServerError => self.tenant_server_error,
            FailureKind::DataError => self.tenant_data_error,
        }
    }

    /// Threshold for the global circuit (data errors never trip it)
    pub fn global_threshold(&self, kind: FailureKind) -> Option<Threshold> {
        match kind {
            FailureKind::RateLimit => Some(self.global_rate_limit),
            FailureKind::ServerError => Some(self.global_server_error),
            FailureKind::DataError => None,
        }
    }

    /// Whether a failure of this kind is mirrored into the global circuit
    pub fn mirrors_to_global(&self, kind: FailureKind) -> bool {
        self.global_mirrored_kinds.contains(&kind) && self.global_threshold(kind).is_some()
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// Usage aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSettings {
    /// Timer flush interval in milliseconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Pending (tenant, day) entries that trigger an early flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Upper bound on a single store write in milliseconds
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,

    /// Stretch the timer after consecutive flush failures
    #[serde(default)]
    pub backoff_enabled: bool,

    /// Longest delay between retries when backoff is enabled
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

fn default_flush_interval() -> u64 {
    30_000
}

fn default_max_batch_size() -> usize {
    500
}

fn default_flush_timeout() -> u64 {
    10_000
}

fn default_backoff_max() -> u64 {
    300_000
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
            max_batch_size: default_max_batch_size(),
            flush_timeout_ms: default_flush_timeout(),
            backoff_enabled: false,
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl UsageSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Delay before the next timer flush given the current failure streak
    pub fn next_delay(&self, consecutive_failures: u32) -> Duration {
        if !self.backoff_enabled || consecutive_failures == 0 {
            return self.flush_interval();
        }
        let factor = 1u64 << consecutive_failures.min(16);
        let delay = self.flush_interval_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms.max(self.flush_interval_ms)))
    }
}

/// Which counter store backs usage flushes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Counter store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite database path (defaults to the platform data directory)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreSettings {
    /// Resolved SQLite path
    pub fn sqlite_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("fleetguard")
                .join("usage.db")
        })
    }
}

/// Status API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSettings {
    /// Enable the status API
    #[serde(default = "default_web_enabled")]
    pub enabled: bool,

    /// Bind address
    #[serde(default = "default_web_bind")]
    pub bind: String,

    /// Port
    #[serde(default = "default_web_port")]
    pub port: u16,
}

fn default_web_enabled() -> bool {
    true
}

fn default_web_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_web_port() -> u16 {
    8787
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            enabled: default_web_enabled(),
            bind: default_web_bind(),
            port: default_web_port(),
        }
    }
}

/// Environment variables that override file settings
pub const ENV_FLUSH_INTERVAL_MS: &str = "FLEETGUARD_FLUSH_INTERVAL_MS";
pub const ENV_MAX_BATCH_SIZE: &str = "FLEETGUARD_MAX_BATCH_SIZE";
pub const ENV_FLUSH_TIMEOUT_MS: &str = "FLEETGUARD_FLUSH_TIMEOUT_MS";
pub const ENV_DB_PATH: &str = "FLEETGUARD_DB_PATH";
pub const ENV_PORT: &str = "FLEETGUARD_PORT";

impl Settings {
    /// Load settings from config file or use defaults
    ///
    /// An explicit path must exist; only the default locations are optional.
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        if let Some(p) = path {
            if !p.exists() {
                anyhow::bail!("Config file not found: {:?}", p);
            }
            let content = std::fs::read_to_string(p)
                .with_context(|| format!("Failed to read config file: {:?}", p))?;
            return toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", p));
        }

        // Try default config locations
        let default_paths = [
            dirs::config_dir().map(|p| p.join("fleetguard/config.toml")),
            dirs::home_dir().map(|p| p.join(".config/fleetguard/config.toml")),
            dirs::home_dir().map(|p| p.join(".fleetguard.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {:?}", path))?;
                return toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {:?}", path));
            }
        }

        // Return defaults if no config file found
        Ok(Self::default())
    }

    /// Merge `FLEETGUARD_*` environment variables (environment beats file)
    pub fn merge_env(&mut self) {
        self.merge_env_from(|key| std::env::var(key).ok());
    }

    fn merge_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_env(&lookup, ENV_FLUSH_INTERVAL_MS) {
            self.usage.flush_interval_ms = v;
        }
        if let Some(v) = parse_env(&lookup, ENV_MAX_BATCH_SIZE) {
            self.usage.max_batch_size = v;
        }
        if let Some(v) = parse_env(&lookup, ENV_FLUSH_TIMEOUT_MS) {
            self.usage.flush_timeout_ms = v;
        }
        if let Some(v) = lookup(ENV_DB_PATH).filter(|v| !v.is_empty()) {
            self.store.path = Some(PathBuf::from(v));
        }
        if let Some(v) = parse_env(&lookup, ENV_PORT) {
            self.web.port = v;
        }
    }

    /// Merge CLI config into settings (CLI takes precedence)
    pub fn merge_cli(&mut self, cli: &Config) {
        if let Some(interval) = cli.flush_interval_ms {
            self.usage.flush_interval_ms = interval;
        }
        if let Some(size) = cli.max_batch_size {
            self.usage.max_batch_size = size;
        }
        if let Some(port) = cli.port {
            self.web.port = port;
        }
        if let Some(path) = &cli.db_path {
            self.store.path = Some(path.clone());
        }
        if cli.memory_store {
            self.store.backend = StoreBackend::Memory;
        }
    }

    /// Validate and normalize settings values
    ///
    /// Clamps intervals and sizes so a bad config cannot spin the flush loop.
    pub fn validate(&mut self) {
        const MIN_FLUSH_INTERVAL_MS: u64 = 100;
        const MIN_FLUSH_TIMEOUT_MS: u64 = 100;

        if self.usage.flush_interval_ms < MIN_FLUSH_INTERVAL_MS {
            self.usage.flush_interval_ms = MIN_FLUSH_INTERVAL_MS;
        }
        if self.usage.flush_timeout_ms < MIN_FLUSH_TIMEOUT_MS {
            self.usage.flush_timeout_ms = MIN_FLUSH_TIMEOUT_MS;
        }
        if self.usage.max_batch_size == 0 {
            self.usage.max_batch_size = 1;
        }
        if self.circuit.max_tenants == 0 {
            self.circuit.max_tenants = 1;
        }
        if self.circuit.sweep_interval_secs == 0 {
            self.circuit.sweep_interval_secs = 1;
        }
        for threshold in [
            &mut self.circuit.tenant_rate_limit,
            &mut self.circuit.tenant_server_error,
            &mut self.circuit.tenant_data_error,
            &mut self.circuit.global_server_error,
            &mut self.circuit.global_rate_limit,
        ] {
            if threshold.failures == 0 {
                threshold.failures = 1;
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}
