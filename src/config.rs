//! Configuration for the gatekeeper service, read from `gatekeeper.toml`.
//!
//! Layered: file → environment → CLI. Every field has a default, so an empty
//! or missing file yields a working in-memory setup.
//!
//! ```toml
//! [store]
//! backend = "sqlite"
//! path = ".gatekeeper/runs.db"
//! busy_retries = 5
//! busy_backoff_ms = 10
//!
//! [gatekeeper]
//! conflict_retries = 0
//!
//! [processor]
//! max_in_flight = 64
//! channel_capacity = 256
//!
//! [ingress]
//! command_addr = "127.0.0.1:7401"
//! status_addr = "127.0.0.1:7402"
//!
//! [output]
//! path = ".gatekeeper/output.jsonl"
//!
//! [engine]
//! command = "nextflow run \"$GATEKEEPER_WORKFLOW_URL\" -r \"$GATEKEEPER_REVISION\""
//!
//! [server]
//! addr = "127.0.0.1:7400"
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::processor::MAX_LANES;
use crate::store::BusyRetry;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "gatekeeper.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            _ => anyhow::bail!("Invalid store backend '{}'. Valid values: memory, sqlite", s),
        }
    }
}

/// Run state store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite file, ignored by the memory backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Busy/locked retries before a store call is reported unavailable
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,
    /// First backoff step; doubles per retry up to 20x
    #[serde(default = "default_busy_backoff_ms")]
    pub busy_backoff_ms: u64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".gatekeeper/runs.db")
}

fn default_busy_retries() -> u32 {
    5
}

fn default_busy_backoff_ms() -> u64 {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            busy_retries: default_busy_retries(),
            busy_backoff_ms: default_busy_backoff_ms(),
        }
    }
}

impl StoreConfig {
    pub fn busy_retry(&self) -> BusyRetry {
        let initial = Duration::from_millis(self.busy_backoff_ms);
        BusyRetry {
            max_retries: self.busy_retries,
            initial_backoff: initial,
            max_backoff: initial * 20,
        }
    }
}

/// Gatekeeper service settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperSection {
    /// In-process retries after a version conflict (0 or 1)
    #[serde(default)]
    pub conflict_retries: u32,
}

/// Stream merge processor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Worker lanes per stream; messages for one run share a lane
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Buffer size of the in-process delivery channels
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_max_in_flight() -> usize {
    64
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// TCP ingress listeners (JSON lines).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_command_addr")]
    pub command_addr: String,
    #[serde(default = "default_status_addr")]
    pub status_addr: String,
}

fn default_command_addr() -> String {
    "127.0.0.1:7401".to_string()
}

fn default_status_addr() -> String {
    "127.0.0.1:7402".to_string()
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            command_addr: default_command_addr(),
            status_addr: default_status_addr(),
        }
    }
}

/// Output stream settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Append accepted messages to this JSON-lines file
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Job-execution engine settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Shell command run per submitted run; no engine when unset
    #[serde(default)]
    pub command: Option<String>,
}

/// HTTP health/inspection server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

fn default_server_addr() -> String {
    "127.0.0.1:7400".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `GATEKEEPER_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// The complete gatekeeper.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gatekeeper: GatekeeperSection,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatekeeperConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse gatekeeper.toml")
    }

    /// Load from `path`, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize gatekeeper.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(path) = get("GATEKEEPER_STORE_PATH") {
            self.store.backend = StoreBackend::Sqlite;
            self.store.path = PathBuf::from(path);
        }
        if let Some(level) = get("GATEKEEPER_LOG") {
            self.logging.level = level;
        }
        if let Some(addr) = get("GATEKEEPER_SERVER_ADDR") {
            self.server.addr = addr;
        }
    }

    /// Conflict retries, bounded to at most one.
    pub fn conflict_retries(&self) -> u32 {
        self.gatekeeper.conflict_retries.min(1)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.gatekeeper.conflict_retries > 1 {
            warnings.push(format!(
                "conflict_retries = {} exceeds the maximum of 1; using 1",
                self.gatekeeper.conflict_retries
            ));
        }
        if self.processor.max_in_flight == 0 {
            warnings.push("processor.max_in_flight must be at least 1".to_string());
        }
        if self.processor.max_in_flight > MAX_LANES {
            warnings.push(format!(
                "processor.max_in_flight = {} exceeds the maximum of {}; using {}",
                self.processor.max_in_flight, MAX_LANES, MAX_LANES
            ));
        }
        if self.processor.channel_capacity == 0 {
            warnings.push("processor.channel_capacity must be at least 1".to_string());
        }
        if self.ingress.command_addr == self.ingress.status_addr {
            warnings.push(format!(
                "command and status ingress share address {}",
                self.ingress.command_addr
            ));
        }
        for (name, addr) in [
            ("ingress.command_addr", &self.ingress.command_addr),
            ("ingress.status_addr", &self.ingress.status_addr),
            ("server.addr", &self.server.addr),
        ] {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                warnings.push(format!("Invalid {} '{}': expected host:port", name, addr));
            }
        }
        if let Some(cmd) = &self.engine.command
            && cmd.trim().is_empty()
        {
            warnings.push("engine.command is empty".to_string());
        }

        warnings
    }
}
