//! Configuration loading and management.
//!
//! Loads jotter configuration from `./jotter.toml` (or `$JOTTER_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::hub::HubConfig;
use crate::logs::AggregatorConfig;
use crate::pipeline::PipelineConfig;
use crate::service::ServiceConfig;

// ── Top-level config ────────────────────────────────────────────

/// Top-level jotter configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Process-level settings (`[runtime]`).
    pub runtime: RuntimeConfig,
    /// Filesystem locations (`[paths]`).
    pub paths: PathsConfig,
    /// Collaborator call bounds and link limits (`[pipeline]`).
    pub pipeline: PipelineSection,
    /// Event hub tuning (`[hub]`).
    pub hub: HubSection,
    /// Log aggregator tuning (`[logs]`).
    pub logs: LogsSection,
    /// Model endpoints (`[models]`).
    pub models: ModelsConfig,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// the result fails [`Config::validate`].
    pub fn load() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let mut config = Self::load_from_file(&Self::config_path_with(env))?;
        config.apply_overrides(env);
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config path: `$JOTTER_CONFIG_PATH`, else `./jotter.toml`.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("JOTTER_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("jotter.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process env.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Runtime.
        if let Some(v) = env("JOTTER_LOG_LEVEL") {
            self.runtime.log_level = v;
        }
        override_parsed(
            &env,
            "JOTTER_SHUTDOWN_TIMEOUT_SECS",
            &mut self.runtime.shutdown_timeout_secs,
        );

        // Paths.
        if let Some(v) = env("JOTTER_DATABASE") {
            self.paths.database = PathBuf::from(v);
        }

        // Models.
        if let Some(v) = env("JOTTER_OLLAMA_URL") {
            self.models.base_url = v;
        }
        if let Some(v) = env("JOTTER_ANALYSIS_MODEL") {
            self.models.analysis_model = v;
        }
        if let Some(v) = env("JOTTER_EMBEDDING_MODEL") {
            self.models.embedding_model = v;
        }
        if let Some(v) = env("JOTTER_DIAGNOSIS_MODEL") {
            self.models.diagnosis_model = v;
        }

        // Buffers.
        override_parsed(&env, "JOTTER_FLUSH_THRESHOLD", &mut self.logs.flush_threshold);
        override_parsed(&env, "JOTTER_FLUSH_INTERVAL_MS", &mut self.logs.flush_interval_ms);
        override_parsed(&env, "JOTTER_HUB_QUEUE_CAPACITY", &mut self.hub.queue_capacity);
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has wrongly typed values.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Reject zero capacities, thresholds, intervals and timeouts.
    ///
    /// # Errors
    ///
    /// Names the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, u64); 13] = [
            ("runtime.shutdown_timeout_secs", self.runtime.shutdown_timeout_secs),
            ("pipeline.analyze_timeout_secs", self.pipeline.analyze_timeout_secs),
            ("pipeline.fetch_timeout_secs", self.pipeline.fetch_timeout_secs),
            ("pipeline.embed_timeout_secs", self.pipeline.embed_timeout_secs),
            ("pipeline.max_links", widen(self.pipeline.max_links)),
            ("pipeline.max_fetched_chars", widen(self.pipeline.max_fetched_chars)),
            ("hub.queue_capacity", widen(self.hub.queue_capacity)),
            ("hub.keepalive_secs", self.hub.keepalive_secs),
            ("logs.flush_threshold", widen(self.logs.flush_threshold)),
            ("logs.flush_interval_ms", self.logs.flush_interval_ms),
            ("logs.max_retained_records", widen(self.logs.max_retained_records)),
            ("models.embedding_dims", widen(self.models.embedding_dims)),
            ("models.diagnosis_timeout_secs", self.models.diagnosis_timeout_secs),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, value)| *value == 0) {
            bail!("{name} must be greater than zero");
        }
        if self.logs.max_retained_records < self.logs.flush_threshold {
            bail!("logs.max_retained_records must be at least logs.flush_threshold");
        }
        Ok(())
    }

    /// Event hub settings.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.hub.queue_capacity,
            keepalive: Duration::from_secs(self.hub.keepalive_secs),
        }
    }

    /// Log aggregator settings.
    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            flush_threshold: self.logs.flush_threshold,
            flush_interval: Duration::from_millis(self.logs.flush_interval_ms),
            max_retained_records: self.logs.max_retained_records,
        }
    }

    /// Service and pipeline timeouts.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            pipeline: PipelineConfig {
                analyze_timeout: Duration::from_secs(self.pipeline.analyze_timeout_secs),
                fetch_timeout: Duration::from_secs(self.pipeline.fetch_timeout_secs),
                embed_timeout: Duration::from_secs(self.pipeline.embed_timeout_secs),
            },
            diagnosis_timeout: Duration::from_secs(self.models.diagnosis_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.runtime.shutdown_timeout_secs),
        }
    }
}

fn override_parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, var: &str, slot: &mut T) {
    if let Some(v) = env(var) {
        match v.parse() {
            Ok(n) => *slot = n,
            Err(_) => tracing::warn!(var, value = %v, "ignoring invalid env override"),
        }
    }
}

fn widen(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

// ── Runtime config ──────────────────────────────────────────────

/// Process-level settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Bound on waiting for in-flight entries at shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            shutdown_timeout_secs: 10,
        }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Filesystem locations for persistent state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite database file.
    pub database: PathBuf,
    /// Directory for rolling JSON process logs.
    pub logs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = data_dir();
        Self {
            database: base.join("jotter.db"),
            logs_dir: base.join("logs"),
        }
    }
}

/// Platform data directory for jotter, or the working directory if the
/// platform has none.
fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "jotter")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

// ── Pipeline config ─────────────────────────────────────────────

/// Collaborator call bounds and link limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Analyzer call timeout.
    pub analyze_timeout_secs: u64,
    /// Per-link fetch timeout.
    pub fetch_timeout_secs: u64,
    /// Embedder call timeout.
    pub embed_timeout_secs: u64,
    /// Links kept per entry.
    pub max_links: usize,
    /// Readable characters kept per fetched page.
    pub max_fetched_chars: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            analyze_timeout_secs: 30,
            fetch_timeout_secs: 15,
            embed_timeout_secs: 30,
            max_links: 10,
            max_fetched_chars: 20_000,
        }
    }
}

// ── Hub config ──────────────────────────────────────────────────

/// Event hub tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubSection {
    /// Bounded queue size per observer.
    pub queue_capacity: usize,
    /// Keepalive period.
    pub keepalive_secs: u64,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            keepalive_secs: 15,
        }
    }
}

// ── Logs config ─────────────────────────────────────────────────

/// Log aggregator tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogsSection {
    /// Buffered records that trigger a flush.
    pub flush_threshold: usize,
    /// Maximum milliseconds between flushes.
    pub flush_interval_ms: u64,
    /// Cap on records held in memory while the store is failing.
    pub max_retained_records: usize,
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            flush_threshold: 50,
            flush_interval_ms: 2000,
            max_retained_records: 5000,
        }
    }
}

// ── Models config ───────────────────────────────────────────────

/// Ollama endpoint and model names.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Ollama base URL.
    pub base_url: String,
    /// Chat model used for content analysis.
    pub analysis_model: String,
    /// Embedding model.
    pub embedding_model: String,
    /// Expected embedding dimensionality.
    pub embedding_dims: usize,
    /// Chat model used for failure diagnosis.
    pub diagnosis_model: String,
    /// Diagnosis call timeout.
    pub diagnosis_timeout_secs: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            analysis_model: "llama3".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            embedding_dims: 768,
            diagnosis_model: "llama3".to_string(),
            diagnosis_timeout_secs: 60,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
