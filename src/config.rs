//! Configuration management for xdna-pipeline.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (XDNA_PIPELINE_TIMEOUT_MS, etc.)
//! 2. Project-local config file (`./xdna-pipeline.toml`)
//! 3. User config file (`~/.config/xdna-pipeline/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # xdna-pipeline.toml
//!
//! # Host wait bound in milliseconds
//! wait_timeout_ms = 30000
//!
//! # Shuffle executor order every round with this seed
//! schedule_seed = 7
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::emu::Schedule;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Optional overrides as read from one config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
struct ConfigFile {
    wait_timeout_ms: Option<u64>,
    max_rounds: Option<u64>,
    schedule_seed: Option<u64>,
    check_invariants: Option<bool>,
}

/// xdna-pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Host wait bound in milliseconds.
    pub wait_timeout_ms: u64,

    /// Scheduling-round budget for one wait.
    pub max_rounds: u64,

    /// Seed for shuffled scheduling. `None` steps executors in order.
    pub schedule_seed: Option<u64>,

    /// Check the buffer handshake invariant after every turn.
    pub check_invariants: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { wait_timeout_ms: 30_000, max_rounds: 100_000, schedule_seed: None, check_invariants: true }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `xdna-pipeline.toml`
    /// 3. User config `~/.config/xdna-pipeline/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load user config first (lowest priority of file configs)
        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        // Load project-local config (higher priority)
        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        // Environment variables override everything
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Wait bound as a duration.
    pub fn wait_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.wait_timeout_ms)
    }

    /// Executor schedule implied by `schedule_seed`.
    pub fn schedule(&self) -> Schedule {
        match self.schedule_seed {
            Some(seed) => Schedule::Shuffled { seed },
            None => Schedule::InOrder,
        }
    }

    /// Load user configuration from ~/.config/xdna-pipeline/config.toml
    fn load_user_config() -> Option<ConfigFile> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./xdna-pipeline.toml
    fn load_local_config() -> Option<ConfigFile> {
        let local_path = Path::new("xdna-pipeline.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        // Try to find project root by looking for Cargo.toml
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("xdna-pipeline.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<ConfigFile> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge a config file into this one.
    /// Only overrides fields the file sets.
    fn merge(&mut self, other: ConfigFile) {
        if let Some(ms) = other.wait_timeout_ms {
            self.wait_timeout_ms = ms;
        }
        if let Some(rounds) = other.max_rounds {
            self.max_rounds = rounds;
        }
        if other.schedule_seed.is_some() {
            self.schedule_seed = other.schedule_seed;
        }
        if let Some(check) = other.check_invariants {
            self.check_invariants = check;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(ms) = parse_var(&var, "XDNA_PIPELINE_TIMEOUT_MS") {
            log::info!("Using XDNA_PIPELINE_TIMEOUT_MS from environment: {}", ms);
            self.wait_timeout_ms = ms;
        }
        if let Some(rounds) = parse_var(&var, "XDNA_PIPELINE_MAX_ROUNDS") {
            log::info!("Using XDNA_PIPELINE_MAX_ROUNDS from environment: {}", rounds);
            self.max_rounds = rounds;
        }
        if let Some(seed) = parse_var(&var, "XDNA_PIPELINE_SEED") {
            log::info!("Using XDNA_PIPELINE_SEED from environment: {}", seed);
            self.schedule_seed = Some(seed);
        }
        if let Some(check) = parse_var(&var, "XDNA_PIPELINE_CHECK_INVARIANTS") {
            self.check_invariants = check;
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("xdna-pipeline").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# xdna-pipeline configuration
# Place this file at ~/.config/xdna-pipeline/config.toml or ./xdna-pipeline.toml

# Host wait bound in milliseconds
wait_timeout_ms = 30000

# Scheduling rounds allowed per wait
max_rounds = 100000

# Shuffle executor order every round (omit for in-order scheduling)
# schedule_seed = 7

# Check the lock handshake invariant after every turn
check_invariants = true
"#
        .to_string()
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let value = var(name)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("Ignoring {}: cannot parse '{}'", name, value);
            None
        }
    }
}
