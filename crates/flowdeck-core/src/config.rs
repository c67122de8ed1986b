use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level flowdeck configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fabricate an active version from the draft when an Agent has none.
    /// Off by default: a missing active version is a hard error.
    #[serde(default)]
    pub recover_missing_active_version: bool,
    /// Join policy for `scenario-parallel` nodes that don't set one.
    #[serde(default)]
    pub parallel_join: ParallelJoinPolicy,
    /// Sleep used by `delay` nodes without a `durationMs`.
    #[serde(default = "default_delay_ms")]
    pub default_delay_ms: u64,
    /// Broadcast capacity of the execution event bus. Must be at least 1.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recover_missing_active_version: false,
            parallel_join: ParallelJoinPolicy::default(),
            default_delay_ms: default_delay_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_event_capacity() -> usize {
    256
}

/// How a parallel fan-out joins its branches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParallelJoinPolicy {
    /// Wait for every branch and record each outcome; the node succeeds.
    #[default]
    SettleAll,
    /// Any failed branch fails the node, even if siblings completed.
    AllOrNothing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "~/.flowdeck/flowdeck.db".to_string()
}

/// JSONL execution logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable execution logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = scenario/agent summary, 2 = + decisions and joins, 3 = + every step.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> String {
    "~/.flowdeck/logs".to_string()
}

fn default_log_level() -> u8 {
    1
}

impl FlowConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot drive an engine.
    pub fn validate(&self) -> Result<()> {
        if self.engine.event_capacity == 0 {
            return Err(FlowError::Config(
                "engine.event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.storage.database_path)
    }

    /// Resolve the log directory, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log
            .as_ref()
            .filter(|log| log.enabled)
            .map(|log| expand_home(&log.log_dir))
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
