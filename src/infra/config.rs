// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::infra::errors::DeckError;
use crate::infra::paths;
use crate::stream::lines::DEFAULT_MAX_LINE_BYTES;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

/// How the coding-agent executable is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable name or absolute path (resolved through PATH).
    pub executable: String,
    /// Appended after the fixed stream-json flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Extra environment variables. Applied before the isolation overrides,
    /// so they cannot replace the config dir or the checkpointing flag.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: "claude".into(),
            extra_args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// Grace periods between SIGTERM and SIGKILL, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    pub abort_ms: u64,
    pub terminate_ms: u64,
    pub shutdown_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            abort_ms: 500,
            terminate_ms: 5_000,
            shutdown_ms: 3_000,
        }
    }
}

impl TimeoutsConfig {
    pub fn abort(&self) -> Duration {
        Duration::from_millis(self.abort_ms)
    }

    pub fn terminate(&self) -> Duration {
        Duration::from_millis(self.terminate_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub stderr_cap_bytes: usize,
    pub checkpoint_capacity: usize,
    /// Longer agent output lines are cut to this many bytes.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            stderr_cap_bytes: 10 * 1024,
            checkpoint_capacity: 100,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl Config {
    /// Load config from file, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| DeckError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }
}
