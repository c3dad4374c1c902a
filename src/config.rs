//! Controller configuration.
//!
//! Configuration is passed to the controller at construction. Environment
//! overrides are applied only by an explicit call to
//! [`ControllerConfig::apply_env`], typically followed by
//! `ModelController::reload_config`.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const ENV_BLOCKING_TIMEOUT: &str = "MODELCTL_BLOCKING_TIMEOUT";
pub const ENV_RUNNING_MODE: &str = "MODELCTL_RUNNING_MODE";

/// Whether the process has a live runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunningMode {
    /// MODEL, RUNTIME and VERIFY stages all run
    #[default]
    Normal,
    /// Configuration only; RUNTIME and VERIFY steps are skipped
    AdminOnly,
}

impl RunningMode {
    pub fn has_runtime(&self) -> bool {
        matches!(self, Self::Normal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Default bound on lock and service waits, in seconds
    pub blocking_timeout_secs: u64,

    /// Bound used after a first timeout within one operation
    pub short_blocking_timeout_secs: u64,

    /// Poll interval while waiting for services to settle
    pub verify_poll_interval_ms: u64,

    pub running_mode: RunningMode,

    /// Run subsystem RUNTIME work concurrently during boot
    pub parallel_boot: bool,

    /// Boot thread pool size; 0 uses the rayon default
    pub boot_threads: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            blocking_timeout_secs: 300,
            short_blocking_timeout_secs: 5,
            verify_poll_interval_ms: 100,
            running_mode: RunningMode::Normal,
            parallel_boot: false,
            boot_threads: 0,
        }
    }
}

impl ControllerConfig {
    /// Load from a TOML file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        log::debug!("Loaded controller config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.blocking_timeout_secs == 0 {
            bail!("blocking_timeout_secs must be positive");
        }
        if self.short_blocking_timeout_secs == 0 {
            bail!("short_blocking_timeout_secs must be positive");
        }
        if self.verify_poll_interval_ms == 0 {
            bail!("verify_poll_interval_ms must be positive");
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(ENV_BLOCKING_TIMEOUT) {
            self.blocking_timeout_secs = raw
                .trim()
                .parse()
                .ok()
                .filter(|secs| *secs > 0)
                .with_context(|| format!("{ENV_BLOCKING_TIMEOUT}={raw} is not a positive integer"))?;
        }
        if let Some(raw) = lookup(ENV_RUNNING_MODE) {
            self.running_mode = match raw.trim() {
                "normal" => RunningMode::Normal,
                "admin-only" => RunningMode::AdminOnly,
                other => bail!("{ENV_RUNNING_MODE}={other} is not a running mode"),
            };
        }
        Ok(())
    }

    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_secs(self.blocking_timeout_secs)
    }

    pub fn short_blocking_timeout(&self) -> Duration {
        Duration::from_secs(self.short_blocking_timeout_secs)
    }

    pub fn verify_poll_interval(&self) -> Duration {
        Duration::from_millis(self.verify_poll_interval_ms)
    }
}
