//! Supervisor configuration, loaded from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::MarkerMode;
use crate::error::{Result, SlotwatchError};
use crate::retry::RetryPolicy;

/// Supervisor tunables. Every field has a default, so an empty TOML file is valid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Watcher poll period.
    pub poll_interval_ms: u64,
    /// How long an instance gets to exit after a stop request, and again after a kill.
    pub grace_period_ms: u64,
    /// Consecutive missing polls before the artifact is reported unreadable.
    pub unreadable_after_polls: u32,
    /// Number of copy slots derived from the hint.
    pub slot_count: usize,
    /// Artifact identity strategy.
    pub marker: MarkerMode,
    /// Backoff for copy and launch failures.
    pub retry: RetryPolicy,
    /// Target invocation.
    pub launch: LaunchConfig,
}

/// How the target is invoked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    /// Mode word for a fresh start.
    pub init_verb: String,
    /// Mode word for a start that should pick up the state record.
    pub resume_verb: String,
    /// Launch the very first instance in resume mode as well.
    pub resume_on_start: bool,
    /// Appended after `<verb> <state_path>`.
    pub extra_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            grace_period_ms: 5_000,
            unreadable_after_polls: 40,
            slot_count: 2,
            marker: MarkerMode::Mtime,
            retry: RetryPolicy::default(),
            launch: LaunchConfig::default(),
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            init_verb: "initialize".to_string(),
            resume_verb: "communicate".to_string(),
            resume_on_start: false,
            extra_args: vec![],
        }
    }
}

impl Config {
    /// Parses and validates a TOML config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)
            .map_err(|e| SlotwatchError::Config(format!("parse {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects settings the supervisor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.slot_count < 2 {
            return Err(SlotwatchError::Config(format!(
                "slot_count must be at least 2, got {}",
                self.slot_count
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(SlotwatchError::Config(
                "poll_interval_ms must be > 0".into(),
            ));
        }
        if self.grace_period_ms == 0 {
            return Err(SlotwatchError::Config(
                "grace_period_ms must be > 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SlotwatchError::Config(
                "retry.max_attempts must be > 0".into(),
            ));
        }
        if self.launch.init_verb.is_empty() || self.launch.resume_verb.is_empty() {
            return Err(SlotwatchError::Config(
                "launch verbs must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// [`poll_interval_ms`](Self::poll_interval_ms) as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// [`grace_period_ms`](Self::grace_period_ms) as a duration.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}
