//! Global configuration parsing, validation, and environment overrides.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::orchestrator::idle::IdlePolicy;
use crate::{AppError, Result};

/// Environment variable overriding [`IdleConfig::timeout_ms`].
pub const ENV_IDLE_TIMEOUT_MS: &str = "RELAY_IDLE_TIMEOUT_MS";
/// Environment variable overriding [`IdleConfig::max_idle_ms`].
pub const ENV_MAX_IDLE_MS: &str = "RELAY_MAX_IDLE_MS";
/// Environment variable overriding [`IdleConfig::stale_output_ms`].
pub const ENV_STALE_OUTPUT_MS: &str = "RELAY_STALE_OUTPUT_MS";
/// Environment variable overriding [`IdleConfig::recheck_ms`].
pub const ENV_IDLE_RECHECK_MS: &str = "RELAY_IDLE_RECHECK_MS";
/// Environment variable overriding [`IdleConfig::kill_escalation_ms`].
pub const ENV_KILL_ESCALATION_MS: &str = "RELAY_KILL_ESCALATION_MS";

/// Idle teardown thresholds (milliseconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct IdleConfig {
    /// Time without attached clients before the first kill decision.
    #[serde(default = "default_idle_timeout_ms")]
    pub timeout_ms: u64,
    /// Absolute cap; past this no guard can keep the process alive.
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
    /// Default delay between re-checks while a guard defers.
    #[serde(default = "default_recheck_ms")]
    pub recheck_ms: u64,
    /// Output silence after which a mid-turn process is considered stuck.
    #[serde(default = "default_stale_output_ms")]
    pub stale_output_ms: u64,
    /// Delay between graceful terminate and forced kill.
    #[serde(default = "default_kill_escalation_ms")]
    pub kill_escalation_ms: u64,
}

fn default_idle_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_idle_ms() -> u64 {
    30 * 60 * 1000
}

fn default_recheck_ms() -> u64 {
    30 * 1000
}

fn default_stale_output_ms() -> u64 {
    10 * 60 * 1000
}

fn default_kill_escalation_ms() -> u64 {
    3000
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_idle_timeout_ms(),
            max_idle_ms: default_max_idle_ms(),
            recheck_ms: default_recheck_ms(),
            stale_output_ms: default_stale_output_ms(),
            kill_escalation_ms: default_kill_escalation_ms(),
        }
    }
}

impl IdleConfig {
    /// Decision thresholds handed to [`check_idle`](crate::orchestrator::idle::check_idle).
    #[must_use]
    pub fn policy(&self) -> IdlePolicy {
        IdlePolicy {
            idle_timeout: Duration::from_millis(self.timeout_ms),
            max_idle: Duration::from_millis(self.max_idle_ms),
            recheck_interval: Duration::from_millis(self.recheck_ms),
        }
    }

    /// Staleness threshold for the active-turn guard.
    #[must_use]
    pub fn stale_output(&self) -> Duration {
        Duration::from_millis(self.stale_output_ms)
    }

    /// Terminate → force-kill delay.
    #[must_use]
    pub fn kill_escalation(&self) -> Duration {
        Duration::from_millis(self.kill_escalation_ms)
    }
}

/// Crash-recovery bookkeeping.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryConfig {
    /// Records older than this are treated as stale metadata and never reaped.
    #[serde(default = "default_max_record_age_hours")]
    pub max_record_age_hours: u32,
    /// Trailing-edge debounce window for record writes.
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
}

fn default_max_record_age_hours() -> u32 {
    24
}

fn default_persist_debounce_ms() -> u64 {
    500
}

impl RecoveryConfig {
    /// Records older than this are skipped by the orphan reaper.
    #[must_use]
    pub fn max_record_age(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.max_record_age_hours))
    }

    /// Debounce window for record writes.
    #[must_use]
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_record_age_hours: default_max_record_age_hours(),
            persist_debounce_ms: default_persist_debounce_ms(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_history_backlog() -> usize {
    500
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory whose immediate subdirectories are offered as folders.
    pub projects_root: PathBuf,
    /// Directory holding the recovery record and close handoffs.
    pub state_dir: PathBuf,
    /// Directory where the agent writes per-folder session transcripts.
    pub history_dir: PathBuf,
    /// Agent CLI binary (e.g., `claude`).
    pub agent_cli: String,
    /// Arguments passed to the agent CLI before the session flags.
    #[serde(default)]
    pub agent_cli_args: Vec<String>,
    /// WebSocket listen address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Agent events retained per session for replay to re-attaching clients.
    #[serde(default = "default_history_backlog")]
    pub history_backlog: usize,
    /// Idle teardown thresholds.
    #[serde(default)]
    pub idle: IdleConfig,
    /// Orphan recovery settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RELAY_*_MS` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a variable is set but is not a valid
    /// millisecond count, or if the overridden values fail validation.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_with(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`apply_env_overrides`](Self::apply_env_overrides).
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let targets: [(&str, &mut u64); 5] = [
            (ENV_IDLE_TIMEOUT_MS, &mut self.idle.timeout_ms),
            (ENV_MAX_IDLE_MS, &mut self.idle.max_idle_ms),
            (ENV_STALE_OUTPUT_MS, &mut self.idle.stale_output_ms),
            (ENV_IDLE_RECHECK_MS, &mut self.idle.recheck_ms),
            (ENV_KILL_ESCALATION_MS, &mut self.idle.kill_escalation_ms),
        ];

        for (key, slot) in targets {
            let Some(raw) = lookup(key) else {
                continue;
            };
            let value = raw.trim().parse::<u64>().map_err(|err| {
                AppError::Config(format!("{key} must be a millisecond count: {err}"))
            })?;
            info!(key, value, "config override from environment");
            *slot = value;
        }

        self.validate_idle()
    }

    /// Path of the persisted recovery record list.
    #[must_use]
    pub fn records_path(&self) -> PathBuf {
        self.state_dir.join("sessions.json")
    }

    /// Directory of per-folder close handoffs.
    #[must_use]
    pub fn handoff_dir(&self) -> PathBuf {
        self.state_dir.join("handoffs")
    }

    fn validate(&mut self) -> Result<()> {
        if self.agent_cli.trim().is_empty() {
            return Err(AppError::Config("agent_cli must not be empty".into()));
        }

        if self.history_backlog == 0 {
            return Err(AppError::Config(
                "history_backlog must be greater than zero".into(),
            ));
        }

        self.validate_idle()?;

        let canonical_root = self
            .projects_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("projects_root invalid: {err}")))?;
        self.projects_root = canonical_root;

        Ok(())
    }

    fn validate_idle(&self) -> Result<()> {
        let idle = &self.idle;
        if idle.timeout_ms == 0 || idle.recheck_ms == 0 {
            return Err(AppError::Config(
                "idle timeout_ms and recheck_ms must be greater than zero".into(),
            ));
        }
        if idle.max_idle_ms < idle.timeout_ms {
            return Err(AppError::Config(
                "idle max_idle_ms must not be smaller than timeout_ms".into(),
            ));
        }
        Ok(())
    }
}
