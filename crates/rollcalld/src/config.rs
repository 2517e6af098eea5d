use anyhow::{Context, Result};
use rollcall_core::Policy;
use std::path::{Path, PathBuf};

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Path to the TOML decision policy.
    pub policy_path: PathBuf,
    pub bus: BusKind,
    /// Overrides `match_threshold` from the policy file.
    pub match_threshold: Option<f32>,
    /// Overrides `debounce_window_secs` from the policy file.
    pub debounce_secs: Option<u64>,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            db_path: var("ROLLCALL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("attendance.db")),
            policy_path: var("ROLLCALL_POLICY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/etc/rollcall/policy.toml")),
            bus: match var("ROLLCALL_BUS").as_deref() {
                Some("session") => BusKind::Session,
                _ => BusKind::System,
            },
            match_threshold: var("ROLLCALL_MATCH_THRESHOLD").and_then(|v| v.parse().ok()),
            debounce_secs: var("ROLLCALL_DEBOUNCE_SECS").and_then(|v| v.parse().ok()),
        }
    }

    /// Read the policy file, apply environment overrides and validate.
    pub fn load_policy(&self) -> Result<Policy> {
        let mut policy = read_policy(&self.policy_path)?;
        if let Some(threshold) = self.match_threshold {
            policy.match_threshold = threshold;
        }
        if let Some(secs) = self.debounce_secs {
            policy.debounce_window_secs = secs;
        }
        policy
            .validate()
            .with_context(|| format!("invalid policy {}", self.policy_path.display()))?;
        Ok(policy)
    }
}

fn read_policy(path: &Path) -> Result<Policy> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse policy {}", path.display()))
}
