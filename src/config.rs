//! Service configuration
//!
//! Limits, timer periods and the CLI executable override. Loaded from
//! `<config_dir>/config.json`; every field falls back to its default.

use crate::error::ConfigError;
use crate::platform;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Environment override for the CLI executable
pub const CLAUDE_PATH_ENV: &str = "SESSIONHUB_CLAUDE_PATH";

/// Environment override for the concurrent session ceiling
pub const MAX_SESSIONS_ENV: &str = "SESSIONHUB_MAX_SESSIONS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Ceiling on sessions in the active-session index
    pub max_concurrent_sessions: usize,

    /// Per-session buffer size reported as over budget (bytes)
    pub max_memory_per_session: u64,

    /// Process resident memory ceiling (bytes)
    pub max_total_memory: u64,

    /// Global CPU usage ceiling (percent)
    pub max_cpu_usage: f32,

    /// Devices not seen for this long are dropped by the liveness sweep
    pub liveness_timeout_secs: u64,

    /// Period of the liveness sweep
    pub heartbeat_sweep_secs: u64,

    /// Identical content for a session collapses within this window
    pub dedup_window_secs: u64,

    /// Period of the resource audit
    pub resource_audit_secs: u64,

    /// Minimum idle time before a session may be evicted for capacity
    pub idle_eviction_secs: u64,

    /// Buffers idle longer than this are trimmed under memory pressure
    pub buffer_trim_idle_secs: u64,

    /// Messages kept per role when a buffer is trimmed
    pub buffer_trim_keep: usize,

    /// Explicit path to the CLI executable
    pub claude_path: Option<PathBuf>,

    /// Extra arguments appended to every CLI invocation
    pub claude_args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
            max_memory_per_session: 100 * MIB,
            max_total_memory: 1024 * MIB,
            max_cpu_usage: 80.0,
            liveness_timeout_secs: 90,
            heartbeat_sweep_secs: 30,
            dedup_window_secs: 30,
            resource_audit_secs: 30,
            idle_eviction_secs: 60,
            buffer_trim_idle_secs: 60 * 60,
            buffer_trim_keep: 10,
            claude_path: None,
            claude_args: Vec::new(),
        }
    }
}

impl Config {
    /// Default config file path (cross-platform)
    pub fn default_path() -> PathBuf {
        platform::config_dir().join("config.json")
    }

    /// Load from a file, falling back to defaults when it does not exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from the default location and apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::default_path())?;
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var(CLAUDE_PATH_ENV) {
            if !path.trim().is_empty() {
                self.claude_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(raw) = std::env::var(MAX_SESSIONS_ENV) {
            match raw.trim().parse() {
                Ok(max) => self.max_concurrent_sessions = max,
                Err(_) => tracing::warn!("Ignoring invalid {}: {}", MAX_SESSIONS_ENV, raw),
            }
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn heartbeat_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sweep_secs.max(1))
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn resource_audit_interval(&self) -> Duration {
        Duration::from_secs(self.resource_audit_secs.max(1))
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    pub fn buffer_trim_idle(&self) -> Duration {
        Duration::from_secs(self.buffer_trim_idle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_from(&temp.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"maxConcurrentSessions": 2, "claudePath": "/opt/claude/bin/claude"}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.max_concurrent_sessions, 2);
        assert_eq!(
            config.claude_path.as_deref(),
            Some(Path::new("/opt/claude/bin/claude"))
        );
        assert_eq!(config.dedup_window_secs, 30);
        assert_eq!(config.buffer_trim_keep, 10);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
