//! Platform helpers
//!
//! Config directory lookup and the test-environment switch used to keep
//! process lookups out of unit tests.

use std::path::PathBuf;

/// Environment variable that overrides the config directory
pub const CONFIG_DIR_ENV: &str = "SESSIONHUB_CONFIG_DIR";

/// Environment variable that marks a test run (`1` or `true`)
pub const TEST_ENV: &str = "SESSIONHUB_TEST";

/// Config directory (cross-platform)
///
/// `$SESSIONHUB_CONFIG_DIR` wins, then the OS config dir, then `~/.sessionhub`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(dir) = dirs_next::config_dir() {
        return dir.join("sessionhub");
    }
    home_dir()
        .map(|h| h.join(".sessionhub"))
        .unwrap_or_else(|| PathBuf::from(".sessionhub"))
}

pub fn home_dir() -> Option<PathBuf> {
    dirs_next::home_dir()
}

/// True when running under the test environment flag
pub fn is_test_env() -> bool {
    matches!(
        std::env::var(TEST_ENV).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE")
    )
}
