//! Locating the CLI executable

use crate::platform;
use std::path::{Path, PathBuf};

pub const DEFAULT_COMMAND: &str = "claude";

/// Install locations checked after `PATH`, relative to the home directory
const HOME_CANDIDATES: &[&str] = &[
    ".claude/local/claude",
    ".local/bin/claude",
    ".npm-global/bin/claude",
    ".volta/bin/claude",
    ".bun/bin/claude",
];

const SYSTEM_CANDIDATES: &[&str] = &[
    "/usr/local/bin/claude",
    "/opt/homebrew/bin/claude",
    "/usr/bin/claude",
];

/// Resolve the CLI binary: explicit override, `PATH`, common install
/// locations, then the bare command name.
///
/// Under the test environment flag no lookups happen; the bare name is
/// returned unless an override is given.
pub fn resolve_executable(override_path: Option<&Path>) -> PathBuf {
    if let Some(path) = override_path {
        return path.to_path_buf();
    }

    if platform::is_test_env() {
        return PathBuf::from(DEFAULT_COMMAND);
    }

    if let Ok(found) = which::which(DEFAULT_COMMAND) {
        return found;
    }

    let home_candidates = platform::home_dir()
        .map(|home| HOME_CANDIDATES.iter().map(|rel| home.join(rel)).collect::<Vec<_>>())
        .unwrap_or_default();
    let system_candidates = SYSTEM_CANDIDATES.iter().map(PathBuf::from);

    for candidate in home_candidates.into_iter().chain(system_candidates) {
        if candidate.is_file() {
            tracing::debug!("Found CLI at {}", candidate.display());
            return candidate;
        }
    }

    tracing::warn!(
        "Could not locate `{}`; falling back to bare command name",
        DEFAULT_COMMAND
    );
    if cfg!(windows) {
        PathBuf::from(format!("{}.exe", DEFAULT_COMMAND))
    } else {
        PathBuf::from(DEFAULT_COMMAND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_wins() {
        let path = resolve_executable(Some(Path::new("/opt/tools/claude")));
        assert_eq!(path, PathBuf::from("/opt/tools/claude"));
    }

    #[test]
    fn test_env_skips_lookup() {
        std::env::set_var(platform::TEST_ENV, "1");
        assert_eq!(resolve_executable(None), PathBuf::from(DEFAULT_COMMAND));
        assert_eq!(
            resolve_executable(Some(Path::new("/opt/tools/claude"))),
            PathBuf::from("/opt/tools/claude")
        );
    }
}
