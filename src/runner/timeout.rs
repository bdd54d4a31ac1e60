//! Turn timeout estimation from command text

use std::time::Duration;

pub const VERY_COMPLEX_TIMEOUT: Duration = Duration::from_millis(600_000);
pub const COMPLEX_TIMEOUT: Duration = Duration::from_millis(300_000);
pub const MEDIUM_TIMEOUT: Duration = Duration::from_millis(180_000);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(120_000);

const VERY_COMPLEX_KEYWORDS: &[&str] = &[
    "comprehensive",
    "entire project",
    "entire codebase",
    "whole project",
    "whole codebase",
    "full analysis",
    "complete analysis",
    "all files",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "review",
    "refactor",
    "debug",
    "analyze",
    "analyse",
    "optimize",
    "implement",
    "migrate",
    "architecture",
    "investigate",
];

/// Timeout for one CLI turn, scaled by how heavy the request reads.
///
/// Pure function of the text: same input, same timeout.
pub fn calculate_timeout_for_command(command: &str) -> Duration {
    let lower = command.to_lowercase();
    let len = command.chars().count();

    if VERY_COMPLEX_KEYWORDS.iter().any(|k| lower.contains(k)) {
        VERY_COMPLEX_TIMEOUT
    } else if COMPLEX_KEYWORDS.iter().any(|k| lower.contains(k)) || len > 200 {
        COMPLEX_TIMEOUT
    } else if len > 50 {
        MEDIUM_TIMEOUT
    } else {
        DEFAULT_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers() {
        assert_eq!(calculate_timeout_for_command("hi"), DEFAULT_TIMEOUT);
        assert_eq!(
            calculate_timeout_for_command("please rename the helper in utils.rs to something clearer"),
            MEDIUM_TIMEOUT
        );
        assert_eq!(calculate_timeout_for_command("debug the login"), COMPLEX_TIMEOUT);
        assert_eq!(calculate_timeout_for_command(&"x".repeat(201)), COMPLEX_TIMEOUT);
        assert_eq!(
            calculate_timeout_for_command("Do a COMPREHENSIVE pass"),
            VERY_COMPLEX_TIMEOUT
        );
    }

    #[test]
    fn heavier_requests_never_get_less_time() {
        let heavy = calculate_timeout_for_command("review the entire codebase");
        let light = calculate_timeout_for_command("hi");
        assert!(heavy >= light);
        assert_eq!(heavy, VERY_COMPLEX_TIMEOUT);
        assert_eq!(heavy, calculate_timeout_for_command("review the entire codebase"));
    }
}
