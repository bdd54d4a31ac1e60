//! Turn completion notifications
//!
//! Delivery transport (APNs, FCM, ...) lives outside this crate; the
//! lifecycle manager only calls a [`TurnNotifier`].

use crate::session::TurnOutcome;

pub trait TurnNotifier: Send + Sync {
    /// Called once per finished turn for the device that submitted it
    fn notify(&self, device_id: &str, session_id: &str, request_id: &str, outcome: &TurnOutcome);
}

/// Writes completions to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl TurnNotifier for LogNotifier {
    fn notify(&self, device_id: &str, session_id: &str, request_id: &str, outcome: &TurnOutcome) {
        match outcome {
            TurnOutcome::Completed { result } => tracing::info!(
                "Turn {} for session {} completed ({} chars) -> device {}",
                request_id,
                session_id,
                result.response.len(),
                device_id
            ),
            TurnOutcome::Failed { error, .. } => tracing::warn!(
                "Turn {} for session {} failed ({}) -> device {}",
                request_id,
                session_id,
                error.kind.as_str(),
                device_id
            ),
        }
    }
}
