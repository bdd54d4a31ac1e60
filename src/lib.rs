//! Share one long-running CLI assistant conversation across devices.
//!
//! Devices register and elect a primary per session; the primary's turns
//! are deduplicated and queued, run one at a time through the CLI, and
//! stored in a per-session message buffer. A resource manager keeps the
//! whole thing within configured limits.

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod hub;
pub mod notify;
pub mod platform;
pub mod protocol;
pub mod queue;
pub mod resources;
pub mod runner;
pub mod session;
mod ticker;
