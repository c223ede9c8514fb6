//! Small tunables, gathered here instead of scattered as magic numbers
//! through `engine.rs` (spec.md §6 "Tunables").

use std::time::Duration;

/// Default command-channel heartbeat period (spec.md §6).
pub const DEFAULT_COMMAND_HEARTBEAT: Duration = Duration::from_millis(3000);

/// Subscription watchdog = this factor times the broker-advertised
/// `keepalive_timer` (spec.md §4.F).
pub const WATCHDOG_MULTIPLIER: u32 = 2;

/// Build the command-channel socket identity: `"<hostname>-<uuidv4>"`
/// (spec.md §6).
pub fn command_identity() -> String {
    let host = gethostname::gethostname().to_string_lossy().into_owned();
    format!("{host}-{}", uuid::Uuid::new_v4())
}
