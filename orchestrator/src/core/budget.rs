//! Wall-clock budget helpers for the control loop.

use std::time::{Duration, Instant};

/// Deadline for a run; `0` seconds means no deadline.
pub fn run_deadline(start: Instant, timeout_secs: u64) -> Option<Instant> {
    if timeout_secs == 0 {
        return None;
    }
    start.checked_add(Duration::from_secs(timeout_secs))
}
