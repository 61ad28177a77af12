//! Quota accounting and admission logic.

mod counter;
mod manager;

pub use counter::Counter;
pub use manager::{AllocateError, QuotaManager};

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
