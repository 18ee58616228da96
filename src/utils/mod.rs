//! Small async building blocks shared by the write and read paths.

mod deadline;
mod gate;
mod shared_promise;

pub use deadline::{deadline_after, no_deadline, with_deadline, Deadline};
pub use gate::{GateGuard, OperationGate};
pub use shared_promise::SharedPromise;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the unix epoch
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Wall-clock seconds since the unix epoch, the unit of cell expiry and deletion time
pub fn unix_seconds() -> i64 {
    unix_millis() / 1000
}
