//! Operation gate
//!
//! Counts operations in flight against an object so it can be closed and
//! drained before being destroyed (pending writes and reads of a dropped table).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{Result, ShardError};

#[derive(Default)]
struct GateState {
    in_flight: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

/// Cloneable handle; all clones share one counter
#[derive(Clone, Default)]
pub struct OperationGate {
    state: Arc<GateState>,
}

/// Held for the duration of one operation
pub struct GateGuard {
    state: Arc<GateState>,
}

impl OperationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation. Fails once the gate is closed.
    pub fn enter(&self) -> Result<GateGuard> {
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.state.closed.load(Ordering::SeqCst) {
            let guard = GateGuard {
                state: self.state.clone(),
            };
            drop(guard);
            return Err(ShardError::ShuttingDown);
        }
        Ok(GateGuard {
            state: self.state.clone(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Refuse new operations and wait for the running ones to finish
    pub async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.wait_idle().await;
    }

    /// Wait until no operation is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if self.state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.idle.notify_waiters();
        }
    }
}
