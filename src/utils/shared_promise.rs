//! Shared promise
//!
//! A single-assignment result that any number of callers can wait on.
//! Flush requests that arrive while a flush is pending are folded into the
//! pending flush by handing them the same promise.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Result, ShardError};

#[derive(Clone)]
pub struct SharedPromise {
    sender: Arc<watch::Sender<Option<Result<()>>>>,
}

impl SharedPromise {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Resolve the promise. Later calls are ignored.
    pub fn set(&self, result: Result<()>) {
        self.sender.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
    }

    pub fn is_resolved(&self) -> bool {
        self.sender.borrow().is_some()
    }

    /// A future resolving to the promised result. Does not borrow `self`.
    pub fn future(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let mut receiver = self.sender.subscribe();
        async move {
            loop {
                let current = receiver.borrow_and_update().as_ref().cloned();
                if let Some(result) = current {
                    return result;
                }
                if receiver.changed().await.is_err() {
                    return Err(ShardError::ShuttingDown);
                }
            }
        }
    }
}

impl Default for SharedPromise {
    fn default() -> Self {
        Self::new()
    }
}
