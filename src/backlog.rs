//! Backlog Controller
//!
//! Turns a backlog measure (for memtables: virtual dirty memory over the pool
//! threshold) into scheduler shares for the flush I/O class.
//!
//! ## Control Curve
//! ```text
//!   shares
//!   1000 |                              *
//!        |                          *
//!    200 |                 *
//!     10 |       *
//!      0 *--------------------------------- backlog
//!        0      soft    soft+(1-soft)/2    1.0
//! ```
//! Between control points the output is linearly interpolated; past the last
//! point it is clamped. `backlog_of_shares` runs the curve backwards so a
//! request worth "N shares" can be compared with the measured backlog.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, ShardError};
use crate::storage::StorageWriter;

/// A cooperative scheduling class whose weight the controller tunes
#[derive(Debug)]
pub struct SchedulingGroup {
    name: &'static str,
    shares: AtomicCell<f32>,
}

impl SchedulingGroup {
    pub fn new(name: &'static str, shares: f32) -> Arc<Self> {
        Arc::new(Self {
            name,
            shares: AtomicCell::new(shares),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn shares(&self) -> f32 {
        self.shares.load()
    }

    pub fn set_shares(&self, shares: f32) {
        self.shares.store(shares);
    }
}

/// The I/O side of a scheduling class
#[async_trait]
pub trait IoPriorityClass: Send + Sync {
    async fn update_shares(&self, shares: u32) -> Result<()>;
}

/// Routes share updates to a storage writer
pub struct StorageIoPriority {
    writer: Arc<dyn StorageWriter>,
}

impl StorageIoPriority {
    pub fn new(writer: Arc<dyn StorageWriter>) -> Arc<Self> {
        Arc::new(Self { writer })
    }
}

#[async_trait]
impl IoPriorityClass for StorageIoPriority {
    async fn update_shares(&self, shares: u32) -> Result<()> {
        self.writer.update_shares(shares).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlPoint {
    pub input: f32,
    pub output: f32,
}

impl ControlPoint {
    pub const fn new(input: f32, output: f32) -> Self {
        Self { input, output }
    }
}

/// Piecewise-linear, non-decreasing mapping from backlog to shares
#[derive(Debug, Clone)]
pub struct ControlCurve {
    points: Vec<ControlPoint>,
}

impl ControlCurve {
    /// Points must be sorted by strictly increasing input with
    /// non-decreasing output
    pub fn new(points: Vec<ControlPoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(ShardError::Config("control curve needs at least one point".to_string()));
        }
        for pair in points.windows(2) {
            if pair[1].input <= pair[0].input || pair[1].output < pair[0].output {
                return Err(ShardError::Config(format!(
                    "control points out of order: {:?} then {:?}",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(Self { points })
    }

    /// The memtable flush curve for a pool with the given soft limit ratio
    pub fn memtable_flush(soft_limit: f32) -> Self {
        Self {
            points: vec![
                ControlPoint::new(0.0, 0.0),
                ControlPoint::new(soft_limit, 10.0),
                ControlPoint::new(soft_limit + (1.0 - soft_limit) / 2.0, 200.0),
                ControlPoint::new(1.0, 1000.0),
            ],
        }
    }

    pub fn points(&self) -> &[ControlPoint] {
        &self.points
    }

    pub fn output(&self, backlog: f32) -> f32 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if backlog <= first.input {
            return first.output;
        }
        if backlog >= last.input {
            return last.output;
        }
        for pair in self.points.windows(2) {
            let (p0, p1) = (pair[0], pair[1]);
            if backlog < p1.input {
                let fraction = (backlog - p0.input) / (p1.input - p0.input);
                return p0.output + fraction * (p1.output - p0.output);
            }
        }
        last.output
    }

    /// Smallest backlog that yields `shares`
    pub fn backlog_of_shares(&self, shares: f32) -> f32 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if shares <= first.output {
            return first.input;
        }
        if shares >= last.output {
            return last.input;
        }
        for pair in self.points.windows(2) {
            let (p0, p1) = (pair[0], pair[1]);
            if shares < p1.output && p1.output > p0.output {
                let fraction = (shares - p0.output) / (p1.output - p0.output);
                return p0.input + fraction * (p1.input - p0.input);
            }
        }
        last.input
    }
}

/// Applies curve output to a scheduling group and its I/O class
pub struct BacklogController {
    curve: ControlCurve,
    group: Arc<SchedulingGroup>,
    io: Arc<dyn IoPriorityClass>,
    /// The propagation to the I/O class currently running, if any
    inflight_update: Mutex<Option<JoinHandle<()>>>,
}

impl BacklogController {
    pub fn new(curve: ControlCurve, group: Arc<SchedulingGroup>, io: Arc<dyn IoPriorityClass>) -> Self {
        Self {
            curve,
            group,
            io,
            inflight_update: Mutex::new(None),
        }
    }

    pub fn curve(&self) -> &ControlCurve {
        &self.curve
    }

    pub fn controller_output(&self, backlog: f32) -> f32 {
        self.curve.output(backlog)
    }

    pub fn backlog_of_shares(&self, shares: f32) -> f32 {
        self.curve.backlog_of_shares(shares)
    }

    /// Sample `backlog` and retune; returns the new shares
    pub fn adjust(&self, backlog: f32) -> f32 {
        let shares = self.controller_output(backlog);
        self.update_controller(shares);
        shares
    }

    /// Set the group's weight and push it to the I/O class
    ///
    /// While a push is in flight new values only update the group; the next
    /// tick carries them to the I/O class.
    pub fn update_controller(&self, shares: f32) {
        self.group.set_shares(shares);

        let mut inflight = self.inflight_update.lock();
        if inflight.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        let io = self.io.clone();
        let group = self.group.name();
        *inflight = Some(tokio::spawn(async move {
            if let Err(e) = io.update_shares(shares as u32).await {
                warn!(group, shares, error = %e, "Failed to update I/O shares");
            }
        }));
    }

    pub fn shares(&self) -> f32 {
        self.group.shares()
    }

    async fn wait_inflight(&self) {
        let handle = self.inflight_update.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Controller for the memtable flush class: static or feedback driven
pub struct FlushController {
    controller: Arc<BacklogController>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl FlushController {
    /// Fixed shares, no feedback
    pub fn fixed(
        shares: f32,
        group: Arc<SchedulingGroup>,
        io: Arc<dyn IoPriorityClass>,
    ) -> Result<Self> {
        let curve = ControlCurve::new(vec![ControlPoint::new(0.0, shares)])?;
        let controller = Arc::new(BacklogController::new(curve, group, io));
        controller.update_controller(shares);
        debug!(shares, "Static memtable flush controller");
        Ok(Self {
            controller,
            ticker: Mutex::new(None),
        })
    }

    /// Sample `backlog` every `interval` and retune
    pub fn feedback<F>(
        curve: ControlCurve,
        interval: Duration,
        group: Arc<SchedulingGroup>,
        io: Arc<dyn IoPriorityClass>,
        backlog: F,
    ) -> Self
    where
        F: Fn() -> f32 + Send + Sync + 'static,
    {
        let controller = Arc::new(BacklogController::new(curve, group, io));
        let ticking = controller.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                ticking.adjust(backlog());
            }
        });
        Self {
            controller,
            ticker: Mutex::new(Some(ticker)),
        }
    }

    pub fn controller(&self) -> &Arc<BacklogController> {
        &self.controller
    }

    pub fn backlog_of_shares(&self, shares: f32) -> f32 {
        self.controller.backlog_of_shares(shares)
    }

    pub fn shares(&self) -> f32 {
        self.controller.shares()
    }

    /// Stop sampling and wait for the last share update
    pub async fn shutdown(&self) {
        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            ticker.abort();
            let _ = ticker.await;
        }
        self.controller.wait_inflight().await;
    }
}
