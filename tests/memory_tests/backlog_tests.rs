//! Tests for the backlog controller
//!
//! These tests verify:
//! - The flush curve hits its control points and interpolates between them
//! - Output never decreases as backlog grows
//! - backlog_of_shares inverts the curve
//! - Controllers push shares to the scheduling group and the I/O class

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfshard::backlog::{
    BacklogController, ControlCurve, ControlPoint, FlushController, IoPriorityClass, SchedulingGroup,
};
use cfshard::ShardError;
use parking_lot::Mutex;

// =============================================================================
// Helper Functions
// =============================================================================

const EPSILON: f32 = 1e-3;

fn assert_close(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < EPSILON,
        "expected {}, got {}",
        expected,
        actual
    );
}

/// Remembers every share value it was given
#[derive(Default)]
struct RecordingIo {
    updates: Mutex<Vec<u32>>,
}

#[async_trait]
impl IoPriorityClass for RecordingIo {
    async fn update_shares(&self, shares: u32) -> cfshard::Result<()> {
        self.updates.lock().push(shares);
        Ok(())
    }
}

async fn wait_for_update(io: &RecordingIo) -> u32 {
    for _ in 0..200 {
        if let Some(last) = io.updates.lock().last().copied() {
            return last;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no share update reached the I/O class");
}

// =============================================================================
// Curve Tests
// =============================================================================

#[test]
fn test_flush_curve_control_points() {
    let curve = ControlCurve::memtable_flush(0.5);

    assert_close(curve.output(0.0), 0.0);
    assert_close(curve.output(0.5), 10.0);
    assert_close(curve.output(0.75), 200.0);
    assert_close(curve.output(1.0), 1000.0);
}

#[test]
fn test_flush_curve_interpolates() {
    let curve = ControlCurve::memtable_flush(0.5);

    assert_close(curve.output(0.25), 5.0);
    assert_close(curve.output(0.625), 105.0);
    assert_close(curve.output(0.875), 600.0);
}

#[test]
fn test_flush_curve_clamps() {
    let curve = ControlCurve::memtable_flush(0.5);

    assert_close(curve.output(-1.0), 0.0);
    assert_close(curve.output(3.0), 1000.0);
}

#[test]
fn test_flush_curve_is_monotonic() {
    let curve = ControlCurve::memtable_flush(0.6);
    let mut previous = curve.output(0.0);

    for step in 1..=240 {
        let backlog = step as f32 / 200.0;
        let output = curve.output(backlog);
        assert!(output >= previous, "output fell at backlog {}", backlog);
        previous = output;
    }
}

#[test]
fn test_backlog_of_shares_inverts_control_points() {
    let curve = ControlCurve::memtable_flush(0.6);

    for point in curve.points() {
        if point.output > 0.0 {
            assert_close(curve.backlog_of_shares(point.output), point.input);
        }
    }
    assert_close(curve.backlog_of_shares(0.0), 0.0);
    assert_close(curve.backlog_of_shares(5000.0), 1.0);
}

#[test]
fn test_backlog_of_shares_round_trips_between_points() {
    let curve = ControlCurve::memtable_flush(0.6);

    let backlog = curve.backlog_of_shares(105.0);

    assert_close(curve.output(backlog), 105.0);
}

#[test]
fn test_curve_rejects_unordered_points() {
    let decreasing = ControlCurve::new(vec![ControlPoint::new(0.0, 10.0), ControlPoint::new(1.0, 5.0)]);
    let repeated = ControlCurve::new(vec![ControlPoint::new(0.5, 0.0), ControlPoint::new(0.5, 5.0)]);
    let empty = ControlCurve::new(Vec::new());

    assert!(matches!(decreasing, Err(ShardError::Config(_))));
    assert!(matches!(repeated, Err(ShardError::Config(_))));
    assert!(matches!(empty, Err(ShardError::Config(_))));
}

// =============================================================================
// Controller Tests
// =============================================================================

#[tokio::test]
async fn test_adjust_updates_group_and_io() {
    let group = SchedulingGroup::new("memtable_flush", 0.0);
    let io = Arc::new(RecordingIo::default());
    let controller = BacklogController::new(ControlCurve::memtable_flush(0.5), group.clone(), io.clone());

    let shares = controller.adjust(1.0);

    assert_close(shares, 1000.0);
    assert_close(group.shares(), 1000.0);
    assert_eq!(wait_for_update(&io).await, 1000);
}

#[tokio::test]
async fn test_fixed_controller_ignores_backlog() {
    let group = SchedulingGroup::new("memtable_flush", 0.0);
    let io = Arc::new(RecordingIo::default());

    let controller = FlushController::fixed(250.0, group.clone(), io.clone()).unwrap();

    assert_close(controller.shares(), 250.0);
    assert_close(controller.controller().adjust(0.9), 250.0);
    assert_eq!(wait_for_update(&io).await, 250);
    controller.shutdown().await;
}

#[tokio::test]
async fn test_feedback_controller_samples_backlog() {
    let group = SchedulingGroup::new("memtable_flush", 0.0);
    let io = Arc::new(RecordingIo::default());

    let controller = FlushController::feedback(
        ControlCurve::memtable_flush(0.5),
        Duration::from_millis(5),
        group.clone(),
        io.clone(),
        || 0.75,
    );

    assert_eq!(wait_for_update(&io).await, 200);
    assert_close(controller.shares(), 200.0);
    assert_close(controller.backlog_of_shares(200.0), 0.75);

    controller.shutdown().await;
}
