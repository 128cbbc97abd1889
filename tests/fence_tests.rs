//! Fence Tracker Tests
//!
//! Tests for:
//! - Monotonic ordering: consumption never skips an older unconsumed marker,
//!   out-of-order ids are dropped without altering the active list
//! - Recycling: consumed fences return to the free pool and reuse their
//!   completion queries
//! - Self-disable: probe failure, backlog overflow (35), unexpected poll and
//!   issue failures
//! - Flush economy: `force_flush` is honored at most once per consumption
//!   pass

use vitrail::testing::{MockBackend, MockOp};
use vitrail::{FenceTracker, GpuError, MAX_ACTIVE_FENCES};

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn consumption_is_in_marker_order() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut tracker = FenceTracker::new();

    tracker.insert_marker(ctx.as_mut(), 10);
    tracker.insert_marker(ctx.as_mut(), 20);
    tracker.insert_marker(ctx.as_mut(), 30);
    assert_eq!(tracker.outstanding(), 3);

    // GPU has only reached the first query.
    control.complete_issued(1);
    tracker.consume_markers(ctx.as_mut(), false);

    assert_eq!(tracker.last_consumed_id(), 10);
    assert!(tracker.is_consumed(10));
    assert!(!tracker.is_consumed(20));
    assert!(!tracker.is_consumed(30));
    assert_eq!(tracker.outstanding(), 2);

    control.complete_issued(2);
    tracker.consume_markers(ctx.as_mut(), false);
    assert_eq!(tracker.last_consumed_id(), 20);
    assert_eq!(tracker.outstanding(), 1);
}

#[test]
fn consuming_a_late_marker_retires_all_predecessors() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut tracker = FenceTracker::new();

    for id in [5, 6, 7, 8] {
        tracker.insert_marker(ctx.as_mut(), id);
    }

    control.complete_issued(4);
    tracker.consume_markers(ctx.as_mut(), false);

    assert_eq!(tracker.last_consumed_id(), 8);
    assert_eq!(tracker.outstanding(), 0);
}

#[test]
fn out_of_order_id_is_ignored() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut tracker = FenceTracker::new();

    tracker.insert_marker(ctx.as_mut(), 100);
    tracker.insert_marker(ctx.as_mut(), 50); // regressed clock: dropped
    assert_eq!(tracker.outstanding(), 1);

    tracker.insert_marker(ctx.as_mut(), 100); // equal is non-decreasing: kept
    tracker.insert_marker(ctx.as_mut(), 150);
    assert_eq!(tracker.outstanding(), 3);

    control.complete_issued(3);
    tracker.consume_markers(ctx.as_mut(), false);
    assert_eq!(tracker.last_consumed_id(), 150);
}

// ============================================================================
// Recycling
// ============================================================================

#[test]
fn consumed_fences_are_recycled_with_their_queries() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut tracker = FenceTracker::new();

    for id in 1..=3 {
        tracker.insert_marker(ctx.as_mut(), id);
    }
    // Probe query plus one per fence.
    assert_eq!(control.created_queries(), 4);

    control.complete_issued(3);
    tracker.consume_markers(ctx.as_mut(), false);
    assert_eq!(tracker.outstanding(), 0);

    for id in 4..=6 {
        tracker.insert_marker(ctx.as_mut(), id);
    }
    // All three came from the free pool; no new queries.
    assert_eq!(control.created_queries(), 4);
    assert_eq!(tracker.outstanding(), 3);
}

// ============================================================================
// Self-disable
// ============================================================================

#[test]
fn probe_failure_disables_tracking_permanently() {
    let (_backend, control) = MockBackend::new();
    control.set_queries_supported(false);
    let mut ctx = control.raw_context();
    let mut tracker = FenceTracker::new();

    tracker.insert_marker(ctx.as_mut(), 7);
    assert!(!tracker.is_enabled());
    assert_eq!(tracker.outstanding(), 0);

    // Disabled tracking degrades to "everything consumed immediately".
    assert!(tracker.is_consumed(7));
    assert_eq!(tracker.last_consumed_id(), 7);

    // Re-enabling support later does not re-enable a tested tracker.
    control.set_queries_supported(true);
    tracker.insert_marker(ctx.as_mut(), 8);
    assert!(!tracker.is_enabled());
    assert!(tracker.is_consumed(8));
}

#[test]
fn backlog_overflow_disables_tracking() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut tracker = FenceTracker::new();

    // Insert markers 1..=40 with nothing ever consumed. By the time the
    // backlog threshold is exceeded the tracker must shut itself off and
    // clear its lists rather than grow without bound.
    for id in 1..=40 {
        tracker.insert_marker(ctx.as_mut(), id);
    }

    assert!(!tracker.is_enabled());
    assert_eq!(tracker.outstanding(), 0);

    // Everything issued (and everything after the disable) reads consumed;
    // reclamation falls back to frame-based timing only.
    assert!(tracker.is_consumed(40));

    // Subsequent calls are cheap no-ops.
    tracker.consume_markers(ctx.as_mut(), true);
    tracker.insert_marker(ctx.as_mut(), 41);
    assert_eq!(tracker.outstanding(), 0);
    assert!(tracker.is_consumed(41));
}

#[test]
fn backlog_disable_happens_exactly_past_threshold() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut tracker = FenceTracker::new();

    for id in 1..=MAX_ACTIVE_FENCES as u64 {
        tracker.insert_marker(ctx.as_mut(), id);
    }
    assert!(tracker.is_enabled());
    assert_eq!(tracker.outstanding(), MAX_ACTIVE_FENCES);

    tracker.insert_marker(ctx.as_mut(), MAX_ACTIVE_FENCES as u64 + 1);
    assert!(!tracker.is_enabled());
    assert_eq!(tracker.outstanding(), 0);
}

#[test]
fn unexpected_poll_failure_disables_tracking() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut tracker = FenceTracker::new();

    tracker.insert_marker(ctx.as_mut(), 1);
    tracker.insert_marker(ctx.as_mut(), 2);

    control.fail_times(MockOp::PollQuery, GpuError::NotSupported, 1);
    tracker.consume_markers(ctx.as_mut(), false);

    assert!(!tracker.is_enabled());
    assert_eq!(tracker.outstanding(), 0);
    // Never propagated: the disabled tracker just reports progress.
    assert!(tracker.is_consumed(2));
}

#[test]
fn issue_failure_disables_tracking() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut tracker = FenceTracker::new();

    control.fail_times(MockOp::IssueQuery, GpuError::FatalInternalError, 1);
    tracker.insert_marker(ctx.as_mut(), 9);

    assert!(!tracker.is_enabled());
    assert!(tracker.is_consumed(9));
}

#[test]
fn device_loss_during_poll_counts_as_consumed() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut tracker = FenceTracker::new();

    tracker.insert_marker(ctx.as_mut(), 1);
    tracker.insert_marker(ctx.as_mut(), 2);

    // A lost adapter is no longer rendering, so the marker can only be
    // behind the GPU; the tracker retires it without disabling itself.
    control.fail_times(MockOp::PollQuery, GpuError::DeviceLost, 1);
    tracker.consume_markers(ctx.as_mut(), false);

    assert!(tracker.is_enabled());
    assert_eq!(tracker.outstanding(), 0);
    assert_eq!(tracker.last_consumed_id(), 2);
}

// ============================================================================
// Flush economy
// ============================================================================

#[test]
fn force_flush_is_spent_once_per_pass() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut tracker = FenceTracker::new();

    for id in 1..=3 {
        tracker.insert_marker(ctx.as_mut(), id);
    }

    tracker.consume_markers(ctx.as_mut(), true);
    assert_eq!(control.flushing_polls(), 1);

    tracker.consume_markers(ctx.as_mut(), false);
    assert_eq!(control.flushing_polls(), 1);
}

// ============================================================================
// Discard on loss
// ============================================================================

#[test]
fn reset_discards_without_waiting() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut tracker = FenceTracker::new();

    for id in 1..=5 {
        tracker.insert_marker(ctx.as_mut(), id);
    }
    assert_eq!(tracker.outstanding(), 5);

    tracker.reset(ctx.as_mut());

    assert_eq!(tracker.outstanding(), 0);
    // Probe query plus the five fence queries.
    assert_eq!(control.destroyed_queries(), 6);
    assert_eq!(tracker.last_consumed_id(), 5);
}
