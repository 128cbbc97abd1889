//! Resource Manager Tests
//!
//! Tests for:
//! - Two-speed destruction: immediate releases reclaimed at the next pass,
//!   delayed releases only after two frame boundaries
//! - Use contexts: nestable marking, non-LIFO teardown, eviction protection
//! - Eviction: OOM-gated, largest-cold-resource victim selection, pending
//!   queue flushing, never touches in-use or delayed-flag records
//! - Teardown: unconditional destruction of everything tracked

use vitrail::backend::{BufferDesc, BufferUsage, DeviceContext, ResourceHandle};
use vitrail::testing::MockBackend;
use vitrail::{DestroyTiming, GpuError, ResourceManager};

fn alloc(ctx: &mut dyn DeviceContext, size: u64) -> ResourceHandle {
    ctx.create_buffer(&BufferDesc {
        size,
        usage: BufferUsage::Vertex,
    })
    .expect("mock allocation")
}

// ============================================================================
// Two-speed destruction
// ============================================================================

#[test]
fn immediate_release_is_reclaimed_on_next_pass() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let handle = alloc(ctx.as_mut(), 1024);
    let key = rm.track(handle, 1024, false);

    rm.release(key);
    assert!(!rm.is_valid(key));
    assert!(control.destroyed_resources().is_empty());

    rm.destroy_released_resources_from_last_frame(ctx.as_mut());
    assert_eq!(control.destroyed_resources(), vec![handle]);
    assert_eq!(rm.record_count(), 0);
}

#[test]
fn delayed_release_waits_two_frame_boundaries() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let handle = alloc(ctx.as_mut(), 4096);
    let key = rm.track(handle, 4096, true);

    // Released during frame N.
    rm.release(key);
    rm.destroy_resources(ctx.as_mut(), DestroyTiming::WithDelay);
    assert!(control.destroyed_resources().is_empty(), "frame N");

    // Frame N+1.
    rm.end_frame();
    rm.destroy_resources(ctx.as_mut(), DestroyTiming::WithDelay);
    assert!(control.destroyed_resources().is_empty(), "frame N+1");

    // Frame N+2: the GPU can no longer be reading it.
    rm.end_frame();
    rm.destroy_resources(ctx.as_mut(), DestroyTiming::WithDelay);
    assert_eq!(control.destroyed_resources(), vec![handle]);
}

#[test]
fn without_delay_flushes_every_pending_release() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let delayed = alloc(ctx.as_mut(), 100);
    let immediate = alloc(ctx.as_mut(), 200);
    let delayed_key = rm.track(delayed, 100, true);
    let immediate_key = rm.track(immediate, 200, false);

    rm.release(delayed_key);
    rm.release(immediate_key);

    // Device teardown path: no delay is honored.
    rm.destroy_resources(ctx.as_mut(), DestroyTiming::WithoutDelay);
    assert_eq!(control.destroyed_resources().len(), 2);
    assert_eq!(rm.record_count(), 0);
}

#[test]
fn release_is_idempotent() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let handle = alloc(ctx.as_mut(), 64);
    let key = rm.track(handle, 64, false);

    rm.release(key);
    rm.release(key);
    rm.destroy_released_resources_from_last_frame(ctx.as_mut());

    let destroyed = control.destroyed_resources();
    assert_eq!(
        destroyed.iter().filter(|&&h| h == handle).count(),
        1,
        "finalization happens exactly once"
    );
}

#[test]
fn destroy_all_resources_tears_down_live_records() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let a = alloc(ctx.as_mut(), 100);
    let b = alloc(ctx.as_mut(), 200);
    let c = alloc(ctx.as_mut(), 300);
    rm.track(a, 100, true);
    rm.track(b, 200, false);
    let c_key = rm.track(c, 300, true);
    rm.release(c_key);

    rm.destroy_all_resources(ctx.as_mut());

    assert_eq!(control.live_resources(), 0);
    assert_eq!(rm.record_count(), 0);
    assert_eq!(rm.tracked_bytes(), 0);
}

// ============================================================================
// Use contexts
// ============================================================================

#[test]
fn eviction_never_touches_resources_in_use() {
    let (_backend, control) = MockBackend::new();
    control.set_memory_budget(Some(1000));
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let handle = alloc(ctx.as_mut(), 600);
    let key = rm.track(handle, 600, false);

    let depth = rm.enter_use_context();
    rm.use_resource(key);

    // Simulated memory pressure: even repeated eviction attempts must not
    // free the in-use resource.
    for _ in 0..3 {
        assert!(!rm.free_some_video_memory(ctx.as_mut(), &GpuError::OutOfVideoMemory));
    }
    assert!(rm.is_valid(key));
    assert!(control.destroyed_resources().is_empty());

    rm.exit_use_context(depth);

    assert!(rm.free_some_video_memory(ctx.as_mut(), &GpuError::OutOfVideoMemory));
    assert!(!rm.is_valid(key));
    assert_eq!(control.destroyed_resources(), vec![handle]);
}

#[test]
fn exiting_an_outer_context_closes_nested_ones() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let a = alloc(ctx.as_mut(), 900);
    let b = alloc(ctx.as_mut(), 100);
    let c = alloc(ctx.as_mut(), 50);
    let a_key = rm.track(a, 900, false);
    let b_key = rm.track(b, 100, false);
    let c_key = rm.track(c, 50, false);

    let d1 = rm.enter_use_context();
    rm.use_resource(a_key);
    let d2 = rm.enter_use_context();
    rm.use_resource(b_key);
    let _d3 = rm.enter_use_context();
    rm.use_resource(c_key);
    assert_eq!(rm.use_context_depth(), 3);

    // Error-path teardown: exiting at d2 also unwinds d3.
    rm.exit_use_context(d2);
    assert_eq!(rm.use_context_depth(), 1);

    // a is the largest record but still protected by d1; the victim must
    // come from the now-unprotected b and c.
    assert!(rm.free_some_video_memory(ctx.as_mut(), &GpuError::OutOfVideoMemory));
    assert!(rm.is_valid(a_key));
    assert!(!rm.is_valid(b_key));
    assert!(rm.is_valid(c_key));

    rm.exit_use_context(d1);
}

#[test]
fn use_without_open_context_is_a_noop() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let handle = alloc(ctx.as_mut(), 128);
    let key = rm.track(handle, 128, false);
    rm.use_resource(key);

    assert!(rm.free_some_video_memory(ctx.as_mut(), &GpuError::OutOfVideoMemory));
    assert!(!rm.is_valid(key));
}

// ============================================================================
// Eviction policy
// ============================================================================

#[test]
fn eviction_requires_an_out_of_memory_code() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let handle = alloc(ctx.as_mut(), 256);
    let key = rm.track(handle, 256, false);

    assert!(!rm.free_some_video_memory(ctx.as_mut(), &GpuError::DeviceLost));
    assert!(!rm.free_some_video_memory(ctx.as_mut(), &GpuError::InvalidArgument("x")));
    assert!(rm.is_valid(key));
}

#[test]
fn eviction_picks_the_largest_cold_resource() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let small = alloc(ctx.as_mut(), 100);
    let large = alloc(ctx.as_mut(), 500);
    let medium = alloc(ctx.as_mut(), 300);
    rm.track(small, 100, false);
    let large_key = rm.track(large, 500, false);
    rm.track(medium, 300, false);

    assert!(rm.free_some_video_memory(ctx.as_mut(), &GpuError::OutOfVideoMemory));
    assert_eq!(control.destroyed_resources(), vec![large]);
    assert!(!rm.is_valid(large_key));
    assert_eq!(rm.tracked_bytes(), 400);
}

#[test]
fn eviction_skips_delayed_release_records() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let handle = alloc(ctx.as_mut(), 2048);
    let key = rm.track(handle, 2048, true);

    // The GPU may still read it; the two-frame protocol is the only way out.
    assert!(!rm.free_some_video_memory(ctx.as_mut(), &GpuError::OutOfVideoMemory));
    assert!(rm.is_valid(key));
}

#[test]
fn eviction_flushes_pending_immediate_releases_first() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let handle = alloc(ctx.as_mut(), 512);
    let key = rm.track(handle, 512, false);
    rm.release(key);

    assert!(rm.free_some_video_memory(ctx.as_mut(), &GpuError::OutOfVideoMemory));
    assert_eq!(control.destroyed_resources(), vec![handle]);
}

#[test]
fn eviction_reports_nothing_left_to_free() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    assert!(!rm.free_some_video_memory(ctx.as_mut(), &GpuError::OutOfVideoMemory));

    let handle = alloc(ctx.as_mut(), 64);
    rm.track(handle, 64, false);
    assert!(rm.free_some_video_memory(ctx.as_mut(), &GpuError::OutOfVideoMemory));
    // The pool is now empty; a further attempt must stop the retry loop.
    assert!(!rm.free_some_video_memory(ctx.as_mut(), &GpuError::OutOfVideoMemory));
}

// ============================================================================
// Accounting
// ============================================================================

#[test]
fn tracked_bytes_follow_record_lifetimes() {
    let (_backend, control) = MockBackend::new();
    let mut ctx = control.raw_context();
    let mut rm = ResourceManager::new();

    let a = alloc(ctx.as_mut(), 1000);
    let b = alloc(ctx.as_mut(), 500);
    let a_key = rm.track(a, 1000, false);
    rm.track(b, 500, true);
    assert_eq!(rm.tracked_bytes(), 1500);

    rm.release(a_key);
    // Accounting drops only at physical destruction.
    assert_eq!(rm.tracked_bytes(), 1500);
    rm.destroy_released_resources_from_last_frame(ctx.as_mut());
    assert_eq!(rm.tracked_bytes(), 500);
    assert_eq!(control.live_resources(), 1);
}
