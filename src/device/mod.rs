//! Device
//!
//! A [`Device`] wraps one physical adapter's command-submission context and
//! owns the three per-device subsystems: a [`ResourceManager`], a
//! [`FenceTracker`], and a [`StateObjectCache`]. It guards exclusive access
//! to the backend context, mediates every GPU allocation through an
//! eviction-retry loop, tracks frame and present state, and translates
//! backend failures into the crate's taxonomy.
//!
//! # Entry protection
//!
//! All mutating operations live on the RAII [`DeviceGuard`] returned by
//! [`Device::enter`], so "must be entered" is enforced by construction. The
//! guard is re-entrant on the owning thread; nesting depth and the owning
//! thread id are tracked for diagnostics and for concurrent-loss handling.
//!
//! # Failure translation
//!
//! A small set of fatal backend results (the device-loss class and driver
//! internal errors) convert to a single sticky display-invalid condition.
//! Once set, every subsequent operation short-circuits with
//! [`GpuError::DisplayStateInvalid`] until the caller discards this device
//! and obtains a fresh one from the
//! [`DeviceManager`](crate::device::DeviceManager).

pub mod fence;
pub mod manager;
pub mod resources;
pub mod state_cache;

use std::cell::RefCell;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::backend::{
    AdapterId, BufferDesc, DeviceContext, DeviceCreateFlags, DrawCall, PresentParams,
    RenderTargetDesc, ResourceHandle, StateHandle, TextureDesc,
};
use crate::errors::{GpuError, Result};
use self::fence::FenceTracker;
use self::manager::DeviceManager;
use self::resources::{DestroyTiming, ResourceKey, ResourceManager};
use self::state_cache::{BlendDesc, DepthStencilDesc, RasterizerDesc, SamplerDesc, StateObjectCache};

/// Backoff applied when the presentation target is transiently occluded.
const OCCLUSION_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of a successful present call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PresentStatus {
    /// The frame reached the target.
    Presented,
    /// The target is occluded; the frame was skipped and should be
    /// re-presented once the target becomes visible again.
    Occluded,
}

/// Per-frame submission counters, reported on frame advance.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct FrameStats {
    pub vertices: u64,
    pub primitives: u64,
}

struct DeviceInner {
    context: Box<dyn DeviceContext>,
    resources: ResourceManager,
    fences: FenceTracker,
    states: StateObjectCache,
    /// The fatal result that invalidated this device, if any. Sticky.
    display_invalid: Option<GpuError>,
    frame_number: u64,
    stats: FrameStats,
    entry_depth: u32,
    entry_thread: Option<ThreadId>,
}

impl DeviceInner {
    fn ensure_usable(&self) -> Result<()> {
        if self.display_invalid.is_some() {
            Err(GpuError::DisplayStateInvalid)
        } else {
            Ok(())
        }
    }
}

/// Attempt a GPU allocation, evicting and retrying while the failure is an
/// out-of-memory condition the resource manager can still relieve.
///
/// Terminates as soon as the attempt succeeds or eviction reports nothing
/// further can be freed, in which case the original failure is returned.
fn retry_alloc<T>(
    inner: &mut DeviceInner,
    mut attempt: impl FnMut(&mut dyn DeviceContext) -> Result<T>,
) -> Result<T> {
    loop {
        match attempt(inner.context.as_mut()) {
            Ok(value) => return Ok(value),
            Err(err) => {
                let freed = inner
                    .resources
                    .free_some_video_memory(inner.context.as_mut(), &err);
                if !freed {
                    return Err(err);
                }
            }
        }
    }
}

// ─── Device ──────────────────────────────────────────────────────────────────

/// Wrapper around one physical adapter's graphics context.
///
/// Created by [`DeviceManager`]; shared by callers as `Arc<Device>`. The
/// manager's pool entry is a `Weak`, so the device is finalized exactly once
/// — when the last external holder drops it.
pub struct Device {
    adapter: AdapterId,
    flags: DeviceCreateFlags,
    software: bool,
    usable: AtomicBool,
    manager: Weak<DeviceManager>,
    inner: ReentrantMutex<RefCell<DeviceInner>>,
}

impl Device {
    pub(crate) fn new(
        context: Box<dyn DeviceContext>,
        adapter: AdapterId,
        flags: DeviceCreateFlags,
        software: bool,
        manager: Weak<DeviceManager>,
    ) -> Self {
        Self {
            adapter,
            flags,
            software,
            usable: AtomicBool::new(true),
            manager,
            inner: ReentrantMutex::new(RefCell::new(DeviceInner {
                context,
                resources: ResourceManager::new(),
                fences: FenceTracker::new(),
                states: StateObjectCache::new(),
                display_invalid: None,
                frame_number: 0,
                stats: FrameStats::default(),
                entry_depth: 0,
                entry_thread: None,
            })),
        }
    }

    /// Adapter this device was created for.
    #[inline]
    #[must_use]
    pub fn adapter(&self) -> AdapterId {
        self.adapter
    }

    /// Behavior flags this device was created with. Together with the
    /// adapter these form the device's pooling identity.
    #[inline]
    #[must_use]
    pub fn create_flags(&self) -> DeviceCreateFlags {
        self.flags
    }

    /// Whether this is the software-rasterizer fallback device.
    #[inline]
    #[must_use]
    pub fn is_software(&self) -> bool {
        self.software
    }

    /// Whether the device can still be handed out and used. The transition
    /// to unusable is irreversible.
    #[inline]
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.usable.load(Ordering::Acquire)
    }

    /// Enters the device's critical section and returns the guard all
    /// mutating operations live on.
    ///
    /// Re-entrant: the owning thread may nest `enter` freely. Devices
    /// created without [`DeviceCreateFlags::MULTITHREADED`] are only ever
    /// entered from one thread, so the lock is uncontended and serves as
    /// assertion bookkeeping.
    pub fn enter(&self) -> DeviceGuard<'_> {
        let lock = self.inner.lock();
        {
            let mut inner = lock.borrow_mut();
            inner.entry_depth += 1;
            inner.entry_thread = Some(std::thread::current().id());
        }
        DeviceGuard { device: self, lock }
    }

    /// Marks this device unusable: discards every outstanding fence (without
    /// waiting), flushes the resource manager's deferred-destruction queues
    /// without delay, and notifies the manager exactly once.
    ///
    /// Idempotent — once unusable, further calls are no-ops. Pass
    /// `may_be_concurrent` when the caller does not already hold the
    /// device's entry protection.
    pub fn mark_unusable(&self, may_be_concurrent: bool) {
        let _ = may_be_concurrent; // entry is re-entrant; always safe to take
        let guard = self.enter();

        if self.usable.swap(false, Ordering::AcqRel) {
            {
                let mut inner = guard.lock.borrow_mut();
                let DeviceInner {
                    context,
                    resources,
                    fences,
                    states,
                    display_invalid,
                    ..
                } = &mut *inner;
                fences.reset(context.as_mut());
                resources.destroy_resources(context.as_mut(), DestroyTiming::WithoutDelay);
                states.clear();
                display_invalid.get_or_insert(GpuError::DeviceLost);
            }
            drop(guard);

            if let Some(manager) = self.manager.upgrade() {
                manager.unusable_notification(self);
            }
        }
    }

    /// Sets the sticky display-invalid condition and tears the device down.
    /// Returns the error the caller should surface.
    fn note_fatal(&self, guard: &DeviceGuard<'_>, err: &GpuError) -> GpuError {
        if err.is_fatal() {
            guard
                .lock
                .borrow_mut()
                .display_invalid
                .get_or_insert(err.clone());
            self.mark_unusable(false);
            GpuError::DisplayStateInvalid
        } else {
            err.clone()
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().get_mut();
        assert_eq!(inner.entry_depth, 0, "device dropped while entered");
        let DeviceInner {
            context,
            resources,
            fences,
            ..
        } = inner;
        fences.reset(context.as_mut());
        resources.destroy_all_resources(context.as_mut());
    }
}

// ─── DeviceGuard ─────────────────────────────────────────────────────────────

/// RAII handle to an entered device. Dropping it leaves the critical
/// section.
pub struct DeviceGuard<'a> {
    device: &'a Device,
    lock: ReentrantMutexGuard<'a, RefCell<DeviceInner>>,
}

impl DeviceGuard<'_> {
    /// The device this guard has entered.
    #[inline]
    #[must_use]
    pub fn device(&self) -> &Device {
        self.device
    }

    // ── Resource creation ──────────────────────────────────────────────────

    /// Creates a sampled texture, evicting unused resources and retrying if
    /// the backend reports out-of-memory. The texture is tracked with
    /// delayed release: the GPU may still sample it when the owner lets go.
    pub fn create_texture(&self, desc: &TextureDesc) -> Result<ResourceKey> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::InvalidArgument("texture extent is zero"));
        }
        let result = {
            let mut inner = self.lock.borrow_mut();
            inner.ensure_usable()?;
            retry_alloc(&mut inner, |context| context.create_texture(desc)).map(|handle| {
                inner.resources.track(handle, desc.size_estimate(), true)
            })
        };
        result.map_err(|e| self.device.note_fatal(self, &e))
    }

    /// Creates a vertex/index/uniform buffer. Buffers are tracked without
    /// delayed release: they are transient fill-and-draw storage protected
    /// by use contexts while bound.
    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<ResourceKey> {
        if desc.size == 0 {
            return Err(GpuError::InvalidArgument("buffer size is zero"));
        }
        let result = {
            let mut inner = self.lock.borrow_mut();
            inner.ensure_usable()?;
            retry_alloc(&mut inner, |context| context.create_buffer(desc))
                .map(|handle| inner.resources.track(handle, desc.size, false))
        };
        result.map_err(|e| self.device.note_fatal(self, &e))
    }

    /// Creates a render target, tracked with delayed release.
    pub fn create_render_target(&self, desc: &RenderTargetDesc) -> Result<ResourceKey> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::InvalidArgument("render target extent is zero"));
        }
        let result = {
            let mut inner = self.lock.borrow_mut();
            inner.ensure_usable()?;
            retry_alloc(&mut inner, |context| context.create_render_target(desc)).map(|handle| {
                inner.resources.track(handle, desc.size_estimate(), true)
            })
        };
        result.map_err(|e| self.device.note_fatal(self, &e))
    }

    /// Copies `bytes` into a tracked resource at `offset`.
    pub fn upload(&self, key: ResourceKey, offset: u64, bytes: &[u8]) -> Result<()> {
        let result = {
            let mut inner = self.lock.borrow_mut();
            inner.ensure_usable()?;
            let handle = inner
                .resources
                .get(key)
                .filter(|r| r.is_valid())
                .map(resources::ResourceRecord::handle)
                .ok_or(GpuError::InvalidArgument("resource is not valid"))?;
            inner.context.upload(handle, offset, bytes)
        };
        result.map_err(|e| self.device.note_fatal(self, &e))
    }

    /// Native handle of a tracked resource, if it is still valid.
    #[must_use]
    pub fn resource_handle(&self, key: ResourceKey) -> Option<ResourceHandle> {
        self.lock
            .borrow()
            .resources
            .get(key)
            .filter(|r| r.is_valid())
            .map(resources::ResourceRecord::handle)
    }

    /// Whether a tracked resource still wraps a live allocation. Owners
    /// recreate resources that were evicted or lost.
    #[must_use]
    pub fn is_resource_valid(&self, key: ResourceKey) -> bool {
        self.lock.borrow().resources.is_valid(key)
    }

    /// Releases the owner's hold on a resource; physical destruction follows
    /// the record's release path.
    pub fn release_resource(&self, key: ResourceKey) {
        self.lock.borrow_mut().resources.release(key);
    }

    // ── Use contexts ───────────────────────────────────────────────────────

    /// Opens a region during which touched resources must not be evicted.
    /// Returns the depth to pass back to [`exit_use_context`].
    ///
    /// [`exit_use_context`]: DeviceGuard::exit_use_context
    pub fn enter_use_context(&self) -> usize {
        self.lock.borrow_mut().resources.enter_use_context()
    }

    /// Closes the use context at `depth` and any contexts nested inside it.
    pub fn exit_use_context(&self, depth: usize) {
        self.lock.borrow_mut().resources.exit_use_context(depth);
    }

    /// Marks a resource as referenced by the innermost open use context.
    pub fn use_resource(&self, key: ResourceKey) {
        self.lock.borrow_mut().resources.use_resource(key);
    }

    // ── State objects ──────────────────────────────────────────────────────

    pub fn get_or_create_blend_state(&self, desc: &BlendDesc) -> Result<StateHandle> {
        let result = {
            let mut inner = self.lock.borrow_mut();
            inner.ensure_usable()?;
            let DeviceInner {
                context, states, ..
            } = &mut *inner;
            states.get_or_create_blend(context.as_mut(), desc)
        };
        result.map_err(|e| self.device.note_fatal(self, &e))
    }

    pub fn get_or_create_rasterizer_state(&self, desc: &RasterizerDesc) -> Result<StateHandle> {
        let result = {
            let mut inner = self.lock.borrow_mut();
            inner.ensure_usable()?;
            let DeviceInner {
                context, states, ..
            } = &mut *inner;
            states.get_or_create_rasterizer(context.as_mut(), desc)
        };
        result.map_err(|e| self.device.note_fatal(self, &e))
    }

    pub fn get_or_create_depth_stencil_state(
        &self,
        desc: &DepthStencilDesc,
    ) -> Result<StateHandle> {
        let result = {
            let mut inner = self.lock.borrow_mut();
            inner.ensure_usable()?;
            let DeviceInner {
                context, states, ..
            } = &mut *inner;
            states.get_or_create_depth_stencil(context.as_mut(), desc)
        };
        result.map_err(|e| self.device.note_fatal(self, &e))
    }

    pub fn get_or_create_sampler_state(&self, desc: &SamplerDesc) -> Result<StateHandle> {
        let result = {
            let mut inner = self.lock.borrow_mut();
            inner.ensure_usable()?;
            let DeviceInner {
                context, states, ..
            } = &mut *inner;
            states.get_or_create_sampler(context.as_mut(), desc)
        };
        result.map_err(|e| self.device.note_fatal(self, &e))
    }

    /// Number of distinct compiled state objects on this device.
    #[must_use]
    pub fn state_object_count(&self) -> usize {
        self.lock.borrow().states.len()
    }

    // ── Submission ─────────────────────────────────────────────────────────

    /// Binds a tracked render target for subsequent draws.
    pub fn set_render_target(&self, key: ResourceKey) -> Result<()> {
        let result = {
            let mut inner = self.lock.borrow_mut();
            inner.ensure_usable()?;
            let handle = inner
                .resources
                .get(key)
                .filter(|r| r.is_valid())
                .map(resources::ResourceRecord::handle)
                .ok_or(GpuError::InvalidArgument("render target is not valid"))?;
            inner.context.set_render_target(handle)
        };
        result.map_err(|e| self.device.note_fatal(self, &e))
    }

    /// Executes one draw submission and accumulates frame metrics.
    pub fn draw(&self, call: &DrawCall) -> Result<()> {
        let result = {
            let mut inner = self.lock.borrow_mut();
            inner.ensure_usable()?;
            inner.context.draw(call).inspect(|()| {
                inner.stats.vertices += u64::from(call.vertex_count);
                inner.stats.primitives += u64::from(call.primitive_count);
            })
        };
        result.map_err(|e| self.device.note_fatal(self, &e))
    }

    /// Presents the back buffer to the window target.
    ///
    /// Transient occlusion is not an error: the call backs off briefly and
    /// returns [`PresentStatus::Occluded`] so the caller re-presents once
    /// the target is visible again.
    pub fn present(&self, params: &PresentParams) -> Result<PresentStatus> {
        if params.source.is_some_and(|r| r.is_empty())
            || params.dest.is_some_and(|r| r.is_empty())
        {
            return Err(GpuError::InvalidArgument("present rectangle is empty"));
        }

        let result = {
            let mut inner = self.lock.borrow_mut();
            inner.ensure_usable()?;
            retry_alloc(&mut inner, |context| context.present(params))
        };

        match result {
            Ok(()) => Ok(PresentStatus::Presented),
            Err(GpuError::PresentationOccluded) => {
                // Repeated failing presents would otherwise spin the CPU;
                // the UI is not responsive during occlusion anyway.
                std::thread::sleep(OCCLUSION_BACKOFF);
                log::debug!("present target occluded; requesting re-present");
                Ok(PresentStatus::Occluded)
            }
            Err(e) => Err(self.device.note_fatal(self, &e)),
        }
    }

    // ── Fences ─────────────────────────────────────────────────────────────

    /// Inserts a completion marker into the command stream. Marker ids must
    /// be non-decreasing; out-of-order ids are dropped, never reordered.
    pub fn insert_marker(&self, id: u64) -> Result<()> {
        let mut inner = self.lock.borrow_mut();
        inner.ensure_usable()?;
        let DeviceInner {
            context, fences, ..
        } = &mut *inner;
        fences.insert_marker(context.as_mut(), id);
        Ok(())
    }

    /// Polls GPU progress and returns the newest marker id known consumed.
    pub fn consume_markers(&self, force_flush: bool) -> Result<u64> {
        let mut inner = self.lock.borrow_mut();
        inner.ensure_usable()?;
        let DeviceInner {
            context, fences, ..
        } = &mut *inner;
        fences.consume_markers(context.as_mut(), force_flush);
        Ok(fences.last_consumed_id())
    }

    /// Whether the GPU has progressed past the given marker.
    #[must_use]
    pub fn is_marker_consumed(&self, id: u64) -> bool {
        self.lock.borrow().fences.is_consumed(id)
    }

    /// Number of outstanding, unconsumed fences (the fence backlog metric).
    #[must_use]
    pub fn outstanding_fences(&self) -> usize {
        self.lock.borrow().fences.outstanding()
    }

    /// Whether fence tracking is still active on this device.
    #[must_use]
    pub fn fences_enabled(&self) -> bool {
        self.lock.borrow().fences.is_enabled()
    }

    // ── Frame boundary ─────────────────────────────────────────────────────

    /// Advances to `frame_number`: reclaims resources deferred-released two
    /// frames ago and any immediate releases accumulated since the last
    /// advance. No-op when the frame number is unchanged.
    pub fn advance_frame(&self, frame_number: u64) {
        let mut inner = self.lock.borrow_mut();
        if inner.frame_number == frame_number {
            return;
        }
        inner.frame_number = frame_number;

        let stats = std::mem::take(&mut inner.stats);
        let outstanding = inner.fences.outstanding();
        log::debug!(
            "frame {frame_number}: {} vertices, {} primitives, {outstanding} fences outstanding",
            stats.vertices,
            stats.primitives
        );

        let DeviceInner {
            context, resources, ..
        } = &mut *inner;
        resources.end_frame();
        resources.destroy_released_resources_from_last_frame(context.as_mut());
        resources.destroy_resources(context.as_mut(), DestroyTiming::WithDelay);
    }

    /// Submission counters accumulated since the last frame advance.
    #[must_use]
    pub fn frame_stats(&self) -> FrameStats {
        self.lock.borrow().stats
    }

    /// Current frame number as last passed to [`advance_frame`].
    ///
    /// [`advance_frame`]: DeviceGuard::advance_frame
    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.lock.borrow().frame_number
    }

    // ── Accounting ─────────────────────────────────────────────────────────

    /// Estimated bytes of video memory tracked on this device.
    #[must_use]
    pub fn tracked_bytes(&self) -> u64 {
        self.lock.borrow().resources.tracked_bytes()
    }

    /// Number of tracked resource records.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock.borrow().resources.record_count()
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.lock.borrow_mut();
        debug_assert!(inner.entry_depth > 0);
        debug_assert_eq!(inner.entry_thread, Some(std::thread::current().id()));
        inner.entry_depth -= 1;
        if inner.entry_depth == 0 {
            inner.entry_thread = None;
        }
    }
}
