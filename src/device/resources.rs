//! GPU Resource Bookkeeping
//!
//! Every live GPU-backed allocation owned by one device is tracked here as a
//! [`ResourceRecord`]: validity, byte-size accounting, use-context marking,
//! and two-speed destruction.
//!
//! # Destruction protocol
//!
//! Releasing a record does not touch the backend. Physical destruction
//! happens on one of three paths:
//!
//! - **Immediate**: records without the delayed-release flag are finalized
//!   by the next [`ResourceManager::destroy_released_resources_from_last_frame`].
//! - **Delayed**: records the GPU may still be reading wait until
//!   [`RELEASE_FRAME_DELAY`] frame boundaries have passed, then fall to
//!   [`ResourceManager::destroy_resources`] with [`DestroyTiming::WithDelay`].
//! - **Teardown**: device loss or destruction flushes everything with
//!   [`DestroyTiming::WithoutDelay`] / [`ResourceManager::destroy_all_resources`].
//!
//! # Eviction
//!
//! [`ResourceManager::free_some_video_memory`] is the sole eviction entry
//! point, invoked from the device's allocation-retry loop. It is
//! intentionally conservative: it never touches a record referenced by an
//! open use context, and it never shortcuts the frame delay of a
//! delayed-release record.

use slotmap::SlotMap;
use smallvec::SmallVec;

use crate::backend::{DeviceContext, ResourceHandle};
use crate::errors::GpuError;

/// Frame boundaries that must pass before a delayed-release record is
/// physically destroyed.
pub const RELEASE_FRAME_DELAY: u64 = 2;

slotmap::new_key_type! {
    /// Stable key of a tracked resource record.
    pub struct ResourceKey;
}

/// Timing selector for [`ResourceManager::destroy_resources`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DestroyTiming {
    /// Finalize only delayed releases whose frame delay has elapsed.
    WithDelay,
    /// Finalize every pending release unconditionally (device teardown).
    WithoutDelay,
}

// ─── ResourceRecord ──────────────────────────────────────────────────────────

/// Bookkeeping for one GPU-backed allocation.
#[derive(Debug)]
pub struct ResourceRecord {
    handle: ResourceHandle,
    size_bytes: u64,
    valid: bool,
    /// The GPU may still be reading this resource after release; physical
    /// destruction must wait for the frame delay.
    delayed_release: bool,
    /// Outstanding references from open use contexts.
    use_count: u32,
}

impl ResourceRecord {
    #[inline]
    #[must_use]
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    #[inline]
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    #[inline]
    #[must_use]
    pub fn requires_delayed_release(&self) -> bool {
        self.delayed_release
    }

    #[inline]
    #[must_use]
    pub fn in_use(&self) -> bool {
        self.use_count > 0
    }
}

// ─── ResourceManager ─────────────────────────────────────────────────────────

/// Per-device tracker of every live GPU-backed allocation.
pub struct ResourceManager {
    records: SlotMap<ResourceKey, ResourceRecord>,
    /// Released records that need no delay, pending the next reclaim pass.
    released_immediate: Vec<ResourceKey>,
    /// Released records with the delay flag, paired with their release frame.
    released_delayed: Vec<(ResourceKey, u64)>,
    /// One mark list per open use context, innermost last.
    use_contexts: Vec<SmallVec<[ResourceKey; 8]>>,
    frame: u64,
    tracked_bytes: u64,
}

impl ResourceManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: SlotMap::with_key(),
            released_immediate: Vec::new(),
            released_delayed: Vec::new(),
            use_contexts: Vec::new(),
            frame: 0,
            tracked_bytes: 0,
        }
    }

    // ── Tracking ───────────────────────────────────────────────────────────

    /// Registers a freshly created allocation.
    ///
    /// `size_estimate` feeds video-memory accounting and eviction victim
    /// selection; `delayed_release` marks resources the GPU may still read
    /// after the owner lets go of them.
    pub fn track(
        &mut self,
        handle: ResourceHandle,
        size_estimate: u64,
        delayed_release: bool,
    ) -> ResourceKey {
        self.tracked_bytes += size_estimate;
        self.records.insert(ResourceRecord {
            handle,
            size_bytes: size_estimate,
            valid: true,
            delayed_release,
            use_count: 0,
        })
    }

    /// Looks up a record. Returns `None` once a record has been finalized.
    #[must_use]
    pub fn get(&self, key: ResourceKey) -> Option<&ResourceRecord> {
        self.records.get(key)
    }

    /// Whether the record still wraps a live native allocation.
    ///
    /// Owners are expected to consult this before binding a resource and to
    /// recreate evicted ones.
    #[must_use]
    pub fn is_valid(&self, key: ResourceKey) -> bool {
        self.records.get(key).is_some_and(ResourceRecord::is_valid)
    }

    /// Number of records currently tracked (including pending releases).
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Estimated bytes of video memory currently tracked.
    #[must_use]
    pub fn tracked_bytes(&self) -> u64 {
        self.tracked_bytes
    }

    // ── Use contexts ───────────────────────────────────────────────────────

    /// Opens a nestable "resources touched here must not be evicted" region
    /// and returns its depth (1-based).
    ///
    /// The returned depth must be handed back to [`exit_use_context`]; exit
    /// with an outer depth also closes every inner context, so error paths
    /// can tear down non-LIFO.
    ///
    /// [`exit_use_context`]: ResourceManager::exit_use_context
    pub fn enter_use_context(&mut self) -> usize {
        self.use_contexts.push(SmallVec::new());
        self.use_contexts.len()
    }

    /// Closes the use context opened at `depth` and any nested inside it.
    pub fn exit_use_context(&mut self, depth: usize) {
        assert!(
            depth >= 1 && depth <= self.use_contexts.len(),
            "exit_use_context({depth}) without matching enter (open depth {})",
            self.use_contexts.len()
        );
        for marks in self.use_contexts.drain(depth - 1..) {
            for key in marks {
                if let Some(record) = self.records.get_mut(key) {
                    record.use_count -= 1;
                }
            }
        }
    }

    /// Depth of currently open use contexts.
    #[must_use]
    pub fn use_context_depth(&self) -> usize {
        self.use_contexts.len()
    }

    /// Marks a resource as referenced by the innermost open use context.
    /// No-op when no context is open.
    pub fn use_resource(&mut self, key: ResourceKey) {
        if let Some(marks) = self.use_contexts.last_mut() {
            if let Some(record) = self.records.get_mut(key) {
                record.use_count += 1;
                marks.push(key);
            }
        }
    }

    // ── Release and destruction ────────────────────────────────────────────

    /// Releases a record for destruction: marks it invalid and queues it on
    /// the immediate or delayed path per its flag.
    ///
    /// Callers must not release a resource an open use context references.
    pub fn release(&mut self, key: ResourceKey) {
        let Some(record) = self.records.get_mut(key) else {
            return;
        };
        if !record.valid {
            return;
        }
        debug_assert!(!record.in_use(), "released a resource inside a use context");

        record.valid = false;
        if record.delayed_release {
            self.released_delayed.push((key, self.frame));
        } else {
            self.released_immediate.push(key);
        }
    }

    /// Finalizes releases that required no delay.
    pub fn destroy_released_resources_from_last_frame(&mut self, context: &mut dyn DeviceContext) {
        for key in std::mem::take(&mut self.released_immediate) {
            self.finalize(context, key);
        }
    }

    /// Finalizes delayed releases — either those whose frame delay has
    /// elapsed, or everything pending when the device is torn down.
    pub fn destroy_resources(&mut self, context: &mut dyn DeviceContext, timing: DestroyTiming) {
        match timing {
            DestroyTiming::WithDelay => {
                let frame = self.frame;
                let mut due = Vec::new();
                self.released_delayed.retain(|&(key, released_at)| {
                    if frame >= released_at + RELEASE_FRAME_DELAY {
                        due.push(key);
                        false
                    } else {
                        true
                    }
                });
                for key in due {
                    self.finalize(context, key);
                }
            }
            DestroyTiming::WithoutDelay => {
                for key in std::mem::take(&mut self.released_immediate) {
                    self.finalize(context, key);
                }
                for (key, _) in std::mem::take(&mut self.released_delayed) {
                    self.finalize(context, key);
                }
            }
        }
    }

    /// Unconditional teardown of every tracked record, live or pending.
    /// Called only when the owning device is being destroyed.
    pub fn destroy_all_resources(&mut self, context: &mut dyn DeviceContext) {
        assert!(
            self.use_contexts.is_empty(),
            "device torn down with an open use context"
        );
        self.released_immediate.clear();
        self.released_delayed.clear();
        for (_, record) in self.records.drain() {
            context.destroy_resource(record.handle);
        }
        self.tracked_bytes = 0;
    }

    // ── Frame boundary ─────────────────────────────────────────────────────

    /// Advances the manager's frame counter. Driven by the owning device's
    /// frame advance, never called directly by the engine.
    pub fn end_frame(&mut self) {
        self.frame += 1;
    }

    #[inline]
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    // ── Eviction ───────────────────────────────────────────────────────────

    /// Tries to free video memory in response to a failed allocation.
    ///
    /// Returns `true` — meaning "retry the allocation" — only when
    /// `last_error` is an out-of-memory condition *and* this call released
    /// at least one resource no open use context references. Each call
    /// flushes any pending immediate releases, then evicts the single
    /// largest cold resource, invalidating its record so the owner recreates
    /// it later. Delayed-release records keep their frame delay and are
    /// never eviction victims.
    pub fn free_some_video_memory(
        &mut self,
        context: &mut dyn DeviceContext,
        last_error: &GpuError,
    ) -> bool {
        if !last_error.is_out_of_memory() {
            return false;
        }

        let mut freed = false;

        if !self.released_immediate.is_empty() {
            self.destroy_released_resources_from_last_frame(context);
            freed = true;
        }

        let victim = self
            .records
            .iter()
            .filter(|(_, r)| r.valid && !r.in_use() && !r.delayed_release)
            .max_by_key(|(_, r)| r.size_bytes)
            .map(|(key, _)| key);

        if let Some(key) = victim {
            log::debug!(
                "evicting resource {:?} ({} bytes) to satisfy allocation",
                self.records[key].handle,
                self.records[key].size_bytes
            );
            self.finalize(context, key);
            freed = true;
        }

        freed
    }

    // ── Internal helpers ───────────────────────────────────────────────────

    fn finalize(&mut self, context: &mut dyn DeviceContext, key: ResourceKey) {
        if let Some(record) = self.records.remove(key) {
            debug_assert!(!record.in_use());
            self.tracked_bytes -= record.size_bytes;
            context.destroy_resource(record.handle);
        }
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}
