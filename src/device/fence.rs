//! GPU Completion Fences
//!
//! A [`Fence`] is a single outstanding completion marker: a reusable backend
//! query correlated with a caller-supplied, monotonically increasing id
//! (wall-clock derived, so issue order matches id order). The
//! [`FenceTracker`] keeps the ordered list of issued fences for one device
//! and answers, without blocking, how far the GPU has progressed through
//! previously submitted work.
//!
//! # Degradation
//!
//! Marker tracking is an optimization, not a correctness requirement. Any
//! unexpected backend failure while inserting or checking a fence disables
//! tracking for the device's lifetime rather than surfacing an error; a
//! disabled tracker reports everything as consumed immediately. The same
//! self-protection applies when the active list outgrows
//! [`MAX_ACTIVE_FENCES`], which indicates a driver that never reports
//! completion.

use bitflags::bitflags;

use crate::backend::{DeviceContext, QueryHandle, QueryStatus};

/// Largest tolerated backlog of unconsumed fences before tracking turns
/// itself off.
pub const MAX_ACTIVE_FENCES: usize = 35;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    struct TrackerFlags: u8 {
        /// Completion-query support has been probed on this device.
        const TESTED = 1 << 0;
        /// The probe succeeded and tracking is active.
        const ENABLED = 1 << 1;
    }
}

// ─── Fence ───────────────────────────────────────────────────────────────────

/// One outstanding GPU-completion marker.
///
/// The underlying query is owned and reusable: consumed fences return to the
/// tracker's free pool and are [`reset`](Fence::reset) with a new id.
#[derive(Debug)]
pub struct Fence {
    query: QueryHandle,
    id: u64,
    issued: bool,
    consumed: bool,
}

impl Fence {
    fn new(query: QueryHandle, id: u64) -> Self {
        Self {
            query,
            id,
            issued: false,
            consumed: false,
        }
    }

    /// Prepares the fence for reuse under a new id.
    fn reset(&mut self, id: u64) {
        self.id = id;
        self.issued = false;
        self.consumed = false;
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn issue(&mut self, context: &mut dyn DeviceContext) -> crate::errors::Result<()> {
        context.issue_query(self.query)?;
        self.issued = true;
        Ok(())
    }

    /// Polls whether the GPU has consumed this fence. The consumed state
    /// latches: once observed, later calls skip the backend.
    fn check(
        &mut self,
        context: &mut dyn DeviceContext,
        flush: bool,
    ) -> crate::errors::Result<bool> {
        if self.issued && !self.consumed {
            self.consumed = context.poll_query(self.query, flush)? == QueryStatus::Consumed;
        }
        Ok(self.issued && self.consumed)
    }
}

// ─── FenceTracker ────────────────────────────────────────────────────────────

/// Ordered collection of issued fences for one device.
pub struct FenceTracker {
    /// Outstanding fences, oldest first. Ids are non-decreasing.
    active: Vec<Fence>,
    /// Consumed fences awaiting reuse.
    free: Vec<Fence>,
    flags: TrackerFlags,
    last_inserted_id: u64,
    last_consumed_id: u64,
}

impl FenceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: Vec::new(),
            free: Vec::new(),
            flags: TrackerFlags::default(),
            last_inserted_id: 0,
            last_consumed_id: 0,
        }
    }

    /// Whether fence tracking is (still) active on this device.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.flags.contains(TrackerFlags::ENABLED)
    }

    /// Number of outstanding, unconsumed fences.
    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.active.len()
    }

    /// Id of the newest marker known to be consumed by the GPU.
    ///
    /// When tracking is disabled everything counts as consumed immediately,
    /// so this reports the last inserted id.
    #[must_use]
    pub fn last_consumed_id(&self) -> u64 {
        if self.is_enabled() {
            self.last_consumed_id
        } else {
            self.last_inserted_id
        }
    }

    /// Whether the GPU is known to have progressed past the given marker.
    #[must_use]
    pub fn is_consumed(&self, id: u64) -> bool {
        id <= self.last_consumed_id()
    }

    /// Inserts a marker into the GPU command stream.
    ///
    /// Ids must be non-decreasing; an id below the last accepted one is
    /// logged and ignored (wall-clock sources can regress, e.g. across a
    /// locked desktop). The first insert probes completion-query support;
    /// probe failure disables tracking permanently.
    pub fn insert_marker(&mut self, context: &mut dyn DeviceContext, id: u64) {
        if id < self.last_inserted_id {
            log::warn!(
                "fence id {id} received out of increasing order (last {}); ignoring",
                self.last_inserted_id
            );
            return;
        }

        if !self.flags.contains(TrackerFlags::TESTED) {
            match context.create_completion_query() {
                Ok(probe) => {
                    context.destroy_query(probe);
                    self.flags.insert(TrackerFlags::ENABLED);
                }
                Err(_) => {
                    log::debug!("completion queries unsupported; fence tracking disabled");
                }
            }
            self.flags.insert(TrackerFlags::TESTED);
        }

        if !self.is_enabled() {
            self.last_inserted_id = id;
            return;
        }

        let mut fence = if let Some(mut recycled) = self.free.pop() {
            recycled.reset(id);
            recycled
        } else {
            match context.create_completion_query() {
                Ok(query) => Fence::new(query, id),
                Err(_) => {
                    self.disable(context);
                    self.last_inserted_id = id;
                    return;
                }
            }
        };

        match fence.issue(context) {
            Ok(()) => {
                self.active.push(fence);
                self.last_inserted_id = id;
            }
            Err(_) => {
                context.destroy_query(fence.query);
                self.disable(context);
                self.last_inserted_id = id;
                return;
            }
        }

        // A backlog of active fences means the hardware is not reporting
        // queries; stop tracking on this device.
        if self.active.len() > MAX_ACTIVE_FENCES {
            log::warn!("backlog of {} unconsumed fences; fence tracking disabled", self.active.len());
            self.disable(context);
        }
    }

    /// Walks the active list newest-to-oldest and retires every fence at or
    /// before the newest one found consumed.
    ///
    /// Consumption is inherently in-order, so the scan stops at the first
    /// consumed fence. A fence whose status cannot be determined counts as
    /// consumed to bound list growth. `force_flush` is honored at most once
    /// per call; remaining checks use the cheaper non-flushing poll.
    pub fn consume_markers(&mut self, context: &mut dyn DeviceContext, mut force_flush: bool) {
        if !self.is_enabled() {
            return;
        }

        for i in (0..self.active.len()).rev() {
            let consumed = match self.active[i].check(context, force_flush) {
                Ok(consumed) => consumed,
                Err(e) if e.is_fatal() => {
                    // The adapter is no longer rendering our content, so the
                    // marker can only be behind the GPU.
                    true
                }
                Err(_) => {
                    self.disable(context);
                    return;
                }
            };

            if consumed {
                self.retire_through(i);
                break;
            }

            // One flush is all the information we can buy; don't pay for it
            // again on older fences.
            force_flush = false;
        }
    }

    /// Discards every outstanding fence without waiting. Called on device
    /// loss and teardown.
    pub fn reset(&mut self, context: &mut dyn DeviceContext) {
        self.last_consumed_id = self.last_inserted_id;
        for fence in self.active.drain(..).chain(self.free.drain(..)) {
            context.destroy_query(fence.query);
        }
    }

    fn disable(&mut self, context: &mut dyn DeviceContext) {
        self.flags.remove(TrackerFlags::ENABLED);
        self.reset(context);
    }

    /// Moves the fence at `index` and all its predecessors to the free pool
    /// and records the newest consumed id.
    fn retire_through(&mut self, index: usize) {
        self.last_consumed_id = self.active[index].id;
        self.free.extend(self.active.drain(..=index));
    }
}

impl Default for FenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
