//! Device Manager
//!
//! The process-wide authority for finding and creating [`Device`]s and for
//! broadcasting adapter loss. One explicitly constructed manager is shared
//! by reference through the host application; there is no global instance.
//!
//! # Pool layout
//!
//! Tracked devices live in one array split into two contiguous ranges:
//! usable entries occupy `[0, first_unusable)`, unusable ones the rest.
//! Transitions between the partitions swap entries by index instead of
//! scanning or reallocating. Entries hold `Weak` references — a device is
//! kept alive by its external holders, and the pool lazily prunes entries
//! whose device has been dropped.
//!
//! # Locking
//!
//! The pool lock guards bookkeeping only (lookup, insert, remove, partition
//! swaps). Backend device creation — potentially slow — runs outside the
//! lock, and the display configuration is re-validated before the new
//! device is published. Adapter-loss listeners are invoked after the lock
//! is released.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::{AdapterId, DeviceCreateFlags, GraphicsBackend, WindowTarget};
use crate::device::Device;
use crate::display::{DisplayConfig, DisplayProvider};
use crate::errors::{GpuError, Result};

/// Back-reference registered with the manager; receives exactly one
/// notification per genuine loss event per adapter.
pub trait AdapterStatusListener: Send + Sync {
    fn notify_adapter_status(&self, adapter: AdapterId, is_valid: bool);
}

struct PoolEntry {
    device: Weak<Device>,
    adapter: AdapterId,
    /// Suppresses duplicate loss broadcasts when several windows share the
    /// adapter: one window may not present (and so not notice the loss)
    /// until after another has already lost and recreated the device.
    device_lost_notified: bool,
}

struct ManagerState {
    pool: Vec<PoolEntry>,
    /// Index of the first unusable entry; usable devices sit below it.
    first_unusable: usize,
    /// The display configuration devices are currently created against.
    display: Option<Arc<DisplayConfig>>,
    /// Held after a display change, so backend-global state tied to the
    /// stale configuration is not unloaded while its devices still exist.
    next_display: Option<Arc<DisplayConfig>>,
    software: Option<Weak<Device>>,
    listeners: Vec<Weak<dyn AdapterStatusListener>>,
}

/// Process-wide pool of devices.
pub struct DeviceManager {
    backend: Arc<dyn GraphicsBackend>,
    displays: Arc<dyn DisplayProvider>,
    state: Mutex<ManagerState>,
}

impl DeviceManager {
    /// Creates the manager. Lifecycle is tied to the host application:
    /// construct at startup, drop at shutdown.
    #[must_use]
    pub fn new(
        backend: Arc<dyn GraphicsBackend>,
        displays: Arc<dyn DisplayProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            displays,
            state: Mutex::new(ManagerState {
                pool: Vec::new(),
                first_unusable: 0,
                display: None,
                next_display: None,
                software: None,
                listeners: Vec::new(),
            }),
        })
    }

    // ── Acquisition ────────────────────────────────────────────────────────

    /// Finds or creates a usable device for the given target.
    ///
    /// Selection policy: the first usable pooled device is returned —
    /// callers needing a very specific configuration must create their own.
    /// If `display` is supplied and stale relative to the authoritative
    /// configuration, or if the configuration changes concurrently with the
    /// acquisition, the call fails with
    /// [`GpuError::DisplayStateInvalid`]; the caller retries from its next
    /// draw attempt.
    pub fn get_device(
        self: &Arc<Self>,
        _target: WindowTarget,
        flags: DeviceCreateFlags,
        display: Option<&DisplayConfig>,
    ) -> Result<Arc<Device>> {
        let adapter = display
            .and_then(|d| d.adapters().first().copied())
            .unwrap_or_default();

        let held;
        let (found, pending_callbacks) = {
            let mut state = self.state.lock();
            held = self.initialize_display_refs(&mut state, display)?;
            let callbacks = Self::prune_dead_entries(&mut state);
            (Self::find_usable(&state), callbacks)
        };
        Self::broadcast(pending_callbacks);

        let device = if let Some(device) = found {
            device
        } else {
            self.create_new_device(&held, adapter, flags)?
        };

        // The configuration may have changed while we searched or created;
        // a device tied to a stale configuration must not be handed out.
        if self.displays.has_changed_since(&held) {
            drop(device);
            return Err(GpuError::DisplayStateInvalid);
        }

        Ok(device)
    }

    /// Returns the single process-wide software-fallback device, creating
    /// it on first use. It is never placed in the adapter pool and is
    /// reference-counted independently.
    pub fn get_software_device(self: &Arc<Self>) -> Result<Arc<Device>> {
        let mut state = self.state.lock();

        if let Some(existing) = state.software.as_ref().and_then(Weak::upgrade) {
            return Ok(existing);
        }

        self.initialize_display_refs(&mut state, None)?;

        let context = self
            .backend
            .create_software_context()
            .map_err(|e| Self::creation_error(&e))?;
        let device = Arc::new(Device::new(
            context,
            AdapterId::default(),
            DeviceCreateFlags::empty(),
            true,
            Arc::downgrade(self),
        ));
        state.software = Some(Arc::downgrade(&device));
        Ok(device)
    }

    // ── Display change fan-out ─────────────────────────────────────────────

    /// Marks every device tied to `old` as unusable and lets go of the
    /// stale configuration, retaining only `new` so backend-global state is
    /// not unloaded while stale devices still exist.
    pub fn notify_display_change(&self, old: &DisplayConfig, new: &Arc<DisplayConfig>) {
        let to_mark: Vec<Arc<Device>> = {
            let mut state = self.state.lock();

            let holds_old = state.display.as_ref().is_some_and(|d| d.same_as(old));
            if !holds_old {
                return;
            }

            let mut devices: Vec<Arc<Device>> = state.pool[..state.first_unusable]
                .iter()
                .filter_map(|entry| entry.device.upgrade())
                .collect();
            if let Some(software) = state.software.as_ref().and_then(Weak::upgrade) {
                devices.push(software);
            }

            state.display = None;
            state.next_display = Some(Arc::clone(new));

            devices
        };

        // Marking takes each device's entry protection and re-enters this
        // manager through `unusable_notification`; the pool lock must not be
        // held across it.
        for device in to_mark {
            device.mark_unusable(true);
        }
    }

    // ── Lifecycle notifications ────────────────────────────────────────────

    /// Called by a device that has become unusable: moves its entry into
    /// the unusable partition and broadcasts the adapter loss once.
    pub(crate) fn unusable_notification(&self, device: &Device) {
        let callbacks = {
            let mut state = self.state.lock();

            let index = state.pool[..state.first_unusable]
                .iter()
                .position(|entry| std::ptr::eq(entry.device.as_ptr(), device));

            // The device may already sit in the unusable partition (a loss
            // noticed on present after a display change), or be the pooled-
            // nowhere software device.
            let Some(index) = index else {
                return;
            };

            let callbacks = Self::collect_loss_callbacks(&mut state, index);

            state.first_unusable -= 1;
            let first_unusable = state.first_unusable;
            state.pool.swap(index, first_unusable);

            callbacks
        };

        Self::broadcast(callbacks);
    }

    // ── Listeners ──────────────────────────────────────────────────────────

    pub fn add_adapter_status_listener(&self, listener: &Arc<dyn AdapterStatusListener>) {
        let mut state = self.state.lock();
        state.listeners.push(Arc::downgrade(listener));
    }

    pub fn remove_adapter_status_listener(&self, listener: &Arc<dyn AdapterStatusListener>) {
        let mut state = self.state.lock();
        state
            .listeners
            .retain(|l| l.upgrade().is_some_and(|l| !Arc::ptr_eq(&l, listener)));
    }

    // ── Stats ──────────────────────────────────────────────────────────────

    /// Number of tracked pool entries (usable and unusable).
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.state.lock().pool.len()
    }

    /// Number of entries in the usable partition.
    #[must_use]
    pub fn usable_device_count(&self) -> usize {
        self.state.lock().first_unusable
    }

    // ── Internal helpers ───────────────────────────────────────────────────

    /// Settles the manager onto the authoritative display configuration.
    /// Fails when the caller supplied a configuration that is stale
    /// relative to it: silently using a different configuration would
    /// mismatch the caller's expectations.
    fn initialize_display_refs(
        &self,
        state: &mut ManagerState,
        given: Option<&DisplayConfig>,
    ) -> Result<Arc<DisplayConfig>> {
        let current = self.displays.current();

        if let Some(given) = given {
            if !given.same_as(&current) {
                return Err(GpuError::DisplayStateInvalid);
            }
        }

        state.display = Some(Arc::clone(&current));
        state.next_display = None;
        Ok(current)
    }

    fn find_usable(state: &ManagerState) -> Option<Arc<Device>> {
        state.pool[..state.first_unusable]
            .iter()
            .find_map(|entry| entry.device.upgrade().filter(|d| d.is_usable()))
    }

    /// Creates a device outside the pool lock, then publishes it if the
    /// display configuration held at acquisition time is still current.
    fn create_new_device(
        self: &Arc<Self>,
        held: &Arc<DisplayConfig>,
        adapter: AdapterId,
        flags: DeviceCreateFlags,
    ) -> Result<Arc<Device>> {
        if self.displays.has_changed_since(held) {
            return Err(GpuError::DisplayStateInvalid);
        }

        let context = self
            .backend
            .create_context(adapter, flags)
            .map_err(|e| Self::creation_error(&e))?;
        let device = Arc::new(Device::new(
            context,
            adapter,
            flags,
            false,
            Arc::downgrade(self),
        ));

        let mut state = self.state.lock();

        if self.displays.has_changed_since(held) {
            return Err(GpuError::DisplayStateInvalid);
        }

        // Place the new entry at the end of the usable partition, moving
        // the first unusable entry (if any) out of the way.
        state.pool.push(PoolEntry {
            device: Arc::downgrade(&device),
            adapter,
            device_lost_notified: false,
        });
        let last = state.pool.len() - 1;
        let first_unusable = state.first_unusable;
        state.pool.swap(first_unusable, last);
        state.first_unusable += 1;

        Ok(device)
    }

    fn creation_error(err: &GpuError) -> GpuError {
        if err.is_fatal() {
            // The adapter went away mid-creation; the caller should retry
            // against the new display state.
            GpuError::DisplayStateInvalid
        } else {
            GpuError::BackendCreationFailed(err.to_string())
        }
    }

    /// Removes entries whose device has been dropped by all holders and
    /// returns the pending loss notifications for entries that never got
    /// one. The caller broadcasts them after releasing the pool lock.
    fn prune_dead_entries(
        state: &mut ManagerState,
    ) -> Vec<(Arc<dyn AdapterStatusListener>, AdapterId)> {
        let mut callbacks = Vec::new();
        let mut i = 0;
        while i < state.pool.len() {
            if state.pool[i].device.strong_count() > 0 {
                i += 1;
                continue;
            }

            callbacks.extend(Self::collect_loss_callbacks(state, i));

            let last = state.pool.len() - 1;
            if i < state.first_unusable {
                // Move the last usable into the gap, then the last unusable
                // into the vacated usable slot.
                state.first_unusable -= 1;
                let first_unusable = state.first_unusable;
                state.pool.swap(i, first_unusable);
                state.pool.swap(first_unusable, last);
            } else {
                state.pool.swap(i, last);
            }
            state.pool.pop();
        }

        callbacks
    }

    /// Gathers the listener calls for one entry's loss event, honoring the
    /// once-per-loss guard.
    fn collect_loss_callbacks(
        state: &mut ManagerState,
        index: usize,
    ) -> Vec<(Arc<dyn AdapterStatusListener>, AdapterId)> {
        let entry = &mut state.pool[index];
        if entry.device_lost_notified {
            return Vec::new();
        }
        entry.device_lost_notified = true;
        let adapter = entry.adapter;

        state.listeners.retain(|l| l.strong_count() > 0);
        state
            .listeners
            .iter()
            .filter_map(Weak::upgrade)
            .map(|l| (l, adapter))
            .collect()
    }

    fn broadcast(callbacks: Vec<(Arc<dyn AdapterStatusListener>, AdapterId)>) {
        for (listener, adapter) in callbacks {
            listener.notify_adapter_status(adapter, false);
        }
    }
}
