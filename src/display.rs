//! Display Configuration
//!
//! The adapter/display enumeration subsystem is an external collaborator.
//! It supplies an authoritative snapshot of the current display topology
//! ([`DisplayConfig`]) and a way to detect that the snapshot has gone stale
//! ([`DisplayProvider`]). The [`DeviceManager`](crate::device::DeviceManager)
//! consults the provider before trusting any cached configuration, and fails
//! device acquisition with `DisplayStateInvalid` when a change races it.

use std::sync::Arc;

use crate::backend::AdapterId;

/// Immutable snapshot of the display topology at one point in time.
///
/// Two snapshots describe the same topology exactly when their generations
/// are equal; any mode change, monitor hot-plug, or adapter reset produces a
/// snapshot with a new generation.
#[derive(Debug)]
pub struct DisplayConfig {
    generation: u64,
    adapters: Vec<AdapterId>,
}

impl DisplayConfig {
    #[must_use]
    pub fn new(generation: u64, adapters: Vec<AdapterId>) -> Self {
        Self {
            generation,
            adapters,
        }
    }

    /// Monotonic generation stamp of this snapshot.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Adapters present in this topology.
    #[must_use]
    pub fn adapters(&self) -> &[AdapterId] {
        &self.adapters
    }

    /// Whether both snapshots describe the same topology.
    #[inline]
    #[must_use]
    pub fn same_as(&self, other: &DisplayConfig) -> bool {
        self.generation == other.generation
    }
}

/// Source of authoritative display snapshots.
///
/// Implementations are expected to be cheap to query; the manager calls
/// [`DisplayProvider::current`] on every device acquisition.
pub trait DisplayProvider: Send + Sync {
    /// The latest display topology.
    fn current(&self) -> Arc<DisplayConfig>;

    /// Whether the topology has changed since `held` was captured.
    fn has_changed_since(&self, held: &DisplayConfig) -> bool {
        !self.current().same_as(held)
    }
}
