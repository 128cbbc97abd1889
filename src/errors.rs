//! Error Types
//!
//! This module defines the failure taxonomy used throughout the crate.
//!
//! # Overview
//!
//! Every backend call is classified into [`GpuError`] at the boundary; the
//! rest of the crate never sees native result codes. The variants fall into
//! three caller-visible outcomes:
//!
//! - **Retry later**: [`GpuError::DisplayStateInvalid`] — re-acquire a device
//!   from the [`DeviceManager`](crate::device::DeviceManager) on the next draw
//!   attempt.
//! - **Recovered locally**: [`GpuError::OutOfVideoMemory`] is retried by the
//!   device's eviction loop and only surfaces when nothing more can be freed.
//! - **Device is gone**: the device-loss class converts to a sticky
//!   display-invalid condition on the owning device.
//!
//! All public APIs return [`Result<T>`], an alias for
//! `std::result::Result<T, GpuError>`.

use thiserror::Error;

/// The failure taxonomy for GPU device and resource operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    // ========================================================================
    // Memory
    // ========================================================================
    /// An allocation failed for lack of GPU memory.
    ///
    /// Recovered locally by the allocation-retry/eviction loop; surfaced only
    /// when eviction cannot free enough.
    #[error("out of video memory")]
    OutOfVideoMemory,

    // ========================================================================
    // Device-loss class (fatal to the device, not the process)
    // ========================================================================
    /// The backend context has been lost and can no longer be used.
    #[error("device lost")]
    DeviceLost,

    /// The backend detected a hung command stream.
    #[error("device hung")]
    DeviceHung,

    /// The physical adapter was removed.
    #[error("device removed")]
    DeviceRemoved,

    /// A driver internal error. Converted to the same sticky display-invalid
    /// state as device loss, but remembered on the device so subsequent calls
    /// fail fast without re-attempting the failing operation.
    #[error("driver internal error")]
    FatalInternalError,

    // ========================================================================
    // Retryable conditions
    // ========================================================================
    /// The display configuration changed underneath the caller.
    ///
    /// Never fatal: discard the device and re-acquire one from the manager.
    #[error("display state invalid; re-acquire a device")]
    DisplayStateInvalid,

    /// The presentation target is temporarily occluded.
    ///
    /// Callers of [`Device`](crate::device::Device) never observe this
    /// variant; `present` converts it to a success with an occluded status
    /// after a bounded backoff.
    #[error("presentation target occluded")]
    PresentationOccluded,

    // ========================================================================
    // Caller and backend contract violations
    // ========================================================================
    /// Caller contract violation (e.g. a degenerate rectangle). Surfaced
    /// immediately, never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The backend could not create a device context.
    #[error("backend device creation failed: {0}")]
    BackendCreationFailed(String),

    /// The backend does not support the requested capability
    /// (e.g. completion queries).
    #[error("operation not supported by backend")]
    NotSupported,
}

impl GpuError {
    /// Whether this failure is an out-of-memory condition that eviction may
    /// be able to recover from.
    #[inline]
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfVideoMemory)
    }

    /// Whether this failure means the device context is permanently gone.
    ///
    /// Fatal failures convert to the sticky display-invalid condition on the
    /// owning device.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost | Self::DeviceHung | Self::DeviceRemoved | Self::FatalInternalError
        )
    }
}

/// Alias for `Result<T, GpuError>`.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(GpuError::DeviceLost.is_fatal());
        assert!(GpuError::DeviceHung.is_fatal());
        assert!(GpuError::DeviceRemoved.is_fatal());
        assert!(GpuError::FatalInternalError.is_fatal());
        assert!(!GpuError::OutOfVideoMemory.is_fatal());
        assert!(!GpuError::DisplayStateInvalid.is_fatal());
        assert!(!GpuError::PresentationOccluded.is_fatal());
    }

    #[test]
    fn test_oom_classification() {
        assert!(GpuError::OutOfVideoMemory.is_out_of_memory());
        assert!(!GpuError::DeviceLost.is_out_of_memory());
    }
}
