//! Graphics Backend Boundary
//!
//! The crate never talks to a native graphics API directly. Instead it
//! consumes the two capability traits defined here, which carry exactly the
//! operation set this core exercises:
//!
//! - [`GraphicsBackend`]: process-wide factory for per-adapter command
//!   contexts.
//! - [`DeviceContext`]: one adapter's command-submission context — resource
//!   creation and upload, draw, present, and completion queries.
//!
//! Backend adapters classify native result codes into
//! [`GpuError`](crate::errors::GpuError) at this boundary. The only
//! capability bit the core interprets is "completion queries supported",
//! observed through [`DeviceContext::create_completion_query`] failing with
//! [`GpuError::NotSupported`](crate::errors::GpuError::NotSupported).

use bitflags::bitflags;

use crate::errors::Result;
use crate::device::state_cache::StateDescriptor;

// ─── Opaque Handles ──────────────────────────────────────────────────────────

/// Ordinal of a physical display adapter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct AdapterId(pub u32);

/// Opaque identifier of a presentation window target.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WindowTarget(pub u64);

/// Opaque handle to a native GPU allocation (texture, buffer, render target).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ResourceHandle(pub u64);

/// Opaque handle to a native completion query.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct QueryHandle(pub u64);

/// Opaque handle to a compiled immutable state object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StateHandle(pub u64);

bitflags! {
    /// Behavior flags supplied when a device context is created.
    ///
    /// Part of a device's pooling identity together with its adapter.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct DeviceCreateFlags: u32 {
        /// The device will be entered from more than one thread; entry
        /// protection takes a real lock instead of assertion-only marking.
        const MULTITHREADED = 1 << 0;
        /// The presentation target needs a destination alpha channel.
        const NEED_DESTINATION_ALPHA = 1 << 1;
    }
}

// ─── Resource Descriptors ────────────────────────────────────────────────────

/// Pixel formats the substrate creates resources with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TextureFormat {
    Bgra8,
    Bgrx8,
    Alpha8,
    Rgba16Float,
}

/// What a buffer allocation will be bound as.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
}

/// Descriptor for a sampled texture allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    /// Byte-size estimate used for video-memory accounting.
    #[must_use]
    pub fn size_estimate(&self) -> u64 {
        let bytes_per_pixel = match self.format {
            TextureFormat::Alpha8 => 1,
            TextureFormat::Bgra8 | TextureFormat::Bgrx8 => 4,
            TextureFormat::Rgba16Float => 8,
        };
        u64::from(self.width) * u64::from(self.height) * bytes_per_pixel
    }
}

/// Descriptor for a vertex/index/uniform buffer allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
}

/// Descriptor for a render-target allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RenderTargetDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub sample_count: u32,
}

impl RenderTargetDesc {
    /// Byte-size estimate used for video-memory accounting.
    #[must_use]
    pub fn size_estimate(&self) -> u64 {
        TextureDesc {
            width: self.width,
            height: self.height,
            format: self.format,
        }
        .size_estimate()
            * u64::from(self.sample_count.max(1))
    }
}

// ─── Submission Types ────────────────────────────────────────────────────────

/// Integer rectangle in target coordinates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// One draw submission. The substrate executes geometry decisions made by
/// the rendering pipeline layer; it does not interpret them.
#[derive(Clone, Copy, Debug)]
pub struct DrawCall {
    pub vertex_count: u32,
    pub primitive_count: u32,
}

/// Parameters for presenting to a window target.
#[derive(Clone, Copy, Debug)]
pub struct PresentParams {
    pub target: WindowTarget,
    /// Sub-rectangle of the back buffer to present, or the whole buffer.
    pub source: Option<Rect>,
    /// Destination rectangle in the window, or the whole client area.
    pub dest: Option<Rect>,
}

/// Result of polling a completion query.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueryStatus {
    /// The GPU has not yet reached the query.
    Pending,
    /// The GPU has processed all work submitted before the query.
    Consumed,
}

// ─── Capability Traits ───────────────────────────────────────────────────────

/// Process-wide entry point of a native graphics backend.
pub trait GraphicsBackend: Send + Sync {
    /// Create a hardware command context for the given adapter.
    fn create_context(
        &self,
        adapter: AdapterId,
        flags: DeviceCreateFlags,
    ) -> Result<Box<dyn DeviceContext>>;

    /// Create the software-rasterizer fallback context.
    fn create_software_context(&self) -> Result<Box<dyn DeviceContext>>;
}

/// One adapter's command-submission context.
///
/// All methods are called with the owning device's entry protection held, so
/// implementations need `Send` but not `Sync`.
pub trait DeviceContext: Send {
    // -- Resource creation and upload --

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<ResourceHandle>;

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<ResourceHandle>;

    fn create_render_target(&mut self, desc: &RenderTargetDesc) -> Result<ResourceHandle>;

    /// Copy `bytes` into a resource at `offset` (the map/unmap analog).
    fn upload(&mut self, resource: ResourceHandle, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Release a native allocation. Infallible: the backend owns any
    /// deferred reclamation of its own.
    fn destroy_resource(&mut self, resource: ResourceHandle);

    // -- Immutable state objects --

    fn compile_state(&mut self, desc: &StateDescriptor) -> Result<StateHandle>;

    // -- Completion queries --

    /// Create a reusable completion query, or fail with `NotSupported` when
    /// the adapter cannot report completion.
    fn create_completion_query(&mut self) -> Result<QueryHandle>;

    /// Issue the query into the command stream.
    fn issue_query(&mut self, query: QueryHandle) -> Result<()>;

    /// Poll the query. `flush` submits buffered commands so the GPU can make
    /// progress toward the query before status is read.
    fn poll_query(&mut self, query: QueryHandle, flush: bool) -> Result<QueryStatus>;

    fn destroy_query(&mut self, query: QueryHandle);

    // -- Submission --

    fn set_render_target(&mut self, target: ResourceHandle) -> Result<()>;

    fn draw(&mut self, call: &DrawCall) -> Result<()>;

    fn present(&mut self, params: &PresentParams) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_size_estimate() {
        let desc = TextureDesc {
            width: 256,
            height: 128,
            format: TextureFormat::Bgra8,
        };
        assert_eq!(desc.size_estimate(), 256 * 128 * 4);

        let a8 = TextureDesc {
            width: 16,
            height: 16,
            format: TextureFormat::Alpha8,
        };
        assert_eq!(a8.size_estimate(), 256);
    }

    #[test]
    fn test_render_target_size_scales_with_samples() {
        let desc = RenderTargetDesc {
            width: 64,
            height: 64,
            format: TextureFormat::Bgrx8,
            sample_count: 4,
        };
        assert_eq!(desc.size_estimate(), 64 * 64 * 4 * 4);
    }

    #[test]
    fn test_rect_emptiness() {
        let r = Rect {
            x: 0,
            y: 0,
            width: 0,
            height: 10,
        };
        assert!(r.is_empty());
    }
}
