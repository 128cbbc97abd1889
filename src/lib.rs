#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod backend;
pub mod device;
pub mod display;
pub mod errors;
pub mod testing;

pub use backend::{
    AdapterId, BufferDesc, BufferUsage, DeviceCreateFlags, DrawCall, GraphicsBackend,
    PresentParams, Rect, RenderTargetDesc, ResourceHandle, StateHandle, TextureDesc,
    TextureFormat, WindowTarget,
};
pub use device::fence::{FenceTracker, MAX_ACTIVE_FENCES};
pub use device::manager::{AdapterStatusListener, DeviceManager};
pub use device::resources::{
    DestroyTiming, RELEASE_FRAME_DELAY, ResourceKey, ResourceManager,
};
pub use device::state_cache::{
    BlendDesc, DepthStencilDesc, RasterizerDesc, SamplerDesc, StateObjectCache,
};
pub use device::{Device, DeviceGuard, FrameStats, PresentStatus};
pub use display::{DisplayConfig, DisplayProvider};
pub use errors::{GpuError, Result};
