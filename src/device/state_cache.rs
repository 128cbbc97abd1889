//! State Object Cache
//!
//! Central owner of all compiled immutable state objects for one device.
//! Fixed-function GPU behavior — blending, rasterization, depth/stencil,
//! sampling — is described by small value-typed descriptors; compiling a
//! descriptor into a native state object is comparatively expensive, so each
//! device de-duplicates them here.
//!
//! # Caching
//!
//! Separate caches exist per state category because the descriptor shapes
//! differ. Each cache maps the full descriptor **value** to the compiled
//! handle: two descriptors that compare equal share one state object, and at
//! most one state object exists per distinct value per device. Entries are
//! never evicted; all caches are discarded together with the device.

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use crate::backend::{DeviceContext, StateHandle};
use crate::errors::Result;

// ─── Blend State ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    InvSrcAlpha,
    DestAlpha,
    InvDestAlpha,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BlendOp {
    Add,
    Subtract,
    RevSubtract,
    Min,
    Max,
}

bitflags! {
    /// Which color channels a blend state writes.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct ColorWriteMask: u8 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const ALL = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits() | Self::ALPHA.bits();
    }
}

/// Immutable blend mode description.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BlendDesc {
    pub enabled: bool,
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub op: BlendOp,
    pub alpha_src_factor: BlendFactor,
    pub alpha_dst_factor: BlendFactor,
    pub alpha_op: BlendOp,
    pub write_mask: ColorWriteMask,
}

impl BlendDesc {
    /// Premultiplied source-over, the renderer's default compositing mode.
    #[must_use]
    pub fn source_over() -> Self {
        Self {
            enabled: true,
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::InvSrcAlpha,
            op: BlendOp::Add,
            alpha_src_factor: BlendFactor::One,
            alpha_dst_factor: BlendFactor::InvSrcAlpha,
            alpha_op: BlendOp::Add,
            write_mask: ColorWriteMask::ALL,
        }
    }

    /// Blending disabled, straight copy.
    #[must_use]
    pub fn opaque() -> Self {
        Self {
            enabled: false,
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            op: BlendOp::Add,
            alpha_src_factor: BlendFactor::One,
            alpha_dst_factor: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
            write_mask: ColorWriteMask::ALL,
        }
    }
}

// ─── Rasterizer State ────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FillMode {
    Solid,
    Wireframe,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// Immutable rasterizer mode description.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RasterizerDesc {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub scissor_enabled: bool,
    pub multisample_antialias: bool,
}

impl Default for RasterizerDesc {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::None,
            scissor_enabled: false,
            multisample_antialias: false,
        }
    }
}

// ─── Depth / Stencil State ───────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CompareFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrSat,
    DecrSat,
    Invert,
}

/// Per-face stencil behavior.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StencilFaceDesc {
    pub compare: CompareFunc,
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
}

impl Default for StencilFaceDesc {
    fn default() -> Self {
        Self {
            compare: CompareFunc::Always,
            fail_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
        }
    }
}

/// Immutable depth/stencil mode description.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DepthStencilDesc {
    pub depth_enabled: bool,
    pub depth_write: bool,
    pub depth_compare: CompareFunc,
    pub stencil_enabled: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front: StencilFaceDesc,
    pub back: StencilFaceDesc,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_enabled: false,
            depth_write: false,
            depth_compare: CompareFunc::LessEqual,
            stencil_enabled: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
            front: StencilFaceDesc::default(),
            back: StencilFaceDesc::default(),
        }
    }
}

// ─── Sampler State ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FilterMode {
    Point,
    Linear,
    Anisotropic,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AddressMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
}

/// Immutable sampler mode description.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SamplerDesc {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mip_filter: FilterMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub max_anisotropy: u8,
    /// BGRA border color, used only with [`AddressMode::Border`].
    pub border_color: [u8; 4],
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            mip_filter: FilterMode::Point,
            address_u: AddressMode::Clamp,
            address_v: AddressMode::Clamp,
            max_anisotropy: 1,
            border_color: [0, 0, 0, 0],
        }
    }
}

// ─── Descriptor Union ────────────────────────────────────────────────────────

/// A state descriptor of any category, as handed to the backend compiler.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StateDescriptor {
    Blend(BlendDesc),
    Rasterizer(RasterizerDesc),
    DepthStencil(DepthStencilDesc),
    Sampler(SamplerDesc),
}

// ─── Cache ───────────────────────────────────────────────────────────────────

/// Per-device de-duplicating cache of compiled state objects.
#[derive(Default)]
pub struct StateObjectCache {
    blend: FxHashMap<BlendDesc, StateHandle>,
    rasterizer: FxHashMap<RasterizerDesc, StateHandle>,
    depth_stencil: FxHashMap<DepthStencilDesc, StateHandle>,
    sampler: FxHashMap<SamplerDesc, StateHandle>,
}

impl StateObjectCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Lookup / compile entry points ──────────────────────────────────────

    pub fn get_or_create_blend(
        &mut self,
        context: &mut dyn DeviceContext,
        desc: &BlendDesc,
    ) -> Result<StateHandle> {
        if let Some(&handle) = self.blend.get(desc) {
            return Ok(handle);
        }
        let handle = context.compile_state(&StateDescriptor::Blend(*desc))?;
        self.blend.insert(*desc, handle);
        Ok(handle)
    }

    pub fn get_or_create_rasterizer(
        &mut self,
        context: &mut dyn DeviceContext,
        desc: &RasterizerDesc,
    ) -> Result<StateHandle> {
        if let Some(&handle) = self.rasterizer.get(desc) {
            return Ok(handle);
        }
        let handle = context.compile_state(&StateDescriptor::Rasterizer(*desc))?;
        self.rasterizer.insert(*desc, handle);
        Ok(handle)
    }

    pub fn get_or_create_depth_stencil(
        &mut self,
        context: &mut dyn DeviceContext,
        desc: &DepthStencilDesc,
    ) -> Result<StateHandle> {
        if let Some(&handle) = self.depth_stencil.get(desc) {
            return Ok(handle);
        }
        let handle = context.compile_state(&StateDescriptor::DepthStencil(*desc))?;
        self.depth_stencil.insert(*desc, handle);
        Ok(handle)
    }

    pub fn get_or_create_sampler(
        &mut self,
        context: &mut dyn DeviceContext,
        desc: &SamplerDesc,
    ) -> Result<StateHandle> {
        if let Some(&handle) = self.sampler.get(desc) {
            return Ok(handle);
        }
        let handle = context.compile_state(&StateDescriptor::Sampler(*desc))?;
        self.sampler.insert(*desc, handle);
        Ok(handle)
    }

    // ── Stats ──────────────────────────────────────────────────────────────

    /// Total number of compiled state objects across all categories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blend.len() + self.rasterizer.len() + self.depth_stencil.len() + self.sampler.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cached entry. Called only at device teardown; the native
    /// state objects go down with the backend context.
    pub fn clear(&mut self) {
        self.blend.clear();
        self.rasterizer.clear();
        self.depth_stencil.clear();
        self.sampler.clear();
    }
}
