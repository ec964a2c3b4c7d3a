//! Materials & Layers
//!
//! A material is an ordered sequence of [`Layer`]s; each layer is one
//! texture/blend stage. The pass resolver folds contiguous layers into
//! hardware passes and composites every layer's authored state against the
//! global override blocks before anything reaches the device.
//!
//! Flag algebra: [`LayerState::composite`] applies a *force-on* and a
//! *force-off* block per field — `(authored | on) & !off` — which lets
//! higher-level code (debug views, shadow receive, wireframe overlay) clamp
//! specific flags regardless of what the material authored. The composite is
//! pure: same three inputs, same output, no device involved.

pub mod bump;
pub mod diff;
pub mod resolver;

pub use bump::BumpTuning;
pub use diff::StateDiffer;
pub use resolver::{PassOutcome, PassPlan, PassResolver, ResolveContext, ResolvedStage};

use bitflags::bitflags;
use glam::{Mat4, Vec4};
use slotmap::{new_key_type, SlotMap};

use crate::device::{ClampFlags, StageOp, TargetId, TextureDesc, UvwSource};

new_key_type! {
    /// Stable key of a material in the [`MaterialStore`].
    pub struct MaterialKey;
    /// Stable key of a logical texture in the [`TextureStore`].
    pub struct TextureKey;
}

// ─── Layer Flag Sets ──────────────────────────────────────────────────────────

bitflags! {
    /// Layer blend flags.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct BlendFlags: u32 {
        /// Framebuffer alpha blend.
        const ALPHA         = 1 << 0;
        /// Additive framebuffer blend.
        const ADD           = 1 << 1;
        /// Multiplicative framebuffer blend.
        const MULT          = 1 << 2;
        /// Per-pixel dot product stage op (bump mapping).
        const DOT3          = 1 << 3;
        /// Signed additive stage op.
        const ADD_SIGNED    = 1 << 4;
        /// Doubled signed additive stage op.
        const ADD_SIGNED_2X = 1 << 5;
        /// No color output at all; a depth-only layer. Always solo.
        const NO_COLOR      = 1 << 6;
    }
}

bitflags! {
    /// Layer depth-buffer flags.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct ZFlags: u32 {
        /// Suppress depth writes.
        const NO_WRITE = 1 << 0;
        /// Suppress the depth test.
        const NO_READ  = 1 << 1;
    }
}

bitflags! {
    /// Miscellaneous layer flags.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct MiscFlags: u32 {
        /// Draw both faces.
        const TWO_SIDED  = 1 << 0;
        /// This layer must be consumed together with its successor in the
        /// same pass; the pair is never split.
        const BIND_NEXT  = 1 << 1;
        /// This layer cannot share a pass with any other layer.
        const SOLO       = 1 << 2;
        /// Bump channel: du.
        const BUMP_DU    = 1 << 3;
        /// Bump channel: dv.
        const BUMP_DV    = 1 << 4;
        /// Bump channel: dw.
        const BUMP_DW    = 1 << 5;
        /// Any bump channel.
        const BUMP_CHANS = Self::BUMP_DU.bits() | Self::BUMP_DV.bits() | Self::BUMP_DW.bits();
        /// UVWs come from a projection rather than an authored channel.
        const PROJECTION = 1 << 6;
    }
}

// ─── Layer State & Overrides ──────────────────────────────────────────────────

/// The full authored flag state of a layer, the unit the override algebra
/// operates on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct LayerState {
    pub blend: BlendFlags,
    pub clamp: ClampFlags,
    pub z: ZFlags,
    pub misc: MiscFlags,
}

impl LayerState {
    /// Apply the override blocks: `(authored | on) & !off`, per field.
    ///
    /// Pure and deterministic; reading a composited state back yields the
    /// override-adjusted flags, never the raw authored ones.
    #[must_use]
    pub fn composite(self, force_on: &LayerState, force_off: &LayerState) -> LayerState {
        LayerState {
            blend: (self.blend | force_on.blend) & !force_off.blend,
            clamp: (self.clamp | force_on.clamp) & !force_off.clamp,
            z: (self.z | force_on.z) & !force_off.z,
            misc: (self.misc | force_on.misc) & !force_off.misc,
        }
    }
}

/// The two global override blocks consulted on every composite.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StateOverrides {
    pub force_on: LayerState,
    pub force_off: LayerState,
}

// ─── Layer ────────────────────────────────────────────────────────────────────

/// One texture/blend stage of a material.
#[derive(Clone, Debug)]
pub struct Layer {
    pub texture: Option<TextureKey>,
    pub transform: Mat4,
    pub uvw_source: UvwSource,
    pub state: LayerState,
    pub opacity: f32,
    /// Ambient under the material-lit equation.
    pub preshade_color: Vec4,
    /// Diffuse under the material-lit equation (scaled by opacity).
    pub runtime_color: Vec4,
    /// Emissive under the material-lit equation.
    pub ambient_color: Vec4,
    pub specular_color: Vec4,
}

impl Default for Layer {
    fn default() -> Self {
        Self {
            texture: None,
            transform: Mat4::IDENTITY,
            uvw_source: UvwSource::Channel(0),
            state: LayerState::default(),
            opacity: 1.0,
            preshade_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            runtime_color: Vec4::ONE,
            ambient_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            specular_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
        }
    }
}

impl Layer {
    /// This layer's state after the override blocks.
    #[must_use]
    pub fn composited(&self, overrides: &StateOverrides) -> LayerState {
        self.state
            .composite(&overrides.force_on, &overrides.force_off)
    }

    /// Stage combine op implied by the composited blend flags.
    #[must_use]
    pub fn stage_op(state: &LayerState) -> StageOp {
        if state.misc.intersects(MiscFlags::BUMP_CHANS) || state.blend.contains(BlendFlags::DOT3) {
            StageOp::Dot3
        } else if state.blend.contains(BlendFlags::ADD_SIGNED_2X) {
            StageOp::AddSigned2x
        } else if state.blend.contains(BlendFlags::ADD_SIGNED) {
            StageOp::AddSigned
        } else if state.blend.contains(BlendFlags::ADD) {
            StageOp::Add
        } else if state.blend.contains(BlendFlags::ALPHA) {
            StageOp::BlendAlpha
        } else {
            StageOp::Modulate
        }
    }

    /// Framebuffer blend implied by the composited blend flags of a pass's
    /// base layer.
    #[must_use]
    pub fn framebuffer_blend(state: &LayerState) -> crate::device::FramebufferBlend {
        use crate::device::FramebufferBlend;
        if state.blend.contains(BlendFlags::NO_COLOR) {
            FramebufferBlend::NoColor
        } else if state.blend.contains(BlendFlags::ADD) {
            FramebufferBlend::Add
        } else if state.blend.contains(BlendFlags::MULT) {
            FramebufferBlend::Mult
        } else if state.blend.contains(BlendFlags::ALPHA) {
            FramebufferBlend::Alpha
        } else {
            FramebufferBlend::Opaque
        }
    }
}

// ─── Material ─────────────────────────────────────────────────────────────────

/// An ordered sequence of layers.
#[derive(Clone, Debug, Default)]
pub struct Material {
    pub layers: Vec<Layer>,
}

impl Material {
    #[must_use]
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    /// A single-layer material over one texture.
    #[must_use]
    pub fn single(texture: Option<TextureKey>) -> Self {
        Self {
            layers: vec![Layer {
                texture,
                ..Layer::default()
            }],
        }
    }
}

// ─── Stores ───────────────────────────────────────────────────────────────────

/// A logical texture: either CPU pixel data awaiting upload, or an alias of
/// an offscreen render target (which is how a material ends up sampling a
/// surface that might also be the active target — the self-reference case
/// the resolver skips).
#[derive(Clone, Debug)]
pub struct LogicalTexture {
    pub desc: TextureDesc,
    pub data: Vec<u8>,
    pub version: u64,
    /// When set, this texture aliases a render target.
    pub target: Option<TargetId>,
}

/// Owning store of logical textures.
#[derive(Default)]
pub struct TextureStore {
    textures: SlotMap<TextureKey, LogicalTexture>,
}

impl TextureStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, texture: LogicalTexture) -> TextureKey {
        self.textures.insert(texture)
    }

    #[must_use]
    pub fn get(&self, key: TextureKey) -> Option<&LogicalTexture> {
        self.textures.get(key)
    }

    pub fn get_mut(&mut self, key: TextureKey) -> Option<&mut LogicalTexture> {
        self.textures.get_mut(key)
    }

    pub fn remove(&mut self, key: TextureKey) -> Option<LogicalTexture> {
        self.textures.remove(key)
    }
}

/// Owning store of materials.
#[derive(Default)]
pub struct MaterialStore {
    materials: SlotMap<MaterialKey, Material>,
}

impl MaterialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, material: Material) -> MaterialKey {
        self.materials.insert(material)
    }

    #[must_use]
    pub fn get(&self, key: MaterialKey) -> Option<&Material> {
        self.materials.get(key)
    }

    pub fn get_mut(&mut self, key: MaterialKey) -> Option<&mut Material> {
        self.materials.get_mut(key)
    }

    pub fn remove(&mut self, key: MaterialKey) -> Option<Material> {
        self.materials.remove(key)
    }
}
