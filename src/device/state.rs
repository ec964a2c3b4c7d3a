//! Device State Vocabulary
//!
//! Granular render-state values and the [`StateCommand`] stream the engine
//! emits to a backend. Every field here is small, `Copy` where possible, and
//! comparable, because the central optimization of the whole pipeline is
//! *diffing*: a command is only emitted when the corresponding field differs
//! from the previously applied snapshot (see
//! [`StateDiffer`](crate::material::StateDiffer)).
//!
//! The vocabulary models a fixed-function pipeline: numbered texture stages
//! with per-stage combine ops and UVW transforms, a single framebuffer blend,
//! a three-way lighting equation, and eight light slots.

use bitflags::bitflags;
use glam::{Mat4, Vec3, Vec4};

use super::{TargetId, TextureId};

/// Number of texture stages the state snapshot tracks. Hardware may expose
/// fewer; [`DeviceCaps::max_simultaneous_textures`](super::DeviceCaps) is the
/// authoritative per-pass bound.
pub const MAX_TEXTURE_STAGES: usize = 8;

/// Number of hardware light slots.
pub const MAX_LIGHT_SLOTS: usize = 8;

// ─── Stage-Level State ────────────────────────────────────────────────────────

/// A texture bindable to a stage: either an uploaded texture or the color
/// surface of an offscreen render target (shadow maps bind this way).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BoundTexture {
    /// A managed-pool texture.
    Texture(TextureId),
    /// The color surface of an offscreen target.
    Target(TargetId),
}

/// Per-stage color combine operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum StageOp {
    /// `current × texture`
    #[default]
    Modulate,
    /// `current + texture`
    Add,
    /// `current + texture − 0.5`
    AddSigned,
    /// `(current + texture − 0.5) × 2`
    AddSigned2x,
    /// Per-pixel dot product of the two arguments (bump mapping).
    Dot3,
    /// Pass the texture argument through unmodified.
    SelectTexture,
    /// Alpha-weighted blend of current and texture.
    BlendAlpha,
}

bitflags! {
    /// Per-axis texture addressing overrides. Unset axes wrap.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct ClampFlags: u8 {
        const CLAMP_U = 1 << 0;
        const CLAMP_V = 1 << 1;
    }
}

/// Where a stage's texture coordinates come from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UvwSource {
    /// An authored UVW channel of the vertex layout.
    Channel(u8),
    /// Camera-space normal (environment/reflection style lookups).
    Normal,
    /// Camera-space position (shadow projection uses this).
    Position,
    /// Reflection vector.
    Reflect,
}

impl Default for UvwSource {
    fn default() -> Self {
        Self::Channel(0)
    }
}

/// Complete state of one texture stage.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct StageState {
    pub texture: Option<BoundTexture>,
    pub op: StageOp,
    pub clamp: ClampFlags,
    pub source: UvwSource,
    pub transform: Mat4,
}

impl Default for StageState {
    fn default() -> Self {
        Self {
            texture: None,
            op: StageOp::default(),
            clamp: ClampFlags::empty(),
            source: UvwSource::default(),
            transform: Mat4::IDENTITY,
        }
    }
}

// ─── Pass-Level State ─────────────────────────────────────────────────────────

/// Depth-buffer policy for a pass.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ZMode {
    /// Write fragment depth.
    pub write: bool,
    /// Test fragment depth.
    pub test: bool,
}

impl Default for ZMode {
    fn default() -> Self {
        Self {
            write: true,
            test: true,
        }
    }
}

/// Triangle culling mode. `Front` is used while rendering reverse-culled
/// shadow casters.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CullMode {
    None,
    #[default]
    Back,
    Front,
}

/// Framebuffer blend applied to the pass output.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FramebufferBlend {
    /// `src`
    #[default]
    Opaque,
    /// `src × srcA + dst × (1 − srcA)`
    Alpha,
    /// `src + dst`
    Add,
    /// `src + dst − 0.5`
    AddSigned,
    /// `(src + dst − 0.5) × 2`
    AddSigned2x,
    /// `src × dst`
    Mult,
    /// `dst × (1 − srcA)` — multiplicative darkening; the shadow projection
    /// pass composes order-independently with this because it only darkens.
    MultInvSrcAlpha,
    /// Color output disabled entirely (depth-only pass).
    NoColor,
}

bitflags! {
    /// Per-channel framebuffer write mask.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct ColorWriteMask: u8 {
        const RED   = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE  = 1 << 2;
        const ALPHA = 1 << 3;
        const COLOR = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits();
        const ALL   = Self::COLOR.bits() | Self::ALPHA.bits();
    }
}

impl Default for ColorWriteMask {
    fn default() -> Self {
        Self::ALL
    }
}

// ─── Lighting ─────────────────────────────────────────────────────────────────

/// Material color constants fed to the fixed-function lighting unit.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct MaterialColors {
    pub ambient: Vec4,
    pub diffuse: Vec4,
    pub emissive: Vec4,
    pub specular: Vec4,
}

/// The three-way lighting equation.
///
/// Selecting a different equation is itself a state change and is diffed
/// against the last-used equation like any other field.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum LightingEquation {
    /// Runtime lighting from material constants: ambient = preshade color,
    /// diffuse = runtime color × opacity, emissive = material ambient.
    MaterialLit(MaterialColors),
    /// Particles: diffuse and emissive come from the vertex color, material
    /// constants suppressed.
    VertexPreshaded,
    /// White material diffuse constant × vertex color, with the ambient
    /// material source switched to per-vertex.
    VertexNonPreshaded,
}

impl Default for LightingEquation {
    fn default() -> Self {
        Self::MaterialLit(MaterialColors::default())
    }
}

/// Shape of one hardware light slot.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum LightKind {
    Directional,
    Point {
        /// Attenuation range.
        range: f32,
    },
    Spot {
        range: f32,
        inner_cone: f32,
        outer_cone: f32,
    },
}

/// Parameters of one hardware light slot.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct LightParams {
    pub kind: LightKind,
    pub position: Vec3,
    pub direction: Vec3,
    pub color: Vec4,
    /// Pre-computed strength of this light on the current span, used to
    /// scale the diffuse contribution.
    pub strength: f32,
}

// ─── Snapshot & Commands ──────────────────────────────────────────────────────

/// Full resolved state for one pass: the snapshot unit the diff engine
/// compares.
///
/// World/view/projection transforms and light slots are deliberately *not*
/// part of this snapshot; they change on span/frame cadence rather than pass
/// cadence and are tracked separately by the differ.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct PassState {
    pub stages: [Option<StageState>; MAX_TEXTURE_STAGES],
    pub lighting: LightingEquation,
    pub z: ZMode,
    pub cull: CullMode,
    pub blend: FramebufferBlend,
    pub write_mask: ColorWriteMask,
}

impl Default for PassState {
    fn default() -> Self {
        Self {
            stages: [None; MAX_TEXTURE_STAGES],
            lighting: LightingEquation::default(),
            z: ZMode::default(),
            cull: CullMode::default(),
            blend: FramebufferBlend::default(),
            write_mask: ColorWriteMask::default(),
        }
    }
}

impl PassState {
    /// Number of active stages (leading `Some` entries).
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.iter().take_while(|s| s.is_some()).count()
    }
}

/// One granular state write. The diff engine emits the minimal sequence of
/// these; a backend applies them in order.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum StateCommand {
    StageTexture { stage: u8, texture: Option<BoundTexture> },
    StageOp { stage: u8, op: StageOp },
    StageClamp { stage: u8, clamp: ClampFlags },
    StageSource { stage: u8, source: UvwSource },
    StageTransform { stage: u8, transform: Mat4 },
    /// Turn a stage off entirely (stages past the pass's stage count).
    StageDisable { stage: u8 },
    Lighting(LightingEquation),
    Z(ZMode),
    Cull(CullMode),
    Blend(FramebufferBlend),
    WriteMask(ColorWriteMask),
    World(Mat4),
    View(Mat4),
    Projection(Mat4),
    /// Set or clear one hardware light slot.
    Light {
        slot: u8,
        params: Option<LightParams>,
    },
    /// Bitmask of enabled light slots. The shadow projection pass uses this
    /// to enable only the slave's own light.
    LightMask(u32),
}
