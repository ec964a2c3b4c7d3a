//! Frame Inputs
//!
//! Types handed to the renderer by the excluded collaborators: the visibility
//! pass (culled, sorted span list), the lighting pass (per-span light lists,
//! strongest first), the shadow submission step (one-frame caster/light
//! pairings) and the camera.
//!
//! The renderer treats all of this as read-only; it never reorders spans,
//! only batches adjacent compatible ones.

use bitflags::bitflags;
use glam::{Mat4, Vec3, Vec4};
use smallvec::SmallVec;

use crate::device::LightKind;
use crate::geometry::GeometryBuffer;
use crate::material::{MaterialKey, TextureKey};

// ─── Bounds ───────────────────────────────────────────────────────────────────

/// Axis-aligned world-space bounds.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    #[must_use]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[must_use]
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            min: Vec3::splat(-0.5),
            max: Vec3::splat(0.5),
        }
    }
}

// ─── Spans ────────────────────────────────────────────────────────────────────

/// Which lighting equation a span's geometry was authored for.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LightingMode {
    /// Runtime lighting from material constants.
    #[default]
    Material,
    /// Particles; vertex colors carry the final shading.
    VertexPreshaded,
    /// Vertex colors modulate a white material constant.
    VertexNonPreshaded,
}

bitflags! {
    /// Span bit-flags from the visibility pass.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct SpanFlags: u32 {
        /// Shadow slaves may project onto this span.
        const RECEIVES_SHADOWS = 1 << 0;
        /// This span was submitted as a shadow caster this frame.
        const CASTS_SHADOWS    = 1 << 1;
        /// The sort stage required back-to-front ordering for this span;
        /// the renderer must not merge it across neighbors.
        const SORT_BARRIER     = 1 << 2;
    }
}

/// One light's influence on a span.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct SpanLight {
    /// Index into [`FrameInput::lights`].
    pub light: usize,
    /// Computed strength, used for slot assignment (strongest first).
    pub strength: f32,
}

/// Per-span light lists, pre-sorted by strength descending, with projector
/// lights split into their own sublist.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct SpanLights {
    pub lights: SmallVec<[SpanLight; 8]>,
    pub projectors: SmallVec<[SpanLight; 4]>,
}

/// A visible renderable batch: a vertex/index range plus material reference,
/// already culled and sorted by the external visibility stage.
#[derive(Clone, Debug)]
pub struct VisibleSpan {
    /// Index into [`FrameInput::geometry`].
    pub buffer: usize,
    pub first_index: u32,
    pub index_count: u32,
    pub base_vertex: i32,
    pub material: MaterialKey,
    pub local_to_world: Mat4,
    pub bounds: Bounds,
    pub lighting: LightingMode,
    pub flags: SpanFlags,
    pub lights: SpanLights,
    /// Baked lightmap appended to every pass of this span's material.
    pub lightmap: Option<TextureKey>,
}

// ─── Lights ───────────────────────────────────────────────────────────────────

/// Texture and transform of a projector light.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct LightProjection {
    pub texture: TextureKey,
    /// Camera-space position to projected UV.
    pub matrix: Mat4,
}

/// An active light for this frame.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct LightSource {
    pub kind: LightKind,
    pub position: Vec3,
    pub direction: Vec3,
    pub color: Vec4,
    /// Present on projector lights; their texture piggybacks onto every
    /// pass of spans they influence.
    pub projection: Option<LightProjection>,
}

// ─── Shadow Submissions ───────────────────────────────────────────────────────

bitflags! {
    /// Per-submission shadow behavior flags.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
    pub struct ShadowFlags: u32 {
        /// The caster's own geometry receives its own shadow (at capped
        /// intensity).
        const SELF_SHADOW  = 1 << 0;
        /// Invert the depth encoding direction.
        const REVERSE_Z    = 1 << 1;
        /// Cull front faces while rendering casters.
        const REVERSE_CULL = 1 << 2;
    }
}

/// One caster batch inside a shadow submission.
#[derive(Clone, Debug)]
pub struct CasterSpan {
    /// Index into [`FrameInput::geometry`].
    pub buffer: usize,
    pub first_index: u32,
    pub index_count: u32,
    pub base_vertex: i32,
    pub local_to_world: Mat4,
    pub bounds: Bounds,
}

/// A one-frame pairing of caster geometry and a casting light, submitted by
/// the scene step. Consumed during the shadow pre-pass; never persists.
#[derive(Clone, Debug)]
pub struct ShadowSubmission {
    /// Index into [`FrameInput::lights`].
    pub light: usize,
    pub casters: Vec<CasterSpan>,
    /// Shadow intensity in `[0, 1]`.
    pub power: f32,
    /// Blur amount; `0.0` disables the blur passes.
    pub blur: f32,
    /// Requested render-target edge length (power of two).
    pub requested_size: u32,
    pub flags: ShadowFlags,
    /// World bounds of the full caster set, used for span filtering.
    pub bounds: Bounds,
}

/// Bit per shadow slave recording which slaves were rendered against a span.
/// Bit `i` corresponds to the slave at index `i` in the frame's slave list.
pub type SlaveMask = u32;

// ─── Camera ───────────────────────────────────────────────────────────────────

pub use crate::device::Viewport;

/// Camera transforms for the frame.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct CameraTransforms {
    pub world_to_camera: Mat4,
    pub camera_to_clip: Mat4,
    pub viewport: Viewport,
}

// ─── Frame Input ──────────────────────────────────────────────────────────────

/// Everything the renderer consumes for one frame.
pub struct FrameInput<'a> {
    pub geometry: &'a [GeometryBuffer],
    pub spans: &'a [VisibleSpan],
    pub lights: &'a [LightSource],
    pub shadow_casters: &'a [ShadowSubmission],
    pub camera: CameraTransforms,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_intersection_is_symmetric() {
        let a = Bounds::new(Vec3::ZERO, Vec3::splat(2.0));
        let b = Bounds::new(Vec3::splat(1.0), Vec3::splat(3.0));
        let c = Bounds::new(Vec3::splat(5.0), Vec3::splat(6.0));
        assert!(a.intersects(&b) && b.intersects(&a));
        assert!(!a.intersects(&c) && !c.intersects(&a));
    }

    #[test]
    fn bounds_touching_faces_intersect() {
        let a = Bounds::new(Vec3::ZERO, Vec3::ONE);
        let b = Bounds::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 1.0, 1.0));
        assert!(a.intersects(&b));
    }
}
