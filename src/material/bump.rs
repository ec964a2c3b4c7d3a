//! Bump-Mapping Approximation
//!
//! Fixed-function bump mapping without dedicated hardware support: three
//! texture stages each compute one dot product of the dominant light
//! direction against a tangent-space basis vector, and their summed outputs
//! are read back through a small lookup texture to form an RGB perturbation.
//!
//! The basis vectors come straight from the span's local-to-world matrix.
//! Each of the three stage transforms packs one dot product into the U
//! coordinate of its lookup, offset into the texel center of the LUT row.
//!
//! The scale constants below are hand-tuned; the visual behavior, not the
//! formula, is the contract. Do not re-derive them.

use glam::{Mat4, Vec3, Vec4};

/// Hand-tuned bump approximation constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BumpTuning {
    /// Scale from a raw light·basis dot product to a LUT U offset.
    pub offset_scale: f32,
    /// Light strengths below this contribute no visible perturbation and
    /// the bump transforms collapse to identity.
    pub specular_falloff_near: f32,
    /// Strengths above this use the full offset scale; in between the
    /// offset ramps linearly.
    pub specular_falloff_far: f32,
    /// Half-texel bias into the lookup row.
    pub lut_texel_bias: f32,
}

impl Default for BumpTuning {
    fn default() -> Self {
        Self {
            offset_scale: 0.05,
            specular_falloff_near: 0.35,
            specular_falloff_far: 0.75,
            lut_texel_bias: 0.5 / 16.0,
        }
    }
}

/// Strength-dependent attenuation of the bump offset.
#[must_use]
pub fn bump_attenuation(strength: f32, tuning: &BumpTuning) -> f32 {
    if strength <= tuning.specular_falloff_near {
        0.0
    } else if strength >= tuning.specular_falloff_far {
        1.0
    } else {
        (strength - tuning.specular_falloff_near)
            / (tuning.specular_falloff_far - tuning.specular_falloff_near)
    }
}

/// The three per-stage UVW transforms for one bump layer triple.
///
/// `transforms[0]` carries light·tangent, `[1]` light·binormal,
/// `[2]` light·normal, each packed into the U coordinate.
#[must_use]
pub fn bump_stage_transforms(
    local_to_world: &Mat4,
    light_dir: Vec3,
    strength: f32,
    tuning: &BumpTuning,
) -> [Mat4; 3] {
    let attenuation = bump_attenuation(strength, tuning);
    if attenuation <= 0.0 {
        return [Mat4::IDENTITY; 3];
    }

    let tangent = local_to_world.x_axis.truncate().normalize_or_zero();
    let binormal = local_to_world.y_axis.truncate().normalize_or_zero();
    let normal = local_to_world.z_axis.truncate().normalize_or_zero();
    let dir = light_dir.normalize_or_zero();

    let scale = tuning.offset_scale * attenuation;
    [tangent, binormal, normal].map(|axis| {
        let u = axis.dot(dir) * scale + tuning.lut_texel_bias;
        // Row selecting a constant U along the LUT, V centered.
        let mut m = Mat4::IDENTITY;
        m.w_axis = Vec4::new(u, 0.5, 0.0, 1.0);
        m
    })
}

/// Number of texture stages a bump triple occupies.
pub const BUMP_STAGE_COUNT: usize = 3;
