//! Shadow Map Blur
//!
//! Softens a shadow map's penumbra in two stages:
//!
//! 1. **Accumulate**: render N offset copies of the map into a half-resolution
//!    scratch target with signed additive blending, each sample weighted 1/N,
//!    offsets spaced around a unit circle.
//! 2. **Composite**: blend the accumulated signed result back over the
//!    full-resolution map with `AddSigned2x`, color channels only.
//!
//! The alpha channel carries the encoded caster depth and is never written
//! by either stage — blur softens the visual penumbra, not the depth test.

use glam::{Mat4, Vec2, Vec4};
use smallvec::SmallVec;

use crate::device::{
    BoundTexture, ColorWriteMask, CullMode, FramebufferBlend, GpuDevice, LightingEquation,
    MaterialColors, PassState, StageOp, StageState, UvwSource, ZMode,
};
use crate::material::StateDiffer;
use crate::resources::{AcquiredTarget, RenderTargetPool};

/// Sample counts supported by the offset pattern.
pub const BLUR_SAMPLES_LOW: u32 = 4;
pub const BLUR_SAMPLES_HIGH: u32 = 8;

/// Blur amounts at or above this threshold use the high sample count.
pub const HIGH_SAMPLE_THRESHOLD: f32 = 0.5;

/// N points around the unit circle, scaled by `radius`. Sample `i` sits at
/// angle `(i + ½) · 2π / n`, so patterns of different N never align.
#[must_use]
pub fn sample_offsets(n: u32, radius: f32) -> SmallVec<[Vec2; 8]> {
    let mut offsets = SmallVec::new();
    for i in 0..n {
        let angle = (i as f32 + 0.5) * std::f32::consts::TAU / n as f32;
        offsets.push(Vec2::new(angle.cos(), angle.sin()) * radius);
    }
    offsets
}

/// Per-sample contribution weight.
#[must_use]
pub fn sample_weight(n: u32) -> f32 {
    1.0 / n as f32
}

/// Sample count for a given blur amount.
#[must_use]
pub fn sample_count(blur: f32) -> u32 {
    if blur >= HIGH_SAMPLE_THRESHOLD {
        BLUR_SAMPLES_HIGH
    } else {
        BLUR_SAMPLES_LOW
    }
}

/// The accumulate-stage pass state for one offset sample.
#[must_use]
pub fn accumulate_pass(map: &AcquiredTarget, offset: Vec2, weight: f32) -> PassState {
    let mut pass = PassState::default();
    pass.stages[0] = Some(StageState {
        texture: Some(BoundTexture::Target(map.target)),
        op: StageOp::Modulate,
        clamp: crate::device::ClampFlags::CLAMP_U | crate::device::ClampFlags::CLAMP_V,
        source: UvwSource::Channel(0),
        transform: Mat4::from_translation(offset.extend(0.0)),
    });
    // The 1/N weight rides the diffuse constant.
    pass.lighting = LightingEquation::MaterialLit(MaterialColors {
        diffuse: Vec4::splat(weight),
        ..MaterialColors::default()
    });
    pass.z = ZMode {
        write: false,
        test: false,
    };
    pass.cull = CullMode::None;
    pass.blend = FramebufferBlend::AddSigned;
    pass.write_mask = ColorWriteMask::ALL;
    pass
}

/// The composite-stage pass state: scratch back over the map, color only.
#[must_use]
pub fn composite_pass(scratch: &AcquiredTarget) -> PassState {
    let mut pass = PassState::default();
    pass.stages[0] = Some(StageState {
        texture: Some(BoundTexture::Target(scratch.target)),
        op: StageOp::SelectTexture,
        clamp: crate::device::ClampFlags::CLAMP_U | crate::device::ClampFlags::CLAMP_V,
        source: UvwSource::Channel(0),
        transform: Mat4::IDENTITY,
    });
    pass.lighting = LightingEquation::MaterialLit(MaterialColors {
        diffuse: Vec4::ONE,
        ..MaterialColors::default()
    });
    pass.z = ZMode {
        write: false,
        test: false,
    };
    pass.cull = CullMode::None;
    pass.blend = FramebufferBlend::AddSigned2x;
    // Alpha holds the encoded depth: never write it.
    pass.write_mask = ColorWriteMask::COLOR;
    pass
}

/// Blur scratch acquisition: half the map's resolution.
pub fn acquire_scratch(
    pool: &mut RenderTargetPool,
    map_size: u32,
) -> Option<AcquiredTarget> {
    pool.acquire((map_size / 2).max(32))
}

/// Runs both blur stages over an already-rendered shadow map, drawing the
/// given fullscreen quad. Returns `false` (map left unblurred, not an
/// error) when no scratch target could be acquired.
pub fn run(
    device: &mut dyn GpuDevice,
    differ: &mut StateDiffer,
    pool: &mut RenderTargetPool,
    map: &AcquiredTarget,
    blur: f32,
    quad: &crate::device::DrawCall,
) -> Result<bool, crate::device::DeviceError> {
    let Some(scratch) = acquire_scratch(pool, map.size) else {
        log::debug!("no scratch target for {0}x{0} blur; map left sharp", map.size);
        return Ok(false);
    };

    let n = sample_count(blur);
    let weight = sample_weight(n);
    let texel = 1.0 / map.size as f32;
    let offsets = sample_offsets(n, blur * texel);

    device.set_target(crate::device::RenderSurface::Offscreen(scratch.target))?;
    device.clear(Some([0.5, 0.5, 0.5, 1.0]), None)?;
    for offset in offsets {
        let pass = accumulate_pass(map, offset, weight);
        differ.apply_pass(device, &pass);
        device.draw(quad)?;
    }

    device.set_target(crate::device::RenderSurface::Offscreen(map.target))?;
    let pass = composite_pass(&scratch);
    differ.apply_pass(device, &pass);
    device.draw(quad)?;

    Ok(true)
}
