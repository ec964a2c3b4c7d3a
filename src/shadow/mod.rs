//! Shadow Pipeline
//!
//! One [`ShadowSlave`] pairs one shadow-casting submission with one light,
//! lives for exactly one frame, and runs a fixed per-frame sequence:
//!
//! `acquire target → push cast state → render caster spans → [blur] →
//! pop cast state → ready to project`
//!
//! The map is not a raw depth buffer: each caster fragment's light-space
//! position is projected through a fixed lookup transform (the *cast LUT*)
//! into a `[0, 1]` scalar stored as alpha (color is white; RGB only matters
//! to the blur). That encoding lets the *projection* step reuse ordinary
//! texture-modulate stages instead of a dedicated depth-compare sampler.
//!
//! Projection composes order-independently: every projected pass only
//! darkens (`dst × (1 − alpha)`), so overlapping slaves agree regardless of
//! order. Cost scales with overlap, so spans carry a precomputed bit mask of
//! the slaves rendered against them.
//!
//! A slave that fails to acquire a target or to render is dropped for this
//! frame only — no shadow beats a corrupt one.

pub mod blur;

use glam::{Mat4, Vec3};
use log::warn;

use crate::config::MAX_SHADOW_SLAVES;
use crate::device::{
    BoundTexture, ColorWriteMask, CullMode, DeviceError, DrawCall, FramebufferBlend, GpuDevice,
    LightKind, LightParams, LightingEquation, MaterialColors, PassState, PixelFormat,
    RenderSurface, StageOp, StageState, TextureDesc, UvwSource, ZMode,
};
use crate::errors::{EmberError, Result};
use crate::geometry::{GeometryBuffer, VertexLayout};
use crate::material::{LogicalTexture, StateDiffer, TextureKey, TextureStore};
use crate::resources::{AcquiredTarget, RenderTargetPool, ResourceRefs, VolatileRing};
use crate::scene::{FrameInput, ShadowFlags, SlaveMask, VisibleSpan};

/// Self-shadow intensity cap. A caster receiving its own shadow at full
/// power over-darkens badly; this ceiling is hand-tuned, not derived.
pub const SELF_SHADOW_MAX_POWER: f32 = 0.3;

/// Edge length of the depth-encoding lookup texture.
pub const LUT_WIDTH: u32 = 16;

/// The cast LUT: maps a light-space position to a `[0, 1]` ramp coordinate
/// across the light's depth range, which the lookup texture converts into
/// the stored alpha value.
#[must_use]
pub fn cast_lut(near: f32, far: f32, reverse: bool) -> Mat4 {
    let range = (far - near).max(1e-3);
    let (scale, bias) = if reverse {
        (1.0 / range, far / range)
    } else {
        (-1.0 / range, -near / range)
    };
    // u = scale·z + bias, v pinned to the LUT row center.
    let mut m = Mat4::ZERO;
    m.z_axis.x = scale;
    m.w_axis.x = bias;
    m.w_axis.y = 0.5;
    m.w_axis.w = 1.0;
    m
}

/// Clip space to texture UV (y flipped, half-texel origin).
#[must_use]
pub fn uv_from_clip() -> Mat4 {
    Mat4::from_cols_array(&[
        0.5, 0.0, 0.0, 0.0, //
        0.0, -0.5, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.5, 0.5, 0.0, 1.0,
    ])
}

// ─── Shadow Slave ─────────────────────────────────────────────────────────────

/// One-frame pairing of a caster submission and its light.
#[derive(Clone, Debug)]
pub struct ShadowSlave {
    /// Index into [`FrameInput::lights`].
    pub light: usize,
    /// Index into [`FrameInput::shadow_casters`].
    pub submission: usize,
    pub world_to_light: Mat4,
    pub light_to_clip: Mat4,
    /// Cast LUT for this slave's depth range.
    pub cast_transform: Mat4,
    pub power: f32,
    pub blur: f32,
    pub flags: ShadowFlags,
    pub bounds: crate::scene::Bounds,
    /// Borrowed target for this frame, once acquired.
    pub target: Option<AcquiredTarget>,
    /// Requested-to-acquired size ratio; below 1.0 after pool degradation.
    pub render_scale: f32,
    /// Set once the map has rendered (and blurred); only ready slaves
    /// project.
    pub ready: bool,
}

fn light_view_projection(
    light: &crate::scene::LightSource,
    bounds: &crate::scene::Bounds,
) -> (Mat4, Mat4, f32, f32) {
    let center = bounds.center();
    let extent = (bounds.max - bounds.min).length().max(1.0);

    let up = |dir: Vec3| {
        if dir.y.abs() > 0.99 {
            Vec3::X
        } else {
            Vec3::Y
        }
    };

    match light.kind {
        LightKind::Directional => {
            let dir = light.direction.normalize_or_zero();
            let dir = if dir == Vec3::ZERO { -Vec3::Z } else { dir };
            let eye = center - dir * extent;
            let view = Mat4::look_at_rh(eye, center, up(dir));
            let half = extent * 0.5;
            let near = 0.1;
            let far = extent * 2.0;
            let proj = Mat4::orthographic_rh(-half, half, -half, half, near, far);
            (view, proj, near, far)
        }
        LightKind::Point { range } | LightKind::Spot { range, .. } => {
            let to_center = center - light.position;
            let dir = to_center.normalize_or_zero();
            let dir = if dir == Vec3::ZERO { -Vec3::Z } else { dir };
            let view = Mat4::look_at_rh(light.position, light.position + dir, up(dir));
            let fov = match light.kind {
                LightKind::Spot { outer_cone, .. } => {
                    (outer_cone * 2.0).clamp(0.1, std::f32::consts::PI - 0.01)
                }
                _ => {
                    let distance = to_center.length().max(1e-3);
                    ((extent * 0.5) / distance).atan().clamp(0.05, 1.2) * 2.0
                }
            };
            let near = 0.1;
            let far = range.max(extent);
            let proj = Mat4::perspective_rh(fov, 1.0, near, far);
            (view, proj, near, far)
        }
    }
}

// ─── Shadow Pipeline ──────────────────────────────────────────────────────────

/// Per-frame statistics from the shadow pre-pass.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ShadowStats {
    pub slaves_built: u32,
    pub slaves_dropped: u32,
    pub caster_draws: u32,
    pub blurred: u32,
}

/// Owns the per-frame slave list, the depth-encoding LUT texture and the
/// fullscreen quad used by the blur.
pub struct ShadowPipeline {
    lut: TextureKey,
    quad: GeometryBuffer,
    slaves: Vec<ShadowSlave>,
}

impl ShadowPipeline {
    /// Registers the LUT texture and builds the blur quad.
    pub fn new(textures: &mut TextureStore) -> Self {
        let ramp: Vec<u8> = (0..LUT_WIDTH)
            .map(|i| ((i * 255) / (LUT_WIDTH - 1)) as u8)
            .collect();
        let lut = textures.add(LogicalTexture {
            desc: TextureDesc {
                width: LUT_WIDTH,
                height: 1,
                format: PixelFormat::Luminance8,
                mip_levels: 1,
            },
            data: ramp,
            version: 1,
            target: None,
        });

        let mut quad = GeometryBuffer::new(VertexLayout::rigid(1), false);
        let stride = quad.layout().stride() as usize;
        // Two triangles over the unit square; positions and UVs only, the
        // remaining attributes stay zeroed.
        let mut vertices = vec![0u8; stride * 4];
        for (i, (x, y)) in [(0.0f32, 0.0f32), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
            .iter()
            .enumerate()
        {
            let at = i * stride;
            vertices[at..at + 4].copy_from_slice(&x.to_le_bytes());
            vertices[at + 4..at + 8].copy_from_slice(&y.to_le_bytes());
            let uv_at = at + stride - 12;
            vertices[uv_at..uv_at + 4].copy_from_slice(&x.to_le_bytes());
            vertices[uv_at + 4..uv_at + 8].copy_from_slice(&y.to_le_bytes());
        }
        quad.set_vertex_data(vertices);
        quad.set_indices(vec![0, 1, 2, 0, 2, 3]);

        Self {
            lut,
            quad,
            slaves: Vec::new(),
        }
    }

    /// The depth-encoding lookup texture.
    #[must_use]
    pub fn lut(&self) -> TextureKey {
        self.lut
    }

    /// The current frame's slaves.
    #[must_use]
    pub fn slaves(&self) -> &[ShadowSlave] {
        &self.slaves
    }

    /// Build this frame's slave list from the scene's submissions. Slaves
    /// past [`MAX_SHADOW_SLAVES`] are dropped with a warning — span
    /// filtering carries one bit per slave.
    pub fn build_slaves(&mut self, input: &FrameInput<'_>) {
        self.slaves.clear();
        for (index, submission) in input.shadow_casters.iter().enumerate() {
            if self.slaves.len() >= MAX_SHADOW_SLAVES {
                warn!(
                    "shadow submissions beyond {MAX_SHADOW_SLAVES} dropped ({} submitted)",
                    input.shadow_casters.len()
                );
                break;
            }
            let Some(light) = input.lights.get(submission.light) else {
                warn!("shadow submission {index} names light {} which does not exist", submission.light);
                continue;
            };
            if submission.casters.is_empty() {
                continue;
            }
            let (view, proj, near, far) = light_view_projection(light, &submission.bounds);
            self.slaves.push(ShadowSlave {
                light: submission.light,
                submission: index,
                world_to_light: view,
                light_to_clip: proj,
                cast_transform: cast_lut(near, far, submission.flags.contains(ShadowFlags::REVERSE_Z)),
                power: submission.power.clamp(0.0, 1.0),
                blur: submission.blur.max(0.0),
                flags: submission.flags,
                bounds: submission.bounds,
                target: None,
                render_scale: 1.0,
                ready: false,
            });
        }
    }

    /// The cast pass state: one stage sampling the LUT by light-space
    /// position through the slave's cast transform.
    fn cast_pass(&self, slave: &ShadowSlave, lut: BoundTexture) -> PassState {
        let mut pass = PassState::default();
        pass.stages[0] = Some(StageState {
            texture: Some(lut),
            op: StageOp::SelectTexture,
            clamp: crate::device::ClampFlags::CLAMP_U | crate::device::ClampFlags::CLAMP_V,
            source: UvwSource::Position,
            transform: slave.cast_transform,
        });
        pass.lighting = LightingEquation::MaterialLit(MaterialColors {
            diffuse: glam::Vec4::ONE,
            ..MaterialColors::default()
        });
        pass.z = ZMode {
            write: true,
            test: true,
        };
        pass.cull = if slave.flags.contains(ShadowFlags::REVERSE_CULL) {
            CullMode::Front
        } else {
            CullMode::Back
        };
        pass.blend = FramebufferBlend::Opaque;
        pass.write_mask = ColorWriteMask::ALL;
        pass
    }

    /// Render every slave's map. Device loss propagates; any other failure
    /// drops the affected slave for this frame and continues.
    pub fn generate(
        &mut self,
        device: &mut dyn GpuDevice,
        differ: &mut StateDiffer,
        refs: &mut ResourceRefs,
        ring: &mut VolatileRing,
        pool: &mut RenderTargetPool,
        textures: &TextureStore,
        input: &FrameInput<'_>,
    ) -> Result<ShadowStats> {
        let mut stats = ShadowStats {
            slaves_built: self.slaves.len() as u32,
            ..ShadowStats::default()
        };
        if self.slaves.is_empty() {
            return Ok(stats);
        }

        let lut_id = refs.ensure_texture(device, textures, self.lut)?;
        let lut = BoundTexture::Texture(lut_id);

        // Quad buffers for the blur composite.
        let quad_vertex = refs.ensure_vertex(device, ring, &self.quad)?;
        let quad_index = refs.ensure_index(device, &self.quad)?;
        let quad_draw = DrawCall {
            vertex_buffer: quad_vertex.buffer,
            vertex_offset: quad_vertex.byte_offset,
            stride: self.quad.layout().stride(),
            index_buffer: quad_index,
            first_index: 0,
            index_count: 6,
            base_vertex: 0,
        };

        for slave_index in 0..self.slaves.len() {
            let requested_size = input.shadow_casters[self.slaves[slave_index].submission]
                .requested_size
                .max(32);

            let Some(target) = pool.acquire(requested_size) else {
                warn!("shadow slave {slave_index} dropped: target pool exhausted");
                stats.slaves_dropped += 1;
                continue;
            };
            {
                let slave = &mut self.slaves[slave_index];
                slave.render_scale = target.size as f32 / requested_size as f32;
                slave.target = Some(target);
            }

            match self.render_slave(
                device, differ, refs, ring, pool, input, slave_index, lut, &quad_draw, &mut stats,
            ) {
                Ok(()) => self.slaves[slave_index].ready = true,
                Err(e) if e.is_device_lost() => return Err(EmberError::DeviceLost),
                Err(e) => {
                    warn!("shadow slave {slave_index} dropped: {e}");
                    stats.slaves_dropped += 1;
                }
            }
        }
        Ok(stats)
    }

    fn render_slave(
        &mut self,
        device: &mut dyn GpuDevice,
        differ: &mut StateDiffer,
        refs: &mut ResourceRefs,
        ring: &mut VolatileRing,
        pool: &mut RenderTargetPool,
        input: &FrameInput<'_>,
        slave_index: usize,
        lut: BoundTexture,
        quad_draw: &DrawCall,
        stats: &mut ShadowStats,
    ) -> Result<()> {
        let slave = self.slaves[slave_index].clone();
        let target = slave.target.expect("acquired by caller");
        let submission = &input.shadow_casters[slave.submission];

        map_lost(device.set_target(RenderSurface::Offscreen(target.target)))?;
        map_lost(device.clear(Some([1.0, 1.0, 1.0, 1.0]), Some(1.0)))?;

        differ.set_view(device, slave.world_to_light);
        differ.set_projection(device, slave.light_to_clip);
        let cast = self.cast_pass(&slave, lut);
        differ.apply_pass(device, &cast);

        for caster in &submission.casters {
            let Some(geometry) = input.geometry.get(caster.buffer) else {
                warn!("caster references geometry {} out of range", caster.buffer);
                continue;
            };
            let vertex = refs.ensure_vertex(device, ring, geometry)?;
            let index = refs.ensure_index(device, geometry)?;
            differ.set_world(device, caster.local_to_world);
            map_lost(device.draw(&DrawCall {
                vertex_buffer: vertex.buffer,
                vertex_offset: vertex.byte_offset,
                stride: geometry.layout().stride(),
                index_buffer: index,
                first_index: caster.first_index,
                index_count: caster.index_count,
                base_vertex: caster.base_vertex,
            }))?;
            stats.caster_draws += 1;
        }

        if slave.blur > 0.0 {
            let blurred = blur::run(device, differ, pool, &target, slave.blur, quad_draw)
                .map_err(lost_or_creation)?;
            if blurred {
                stats.blurred += 1;
            }
        }
        Ok(())
    }

    /// Per-span slave bit masks: bit `i` set when slave `i` is ready and
    /// its bounds intersect the span's.
    #[must_use]
    pub fn slave_masks(&self, spans: &[VisibleSpan]) -> Vec<SlaveMask> {
        spans
            .iter()
            .map(|span| {
                if !span.flags.contains(crate::scene::SpanFlags::RECEIVES_SHADOWS) {
                    return 0;
                }
                let mut mask: SlaveMask = 0;
                for (i, slave) in self.slaves.iter().enumerate() {
                    if slave.ready && slave.bounds.intersects(&span.bounds) {
                        mask |= 1 << i;
                    }
                }
                mask
            })
            .collect()
    }

    /// The projection pass state for one slave over one receiving span.
    #[must_use]
    pub fn projection_pass(
        &self,
        slave: &ShadowSlave,
        lut: BoundTexture,
        camera_from_world: Mat4,
    ) -> PassState {
        let world_from_camera = camera_from_world.inverse();
        let map_uv = uv_from_clip() * slave.light_to_clip * slave.world_to_light * world_from_camera;
        let lut_uv = slave.cast_transform * slave.world_to_light * world_from_camera;

        let target = slave.target.expect("only ready slaves project");
        let mut pass = PassState::default();
        pass.stages[0] = Some(StageState {
            texture: Some(BoundTexture::Target(target.target)),
            op: StageOp::SelectTexture,
            clamp: crate::device::ClampFlags::CLAMP_U | crate::device::ClampFlags::CLAMP_V,
            source: UvwSource::Position,
            transform: map_uv,
        });
        pass.stages[1] = Some(StageState {
            texture: Some(lut),
            op: StageOp::Modulate,
            clamp: crate::device::ClampFlags::CLAMP_U | crate::device::ClampFlags::CLAMP_V,
            source: UvwSource::Position,
            transform: lut_uv,
        });
        pass.lighting = LightingEquation::MaterialLit(MaterialColors {
            diffuse: glam::Vec4::ONE,
            ..MaterialColors::default()
        });
        pass.z = ZMode {
            write: false,
            test: true,
        };
        pass.cull = CullMode::Back;
        pass.blend = FramebufferBlend::MultInvSrcAlpha;
        pass.write_mask = ColorWriteMask::COLOR;
        pass
    }

    /// Project every intersecting ready slave onto a span whose geometry is
    /// already bound, re-issuing its draw with multiplicative darkening.
    /// Returns the number of projection draws issued.
    pub fn project_onto_span(
        &self,
        device: &mut dyn GpuDevice,
        differ: &mut StateDiffer,
        refs: &mut ResourceRefs,
        textures: &TextureStore,
        span: &VisibleSpan,
        mask: SlaveMask,
        draw: &DrawCall,
        camera_from_world: Mat4,
        lights: &[crate::scene::LightSource],
    ) -> Result<u32> {
        if mask == 0 {
            return Ok(0);
        }
        let lut_id = refs.ensure_texture(device, textures, self.lut)?;
        let lut = BoundTexture::Texture(lut_id);

        let mut draws = 0;
        for (i, slave) in self.slaves.iter().enumerate() {
            if mask & (1 << i) == 0 || !slave.ready {
                continue;
            }
            let Some(light) = lights.get(slave.light) else {
                continue;
            };

            let mut power = slave.power;
            if span.flags.contains(crate::scene::SpanFlags::CASTS_SHADOWS)
                && slave.flags.contains(ShadowFlags::SELF_SHADOW)
            {
                power = power.min(SELF_SHADOW_MAX_POWER);
            }

            let pass = self.projection_pass(slave, lut, camera_from_world);
            differ.apply_pass(device, &pass);
            differ.set_light(
                device,
                0,
                Some(LightParams {
                    kind: light.kind,
                    position: light.position,
                    direction: light.direction,
                    color: light.color,
                    strength: power,
                }),
            );
            differ.set_light_mask(device, 1);
            map_lost(device.draw(draw))?;
            draws += 1;
        }
        Ok(draws)
    }

    /// Frame boundary: slaves never persist.
    pub fn end_frame(&mut self) {
        self.slaves.clear();
    }
}

fn map_lost(result: std::result::Result<(), DeviceError>) -> Result<()> {
    result.map_err(|e| match e {
        DeviceError::Lost => EmberError::DeviceLost,
        other => EmberError::Device(other),
    })
}

fn lost_or_creation(e: DeviceError) -> EmberError {
    match e {
        DeviceError::Lost => EmberError::DeviceLost,
        other => EmberError::Device(other),
    }
}
