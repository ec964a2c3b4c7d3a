//! Shadow Pipeline Tests
//!
//! Tests for:
//! - Pool degradation adjusting a slave's render scale (smaller map, same
//!   shadow)
//! - Pool exhaustion dropping the slave for the frame, never failing it
//! - The cast state: LUT sampled by light-space position
//! - Span filtering masks
//! - Slaves never persisting across frames

use glam::{Mat4, Vec3, Vec4};

use ember::config::{RingConfig, TargetPoolConfig};
use ember::device::{
    DeviceCaps, LightKind, RecordingDevice, StateCommand, TraceCommand, UvwSource,
};
use ember::geometry::{GeometryBuffer, VertexLayout};
use ember::material::{StateDiffer, TextureStore};
use ember::resources::{RenderTargetPool, ResourceRefs, VolatileRing};
use ember::scene::{
    Bounds, CameraTransforms, CasterSpan, FrameInput, LightSource, ShadowFlags,
    ShadowSubmission, SpanFlags, SpanLights, Viewport, VisibleSpan,
};
use ember::shadow::ShadowPipeline;

struct Rig {
    device: RecordingDevice,
    differ: StateDiffer,
    refs: ResourceRefs,
    ring: VolatileRing,
    pool: RenderTargetPool,
    textures: TextureStore,
    shadows: ShadowPipeline,
}

fn rig(counts: [u32; 5]) -> Rig {
    let mut device = RecordingDevice::new(DeviceCaps::default());
    let mut refs = ResourceRefs::new();
    let mut ring = VolatileRing::new(RingConfig::default());
    let mut pool = RenderTargetPool::new(TargetPoolConfig { counts });
    refs.run_transient_phase(&mut device, &mut ring, &mut pool)
        .unwrap();
    let mut textures = TextureStore::new();
    let shadows = ShadowPipeline::new(&mut textures);
    Rig {
        device,
        differ: StateDiffer::new(),
        refs,
        ring,
        pool,
        textures,
        shadows,
    }
}

fn caster_buffer() -> GeometryBuffer {
    let layout = VertexLayout::rigid(1);
    let mut buffer = GeometryBuffer::new(layout, false);
    buffer.set_vertex_data(vec![0u8; layout.stride() as usize * 3]);
    buffer.set_indices(vec![0, 1, 2]);
    buffer
}

fn submission(requested_size: u32) -> ShadowSubmission {
    ShadowSubmission {
        light: 0,
        casters: vec![CasterSpan {
            buffer: 0,
            first_index: 0,
            index_count: 3,
            base_vertex: 0,
            local_to_world: Mat4::IDENTITY,
            bounds: Bounds::new(Vec3::splat(-1.0), Vec3::splat(1.0)),
        }],
        power: 0.7,
        blur: 0.0,
        requested_size,
        flags: ShadowFlags::empty(),
        bounds: Bounds::new(Vec3::splat(-1.0), Vec3::splat(1.0)),
    }
}

fn light() -> LightSource {
    LightSource {
        kind: LightKind::Directional,
        position: Vec3::ZERO,
        direction: Vec3::NEG_Y,
        color: Vec4::ONE,
        projection: None,
    }
}

fn input<'a>(
    buffers: &'a [GeometryBuffer],
    lights: &'a [LightSource],
    casters: &'a [ShadowSubmission],
) -> FrameInput<'a> {
    FrameInput {
        geometry: buffers,
        spans: &[],
        lights,
        shadow_casters: casters,
        camera: CameraTransforms {
            world_to_camera: Mat4::IDENTITY,
            camera_to_clip: Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0),
            viewport: Viewport {
                x: 0,
                y: 0,
                width: 640,
                height: 480,
            },
        },
    }
}

// ============================================================================
// Pool Degradation (smaller map, same shadow)
// ============================================================================

#[test]
fn empty_bucket_degrades_and_adjusts_render_scale() {
    // No 256 or 512 targets at all; 128s available.
    let mut r = rig([0, 0, 2, 0, 0]);
    let buffers = [caster_buffer()];
    let lights = [light()];
    let casters = [submission(256)];
    let frame = input(&buffers, &lights, &casters);

    r.shadows.build_slaves(&frame);
    let stats = r
        .shadows
        .generate(
            &mut r.device,
            &mut r.differ,
            &mut r.refs,
            &mut r.ring,
            &mut r.pool,
            &r.textures,
            &frame,
        )
        .unwrap();

    assert_eq!(stats.slaves_dropped, 0);
    let slave = &r.shadows.slaves()[0];
    assert!(slave.ready);
    let target = slave.target.expect("target acquired");
    assert_eq!(target.size, 128, "degraded to the next smaller bucket");
    assert!(
        (slave.render_scale - 0.5).abs() < 1e-6,
        "render scale tracks the degradation, got {}",
        slave.render_scale
    );
}

#[test]
fn total_exhaustion_drops_the_slave_for_the_frame() {
    let mut r = rig([0, 0, 0, 0, 0]);
    let buffers = [caster_buffer()];
    let lights = [light()];
    let casters = [submission(128)];
    let frame = input(&buffers, &lights, &casters);

    r.shadows.build_slaves(&frame);
    let stats = r
        .shadows
        .generate(
            &mut r.device,
            &mut r.differ,
            &mut r.refs,
            &mut r.ring,
            &mut r.pool,
            &r.textures,
            &frame,
        )
        .unwrap();

    assert_eq!(stats.slaves_dropped, 1);
    assert!(!r.shadows.slaves()[0].ready, "dropped slave never projects");
    assert_eq!(stats.caster_draws, 0);
}

// ============================================================================
// Cast State
// ============================================================================

#[test]
fn cast_pass_samples_the_lut_by_position() {
    let mut r = rig([0, 0, 4, 0, 0]);
    let buffers = [caster_buffer()];
    let lights = [light()];
    let casters = [submission(128)];
    let frame = input(&buffers, &lights, &casters);

    r.shadows.build_slaves(&frame);
    r.device.take_commands();
    r.shadows
        .generate(
            &mut r.device,
            &mut r.differ,
            &mut r.refs,
            &mut r.ring,
            &mut r.pool,
            &r.textures,
            &frame,
        )
        .unwrap();

    assert!(
        r.device.state_commands().any(|c| matches!(
            c,
            StateCommand::StageSource {
                stage: 0,
                source: UvwSource::Position
            }
        )),
        "cast stage sources UVWs from position"
    );
    // The map clears to white; alpha carries the encoded depth.
    assert!(r.device.commands().iter().any(|c| matches!(
        c,
        TraceCommand::Clear {
            color: Some([1.0, 1.0, 1.0, 1.0]),
            depth: Some(_)
        }
    )));
}

// ============================================================================
// Span Filtering
// ============================================================================

#[test]
fn slave_masks_follow_bounds_and_receive_flag() {
    let mut r = rig([0, 0, 4, 0, 0]);
    let buffers = [caster_buffer()];
    let lights = [light()];
    let casters = [submission(128)];
    let frame = input(&buffers, &lights, &casters);

    r.shadows.build_slaves(&frame);
    r.shadows
        .generate(
            &mut r.device,
            &mut r.differ,
            &mut r.refs,
            &mut r.ring,
            &mut r.pool,
            &r.textures,
            &frame,
        )
        .unwrap();

    let base = VisibleSpan {
        buffer: 0,
        first_index: 0,
        index_count: 3,
        base_vertex: 0,
        material: Default::default(),
        local_to_world: Mat4::IDENTITY,
        bounds: Bounds::new(Vec3::splat(-0.5), Vec3::splat(0.5)),
        lighting: ember::scene::LightingMode::Material,
        flags: SpanFlags::RECEIVES_SHADOWS,
        lights: SpanLights::default(),
        lightmap: None,
    };
    let intersecting = base.clone();
    let far = VisibleSpan {
        bounds: Bounds::new(Vec3::splat(50.0), Vec3::splat(51.0)),
        ..base.clone()
    };
    let opted_out = VisibleSpan {
        flags: SpanFlags::empty(),
        ..base
    };

    let masks = r.shadows.slave_masks(&[intersecting, far, opted_out]);
    assert_eq!(masks, vec![1, 0, 0]);
}

// ============================================================================
// One-Frame Lifetime
// ============================================================================

#[test]
fn slaves_never_persist_across_frames() {
    let mut r = rig([0, 0, 4, 0, 0]);
    let buffers = [caster_buffer()];
    let lights = [light()];
    let casters = [submission(128)];
    let frame = input(&buffers, &lights, &casters);

    r.shadows.build_slaves(&frame);
    assert_eq!(r.shadows.slaves().len(), 1);
    r.shadows.end_frame();
    assert!(r.shadows.slaves().is_empty());
}
