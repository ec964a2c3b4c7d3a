//! Frame Controller Tests
//!
//! End-to-end frames against the recording backend:
//! - Single-layer opaque material, one light, no shadows: one draw call per
//!   merged span group, one lighting-equation block
//! - Adjacent-span merging rules
//! - Redundant state suppression across consecutive frames
//! - Per-span skip policy keeping the frame alive
//! - Shadow generation ordering ahead of the main pass
//! - Projection draws with multiplicative darkening
//! - Blur leaving the alpha channel unwritten

use glam::{Mat4, Vec3, Vec4};

use ember::config::RendererSettings;
use ember::device::{
    ColorWriteMask, DeviceCaps, FramebufferBlend, LightKind, RecordingDevice, RenderSurface,
    StateCommand, TraceCommand,
};
use ember::geometry::{GeometryBuffer, VertexLayout};
use ember::material::Material;
use ember::scene::{
    Bounds, CameraTransforms, CasterSpan, FrameInput, LightSource, LightingMode, ShadowFlags,
    ShadowSubmission, SpanFlags, SpanLight, SpanLights, Viewport, VisibleSpan,
};
use ember::{MaterialStore, Renderer};

fn camera() -> CameraTransforms {
    CameraTransforms {
        world_to_camera: Mat4::look_at_rh(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, Vec3::Y),
        camera_to_clip: Mat4::perspective_rh(1.0, 16.0 / 9.0, 0.1, 100.0),
        viewport: Viewport {
            x: 0,
            y: 0,
            width: 1280,
            height: 720,
        },
    }
}

fn triangle_buffer(vertex_count: u32) -> GeometryBuffer {
    let layout = VertexLayout::rigid(1);
    let mut buffer = GeometryBuffer::new(layout, false);
    buffer.set_vertex_data(vec![0u8; (layout.stride() * vertex_count) as usize]);
    buffer.set_indices((0..vertex_count as u16).collect());
    buffer
}

fn one_light() -> LightSource {
    LightSource {
        kind: LightKind::Directional,
        position: Vec3::ZERO,
        direction: Vec3::new(0.3, -1.0, 0.2).normalize(),
        color: Vec4::ONE,
        projection: None,
    }
}

fn span_lights() -> SpanLights {
    let mut lights = SpanLights::default();
    lights.lights.push(SpanLight {
        light: 0,
        strength: 1.0,
    });
    lights
}

fn span(
    materials: &mut MaterialStore,
    material: &Material,
    first_index: u32,
    index_count: u32,
) -> VisibleSpan {
    let key = materials.add(material.clone());
    VisibleSpan {
        buffer: 0,
        first_index,
        index_count,
        base_vertex: 0,
        material: key,
        local_to_world: Mat4::IDENTITY,
        bounds: Bounds::new(Vec3::splat(-1.0), Vec3::splat(1.0)),
        lighting: LightingMode::Material,
        flags: SpanFlags::empty(),
        lights: span_lights(),
        lightmap: None,
    }
}

fn new_renderer() -> Renderer<RecordingDevice> {
    let device = RecordingDevice::new(DeviceCaps::default());
    Renderer::new(device, RendererSettings::default()).expect("renderer init")
}

// ============================================================================
// Scenario: single-layer opaque material, one light, no shadows
// ============================================================================

#[test]
fn opaque_merged_spans_issue_one_draw_and_one_lighting_block() {
    let mut renderer = new_renderer();
    let material = Material::single(None);
    let key = renderer.materials.add(material);

    let buffers = [triangle_buffer(6)];
    let make_span = |first_index: u32| VisibleSpan {
        buffer: 0,
        first_index,
        index_count: 3,
        base_vertex: 0,
        material: key,
        local_to_world: Mat4::IDENTITY,
        bounds: Bounds::default(),
        lighting: LightingMode::Material,
        flags: SpanFlags::empty(),
        lights: span_lights(),
        lightmap: None,
    };
    let spans = [make_span(0), make_span(3)];
    let lights = [one_light()];

    renderer.device_mut().take_commands();
    let report = renderer
        .render_frame(&FrameInput {
            geometry: &buffers,
            spans: &spans,
            lights: &lights,
            shadow_casters: &[],
            camera: camera(),
        })
        .unwrap();

    assert!(report.rendered);
    assert_eq!(report.span_groups, 1, "adjacent compatible spans merge");
    assert_eq!(report.draw_calls, 1, "one draw per merged span group");
    assert_eq!(report.spans_skipped, 0);

    let device = renderer.device();
    let lighting_blocks = device
        .state_commands()
        .filter(|c| matches!(c, StateCommand::Lighting(_)))
        .count();
    assert_eq!(lighting_blocks, 1, "exactly one lighting-equation block");

    let draws: Vec<_> = device.draw_calls().collect();
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].index_count, 6, "merged draw covers both spans");
}

#[test]
fn sort_barrier_prevents_merging() {
    let mut renderer = new_renderer();
    let key = renderer.materials.add(Material::single(None));
    let buffers = [triangle_buffer(6)];

    let mut second = VisibleSpan {
        buffer: 0,
        first_index: 3,
        index_count: 3,
        base_vertex: 0,
        material: key,
        local_to_world: Mat4::IDENTITY,
        bounds: Bounds::default(),
        lighting: LightingMode::Material,
        flags: SpanFlags::SORT_BARRIER,
        lights: span_lights(),
        lightmap: None,
    };
    let first = VisibleSpan {
        first_index: 0,
        flags: SpanFlags::empty(),
        ..second.clone()
    };
    second.flags = SpanFlags::SORT_BARRIER;

    let lights = [one_light()];
    let report = renderer
        .render_frame(&FrameInput {
            geometry: &buffers,
            spans: &[first, second],
            lights: &lights,
            shadow_casters: &[],
            camera: camera(),
        })
        .unwrap();

    assert_eq!(report.span_groups, 2);
    assert_eq!(report.draw_calls, 2);
}

// ============================================================================
// State suppression across frames
// ============================================================================

#[test]
fn second_identical_frame_emits_far_fewer_state_commands() {
    let mut renderer = new_renderer();
    let key = renderer.materials.add(Material::single(None));
    let buffers = [triangle_buffer(3)];
    let spans = [VisibleSpan {
        buffer: 0,
        first_index: 0,
        index_count: 3,
        base_vertex: 0,
        material: key,
        local_to_world: Mat4::IDENTITY,
        bounds: Bounds::default(),
        lighting: LightingMode::Material,
        flags: SpanFlags::empty(),
        lights: span_lights(),
        lightmap: None,
    }];
    let lights = [one_light()];
    let input = FrameInput {
        geometry: &buffers,
        spans: &spans,
        lights: &lights,
        shadow_casters: &[],
        camera: camera(),
    };

    renderer.render_frame(&input).unwrap();
    renderer.device_mut().take_commands();
    renderer.render_frame(&input).unwrap();

    let second_frame_states = renderer.device().state_commands().count();
    assert_eq!(
        second_frame_states, 0,
        "an identical frame re-emits no state at all"
    );
    assert_eq!(renderer.device().draw_calls().count(), 1, "but still draws");
}

// ============================================================================
// Skip policy
// ============================================================================

#[test]
fn missing_material_skips_the_span_not_the_frame() {
    let mut renderer = new_renderer();
    let live = renderer.materials.add(Material::single(None));
    let dead = renderer.materials.add(Material::single(None));
    renderer.materials.remove(dead);

    let buffers = [triangle_buffer(6)];
    let make = |first_index: u32, key| VisibleSpan {
        buffer: 0,
        first_index,
        index_count: 3,
        base_vertex: 0,
        material: key,
        local_to_world: Mat4::IDENTITY,
        bounds: Bounds::default(),
        lighting: LightingMode::Material,
        flags: SpanFlags::empty(),
        lights: span_lights(),
        lightmap: None,
    };
    let spans = [make(0, dead), make(3, live)];
    let lights = [one_light()];

    let report = renderer
        .render_frame(&FrameInput {
            geometry: &buffers,
            spans: &spans,
            lights: &lights,
            shadow_casters: &[],
            camera: camera(),
        })
        .unwrap();

    assert!(report.rendered, "frame survives a bad span");
    assert_eq!(report.spans_skipped, 1);
    assert_eq!(report.draw_calls, 1, "the healthy span still draws");
}

// ============================================================================
// Shadows end to end
// ============================================================================

fn shadow_input<'a>(
    buffers: &'a [GeometryBuffer],
    spans: &'a [VisibleSpan],
    lights: &'a [LightSource],
    casters: &'a [ShadowSubmission],
) -> FrameInput<'a> {
    FrameInput {
        geometry: buffers,
        spans,
        lights,
        shadow_casters: casters,
        camera: camera(),
    }
}

fn caster_submission(blur: f32) -> ShadowSubmission {
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
        power: 0.8,
        blur,
        requested_size: 128,
        flags: ShadowFlags::empty(),
        bounds: Bounds::new(Vec3::splat(-1.0), Vec3::splat(1.0)),
    }
}

#[test]
fn shadow_generation_strictly_precedes_the_main_pass() {
    let mut renderer = new_renderer();
    let material = Material::single(None);
    let buffers = [triangle_buffer(3)];
    let mut receiving = span(&mut renderer.materials, &material, 0, 3);
    receiving.flags = SpanFlags::RECEIVES_SHADOWS;
    let spans = [receiving];
    let lights = [one_light()];
    let casters = [caster_submission(0.0)];

    renderer.device_mut().take_commands();
    let report = renderer
        .render_frame(&shadow_input(&buffers, &spans, &lights, &casters))
        .unwrap();
    assert_eq!(report.shadows.slaves_built, 1);
    assert_eq!(report.shadows.caster_draws, 1);

    let commands = renderer.device().commands();
    let offscreen_at = commands
        .iter()
        .position(|c| matches!(c, TraceCommand::SetTarget(RenderSurface::Offscreen(_))))
        .expect("shadow target bound");
    let backbuffer_at = commands
        .iter()
        .position(|c| matches!(c, TraceCommand::SetTarget(RenderSurface::BackBuffer)))
        .expect("backbuffer bound");
    assert!(
        offscreen_at < backbuffer_at,
        "shadow maps render before any normal geometry"
    );
}

#[test]
fn shadow_projection_darkens_receiving_spans() {
    let mut renderer = new_renderer();
    let material = Material::single(None);
    let buffers = [triangle_buffer(3)];
    let mut receiving = span(&mut renderer.materials, &material, 0, 3);
    receiving.flags = SpanFlags::RECEIVES_SHADOWS;
    let spans = [receiving];
    let lights = [one_light()];
    let casters = [caster_submission(0.0)];

    let report = renderer
        .render_frame(&shadow_input(&buffers, &spans, &lights, &casters))
        .unwrap();

    assert_eq!(report.projection_draws, 1);
    assert!(
        renderer
            .device()
            .state_commands()
            .any(|c| matches!(c, StateCommand::Blend(FramebufferBlend::MultInvSrcAlpha))),
        "projection uses multiplicative darkening"
    );
}

#[test]
fn span_outside_slave_bounds_is_not_projected_onto() {
    let mut renderer = new_renderer();
    let material = Material::single(None);
    let buffers = [triangle_buffer(3)];
    let mut far_away = span(&mut renderer.materials, &material, 0, 3);
    far_away.flags = SpanFlags::RECEIVES_SHADOWS;
    far_away.bounds = Bounds::new(Vec3::splat(100.0), Vec3::splat(101.0));
    let spans = [far_away];
    let lights = [one_light()];
    let casters = [caster_submission(0.0)];

    let report = renderer
        .render_frame(&shadow_input(&buffers, &spans, &lights, &casters))
        .unwrap();
    assert_eq!(report.projection_draws, 0, "span filtering by bounds bit");
}

#[test]
fn blur_composites_color_only_preserving_alpha() {
    let mut renderer = new_renderer();
    let material = Material::single(None);
    let buffers = [triangle_buffer(3)];
    let spans = [span(&mut renderer.materials, &material, 0, 3)];
    let lights = [one_light()];
    let casters = [caster_submission(1.0)];

    renderer.device_mut().take_commands();
    let report = renderer
        .render_frame(&shadow_input(&buffers, &spans, &lights, &casters))
        .unwrap();
    assert_eq!(report.shadows.blurred, 1);

    // Walk the stream tracking blend and write mask; every draw issued
    // under the signed composite blend must mask the alpha channel off.
    let mut blend = FramebufferBlend::Opaque;
    let mut mask = ColorWriteMask::ALL;
    let mut composite_draws = 0;
    for command in renderer.device().commands() {
        match command {
            TraceCommand::State(StateCommand::Blend(b)) => blend = *b,
            TraceCommand::State(StateCommand::WriteMask(m)) => mask = *m,
            TraceCommand::Draw(_) => {
                if blend == FramebufferBlend::AddSigned2x {
                    composite_draws += 1;
                    assert!(
                        !mask.contains(ColorWriteMask::ALPHA),
                        "composite draw would overwrite the encoded depth alpha"
                    );
                }
            }
            _ => {}
        }
    }
    assert_eq!(composite_draws, 1, "one composite draw back into the map");
}
