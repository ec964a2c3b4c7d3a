//! Frame Lifecycle Controller
//!
//! [`Renderer`] is the explicit context object that owns the device, the
//! resource registry, the pools, the ring, the pass resolver and the shadow
//! pipeline — constructed once, threaded by reference everywhere, no global
//! state.
//!
//! One frame is one [`render_frame`](Renderer::render_frame) call:
//!
//! 1. Device health check; drive the recovery machine if the device is lost
//!    (the frame is skipped while recovering).
//! 2. `begin` bracket, frame counters, pool/ring reset.
//! 3. Shadow pre-pass — strictly before any normal-geometry rendering,
//!    since the main pass consumes completed shadow maps.
//! 4. Main pass: walk the visible span list in order, resolve material
//!    passes, issue draws, then project intersecting shadow slaves onto
//!    each span. Adjacent compatible spans merge into one draw; the list is
//!    never reordered.
//! 5. `end` bracket (present), slave teardown, periodic ref pruning.
//!
//! Device loss at any point aborts the remainder of the frame; the next
//! `render_frame` call enters recovery. Per-span failures skip that span
//! and keep the frame alive.

pub mod recovery;

pub use recovery::{DeviceRecovery, RecoveryState, RecoveryStep};

use std::time::Duration;

use glam::Vec3;
use log::warn;
use smallvec::SmallVec;

use crate::config::RendererSettings;
use crate::device::{
    BoundTexture, DeviceCaps, DeviceError, DeviceStatus, DrawCall, GpuDevice, LightKind,
    LightParams, PassState, RenderSurface, StageState, UvwSource, MAX_TEXTURE_STAGES,
};
use crate::errors::{EmberError, Result};
use crate::material::{
    Layer, LayerState, MaterialStore, MiscFlags, PassOutcome, PassPlan, PassResolver,
    StateDiffer, StateOverrides, TextureStore,
};
use crate::resources::{RenderTargetPool, ResourceRefs, VolatileRing};
use crate::scene::{FrameInput, SlaveMask, VisibleSpan};
use crate::shadow::{ShadowPipeline, ShadowStats};

// ─── Frame Outputs ────────────────────────────────────────────────────────────

/// Broadcast notifications drained by the embedder after each frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameEvent {
    /// Device recovery completed; external owners of GPU-backed resources
    /// (fonts, cached textures) should lazily rebuild.
    ResourcesRecreated,
    /// Recovery had to fall back to the reduced default display
    /// configuration.
    DisplayFellBack,
}

/// What one `render_frame` call did.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct FrameReport {
    /// False when the frame was skipped (recovering) or aborted (device
    /// lost mid-frame).
    pub rendered: bool,
    /// Set when recovering: how long the embedder should wait before the
    /// next attempt.
    pub retry_in: Option<Duration>,
    pub draw_calls: u32,
    pub passes: u32,
    pub spans_skipped: u32,
    pub span_groups: u32,
    pub projection_draws: u32,
    pub shadows: ShadowStats,
}

#[derive(Default)]
struct GroupOutcome {
    draws: u32,
    passes: u32,
    projections: u32,
    skipped: bool,
}

// ─── Renderer ─────────────────────────────────────────────────────────────────

/// The frame-lifecycle controller and root context object.
pub struct Renderer<D: GpuDevice> {
    device: D,
    settings: RendererSettings,
    caps: DeviceCaps,
    refs: ResourceRefs,
    ring: VolatileRing,
    targets: RenderTargetPool,
    differ: StateDiffer,
    resolver: PassResolver,
    shadows: ShadowPipeline,
    recovery: DeviceRecovery,
    pub textures: TextureStore,
    pub materials: MaterialStore,
    events: Vec<FrameEvent>,
}

impl<D: GpuDevice> Renderer<D> {
    /// Validate the device and build every component, ending with the
    /// transient creation phase so managed allocations are legal afterward.
    pub fn new(device: D, settings: RendererSettings) -> Result<Self> {
        let caps = *device.caps();
        if !caps.has_depth_format {
            return Err(EmberError::NoDepthFormat);
        }
        if caps.max_simultaneous_textures == 0 {
            return Err(EmberError::NoCompatibleDevice(
                "device reports zero texture stages".into(),
            ));
        }
        if caps.max_lights == 0 {
            return Err(EmberError::InsufficientCaps("no hardware light slots".into()));
        }
        if !caps.supports_signed_blend {
            warn!("no signed blending: shadow blur will leave maps sharp");
        }

        let mut textures = TextureStore::new();
        let shadows = ShadowPipeline::new(&mut textures);

        let mut renderer = Self {
            device,
            caps,
            refs: ResourceRefs::new(),
            ring: VolatileRing::new(settings.ring),
            targets: RenderTargetPool::new(settings.target_pool),
            differ: StateDiffer::new(),
            resolver: PassResolver::default(),
            shadows,
            recovery: DeviceRecovery::new(settings.retry),
            textures,
            materials: MaterialStore::new(),
            events: Vec::new(),
            settings,
        };
        renderer.refs.run_transient_phase(
            &mut renderer.device,
            &mut renderer.ring,
            &mut renderer.targets,
        )?;
        Ok(renderer)
    }

    #[must_use]
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// The force-on/force-off blocks applied to every layer composite
    /// (debug visualization, wireframe overlay, shadow receive clamping).
    pub fn set_overrides(&mut self, overrides: StateOverrides) {
        self.resolver.overrides = overrides;
    }

    #[must_use]
    pub fn overrides(&self) -> &StateOverrides {
        &self.resolver.overrides
    }

    /// Notifications accumulated since the last drain.
    pub fn drain_events(&mut self) -> Vec<FrameEvent> {
        std::mem::take(&mut self.events)
    }

    #[must_use]
    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    // ── Frame Driver ───────────────────────────────────────────────────────

    /// Render one frame. Never panics on bad scene data; the report says
    /// what actually happened.
    pub fn render_frame(&mut self, input: &FrameInput<'_>) -> Result<FrameReport> {
        let mut report = FrameReport::default();

        if self.device.status() == DeviceStatus::Lost {
            self.note_loss();
        }
        if self.recovery.state() != RecoveryState::Healthy {
            match self.recovery.step(&mut self.device, &self.settings.display) {
                RecoveryStep::Rendering => {}
                RecoveryStep::Waiting(delay) => {
                    report.retry_in = Some(delay);
                    return Ok(report);
                }
                RecoveryStep::Recovered { fell_back } => {
                    self.refs.run_transient_phase(
                        &mut self.device,
                        &mut self.ring,
                        &mut self.targets,
                    )?;
                    self.differ.invalidate();
                    self.events.push(FrameEvent::ResourcesRecreated);
                    if fell_back {
                        self.events.push(FrameEvent::DisplayFellBack);
                    }
                }
                RecoveryStep::Failed => {
                    return Err(EmberError::RecoveryFailed {
                        attempts: self.settings.retry.max_attempts,
                    });
                }
            }
        }

        if let Err(e) = self.device.begin_frame() {
            return self.frame_error(e, report);
        }
        self.refs.next_frame();
        self.ring.begin_frame();
        self.targets.reset();

        // Shadow generation strictly precedes normal rendering.
        self.shadows.build_slaves(input);
        match self.shadows.generate(
            &mut self.device,
            &mut self.differ,
            &mut self.refs,
            &mut self.ring,
            &mut self.targets,
            &self.textures,
            input,
        ) {
            Ok(stats) => report.shadows = stats,
            Err(e) if e.is_device_lost() => {
                self.note_loss();
                return Ok(report);
            }
            Err(e) => return Err(e),
        }

        match self.render_main(input, &mut report) {
            Ok(()) => {}
            Err(e) if e.is_device_lost() => {
                self.note_loss();
                return Ok(report);
            }
            Err(e) => return Err(e),
        }

        match self.device.end_frame() {
            Ok(()) => {}
            Err(e) => return self.frame_error(e, report),
        }
        self.shadows.end_frame();
        if self.refs.frame() % 64 == 0 {
            self.refs.prune(&mut self.device, 600);
        }
        report.rendered = true;
        Ok(report)
    }

    fn frame_error(&mut self, e: DeviceError, report: FrameReport) -> Result<FrameReport> {
        match e {
            DeviceError::Lost => {
                self.note_loss();
                Ok(report)
            }
            other => Err(other.into()),
        }
    }

    /// Device loss: drop every default-pool resource, forget tracked state,
    /// discard this frame's slaves. Managed resources survive the reset.
    fn note_loss(&mut self) {
        self.recovery.mark_lost();
        self.refs
            .on_device_lost(&mut self.device, &mut self.ring, &mut self.targets);
        self.differ.invalidate();
        self.shadows.end_frame();
    }

    // ── Main Pass ──────────────────────────────────────────────────────────

    fn render_main(&mut self, input: &FrameInput<'_>, report: &mut FrameReport) -> Result<()> {
        let masks = self.shadows.slave_masks(input.spans);

        map_lost(self.device.set_target(RenderSurface::BackBuffer))?;
        map_lost(self.device.set_viewport(input.camera.viewport))?;
        map_lost(self.device.clear(Some(self.settings.clear_color), Some(1.0)))?;
        self.differ.set_view(&mut self.device, input.camera.world_to_camera);
        self.differ
            .set_projection(&mut self.device, input.camera.camera_to_clip);

        let mut index = 0;
        while index < input.spans.len() {
            let mut merged = 1;
            while index + merged < input.spans.len()
                && Self::can_merge(
                    &input.spans[index + merged - 1],
                    &input.spans[index + merged],
                    masks[index + merged - 1],
                    masks[index + merged],
                )
            {
                merged += 1;
            }

            match self.draw_span_group(input, index, merged, masks[index]) {
                Ok(outcome) => {
                    if outcome.skipped {
                        report.spans_skipped += merged as u32;
                    } else {
                        report.draw_calls += outcome.draws;
                        report.passes += outcome.passes;
                        report.projection_draws += outcome.projections;
                        report.span_groups += 1;
                    }
                }
                Err(e) if e.is_device_lost() => return Err(EmberError::DeviceLost),
                Err(e) => {
                    warn!("span group at {index} skipped: {e}");
                    report.spans_skipped += merged as u32;
                }
            }
            index += merged;
        }
        Ok(())
    }

    /// Adjacent spans merge when a single draw can express both: same
    /// buffer, material, transform, lighting and shadow interaction, with
    /// contiguous index ranges and no sort barrier between them.
    fn can_merge(a: &VisibleSpan, b: &VisibleSpan, mask_a: SlaveMask, mask_b: SlaveMask) -> bool {
        a.buffer == b.buffer
            && a.material == b.material
            && a.base_vertex == b.base_vertex
            && a.local_to_world == b.local_to_world
            && a.lighting == b.lighting
            && a.lightmap == b.lightmap
            && a.lights == b.lights
            && mask_a == mask_b
            && !b.flags.contains(crate::scene::SpanFlags::SORT_BARRIER)
            && b.first_index == a.first_index + a.index_count
    }

    fn draw_span_group(
        &mut self,
        input: &FrameInput<'_>,
        first: usize,
        merged: usize,
        mask: SlaveMask,
    ) -> Result<GroupOutcome> {
        let span = &input.spans[first];
        let mut outcome = GroupOutcome::default();

        let Some(geometry) = input.geometry.get(span.buffer) else {
            warn!("span references geometry {} out of range", span.buffer);
            outcome.skipped = true;
            return Ok(outcome);
        };
        let Some(material) = self.materials.get(span.material) else {
            warn!("span references a material that no longer exists");
            outcome.skipped = true;
            return Ok(outcome);
        };
        let material = material.clone();

        let vertex = self
            .refs
            .ensure_vertex(&mut self.device, &mut self.ring, geometry)?;
        let index = self.refs.ensure_index(&mut self.device, geometry)?;
        let index_count: u32 = input.spans[first..first + merged]
            .iter()
            .map(|s| s.index_count)
            .sum();
        let draw = DrawCall {
            vertex_buffer: vertex.buffer,
            vertex_offset: vertex.byte_offset,
            stride: geometry.layout().stride(),
            index_buffer: index,
            first_index: span.first_index,
            index_count,
            base_vertex: span.base_vertex,
        };

        // Hardware light slots, strongest first, straight from the
        // pre-sorted span list.
        let mut light_mask = 0u32;
        for (slot, span_light) in span
            .lights
            .lights
            .iter()
            .take(self.caps.max_lights as usize)
            .enumerate()
        {
            let Some(light) = input.lights.get(span_light.light) else {
                continue;
            };
            self.differ.set_light(
                &mut self.device,
                slot,
                Some(LightParams {
                    kind: light.kind,
                    position: light.position,
                    direction: light.direction,
                    color: light.color,
                    strength: span_light.strength,
                }),
            );
            light_mask |= 1 << slot;
        }
        self.differ.set_light_mask(&mut self.device, light_mask);

        let piggybacks = Self::piggybacks_for_span(span, input);
        let dominant_light = Self::dominant_light(span, input);

        let ctx = crate::material::ResolveContext {
            caps: &self.caps,
            textures: &self.textures,
            lighting_mode: span.lighting,
            piggybacks: &piggybacks,
            active_target: None,
            local_to_world: span.local_to_world,
            dominant_light,
        };

        self.differ.set_world(&mut self.device, span.local_to_world);

        let mut start = 0;
        loop {
            match self.resolver.resolve_pass(&material, start, &ctx) {
                PassOutcome::Done => break,
                PassOutcome::Skip => {
                    if start == 0 {
                        outcome.skipped = true;
                        return Ok(outcome);
                    }
                    break;
                }
                PassOutcome::Pass(plan) => {
                    debug_assert!(plan.next_layer > start, "resolver must make progress");
                    let pass = Self::pass_state_from_plan(
                        &mut self.device,
                        &mut self.refs,
                        &self.textures,
                        &plan,
                    )?;
                    self.differ.apply_pass(&mut self.device, &pass);
                    map_lost(self.device.draw(&draw))?;
                    outcome.draws += 1;
                    outcome.passes += 1;
                    start = plan.next_layer;
                }
            }
        }

        if mask != 0 && outcome.draws > 0 {
            outcome.projections = self.shadows.project_onto_span(
                &mut self.device,
                &mut self.differ,
                &mut self.refs,
                &self.textures,
                span,
                mask,
                &draw,
                input.camera.world_to_camera,
                input.lights,
            )?;
        }
        Ok(outcome)
    }

    fn pass_state_from_plan(
        device: &mut D,
        refs: &mut ResourceRefs,
        textures: &TextureStore,
        plan: &PassPlan,
    ) -> Result<PassState> {
        let mut pass = PassState {
            stages: [None; MAX_TEXTURE_STAGES],
            lighting: plan.lighting,
            z: plan.z,
            cull: plan.cull,
            blend: plan.blend,
            write_mask: plan.write_mask,
        };
        for (i, stage) in plan.stages.iter().enumerate().take(MAX_TEXTURE_STAGES) {
            let texture = match stage.texture {
                None => None,
                Some(key) => match textures.get(key) {
                    None => {
                        warn!("stage texture no longer exists; stage left unbound");
                        None
                    }
                    Some(t) => match t.target {
                        Some(alias) => Some(BoundTexture::Target(alias)),
                        None => Some(BoundTexture::Texture(
                            refs.ensure_texture(device, textures, key)?,
                        )),
                    },
                },
            };
            pass.stages[i] = Some(StageState {
                texture,
                op: stage.op,
                clamp: stage.clamp,
                source: stage.source,
                transform: stage.transform,
            });
        }
        Ok(pass)
    }

    /// Lightmap first, then projector lights, in span light order.
    fn piggybacks_for_span(
        span: &VisibleSpan,
        input: &FrameInput<'_>,
    ) -> SmallVec<[Layer; 4]> {
        let mut piggybacks: SmallVec<[Layer; 4]> = SmallVec::new();
        if let Some(lightmap) = span.lightmap {
            piggybacks.push(Layer {
                texture: Some(lightmap),
                uvw_source: UvwSource::Channel(1),
                ..Layer::default()
            });
        }
        for projector in &span.lights.projectors {
            let Some(light) = input.lights.get(projector.light) else {
                continue;
            };
            let Some(projection) = light.projection else {
                continue;
            };
            piggybacks.push(Layer {
                texture: Some(projection.texture),
                uvw_source: UvwSource::Position,
                transform: projection.matrix,
                state: LayerState {
                    misc: MiscFlags::PROJECTION,
                    ..LayerState::default()
                },
                ..Layer::default()
            });
        }
        piggybacks
    }

    /// Direction and strength of the strongest light on the span, for the
    /// bump approximation.
    fn dominant_light(span: &VisibleSpan, input: &FrameInput<'_>) -> Option<(Vec3, f32)> {
        let strongest = span.lights.lights.first()?;
        let light = input.lights.get(strongest.light)?;
        let direction = match light.kind {
            LightKind::Directional => light.direction,
            _ => span.bounds.center() - light.position,
        };
        Some((direction.normalize_or_zero(), strongest.strength))
    }
}

fn map_lost(result: std::result::Result<(), DeviceError>) -> Result<()> {
    result.map_err(|e| match e {
        DeviceError::Lost => EmberError::DeviceLost,
        other => EmberError::Device(other),
    })
}
