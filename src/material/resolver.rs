//! Material Pass Resolution
//!
//! [`PassResolver::resolve_pass`] answers one question per call: starting at
//! layer `start`, how many contiguous layers of this material can be folded
//! into the next hardware pass, and what state does that pass carry?
//!
//! Layers fold in *bind groups* — maximal runs joined by
//! [`MiscFlags::BIND_NEXT`](super::MiscFlags) — and a group is never split
//! across passes. Folding stops at the hardware's simultaneous-texture
//! budget, at layers that must run solo, and at depth-only (no color output)
//! layers.
//!
//! Piggyback layers (lightmaps, projected lights) are appended after the
//! material layers wherever stage room remains; the final pass of a material
//! un-folds trailing groups if necessary so the piggybacks are never lost
//! entirely.
//!
//! On hardware with fewer than four simultaneous textures, a bump-mapped
//! layer chain cannot fold alongside its base layer; the resolver forces the
//! chain through two reduced passes instead.

use glam::Vec3;
use log::{debug, warn};
use smallvec::SmallVec;

use crate::device::{
    ColorWriteMask, CullMode, DeviceCaps, FramebufferBlend, LightingEquation, MaterialColors,
    StageOp, TargetId, UvwSource, ZMode, MAX_TEXTURE_STAGES,
};
use crate::scene::LightingMode;

use super::bump::{bump_stage_transforms, BumpTuning};
use super::{Layer, Material, MiscFlags, StateOverrides, TextureStore, ZFlags};

/// Spans' surroundings the resolver needs to make its decisions.
pub struct ResolveContext<'a> {
    pub caps: &'a DeviceCaps,
    pub textures: &'a TextureStore,
    pub lighting_mode: LightingMode,
    /// Layers appended to passes of every material (lightmap, projected
    /// lights), already assembled for this span.
    pub piggybacks: &'a [Layer],
    /// The render target currently being drawn into, for the
    /// self-reference check.
    pub active_target: Option<TargetId>,
    pub local_to_world: glam::Mat4,
    /// Direction and strength of the strongest light on the span, consumed
    /// by the bump approximation.
    pub dominant_light: Option<(Vec3, f32)>,
}

/// One texture stage of a resolved pass.
#[derive(Clone, Debug)]
pub struct ResolvedStage {
    pub texture: Option<super::TextureKey>,
    pub op: StageOp,
    pub clamp: crate::device::ClampFlags,
    pub source: UvwSource,
    pub transform: glam::Mat4,
}

/// A fully resolved hardware pass.
#[derive(Clone, Debug)]
pub struct PassPlan {
    pub first_layer: usize,
    /// Index of the first unconsumed layer; strictly greater than
    /// `first_layer`.
    pub next_layer: usize,
    /// Material stages first, then `piggyback_count` piggyback stages.
    pub stages: SmallVec<[ResolvedStage; MAX_TEXTURE_STAGES]>,
    pub piggyback_count: usize,
    pub lighting: LightingEquation,
    pub z: ZMode,
    pub cull: CullMode,
    pub blend: FramebufferBlend,
    pub write_mask: ColorWriteMask,
}

impl PassPlan {
    /// Material layers consumed by this pass.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.next_layer - self.first_layer
    }
}

/// Result of one resolution step.
#[derive(Debug)]
pub enum PassOutcome {
    /// The next pass to render.
    Pass(PassPlan),
    /// All layers consumed.
    Done,
    /// This material cannot render on this span this frame; skip it and
    /// keep going with the remaining spans.
    Skip,
}

/// Stateless pass resolver: overrides and tuning in, pass plans out.
#[derive(Debug, Clone, Default)]
pub struct PassResolver {
    pub overrides: StateOverrides,
    pub tuning: BumpTuning,
}

impl PassResolver {
    #[must_use]
    pub fn new(overrides: StateOverrides, tuning: BumpTuning) -> Self {
        Self { overrides, tuning }
    }

    /// Resolve the next pass of `material`, starting at layer `start`.
    pub fn resolve_pass(
        &self,
        material: &Material,
        start: usize,
        ctx: &ResolveContext<'_>,
    ) -> PassOutcome {
        let layers = &material.layers;
        if layers.is_empty() {
            debug!("material with no usable layers skipped");
            return PassOutcome::Skip;
        }
        if start >= layers.len() {
            return PassOutcome::Done;
        }

        if start == 0 && !self.validate_material(material, ctx) {
            return PassOutcome::Skip;
        }

        let max_tex = ctx.caps.max_simultaneous_textures as usize;

        // Weak-hardware bump fallback: the chain cannot fold with its base,
        // so it is forced through reduced passes.
        if ctx.caps.max_simultaneous_textures < 4 && self.is_bump(&layers[start]) {
            return self.bump_fallback_pass(material, start, max_tex, ctx);
        }

        // Fold whole bind groups until the budget or a solo condition stops us.
        let mut groups: SmallVec<[usize; MAX_TEXTURE_STAGES]> = SmallVec::new();
        let first_group = self.group_len(layers, start);
        if first_group > max_tex {
            warn!(
                "bound layer run of {first_group} exceeds {max_tex} texture stages; material skipped"
            );
            return PassOutcome::Skip;
        }
        groups.push(first_group);
        let mut count = first_group;

        if !self.group_is_solo(layers, start, first_group) {
            loop {
                let next_start = start + count;
                if next_start >= layers.len() {
                    break;
                }
                let group = self.group_len(layers, next_start);
                if self.group_is_solo(layers, next_start, group) {
                    break;
                }
                if count + group > max_tex {
                    break;
                }
                groups.push(group);
                count += group;
            }
        }

        // Piggybacks ride wherever room remains; the material's final pass
        // sheds trailing groups to guarantee them a seat.
        let wanted = ctx.piggybacks.len();
        if start + count == layers.len() {
            while groups.len() > 1 && max_tex - count < wanted {
                count -= groups.pop().expect("len checked");
            }
        }
        let piggyback_count = wanted.min(max_tex - count);
        if start + count == layers.len() && piggyback_count < wanted {
            debug!(
                "dropping {} piggyback layer(s): no stage room",
                wanted - piggyback_count
            );
        }

        PassOutcome::Pass(self.build_plan(material, start, count, piggyback_count, ctx))
    }

    // ── Plan Construction ──────────────────────────────────────────────────

    fn build_plan(
        &self,
        material: &Material,
        start: usize,
        count: usize,
        piggyback_count: usize,
        ctx: &ResolveContext<'_>,
    ) -> PassPlan {
        let layers = &material.layers;
        let first_state = layers[start].composited(&self.overrides);

        let bump_transforms = ctx.dominant_light.map(|(dir, strength)| {
            bump_stage_transforms(&ctx.local_to_world, dir, strength, &self.tuning)
        });

        let mut stages: SmallVec<[ResolvedStage; MAX_TEXTURE_STAGES]> = SmallVec::new();
        let mut bump_index = 0usize;
        for (position, layer) in layers[start..start + count].iter().enumerate() {
            let state = layer.composited(&self.overrides);
            let mut transform = layer.transform;
            let mut op = if position == 0 {
                StageOp::Modulate
            } else {
                Layer::stage_op(&state)
            };
            if state.misc.intersects(MiscFlags::BUMP_CHANS) {
                op = StageOp::Dot3;
                if let Some(transforms) = &bump_transforms {
                    transform = transforms[bump_index.min(2)];
                    bump_index += 1;
                }
            }
            stages.push(ResolvedStage {
                texture: layer.texture,
                op,
                clamp: state.clamp,
                source: layer.uvw_source,
                transform,
            });
        }
        for piggyback in &ctx.piggybacks[..piggyback_count] {
            let state = piggyback.composited(&self.overrides);
            stages.push(ResolvedStage {
                texture: piggyback.texture,
                op: Layer::stage_op(&state),
                clamp: state.clamp,
                source: piggyback.uvw_source,
                transform: piggyback.transform,
            });
        }

        PassPlan {
            first_layer: start,
            next_layer: start + count,
            stages,
            piggyback_count,
            lighting: Self::lighting_equation(ctx.lighting_mode, &layers[start]),
            z: ZMode {
                write: !first_state.z.contains(ZFlags::NO_WRITE),
                test: !first_state.z.contains(ZFlags::NO_READ),
            },
            cull: if first_state.misc.contains(MiscFlags::TWO_SIDED) {
                CullMode::None
            } else {
                CullMode::Back
            },
            blend: if start == 0 {
                Layer::framebuffer_blend(&first_state)
            } else {
                // Upper-layer passes composite over the base pass.
                Self::upper_pass_blend(&first_state)
            },
            write_mask: ColorWriteMask::ALL,
        }
    }

    fn upper_pass_blend(state: &super::LayerState) -> FramebufferBlend {
        let authored = Layer::framebuffer_blend(state);
        if authored == FramebufferBlend::Opaque {
            // An opaque upper pass would replace the base pass outright.
            FramebufferBlend::Alpha
        } else {
            authored
        }
    }

    /// The three-way lighting equation, keyed off the span's lighting mode.
    #[must_use]
    pub fn lighting_equation(mode: LightingMode, base: &Layer) -> LightingEquation {
        match mode {
            LightingMode::Material => {
                let opacity = base.opacity;
                let runtime = base.runtime_color;
                LightingEquation::MaterialLit(MaterialColors {
                    ambient: base.preshade_color,
                    diffuse: glam::Vec4::new(
                        runtime.x * opacity,
                        runtime.y * opacity,
                        runtime.z * opacity,
                        opacity,
                    ),
                    emissive: base.ambient_color,
                    specular: base.specular_color,
                })
            }
            LightingMode::VertexPreshaded => LightingEquation::VertexPreshaded,
            LightingMode::VertexNonPreshaded => LightingEquation::VertexNonPreshaded,
        }
    }

    // ── Folding Rules ──────────────────────────────────────────────────────

    /// Length of the bind group starting at `start`: 1 plus the run of
    /// layers chained by `BIND_NEXT`. A dangling `BIND_NEXT` on the last
    /// layer ends at the material boundary.
    fn group_len(&self, layers: &[Layer], start: usize) -> usize {
        let mut len = 1;
        while start + len < layers.len() {
            let prev = layers[start + len - 1].composited(&self.overrides);
            if !prev.misc.contains(MiscFlags::BIND_NEXT) {
                break;
            }
            len += 1;
        }
        len
    }

    /// Whether any layer of the group must run solo: explicitly flagged, or
    /// depth-only (no color output).
    fn group_is_solo(&self, layers: &[Layer], start: usize, len: usize) -> bool {
        layers[start..start + len].iter().any(|layer| {
            let state = layer.composited(&self.overrides);
            state.misc.contains(MiscFlags::SOLO)
                || state.blend.contains(super::BlendFlags::NO_COLOR)
        })
    }

    fn is_bump(&self, layer: &Layer) -> bool {
        layer
            .composited(&self.overrides)
            .misc
            .intersects(MiscFlags::BUMP_CHANS)
    }

    /// Up-front checks that make the whole material unrenderable on this
    /// span: a base texture aliasing the active render target, or any layer
    /// sourcing a UVW channel the hardware cannot address.
    fn validate_material(&self, material: &Material, ctx: &ResolveContext<'_>) -> bool {
        if let Some(key) = material.layers[0].texture {
            if let Some(texture) = ctx.textures.get(key) {
                if let (Some(alias), Some(active)) = (texture.target, ctx.active_target) {
                    if alias == active {
                        warn!("material base texture aliases the active render target; span skipped");
                        return false;
                    }
                }
            }
        }
        for layer in &material.layers {
            if let UvwSource::Channel(channel) = layer.uvw_source {
                if u32::from(channel) >= ctx.caps.max_uvw_channels {
                    warn!(
                        "layer sources UVW channel {channel} beyond hardware max {}; span skipped",
                        ctx.caps.max_uvw_channels
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Forced reduced passes for bump chains on < 4 texture units. Each
    /// call consumes as much of the chain (plus its base layer) as fits;
    /// piggybacks sit these passes out.
    fn bump_fallback_pass(
        &self,
        material: &Material,
        start: usize,
        max_tex: usize,
        ctx: &ResolveContext<'_>,
    ) -> PassOutcome {
        let layers = &material.layers;
        let mut chain = 0;
        while start + chain < layers.len() && self.is_bump(&layers[start + chain]) {
            chain += 1;
        }
        // The base layer immediately after the chain rides the final
        // fallback pass.
        let with_base = (chain + usize::from(start + chain < layers.len())).max(1);
        let count = with_base.min(max_tex.max(1));

        let mut plan = self.build_plan(material, start, count, 0, ctx);
        if start != 0 {
            plan.blend = FramebufferBlend::Add;
        }
        PassOutcome::Pass(plan)
    }
}
