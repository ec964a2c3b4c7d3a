//! Render-State Diff Engine
//!
//! Redundant state-change calls are measurably expensive; the engine
//! therefore keeps an explicit snapshot of the last state it emitted and
//! writes only the fields that differ. The snapshot is a plain value, so the
//! diff logic runs (and is tested) without a device doing anything but
//! recording.
//!
//! Backend write failures are logged with the backend's error string and do
//! not stop the frame.

use glam::Mat4;
use log::warn;

use crate::device::{
    GpuDevice, LightParams, PassState, StateCommand, MAX_LIGHT_SLOTS, MAX_TEXTURE_STAGES,
};

/// Tracks the last-applied device state and suppresses redundant writes.
pub struct StateDiffer {
    /// Last fully-applied pass snapshot; `None` after
    /// [`invalidate`](Self::invalidate) (device state unknown).
    current: Option<PassState>,
    world: Option<Mat4>,
    view: Option<Mat4>,
    projection: Option<Mat4>,
    /// Outer `None` = slot state unknown; inner `None` = slot disabled.
    lights: [Option<Option<LightParams>>; MAX_LIGHT_SLOTS],
    light_mask: Option<u32>,
    version: u64,
}

impl StateDiffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: None,
            world: None,
            view: None,
            projection: None,
            lights: [None; MAX_LIGHT_SLOTS],
            light_mask: None,
            version: 0,
        }
    }

    /// The last-applied snapshot, if the device state is known.
    #[must_use]
    pub fn current(&self) -> Option<&PassState> {
        self.current.as_ref()
    }

    /// Monotonic snapshot version; bumps whenever at least one command was
    /// emitted.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Forget everything; the next application re-emits all fields. Called
    /// after device reset, when the tracked state no longer reflects the
    /// hardware.
    pub fn invalidate(&mut self) {
        self.current = None;
        self.world = None;
        self.view = None;
        self.projection = None;
        self.lights = [None; MAX_LIGHT_SLOTS];
        self.light_mask = None;
    }

    fn emit(device: &mut dyn GpuDevice, command: &StateCommand, emitted: &mut u32) {
        if let Err(e) = device.apply(command) {
            warn!("state write failed ({command:?}): {e}");
        }
        *emitted += 1;
    }

    /// Apply a resolved pass state, emitting only fields that differ from
    /// the previous snapshot. Returns the number of commands emitted —
    /// zero when `next` equals the tracked state in every diffed field.
    pub fn apply_pass(&mut self, device: &mut dyn GpuDevice, next: &PassState) -> u32 {
        let mut emitted = 0u32;

        for stage in 0..MAX_TEXTURE_STAGES {
            let stage_u8 = stage as u8;
            let previous = self.current.as_ref().and_then(|c| c.stages[stage]);
            match (previous, next.stages[stage]) {
                (None, None) => {}
                (Some(_), None) => {
                    Self::emit(device, &StateCommand::StageDisable { stage: stage_u8 }, &mut emitted);
                }
                (old, Some(new)) => {
                    if old.map(|o| o.texture) != Some(new.texture) {
                        Self::emit(
                            device,
                            &StateCommand::StageTexture {
                                stage: stage_u8,
                                texture: new.texture,
                            },
                            &mut emitted,
                        );
                    }
                    if old.map(|o| o.op) != Some(new.op) {
                        Self::emit(
                            device,
                            &StateCommand::StageOp {
                                stage: stage_u8,
                                op: new.op,
                            },
                            &mut emitted,
                        );
                    }
                    if old.map(|o| o.clamp) != Some(new.clamp) {
                        Self::emit(
                            device,
                            &StateCommand::StageClamp {
                                stage: stage_u8,
                                clamp: new.clamp,
                            },
                            &mut emitted,
                        );
                    }
                    if old.map(|o| o.source) != Some(new.source) {
                        Self::emit(
                            device,
                            &StateCommand::StageSource {
                                stage: stage_u8,
                                source: new.source,
                            },
                            &mut emitted,
                        );
                    }
                    if old.map(|o| o.transform) != Some(new.transform) {
                        Self::emit(
                            device,
                            &StateCommand::StageTransform {
                                stage: stage_u8,
                                transform: new.transform,
                            },
                            &mut emitted,
                        );
                    }
                }
            }
        }

        let previous = self.current.as_ref();
        if previous.map(|c| c.lighting) != Some(next.lighting) {
            Self::emit(device, &StateCommand::Lighting(next.lighting), &mut emitted);
        }
        if previous.map(|c| c.z) != Some(next.z) {
            Self::emit(device, &StateCommand::Z(next.z), &mut emitted);
        }
        if previous.map(|c| c.cull) != Some(next.cull) {
            Self::emit(device, &StateCommand::Cull(next.cull), &mut emitted);
        }
        if previous.map(|c| c.blend) != Some(next.blend) {
            Self::emit(device, &StateCommand::Blend(next.blend), &mut emitted);
        }
        if previous.map(|c| c.write_mask) != Some(next.write_mask) {
            Self::emit(device, &StateCommand::WriteMask(next.write_mask), &mut emitted);
        }

        self.current = Some(*next);
        if emitted > 0 {
            self.version += 1;
        }
        emitted
    }

    /// Set the world transform if it differs from the tracked one.
    pub fn set_world(&mut self, device: &mut dyn GpuDevice, world: Mat4) {
        if self.world != Some(world) {
            let mut emitted = 0;
            Self::emit(device, &StateCommand::World(world), &mut emitted);
            self.world = Some(world);
            self.version += 1;
        }
    }

    /// Set the view transform if it differs from the tracked one.
    pub fn set_view(&mut self, device: &mut dyn GpuDevice, view: Mat4) {
        if self.view != Some(view) {
            let mut emitted = 0;
            Self::emit(device, &StateCommand::View(view), &mut emitted);
            self.view = Some(view);
            self.version += 1;
        }
    }

    /// Set the projection transform if it differs from the tracked one.
    pub fn set_projection(&mut self, device: &mut dyn GpuDevice, projection: Mat4) {
        if self.projection != Some(projection) {
            let mut emitted = 0;
            Self::emit(device, &StateCommand::Projection(projection), &mut emitted);
            self.projection = Some(projection);
            self.version += 1;
        }
    }

    /// Set or clear one light slot if it differs from the tracked state.
    pub fn set_light(
        &mut self,
        device: &mut dyn GpuDevice,
        slot: usize,
        params: Option<LightParams>,
    ) {
        if slot >= MAX_LIGHT_SLOTS {
            return;
        }
        if self.lights[slot] != Some(params) {
            let mut emitted = 0;
            Self::emit(
                device,
                &StateCommand::Light {
                    slot: slot as u8,
                    params,
                },
                &mut emitted,
            );
            self.lights[slot] = Some(params);
            self.version += 1;
        }
    }

    /// Set the enabled-light mask if it differs from the tracked one.
    pub fn set_light_mask(&mut self, device: &mut dyn GpuDevice, mask: u32) {
        if self.light_mask != Some(mask) {
            let mut emitted = 0;
            Self::emit(device, &StateCommand::LightMask(mask), &mut emitted);
            self.light_mask = Some(mask);
            self.version += 1;
        }
    }
}

impl Default for StateDiffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        BoundTexture, DeviceCaps, RecordingDevice, StageOp, StageState, TextureId,
    };

    fn pass_with_one_stage() -> PassState {
        let mut pass = PassState::default();
        pass.stages[0] = Some(StageState {
            texture: Some(BoundTexture::Texture(TextureId(7))),
            op: StageOp::Modulate,
            ..StageState::default()
        });
        pass
    }

    #[test]
    fn identical_pass_emits_nothing() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let mut differ = StateDiffer::new();
        let pass = pass_with_one_stage();

        let first = differ.apply_pass(&mut device, &pass);
        assert!(first > 0, "cold apply emits the full state");
        let second = differ.apply_pass(&mut device, &pass);
        assert_eq!(second, 0, "identical reapply must be silent");
        let third = differ.apply_pass(&mut device, &pass);
        assert_eq!(third, 0);
    }

    #[test]
    fn single_field_change_emits_single_command() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let mut differ = StateDiffer::new();
        let pass = pass_with_one_stage();
        differ.apply_pass(&mut device, &pass);

        let mut changed = pass;
        changed.stages[0] = Some(StageState {
            op: StageOp::Add,
            ..pass.stages[0].unwrap()
        });
        let emitted = differ.apply_pass(&mut device, &changed);
        assert_eq!(emitted, 1, "only the changed stage op should be written");
    }

    #[test]
    fn dropping_a_stage_disables_it() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let mut differ = StateDiffer::new();
        let mut two_stages = pass_with_one_stage();
        two_stages.stages[1] = Some(StageState::default());
        differ.apply_pass(&mut device, &two_stages);

        device.take_commands();
        let one_stage = pass_with_one_stage();
        differ.apply_pass(&mut device, &one_stage);
        assert!(
            device
                .state_commands()
                .any(|c| matches!(c, StateCommand::StageDisable { stage: 1 })),
            "stage 1 must be disabled when the new pass stops using it"
        );
    }

    #[test]
    fn invalidate_forces_full_reemit() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let mut differ = StateDiffer::new();
        let pass = pass_with_one_stage();
        let cold = differ.apply_pass(&mut device, &pass);
        differ.invalidate();
        let warm = differ.apply_pass(&mut device, &pass);
        assert_eq!(cold, warm, "post-invalidate apply re-emits everything");
    }

    #[test]
    fn current_reads_back_the_applied_snapshot() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let mut differ = StateDiffer::new();
        assert!(differ.current().is_none(), "unknown until first apply");
        let pass = pass_with_one_stage();
        differ.apply_pass(&mut device, &pass);
        assert_eq!(differ.current(), Some(&pass));
    }

    #[test]
    fn transform_diffing_tracks_each_matrix() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let mut differ = StateDiffer::new();
        differ.set_world(&mut device, Mat4::IDENTITY);
        differ.set_world(&mut device, Mat4::IDENTITY);
        let worlds = device
            .state_commands()
            .filter(|c| matches!(c, StateCommand::World(_)))
            .count();
        assert_eq!(worlds, 1);
    }
}
