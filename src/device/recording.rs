//! Command-Recording Backend
//!
//! A headless [`GpuDevice`] that records every command it receives and can
//! replay failures on a script. It serves two purposes:
//!
//! - **Tracing**: capture the exact command stream a frame produced, for
//!   offline inspection of state-change counts and draw ordering.
//! - **Testing**: every testable property of the engine (diff idempotence,
//!   pool degradation, device-lost recovery) is asserted against the
//!   recorded stream, with loss/reset/allocation failures injected via
//!   [`FailureScript`].
//!
//! The backend enforces the real API model's reset rule: a lost device
//! refuses [`reset`](GpuDevice::reset) while any default-pool resource is
//! still alive, which is exactly the bug class the resource registry's
//! release-before-reset sequencing exists to prevent.

use rustc_hash::FxHashMap;

use crate::config::DisplayConfig;

use super::{
    DepthFormat, DepthSurfaceId, DeviceCaps, DeviceError, DeviceStatus, DrawCall, GpuDevice,
    IndexBufferId, LockMode, MemoryPool, RenderSurface, StateCommand, TargetDesc, TargetId,
    TextureDesc, TextureId, VertexBufferId, Viewport,
};

// ─── Trace Stream ─────────────────────────────────────────────────────────────

/// One recorded backend operation.
#[derive(Clone, PartialEq, Debug)]
pub enum TraceCommand {
    BeginFrame { frame: u64 },
    EndFrame,
    SetTarget(RenderSurface),
    SetViewport(Viewport),
    Clear { color: Option<[f32; 4]>, depth: Option<f32> },
    State(StateCommand),
    Draw(DrawCall),
    CreateVertexBuffer { id: VertexBufferId, pool: MemoryPool, byte_size: u32 },
    WriteVertexBuffer { id: VertexBufferId, byte_offset: u32, len: u32, lock: LockMode },
    DestroyVertexBuffer(VertexBufferId),
    CreateIndexBuffer { id: IndexBufferId, pool: MemoryPool, byte_size: u32 },
    WriteIndexBuffer { id: IndexBufferId, byte_offset: u32, len: u32 },
    DestroyIndexBuffer(IndexBufferId),
    CreateTexture { id: TextureId, pool: MemoryPool, desc: TextureDesc },
    UploadTexture { id: TextureId, len: u32 },
    DestroyTexture(TextureId),
    CreateTarget { id: TargetId, desc: TargetDesc },
    CreateSharedDepth { id: DepthSurfaceId, width: u32, height: u32, format: DepthFormat },
    DestroyTarget(TargetId),
    DestroySharedDepth(DepthSurfaceId),
    EvictManaged,
    Reset { ok: bool },
}

// ─── Failure Script ───────────────────────────────────────────────────────────

/// Scripted failures for tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailureScript {
    /// Report the device lost when `begin_frame` is called for this frame
    /// number (0-based).
    pub lose_at_frame: Option<u64>,
    /// Report the device lost on the Nth draw call of the device's lifetime
    /// (0-based) — a mid-frame loss.
    pub lose_at_draw: Option<u64>,
    /// Number of `reset` attempts to fail before one succeeds.
    pub fail_resets: u32,
    /// Number of upcoming resource creations to fail with `OutOfMemory`.
    pub fail_next_allocations: u32,
}

// ─── Recording Device ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
struct LiveBuffer {
    pool: MemoryPool,
    byte_size: u32,
}

/// Headless recording implementation of [`GpuDevice`].
pub struct RecordingDevice {
    caps: DeviceCaps,
    status: DeviceStatus,
    script: FailureScript,
    commands: Vec<TraceCommand>,

    frame: u64,
    draws: u64,
    next_handle: u32,

    vertex_buffers: FxHashMap<u32, LiveBuffer>,
    index_buffers: FxHashMap<u32, LiveBuffer>,
    textures: FxHashMap<u32, MemoryPool>,
    targets: FxHashMap<u32, TargetDesc>,
    shared_depths: FxHashMap<u32, (u32, u32, DepthFormat)>,
}

impl RecordingDevice {
    /// A device with the given capability profile and no scripted failures.
    #[must_use]
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            status: DeviceStatus::Healthy,
            script: FailureScript::default(),
            commands: Vec::new(),
            frame: 0,
            draws: 0,
            next_handle: 1,
            vertex_buffers: FxHashMap::default(),
            index_buffers: FxHashMap::default(),
            textures: FxHashMap::default(),
            targets: FxHashMap::default(),
            shared_depths: FxHashMap::default(),
        }
    }

    /// A device with scripted failures.
    #[must_use]
    pub fn with_script(caps: DeviceCaps, script: FailureScript) -> Self {
        let mut device = Self::new(caps);
        device.script = script;
        device
    }

    // ── Inspection ─────────────────────────────────────────────────────────

    /// Everything recorded so far, in order.
    #[must_use]
    pub fn commands(&self) -> &[TraceCommand] {
        &self.commands
    }

    /// Drain the recorded stream (typically between frames in a test).
    pub fn take_commands(&mut self) -> Vec<TraceCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Recorded state commands only.
    pub fn state_commands(&self) -> impl Iterator<Item = &StateCommand> {
        self.commands.iter().filter_map(|c| match c {
            TraceCommand::State(s) => Some(s),
            _ => None,
        })
    }

    /// Recorded draw calls only.
    pub fn draw_calls(&self) -> impl Iterator<Item = &DrawCall> {
        self.commands.iter().filter_map(|c| match c {
            TraceCommand::Draw(d) => Some(d),
            _ => None,
        })
    }

    /// Live default-pool resource count across all categories.
    #[must_use]
    pub fn live_default_pool_count(&self) -> usize {
        self.vertex_buffers
            .values()
            .filter(|b| b.pool == MemoryPool::Default)
            .count()
            + self
                .index_buffers
                .values()
                .filter(|b| b.pool == MemoryPool::Default)
                .count()
            + self
                .textures
                .values()
                .filter(|p| **p == MemoryPool::Default)
                .count()
            + self.targets.len()
            + self.shared_depths.len()
    }

    /// Live managed-pool resource count across all categories.
    #[must_use]
    pub fn live_managed_pool_count(&self) -> usize {
        self.vertex_buffers
            .values()
            .filter(|b| b.pool == MemoryPool::Managed)
            .count()
            + self
                .index_buffers
                .values()
                .filter(|b| b.pool == MemoryPool::Managed)
                .count()
            + self
                .textures
                .values()
                .filter(|p| **p == MemoryPool::Managed)
                .count()
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn next_id(&mut self) -> u32 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn check_healthy(&self) -> Result<(), DeviceError> {
        match self.status {
            DeviceStatus::Healthy => Ok(()),
            DeviceStatus::Lost => Err(DeviceError::Lost),
        }
    }

    fn check_allocation(&mut self) -> Result<(), DeviceError> {
        self.check_healthy()?;
        if self.script.fail_next_allocations > 0 {
            self.script.fail_next_allocations -= 1;
            return Err(DeviceError::OutOfMemory);
        }
        Ok(())
    }
}

impl GpuDevice for RecordingDevice {
    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn status(&self) -> DeviceStatus {
        self.status
    }

    fn reset(&mut self, _display: &DisplayConfig) -> Result<(), DeviceError> {
        if self.script.fail_resets > 0 {
            self.script.fail_resets -= 1;
            self.commands.push(TraceCommand::Reset { ok: false });
            return Err(DeviceError::Lost);
        }
        // The real API refuses to reset while default-pool resources are
        // alive. Enforcing it here catches release-before-reset bugs.
        if self.live_default_pool_count() > 0 {
            self.commands.push(TraceCommand::Reset { ok: false });
            return Err(DeviceError::Backend(
                "reset with live default-pool resources".into(),
            ));
        }
        self.status = DeviceStatus::Healthy;
        self.commands.push(TraceCommand::Reset { ok: true });
        Ok(())
    }

    fn create_vertex_buffer(
        &mut self,
        pool: MemoryPool,
        byte_size: u32,
    ) -> Result<VertexBufferId, DeviceError> {
        self.check_allocation()?;
        let id = VertexBufferId(self.next_id());
        self.vertex_buffers.insert(id.0, LiveBuffer { pool, byte_size });
        self.commands.push(TraceCommand::CreateVertexBuffer {
            id,
            pool,
            byte_size,
        });
        Ok(id)
    }

    fn create_index_buffer(
        &mut self,
        pool: MemoryPool,
        byte_size: u32,
    ) -> Result<IndexBufferId, DeviceError> {
        self.check_allocation()?;
        let id = IndexBufferId(self.next_id());
        self.index_buffers.insert(id.0, LiveBuffer { pool, byte_size });
        self.commands.push(TraceCommand::CreateIndexBuffer {
            id,
            pool,
            byte_size,
        });
        Ok(id)
    }

    fn write_vertex_buffer(
        &mut self,
        buffer: VertexBufferId,
        byte_offset: u32,
        data: &[u8],
        lock: LockMode,
    ) -> Result<(), DeviceError> {
        self.check_healthy()?;
        let live = self
            .vertex_buffers
            .get(&buffer.0)
            .ok_or(DeviceError::InvalidHandle("vertex buffer"))?;
        if byte_offset + data.len() as u32 > live.byte_size {
            return Err(DeviceError::Backend(format!(
                "vertex write past end: {} + {} > {}",
                byte_offset,
                data.len(),
                live.byte_size
            )));
        }
        self.commands.push(TraceCommand::WriteVertexBuffer {
            id: buffer,
            byte_offset,
            len: data.len() as u32,
            lock,
        });
        Ok(())
    }

    fn write_index_buffer(
        &mut self,
        buffer: IndexBufferId,
        byte_offset: u32,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.check_healthy()?;
        if !self.index_buffers.contains_key(&buffer.0) {
            return Err(DeviceError::InvalidHandle("index buffer"));
        }
        self.commands.push(TraceCommand::WriteIndexBuffer {
            id: buffer,
            byte_offset,
            len: data.len() as u32,
        });
        Ok(())
    }

    fn destroy_vertex_buffer(&mut self, buffer: VertexBufferId) {
        if self.vertex_buffers.remove(&buffer.0).is_some() {
            self.commands.push(TraceCommand::DestroyVertexBuffer(buffer));
        }
    }

    fn destroy_index_buffer(&mut self, buffer: IndexBufferId) {
        if self.index_buffers.remove(&buffer.0).is_some() {
            self.commands.push(TraceCommand::DestroyIndexBuffer(buffer));
        }
    }

    fn create_texture(
        &mut self,
        pool: MemoryPool,
        desc: &TextureDesc,
    ) -> Result<TextureId, DeviceError> {
        self.check_allocation()?;
        let id = TextureId(self.next_id());
        self.textures.insert(id.0, pool);
        self.commands.push(TraceCommand::CreateTexture {
            id,
            pool,
            desc: *desc,
        });
        Ok(id)
    }

    fn upload_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), DeviceError> {
        self.check_healthy()?;
        if !self.textures.contains_key(&texture.0) {
            return Err(DeviceError::InvalidHandle("texture"));
        }
        self.commands.push(TraceCommand::UploadTexture {
            id: texture,
            len: data.len() as u32,
        });
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture.0).is_some() {
            self.commands.push(TraceCommand::DestroyTexture(texture));
        }
    }

    fn create_target(&mut self, desc: &TargetDesc) -> Result<TargetId, DeviceError> {
        self.check_allocation()?;
        if desc.width > self.caps.max_target_size || desc.height > self.caps.max_target_size {
            return Err(DeviceError::Unsupported("target size"));
        }
        let id = TargetId(self.next_id());
        self.targets.insert(id.0, *desc);
        self.commands.push(TraceCommand::CreateTarget { id, desc: *desc });
        Ok(id)
    }

    fn create_shared_depth(
        &mut self,
        width: u32,
        height: u32,
        format: DepthFormat,
    ) -> Result<DepthSurfaceId, DeviceError> {
        self.check_allocation()?;
        let id = DepthSurfaceId(self.next_id());
        self.shared_depths.insert(id.0, (width, height, format));
        self.commands.push(TraceCommand::CreateSharedDepth {
            id,
            width,
            height,
            format,
        });
        Ok(id)
    }

    fn destroy_target(&mut self, target: TargetId) {
        if self.targets.remove(&target.0).is_some() {
            self.commands.push(TraceCommand::DestroyTarget(target));
        }
    }

    fn destroy_shared_depth(&mut self, depth: DepthSurfaceId) {
        if self.shared_depths.remove(&depth.0).is_some() {
            self.commands.push(TraceCommand::DestroySharedDepth(depth));
        }
    }

    fn evict_managed(&mut self) {
        self.commands.push(TraceCommand::EvictManaged);
    }

    fn begin_frame(&mut self) -> Result<(), DeviceError> {
        if self.script.lose_at_frame == Some(self.frame) {
            self.script.lose_at_frame = None;
            self.status = DeviceStatus::Lost;
        }
        self.check_healthy()?;
        self.commands.push(TraceCommand::BeginFrame { frame: self.frame });
        self.frame += 1;
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), DeviceError> {
        self.check_healthy()?;
        self.commands.push(TraceCommand::EndFrame);
        Ok(())
    }

    fn set_target(&mut self, surface: RenderSurface) -> Result<(), DeviceError> {
        self.check_healthy()?;
        if let RenderSurface::Offscreen(t) = surface {
            if !self.targets.contains_key(&t.0) {
                return Err(DeviceError::InvalidHandle("render target"));
            }
        }
        self.commands.push(TraceCommand::SetTarget(surface));
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), DeviceError> {
        self.check_healthy()?;
        self.commands.push(TraceCommand::SetViewport(viewport));
        Ok(())
    }

    fn clear(
        &mut self,
        color: Option<[f32; 4]>,
        depth: Option<f32>,
    ) -> Result<(), DeviceError> {
        self.check_healthy()?;
        self.commands.push(TraceCommand::Clear { color, depth });
        Ok(())
    }

    fn apply(&mut self, command: &StateCommand) -> Result<(), DeviceError> {
        self.check_healthy()?;
        self.commands.push(TraceCommand::State(*command));
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall) -> Result<(), DeviceError> {
        if self.script.lose_at_draw == Some(self.draws) {
            self.script.lose_at_draw = None;
            self.status = DeviceStatus::Lost;
        }
        self.check_healthy()?;
        self.draws += 1;
        self.commands.push(TraceCommand::Draw(*call));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_refuses_live_default_pool() {
        let mut device = RecordingDevice::with_script(
            DeviceCaps::default(),
            FailureScript {
                lose_at_frame: Some(0),
                ..Default::default()
            },
        );
        let buffer = device
            .create_vertex_buffer(MemoryPool::Default, 256)
            .unwrap();
        assert!(device.begin_frame().is_err());
        assert_eq!(device.status(), DeviceStatus::Lost);

        let err = device.reset(&DisplayConfig::default()).unwrap_err();
        assert!(matches!(err, DeviceError::Backend(_)));

        device.destroy_vertex_buffer(buffer);
        assert!(device.reset(&DisplayConfig::default()).is_ok());
        assert_eq!(device.status(), DeviceStatus::Healthy);
    }

    #[test]
    fn scripted_allocation_failure_is_transient() {
        let mut device = RecordingDevice::with_script(
            DeviceCaps::default(),
            FailureScript {
                fail_next_allocations: 1,
                ..Default::default()
            },
        );
        assert_eq!(
            device.create_vertex_buffer(MemoryPool::Managed, 64),
            Err(DeviceError::OutOfMemory)
        );
        assert!(device.create_vertex_buffer(MemoryPool::Managed, 64).is_ok());
    }
}
