//! ResourceRef Registry
//!
//! Owns the mapping from logical geometry/texture objects to backend GPU
//! resource handles. Refs are created lazily on first use, re-filled when
//! their owner's version moves past the last uploaded version, and released
//! when the device is lost or the owner goes away.
//!
//! Exactly one ref exists per logical object at a time; the registry is
//! keyed by the owner's stable identity, so "release everything in category
//! X" is an iteration over a map, not a walk of an intrusive list.
//!
//! # Allocation Ordering
//!
//! The backend requires every default-pool (transient) allocation in the
//! subsystem — the volatile ring, the render-target pool, blur scratch — to
//! be created in one dedicated phase, with managed resources evicted
//! immediately beforehand. [`run_transient_phase`](ResourceRefs::run_transient_phase)
//! is that phase; any managed `ensure_*` before it completes is rejected
//! with [`EmberError::TransientPhaseIncomplete`] rather than handed to the
//! backend, where the ordering violation would be undefined behavior.

use rustc_hash::FxHashMap;
use slotmap::SecondaryMap;

use crate::device::{
    GpuDevice, IndexBufferId, MemoryPool, TextureId, VertexBufferId,
};
use crate::errors::{EmberError, Result};
use crate::geometry::{GeometryBuffer, GeometryBufferId};
use crate::material::{TextureKey, TextureStore};

use super::ring::{RingSlice, VolatileRing};
use super::targets::RenderTargetPool;

// ─── Ref Records ──────────────────────────────────────────────────────────────

/// Backend state for one logical geometry buffer.
#[derive(Debug, Default)]
struct BufferRef {
    /// Managed vertex buffer (static geometry only).
    vertex: Option<VertexBufferId>,
    /// Managed index buffer.
    index: Option<IndexBufferId>,
    /// Live ring range (volatile geometry only).
    ring: Option<RingSlice>,
    /// Frame the ring range was appended; one append per buffer per frame.
    ring_frame: u64,
    uploaded_vertex_version: u64,
    uploaded_index_version: u64,
    vertex_byte_size: u32,
    last_used_frame: u64,
}

/// Backend state for one logical texture.
#[derive(Debug, Default)]
struct TextureRef {
    handle: Option<TextureId>,
    uploaded_version: u64,
    last_used_frame: u64,
}

/// Where a span's vertices live for this frame's draws.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VertexBinding {
    pub buffer: VertexBufferId,
    /// Byte offset of the first vertex (nonzero for ring draws).
    pub byte_offset: u32,
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// The resource-ref registry.
pub struct ResourceRefs {
    buffers: FxHashMap<GeometryBufferId, BufferRef>,
    textures: SecondaryMap<TextureKey, TextureRef>,
    transient_ready: bool,
    frame: u64,
}

impl ResourceRefs {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffers: FxHashMap::default(),
            textures: SecondaryMap::new(),
            transient_ready: false,
            frame: 0,
        }
    }

    /// Whether the transient creation phase has run since init or the last
    /// device loss.
    #[inline]
    #[must_use]
    pub fn transient_ready(&self) -> bool {
        self.transient_ready
    }

    /// Advance the frame counter (used for last-used stamping and the
    /// once-per-frame ring append discipline).
    pub fn next_frame(&mut self) {
        self.frame += 1;
    }

    #[inline]
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    // ── Transient Phase ────────────────────────────────────────────────────

    /// Evict managed resources, then create every default-pool resource in
    /// one phase: the volatile ring and the full render-target pool.
    ///
    /// Must complete before any managed allocation; re-run after device
    /// recovery.
    pub fn run_transient_phase(
        &mut self,
        device: &mut dyn GpuDevice,
        ring: &mut VolatileRing,
        targets: &mut RenderTargetPool,
    ) -> Result<()> {
        device.evict_managed();
        ring.create(device)?;
        let max_size = device.caps().max_target_size;
        targets.create_targets(device, max_size)?;
        self.transient_ready = true;
        Ok(())
    }

    /// Device loss: destroy default-pool resources only. Managed refs
    /// survive the reset; volatile refs become dirty and recreate on their
    /// next ensure.
    pub fn on_device_lost(
        &mut self,
        device: &mut dyn GpuDevice,
        ring: &mut VolatileRing,
        targets: &mut RenderTargetPool,
    ) {
        ring.release(device);
        targets.release(device);
        for buffer_ref in self.buffers.values_mut() {
            buffer_ref.ring = None;
            buffer_ref.ring_frame = 0;
        }
        self.transient_ready = false;
    }

    // ── Ensure Operations ──────────────────────────────────────────────────

    /// Guarantee the buffer's vertices are resident and current, returning
    /// where draws should source them.
    ///
    /// Volatile buffers append their live range into the ring the first time
    /// they are ensured each frame; static buffers allocate managed memory
    /// once and re-upload only when invalidated. A creation failure is
    /// reported to the caller, which skips the span for this frame.
    pub fn ensure_vertex(
        &mut self,
        device: &mut dyn GpuDevice,
        ring: &mut VolatileRing,
        buffer: &GeometryBuffer,
    ) -> Result<VertexBinding> {
        let frame = self.frame;
        let entry = self.buffers.entry(buffer.id()).or_default();
        entry.last_used_frame = frame;

        if buffer.is_volatile() {
            // Reuse this frame's append when it is still live.
            if entry.ring_frame == frame {
                if let Some(slice) = entry.ring {
                    if let Some(offset) = ring.resolve(slice) {
                        return Ok(VertexBinding {
                            buffer: ring.buffer().expect("resolved slice implies ring"),
                            byte_offset: offset,
                        });
                    }
                }
            }
            let slice = ring.append(device, buffer.vertex_data())?;
            entry.ring = Some(slice);
            entry.ring_frame = frame;
            return Ok(VertexBinding {
                buffer: ring.buffer().expect("append implies ring"),
                byte_offset: slice.offset,
            });
        }

        if !self.transient_ready {
            return Err(EmberError::TransientPhaseIncomplete("static vertex buffer"));
        }

        let data = buffer.vertex_data();
        let needs_realloc = match entry.vertex {
            None => true,
            Some(_) => entry.vertex_byte_size < data.len() as u32,
        };
        if needs_realloc {
            if let Some(old) = entry.vertex.take() {
                device.destroy_vertex_buffer(old);
            }
            let handle = device
                .create_vertex_buffer(MemoryPool::Managed, data.len() as u32)
                .map_err(|source| EmberError::ResourceCreation {
                    context: "static vertex buffer",
                    source,
                })?;
            entry.vertex = Some(handle);
            entry.vertex_byte_size = data.len() as u32;
            entry.uploaded_vertex_version = 0;
        }
        let handle = entry.vertex.expect("allocated above");
        if entry.uploaded_vertex_version < buffer.version() {
            device
                .write_vertex_buffer(handle, 0, data, crate::device::LockMode::NoOverwrite)
                .map_err(|source| EmberError::ResourceCreation {
                    context: "static vertex upload",
                    source,
                })?;
            entry.uploaded_vertex_version = buffer.version();
        }
        Ok(VertexBinding {
            buffer: handle,
            byte_offset: 0,
        })
    }

    /// Guarantee the buffer's indices are resident and current.
    pub fn ensure_index(
        &mut self,
        device: &mut dyn GpuDevice,
        buffer: &GeometryBuffer,
    ) -> Result<IndexBufferId> {
        if !self.transient_ready {
            return Err(EmberError::TransientPhaseIncomplete("index buffer"));
        }
        let frame = self.frame;
        let entry = self.buffers.entry(buffer.id()).or_default();
        entry.last_used_frame = frame;

        let bytes: &[u8] = bytemuck::cast_slice(buffer.indices());
        if entry.index.is_none() {
            let handle = device
                .create_index_buffer(MemoryPool::Managed, bytes.len() as u32)
                .map_err(|source| EmberError::ResourceCreation {
                    context: "index buffer",
                    source,
                })?;
            entry.index = Some(handle);
            entry.uploaded_index_version = 0;
        }
        let handle = entry.index.expect("allocated above");
        if entry.uploaded_index_version < buffer.version() {
            device
                .write_index_buffer(handle, 0, bytes)
                .map_err(|source| EmberError::ResourceCreation {
                    context: "index upload",
                    source,
                })?;
            entry.uploaded_index_version = buffer.version();
        }
        Ok(handle)
    }

    /// Guarantee a logical texture is resident and current.
    pub fn ensure_texture(
        &mut self,
        device: &mut dyn GpuDevice,
        textures: &TextureStore,
        key: TextureKey,
    ) -> Result<TextureId> {
        if !self.transient_ready {
            return Err(EmberError::TransientPhaseIncomplete("texture"));
        }
        let Some(texture) = textures.get(key) else {
            return Err(EmberError::ResourceCreation {
                context: "texture lookup",
                source: crate::device::DeviceError::InvalidHandle("texture key"),
            });
        };
        let frame = self.frame;
        let entry = self
            .textures
            .entry(key)
            .expect("texture key outlives its refs")
            .or_insert_with(TextureRef::default);
        entry.last_used_frame = frame;

        if entry.handle.is_none() {
            let handle = device
                .create_texture(MemoryPool::Managed, &texture.desc)
                .map_err(|source| EmberError::ResourceCreation {
                    context: "texture",
                    source,
                })?;
            entry.handle = Some(handle);
            entry.uploaded_version = 0;
        }
        let handle = entry.handle.expect("allocated above");
        if entry.uploaded_version < texture.version {
            device
                .upload_texture(handle, &texture.data)
                .map_err(|source| EmberError::ResourceCreation {
                    context: "texture upload",
                    source,
                })?;
            entry.uploaded_version = texture.version;
        }
        Ok(handle)
    }

    // ── Release ────────────────────────────────────────────────────────────

    /// The owner of a geometry buffer is gone; drop its ref and backend
    /// resources.
    pub fn release_buffer(&mut self, device: &mut dyn GpuDevice, id: GeometryBufferId) {
        if let Some(entry) = self.buffers.remove(&id) {
            if let Some(v) = entry.vertex {
                device.destroy_vertex_buffer(v);
            }
            if let Some(i) = entry.index {
                device.destroy_index_buffer(i);
            }
        }
    }

    /// The owner of a texture is gone; drop its ref and backend resource.
    pub fn release_texture(&mut self, device: &mut dyn GpuDevice, key: TextureKey) {
        if let Some(entry) = self.textures.remove(key) {
            if let Some(t) = entry.handle {
                device.destroy_texture(t);
            }
        }
    }

    /// Drop refs not used for `max_age` frames, returning their backend
    /// resources to the device.
    pub fn prune(&mut self, device: &mut dyn GpuDevice, max_age: u64) {
        let cutoff = self.frame.saturating_sub(max_age);
        let stale: Vec<GeometryBufferId> = self
            .buffers
            .iter()
            .filter(|(_, r)| r.last_used_frame < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.release_buffer(device, id);
        }
        let stale_textures: Vec<TextureKey> = self
            .textures
            .iter()
            .filter(|(_, r)| r.last_used_frame < cutoff)
            .map(|(key, _)| key)
            .collect();
        for key in stale_textures {
            self.release_texture(device, key);
        }
    }

    /// Number of live buffer refs (tests).
    #[must_use]
    pub fn buffer_ref_count(&self) -> usize {
        self.buffers.len()
    }
}

impl Default for ResourceRefs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RingConfig, TargetPoolConfig};
    use crate::device::{DeviceCaps, RecordingDevice, TraceCommand};
    use crate::geometry::VertexLayout;

    struct Fixture {
        device: RecordingDevice,
        refs: ResourceRefs,
        ring: VolatileRing,
        targets: RenderTargetPool,
    }

    fn fixture() -> Fixture {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let mut refs = ResourceRefs::new();
        let mut ring = VolatileRing::new(RingConfig { capacity: 4096 });
        let mut targets = RenderTargetPool::new(TargetPoolConfig { counts: [1, 0, 0, 0, 0] });
        refs.run_transient_phase(&mut device, &mut ring, &mut targets)
            .unwrap();
        Fixture {
            device,
            refs,
            ring,
            targets,
        }
    }

    fn static_buffer() -> GeometryBuffer {
        let mut buffer = GeometryBuffer::new(VertexLayout::rigid(1), false);
        buffer.set_vertex_data(vec![0u8; 44 * 3]);
        buffer.set_indices(vec![0, 1, 2]);
        buffer
    }

    #[test]
    fn managed_allocation_before_transient_phase_is_rejected() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let mut refs = ResourceRefs::new();
        let mut ring = VolatileRing::new(RingConfig::default());
        let buffer = static_buffer();
        let err = refs
            .ensure_vertex(&mut device, &mut ring, &buffer)
            .unwrap_err();
        assert!(matches!(err, EmberError::TransientPhaseIncomplete(_)));
    }

    #[test]
    fn transient_phase_evicts_managed_first() {
        let f = fixture();
        let commands = f.device.commands();
        let evict_at = commands
            .iter()
            .position(|c| matches!(c, TraceCommand::EvictManaged))
            .expect("evict recorded");
        let first_create = commands
            .iter()
            .position(|c| {
                matches!(
                    c,
                    TraceCommand::CreateVertexBuffer { .. } | TraceCommand::CreateTarget { .. }
                )
            })
            .expect("creations recorded");
        assert!(evict_at < first_create, "evict must precede creation phase");
    }

    #[test]
    fn static_buffer_uploads_once() {
        let mut f = fixture();
        let buffer = static_buffer();
        f.refs.next_frame();
        f.refs
            .ensure_vertex(&mut f.device, &mut f.ring, &buffer)
            .unwrap();
        f.refs.next_frame();
        f.refs
            .ensure_vertex(&mut f.device, &mut f.ring, &buffer)
            .unwrap();

        let uploads = f
            .device
            .commands()
            .iter()
            .filter(|c| matches!(c, TraceCommand::WriteVertexBuffer { .. }))
            .count();
        assert_eq!(uploads, 1, "unchanged static data must not re-upload");
    }

    #[test]
    fn invalidate_forces_reupload() {
        let mut f = fixture();
        let mut buffer = static_buffer();
        f.refs.next_frame();
        f.refs
            .ensure_vertex(&mut f.device, &mut f.ring, &buffer)
            .unwrap();
        buffer.invalidate();
        f.refs
            .ensure_vertex(&mut f.device, &mut f.ring, &buffer)
            .unwrap();
        let uploads = f
            .device
            .commands()
            .iter()
            .filter(|c| matches!(c, TraceCommand::WriteVertexBuffer { .. }))
            .count();
        assert_eq!(uploads, 2);
    }

    #[test]
    fn volatile_buffer_appends_once_per_frame() {
        let mut f = fixture();
        let mut buffer = GeometryBuffer::new(VertexLayout::rigid(0), true);
        buffer.set_vertex_data(vec![0u8; 32 * 4]);

        f.refs.next_frame();
        f.ring.begin_frame();
        let a = f
            .refs
            .ensure_vertex(&mut f.device, &mut f.ring, &buffer)
            .unwrap();
        let b = f
            .refs
            .ensure_vertex(&mut f.device, &mut f.ring, &buffer)
            .unwrap();
        assert_eq!(a, b, "second ensure in a frame reuses the append");

        let writes = f
            .device
            .commands()
            .iter()
            .filter(|c| matches!(c, TraceCommand::WriteVertexBuffer { .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[test]
    fn volatile_buffer_never_allocates_its_own_memory() {
        let mut f = fixture();
        let mut buffer = GeometryBuffer::new(VertexLayout::rigid(0), true);
        buffer.set_vertex_data(vec![0u8; 64]);
        f.refs.next_frame();
        f.ring.begin_frame();
        let binding = f
            .refs
            .ensure_vertex(&mut f.device, &mut f.ring, &buffer)
            .unwrap();
        assert_eq!(Some(binding.buffer), f.ring.buffer());
    }

    #[test]
    fn device_lost_releases_default_pool_only() {
        let mut f = fixture();
        let buffer = static_buffer();
        f.refs.next_frame();
        f.refs
            .ensure_vertex(&mut f.device, &mut f.ring, &buffer)
            .unwrap();
        f.refs.ensure_index(&mut f.device, &buffer).unwrap();

        let managed_before = f.device.live_managed_pool_count();
        f.refs
            .on_device_lost(&mut f.device, &mut f.ring, &mut f.targets);

        assert_eq!(f.device.live_default_pool_count(), 0);
        assert_eq!(f.device.live_managed_pool_count(), managed_before);
        assert!(!f.refs.transient_ready());
    }

    #[test]
    fn prune_destroys_stale_refs() {
        let mut f = fixture();
        let buffer = static_buffer();
        f.refs.next_frame();
        f.refs
            .ensure_vertex(&mut f.device, &mut f.ring, &buffer)
            .unwrap();
        assert_eq!(f.refs.buffer_ref_count(), 1);
        for _ in 0..10 {
            f.refs.next_frame();
        }
        f.refs.prune(&mut f.device, 5);
        assert_eq!(f.refs.buffer_ref_count(), 0);
    }
}
