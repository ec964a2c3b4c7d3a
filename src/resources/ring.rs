//! Volatile Vertex Ring
//!
//! One process-wide default-pool vertex buffer recycled every frame for all
//! volatile (CPU-recomputed) vertex data: software-skinned meshes, particles
//! and decals all append into it while visible.
//!
//! Discipline: append-only within a frame. The cursor resets to zero at the
//! frame boundary and whenever an append would overflow capacity; either
//! reset advances a generation counter that invalidates every previously
//! issued [`RingSlice`]. Consumers must [`resolve`](VolatileRing::resolve)
//! a slice before use — a stale offset is the use-after-reset bug class this
//! guard exists for.
//!
//! Writes at offset zero use the `Discard` lock (the driver orphans the old
//! contents); all other appends use `NoOverwrite`.

use log::debug;

use crate::config::RingConfig;
use crate::device::{GpuDevice, LockMode, MemoryPool, VertexBufferId};
use crate::errors::{EmberError, Result};

/// A borrowed range of the ring, valid until the next cursor reset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RingSlice {
    pub offset: u32,
    pub len: u32,
    /// Ring generation at issue time; checked by [`VolatileRing::resolve`].
    pub generation: u64,
}

/// The shared volatile vertex ring.
pub struct VolatileRing {
    capacity: u32,
    buffer: Option<VertexBufferId>,
    cursor: u32,
    generation: u64,
}

impl VolatileRing {
    #[must_use]
    pub fn new(config: RingConfig) -> Self {
        Self {
            capacity: config.capacity,
            buffer: None,
            cursor: 0,
            generation: 0,
        }
    }

    /// Backend buffer, once created.
    #[inline]
    #[must_use]
    pub fn buffer(&self) -> Option<VertexBufferId> {
        self.buffer
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Create the backing default-pool buffer. Part of the transient
    /// creation phase; must precede any managed allocation.
    pub fn create(&mut self, device: &mut dyn GpuDevice) -> Result<()> {
        if self.buffer.is_some() {
            return Ok(());
        }
        let buffer = device
            .create_vertex_buffer(MemoryPool::Default, self.capacity)
            .map_err(|source| EmberError::ResourceCreation {
                context: "volatile ring buffer",
                source,
            })?;
        self.buffer = Some(buffer);
        self.cursor = 0;
        self.generation += 1;
        Ok(())
    }

    /// Destroy the backing buffer (device loss). Outstanding slices become
    /// permanently stale.
    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        if let Some(buffer) = self.buffer.take() {
            device.destroy_vertex_buffer(buffer);
        }
        self.cursor = 0;
        self.generation += 1;
    }

    /// Frame boundary: rewind the cursor and invalidate all prior slices.
    pub fn begin_frame(&mut self) {
        self.cursor = 0;
        self.generation += 1;
    }

    /// Append vertex bytes, wrapping (and invalidating all prior slices)
    /// when the ring is full.
    pub fn append(&mut self, device: &mut dyn GpuDevice, data: &[u8]) -> Result<RingSlice> {
        let Some(buffer) = self.buffer else {
            return Err(EmberError::TransientPhaseIncomplete("volatile ring"));
        };
        let len = data.len() as u32;
        if len > self.capacity {
            return Err(EmberError::RingOverCapacity {
                requested: len,
                capacity: self.capacity,
            });
        }

        let overflows = self
            .cursor
            .checked_add(len)
            .is_none_or(|end| end > self.capacity);
        let offset = if overflows {
            debug!(
                "volatile ring wrap at {} bytes, generation {} -> {}",
                self.cursor,
                self.generation,
                self.generation + 1
            );
            self.generation += 1;
            0
        } else {
            self.cursor
        };

        let lock = if offset == 0 {
            LockMode::Discard
        } else {
            LockMode::NoOverwrite
        };
        device
            .write_vertex_buffer(buffer, offset, data, lock)
            .map_err(|source| EmberError::ResourceCreation {
                context: "volatile ring append",
                source,
            })?;

        self.cursor = offset + len;
        Ok(RingSlice {
            offset,
            len,
            generation: self.generation,
        })
    }

    /// Validate a slice against the current generation. Returns the byte
    /// offset if still live, `None` if stale.
    #[must_use]
    pub fn resolve(&self, slice: RingSlice) -> Option<u32> {
        (self.buffer.is_some() && slice.generation == self.generation).then_some(slice.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingConfig;
    use crate::device::{DeviceCaps, RecordingDevice, TraceCommand};

    fn ring_with_device(capacity: u32) -> (VolatileRing, RecordingDevice) {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let mut ring = VolatileRing::new(RingConfig { capacity });
        ring.create(&mut device).unwrap();
        (ring, device)
    }

    #[test]
    fn overflow_bumps_generation_exactly_once() {
        let (mut ring, mut device) = ring_with_device(100);
        ring.begin_frame();
        let start_generation = ring.generation();

        let a = ring.append(&mut device, &[0u8; 60]).unwrap();
        let b = ring.append(&mut device, &[0u8; 30]).unwrap();
        assert_eq!(a.generation, start_generation);
        assert_eq!(b.generation, start_generation);

        // 60 + 30 + 20 > 100: wraps once
        let c = ring.append(&mut device, &[0u8; 20]).unwrap();
        assert_eq!(c.generation, start_generation + 1);
        assert_eq!(c.offset, 0);

        // handles issued before the wrap are stale, the new one is live
        assert!(ring.resolve(a).is_none());
        assert!(ring.resolve(b).is_none());
        assert_eq!(ring.resolve(c), Some(0));
    }

    #[test]
    fn first_append_discards_later_appends_no_overwrite() {
        let (mut ring, mut device) = ring_with_device(100);
        ring.begin_frame();
        ring.append(&mut device, &[0u8; 10]).unwrap();
        ring.append(&mut device, &[0u8; 10]).unwrap();

        let locks: Vec<LockMode> = device
            .commands()
            .iter()
            .filter_map(|c| match c {
                TraceCommand::WriteVertexBuffer { lock, .. } => Some(*lock),
                _ => None,
            })
            .collect();
        assert_eq!(locks, vec![LockMode::Discard, LockMode::NoOverwrite]);
    }

    #[test]
    fn frame_reset_invalidates_outstanding_slices() {
        let (mut ring, mut device) = ring_with_device(100);
        ring.begin_frame();
        let slice = ring.append(&mut device, &[0u8; 10]).unwrap();
        assert!(ring.resolve(slice).is_some());
        ring.begin_frame();
        assert!(ring.resolve(slice).is_none());
    }

    #[test]
    fn oversized_append_is_rejected() {
        let (mut ring, mut device) = ring_with_device(64);
        ring.begin_frame();
        let err = ring.append(&mut device, &[0u8; 65]).unwrap_err();
        assert!(matches!(err, EmberError::RingOverCapacity { .. }));
    }

    #[test]
    fn release_makes_every_slice_stale() {
        let (mut ring, mut device) = ring_with_device(100);
        ring.begin_frame();
        let slice = ring.append(&mut device, &[0u8; 10]).unwrap();
        ring.release(&mut device);
        assert!(ring.resolve(slice).is_none());
    }
}
