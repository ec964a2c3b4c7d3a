//! Offscreen Render-Target Pool
//!
//! Pre-allocated pools of color+depth surfaces bucketed by power-of-two edge
//! length (32..512), shared by shadow-map generation and texture
//! compositing. Pre-allocation avoids per-frame target creation entirely;
//! bucket counts are fixed at startup.
//!
//! # Borrowing
//!
//! [`acquire`](RenderTargetPool::acquire) marks an entry busy for the rest of
//! the frame; [`reset`](RenderTargetPool::reset) at the frame boundary frees
//! every entry at once. A target borrowed by one shadow slave can never be
//! handed to another within the same frame.
//!
//! # Degradation
//!
//! When a bucket is exhausted, `acquire` falls back to the next smaller
//! bucket rather than failing; callers read the actual size off the returned
//! [`AcquiredTarget`] and scale their rendering accordingly. Only total
//! exhaustion yields `None`.
//!
//! All targets of one bucket share a single depth surface — legal because
//! they are identical in width, height and depth format, and only one of
//! them is ever the active target at a time.

use log::warn;

use crate::config::{TargetPoolConfig, TARGET_POOL_SIZES};
use crate::device::{
    DepthAttachment, DepthFormat, DepthSurfaceId, DeviceError, GpuDevice, PixelFormat,
    TargetDesc, TargetId,
};
use crate::errors::{EmberError, Result};

/// Identifies a pool entry across one frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PoolTargetId {
    bucket: u8,
    index: u16,
}

/// A target borrowed from the pool for the current frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AcquiredTarget {
    pub id: PoolTargetId,
    pub target: TargetId,
    /// Actual edge length; smaller than requested when the pool degraded.
    pub size: u32,
}

struct PoolEntry {
    target: TargetId,
    in_use: bool,
}

struct Bucket {
    size: u32,
    entries: Vec<PoolEntry>,
    shared_depth: Option<DepthSurfaceId>,
}

/// Fixed pool of offscreen targets, bucketed by power-of-two size.
pub struct RenderTargetPool {
    config: TargetPoolConfig,
    depth_format: DepthFormat,
    buckets: Vec<Bucket>,
    created: bool,
}

impl RenderTargetPool {
    #[must_use]
    pub fn new(config: TargetPoolConfig) -> Self {
        let buckets = TARGET_POOL_SIZES
            .iter()
            .map(|&size| Bucket {
                size,
                entries: Vec::new(),
                shared_depth: None,
            })
            .collect();
        Self {
            config,
            depth_format: DepthFormat::D24S8,
            buckets,
            created: false,
        }
    }

    /// Whether the backend targets exist (transient phase has run).
    #[inline]
    #[must_use]
    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Free entries currently available in the bucket of exactly `size`.
    #[must_use]
    pub fn free_count(&self, size: u32) -> usize {
        self.buckets
            .iter()
            .find(|b| b.size == size)
            .map_or(0, |b| b.entries.iter().filter(|e| !e.in_use).count())
    }

    /// The shared depth surface for the bucket of exactly `size`, creating
    /// it on first use. One depth surface exists per distinct size bucket;
    /// sharing across different sizes is rejected by construction.
    pub fn find_shared(
        &mut self,
        device: &mut dyn GpuDevice,
        size: u32,
    ) -> Result<DepthSurfaceId> {
        let format = self.depth_format;
        let bucket = self
            .buckets
            .iter_mut()
            .find(|b| b.size == size)
            .ok_or(EmberError::Device(DeviceError::Unsupported(
                "target size outside pool buckets",
            )))?;
        if let Some(depth) = bucket.shared_depth {
            return Ok(depth);
        }
        let depth = device
            .create_shared_depth(size, size, format)
            .map_err(|source| EmberError::ResourceCreation {
                context: "pool shared depth",
                source,
            })?;
        bucket.shared_depth = Some(depth);
        Ok(depth)
    }

    /// Create every pooled target. Part of the transient creation phase.
    ///
    /// A single target failing to allocate reduces that bucket's effective
    /// count rather than failing the pool; the shortage is logged.
    pub fn create_targets(&mut self, device: &mut dyn GpuDevice, max_size: u32) -> Result<()> {
        if self.created {
            return Ok(());
        }
        for bucket_index in 0..self.buckets.len() {
            let size = self.buckets[bucket_index].size;
            if size > max_size {
                continue;
            }
            let count = self.config.counts[bucket_index];
            if count == 0 {
                continue;
            }
            let shared = self.find_shared(device, size)?;
            let desc = TargetDesc {
                width: size,
                height: size,
                format: PixelFormat::Argb8888,
                depth: DepthAttachment::Shared(shared),
            };
            for _ in 0..count {
                match device.create_target(&desc) {
                    Ok(target) => self.buckets[bucket_index].entries.push(PoolEntry {
                        target,
                        in_use: false,
                    }),
                    Err(e) => {
                        warn!("render-target pool short at {size}x{size}: {e}");
                        break;
                    }
                }
            }
        }
        self.created = true;
        Ok(())
    }

    /// Destroy every pooled target and depth surface (device loss).
    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        for bucket in &mut self.buckets {
            for entry in bucket.entries.drain(..) {
                device.destroy_target(entry.target);
            }
            if let Some(depth) = bucket.shared_depth.take() {
                device.destroy_shared_depth(depth);
            }
        }
        self.created = false;
    }

    /// Frame boundary: every entry becomes free again.
    pub fn reset(&mut self) {
        for bucket in &mut self.buckets {
            for entry in &mut bucket.entries {
                entry.in_use = false;
            }
        }
    }

    /// Borrow a target of the requested size, degrading to the next smaller
    /// bucket when exhausted. `None` only at total exhaustion.
    pub fn acquire(&mut self, size: u32) -> Option<AcquiredTarget> {
        // Largest bucket not exceeding the request; oversize requests clamp
        // to the top bucket.
        let start = self
            .buckets
            .iter()
            .rposition(|b| b.size <= size)
            .unwrap_or(0);

        for bucket_index in (0..=start).rev() {
            let bucket = &mut self.buckets[bucket_index];
            if let Some(entry_index) = bucket.entries.iter().position(|e| !e.in_use) {
                let entry = &mut bucket.entries[entry_index];
                entry.in_use = true;
                return Some(AcquiredTarget {
                    id: PoolTargetId {
                        bucket: bucket_index as u8,
                        index: entry_index as u16,
                    },
                    target: entry.target,
                    size: bucket.size,
                });
            }
        }
        None
    }
}
