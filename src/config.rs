//! Renderer Settings & Tuning Configuration
//!
//! This module defines the configuration consumed once during
//! [`Renderer::new`](crate::frame::Renderer::new) to size the transient
//! resource pools and parameterize device-loss recovery.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ember::config::{RendererSettings, RetryPolicy};
//!
//! // Default: 2 MiB volatile ring, stock target pool, 8 reset retries
//! let settings = RendererSettings::default();
//!
//! // Memory-constrained setup with a smaller shadow target pool
//! let settings = RendererSettings {
//!     target_pool: ember::config::TargetPoolConfig::small(),
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

// ---------------------------------------------------------------------------
// RingConfig
// ---------------------------------------------------------------------------

/// Sizing for the shared volatile vertex ring.
///
/// All CPU-recomputed (software-skinned, particle, decal) vertex data for a
/// frame is appended into one device-memory ring. The capacity bounds the
/// total volatile vertex bytes that can be in flight before the ring wraps
/// and invalidates earlier appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    /// Total ring capacity in bytes.
    pub capacity: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity: 2 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// TargetPoolConfig
// ---------------------------------------------------------------------------

/// Per-bucket entry counts for the offscreen render-target pool.
///
/// Buckets are power-of-two edge lengths from 32 through 512. Counts are
/// fixed at startup; [`acquire`](crate::resources::RenderTargetPool::acquire)
/// degrades to the next smaller bucket when one is exhausted rather than
/// allocating mid-frame.
///
/// | Bucket | Default count |
/// |--------|---------------|
/// | 512    | 2             |
/// | 256    | 4             |
/// | 128    | 8             |
/// | 64     | 8             |
/// | 32     | 8             |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPoolConfig {
    /// Entry counts indexed from the smallest bucket (32) to the largest (512).
    pub counts: [u32; 5],
}

/// Power-of-two edge lengths of the pool buckets, smallest first.
pub const TARGET_POOL_SIZES: [u32; 5] = [32, 64, 128, 256, 512];

impl Default for TargetPoolConfig {
    fn default() -> Self {
        Self {
            counts: [8, 8, 8, 4, 2],
        }
    }
}

impl TargetPoolConfig {
    /// A reduced pool for memory-constrained devices.
    #[must_use]
    pub fn small() -> Self {
        Self {
            counts: [4, 4, 4, 2, 1],
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded-retry policy for device-loss recovery.
///
/// Recovery never sleeps inside the library; [`delay_before`](Self::delay_before)
/// reports how long the embedder should wait before calling
/// `begin_frame` again, keeping the timing injectable for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of device reset attempts before falling back to the
    /// reduced default display configuration.
    pub max_attempts: u32,
    /// Delay before the first retry. Subsequent retries back off
    /// exponentially (doubling per attempt).
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Suggested wait before reset attempt `attempt` (0-based),
    /// doubling per attempt.
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(8))
    }
}

// ---------------------------------------------------------------------------
// DisplayConfig
// ---------------------------------------------------------------------------

/// Display mode requested from the device on creation or reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConfig {
    /// Backbuffer width in pixels.
    pub width: u32,
    /// Backbuffer height in pixels.
    pub height: u32,
    /// Color depth in bits per pixel.
    pub color_depth: u32,
    /// Windowed (true) vs exclusive fullscreen (false).
    pub windowed: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            color_depth: 32,
            windowed: true,
        }
    }
}

impl DisplayConfig {
    /// The reduced configuration used as a last resort when device reset
    /// retries are exhausted.
    #[must_use]
    pub fn reduced_default() -> Self {
        Self {
            width: 800,
            height: 600,
            color_depth: 16,
            windowed: true,
        }
    }
}

// ---------------------------------------------------------------------------
// RendererSettings
// ---------------------------------------------------------------------------

/// Global configuration for renderer initialization.
///
/// | Field         | Description                            | Default        |
/// |---------------|----------------------------------------|----------------|
/// | `ring`        | Volatile vertex ring sizing            | 2 MiB          |
/// | `target_pool` | Offscreen target pool bucket counts    | stock counts   |
/// | `retry`       | Device-loss recovery policy            | 8 × 250ms exp. |
/// | `display`     | Requested display mode                 | 1280×720×32 w  |
/// | `clear_color` | Backbuffer clear color                 | opaque black   |
#[derive(Debug, Clone)]
pub struct RendererSettings {
    /// Volatile ring sizing.
    pub ring: RingConfig,
    /// Offscreen render-target pool sizing.
    pub target_pool: TargetPoolConfig,
    /// Device-loss recovery policy.
    pub retry: RetryPolicy,
    /// Requested display mode.
    pub display: DisplayConfig,
    /// Backbuffer clear color at the start of each frame.
    pub clear_color: [f32; 4],
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            ring: RingConfig::default(),
            target_pool: TargetPoolConfig::default(),
            retry: RetryPolicy::default(),
            display: DisplayConfig::default(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Hard cap on simultaneous shadow slaves per frame.
///
/// Span filtering stores one bit per slave, so the cap is the bit width of
/// [`SlaveMask`](crate::scene::SlaveMask). Submissions beyond the cap are
/// dropped with a warning.
pub const MAX_SHADOW_SLAVES: usize = 32;
