//! GPU Device Abstraction
//!
//! The engine targets one fixed GPU API model: a device with two memory
//! pools (transient *default* memory that dies with the device, durable
//! *managed* memory the driver backs and restores), lockable buffers with a
//! discard/no-overwrite discipline, numbered fixed-function texture stages,
//! and a device-lost/reset lifecycle.
//!
//! [`GpuDevice`] is the seam between the engine and a concrete backend. The
//! engine never talks to an API directly; it issues typed commands through
//! this trait, which keeps every component above it testable against the
//! in-crate [`recording`] backend.
//!
//! # Ordering Contract
//!
//! Backends for this API model require that **all** default-pool resources
//! are created before any managed-pool allocation, with managed resources
//! evicted immediately beforehand. The
//! [`ResourceRefs`](crate::resources::ResourceRefs) registry enforces this;
//! the trait merely provides [`evict_managed`](GpuDevice::evict_managed).

pub mod recording;
pub mod state;

pub use recording::{FailureScript, RecordingDevice, TraceCommand};
pub use state::{
    BoundTexture, ClampFlags, ColorWriteMask, CullMode, FramebufferBlend, LightKind,
    LightParams, LightingEquation, MaterialColors, PassState, StageOp, StageState,
    StateCommand, UvwSource, ZMode, MAX_LIGHT_SLOTS, MAX_TEXTURE_STAGES,
};

use thiserror::Error;

use crate::config::DisplayConfig;

// ─── Handles ──────────────────────────────────────────────────────────────────

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        pub struct $name(pub(crate) u32);

        impl $name {
            /// Raw backend index.
            #[inline]
            #[must_use]
            pub fn index(self) -> u32 {
                self.0
            }
        }
    };
}

handle_type!(
    /// Backend handle for a vertex buffer.
    VertexBufferId
);
handle_type!(
    /// Backend handle for an index buffer.
    IndexBufferId
);
handle_type!(
    /// Backend handle for an uploaded texture.
    TextureId
);
handle_type!(
    /// Backend handle for an offscreen color render target.
    TargetId
);
handle_type!(
    /// Backend handle for a depth surface, shareable between same-size targets.
    DepthSurfaceId
);

// ─── Pools, Locks, Status ─────────────────────────────────────────────────────

/// Device memory allocation class.
///
/// The two classes have a strict creation-order dependency: every `Default`
/// allocation in the subsystem must precede the first `Managed` allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemoryPool {
    /// Transient device memory. Lost on device reset; cheap to write every
    /// frame. The volatile ring and all render targets live here.
    Default,
    /// Durable driver-backed memory. Survives device reset. Static geometry
    /// and textures live here.
    Managed,
}

/// Buffer locking discipline for writes into default-pool buffers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockMode {
    /// Orphan the previous contents; the driver hands back fresh memory.
    /// Used when the ring wraps to offset zero.
    Discard,
    /// Append without touching bytes the GPU may still be reading.
    NoOverwrite,
}

/// Health of the device as reported by the backend.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceStatus {
    /// Normal operation.
    Healthy,
    /// The device is lost. Frames cannot render until a successful
    /// [`reset`](GpuDevice::reset).
    Lost,
}

/// Backend failure. The engine maps these into
/// [`EmberError`](crate::errors::EmberError) close to the call site.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device is lost; the operation did not execute.
    #[error("device lost")]
    Lost,
    /// The pool or heap had no room for the allocation.
    #[error("out of device memory")]
    OutOfMemory,
    /// A handle did not refer to a live resource.
    #[error("stale or invalid handle: {0}")]
    InvalidHandle(&'static str),
    /// The backend cannot express the requested state or format.
    #[error("unsupported by backend: {0}")]
    Unsupported(&'static str),
    /// Any other backend-reported failure, with its error string.
    #[error("backend error: {0}")]
    Backend(String),
}

// ─── Capabilities ─────────────────────────────────────────────────────────────

/// Hardware capability profile queried once at init.
///
/// Consumed by the pass resolver (stage budget, UVW bounds) and re-exported
/// to external quality-tier selection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceCaps {
    /// Simultaneous texture stages usable in one pass.
    pub max_simultaneous_textures: u32,
    /// Highest authored UVW channel index the hardware can source, plus one.
    pub max_uvw_channels: u32,
    /// Hardware light slots.
    pub max_lights: u32,
    /// Largest supported render-target edge length.
    pub max_target_size: u32,
    /// Whether a usable pixel depth format exists. Init fails fatally
    /// without one.
    pub has_depth_format: bool,
    /// Signed additive framebuffer blending (`AddSigned2x`), required by the
    /// shadow blur composite.
    pub supports_signed_blend: bool,
    /// Block-compressed texture support ([`PixelFormat::Dxt1`]/
    /// [`PixelFormat::Dxt5`]); re-exported to asset quality-tier selection.
    pub supports_compressed_textures: bool,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            max_simultaneous_textures: 8,
            max_uvw_channels: 8,
            max_lights: 8,
            max_target_size: 512,
            has_depth_format: true,
            supports_signed_blend: true,
            supports_compressed_textures: true,
        }
    }
}

// ─── Resource Descriptors ─────────────────────────────────────────────────────

/// Pixel format for textures and target color surfaces.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum PixelFormat {
    /// 8-bit BGRA, the universal fallback.
    #[default]
    Argb8888,
    /// 16-bit, used by the reduced fallback display config.
    Argb4444,
    /// Block-compressed opaque.
    Dxt1,
    /// Block-compressed with alpha.
    Dxt5,
    /// Single-channel luminance.
    Luminance8,
}

/// Depth surface format.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum DepthFormat {
    #[default]
    D24S8,
    D16,
}

/// Descriptor for creating a texture.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub mip_levels: u32,
}

/// Depth attachment choice for an offscreen target.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DepthAttachment {
    /// No depth surface.
    None,
    /// A dedicated depth surface owned by this target.
    Owned(DepthFormat),
    /// A depth surface shared with other same-size targets. Sharing is only
    /// legal between targets of identical width, height and depth format.
    Shared(DepthSurfaceId),
}

/// Descriptor for creating an offscreen render target. Targets always live
/// in the default pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TargetDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub depth: DepthAttachment,
}

/// Viewport rectangle in pixels.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Where draws land.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RenderSurface {
    /// The swap chain backbuffer.
    BackBuffer,
    /// An offscreen target (shadow maps, blur scratch).
    Offscreen(TargetId),
}

/// One indexed draw.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DrawCall {
    pub vertex_buffer: VertexBufferId,
    /// Byte offset of the first vertex (ring-buffer draws use this).
    pub vertex_offset: u32,
    pub stride: u32,
    pub index_buffer: IndexBufferId,
    pub first_index: u32,
    pub index_count: u32,
    pub base_vertex: i32,
}

// ─── The Device Trait ─────────────────────────────────────────────────────────

/// The backend seam. One implementation per concrete API; the in-crate
/// [`RecordingDevice`] records the command stream for tests and tracing.
///
/// All methods are infallible bookkeeping or return [`DeviceError`];
/// implementations never panic on bad input.
pub trait GpuDevice {
    /// Capability profile. Stable for the lifetime of the device.
    fn caps(&self) -> &DeviceCaps;

    /// Current device health. Polled by the frame controller at frame
    /// boundaries and after any `Lost` error.
    fn status(&self) -> DeviceStatus;

    /// Attempt to reset a lost device into the given display configuration.
    fn reset(&mut self, display: &DisplayConfig) -> Result<(), DeviceError>;

    // ── Buffers ────────────────────────────────────────────────────────────

    fn create_vertex_buffer(
        &mut self,
        pool: MemoryPool,
        byte_size: u32,
    ) -> Result<VertexBufferId, DeviceError>;

    fn create_index_buffer(
        &mut self,
        pool: MemoryPool,
        byte_size: u32,
    ) -> Result<IndexBufferId, DeviceError>;

    /// Write bytes into a vertex buffer. Default-pool buffers require a
    /// [`LockMode`]; managed buffers ignore it.
    fn write_vertex_buffer(
        &mut self,
        buffer: VertexBufferId,
        byte_offset: u32,
        data: &[u8],
        lock: LockMode,
    ) -> Result<(), DeviceError>;

    fn write_index_buffer(
        &mut self,
        buffer: IndexBufferId,
        byte_offset: u32,
        data: &[u8],
    ) -> Result<(), DeviceError>;

    fn destroy_vertex_buffer(&mut self, buffer: VertexBufferId);
    fn destroy_index_buffer(&mut self, buffer: IndexBufferId);

    // ── Textures & Targets ─────────────────────────────────────────────────

    fn create_texture(
        &mut self,
        pool: MemoryPool,
        desc: &TextureDesc,
    ) -> Result<TextureId, DeviceError>;

    fn upload_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), DeviceError>;

    fn destroy_texture(&mut self, texture: TextureId);

    fn create_target(&mut self, desc: &TargetDesc) -> Result<TargetId, DeviceError>;

    fn create_shared_depth(
        &mut self,
        width: u32,
        height: u32,
        format: DepthFormat,
    ) -> Result<DepthSurfaceId, DeviceError>;

    fn destroy_target(&mut self, target: TargetId);
    fn destroy_shared_depth(&mut self, depth: DepthSurfaceId);

    /// Evict all managed-pool resources from device memory. Must be called
    /// immediately before the transient creation phase.
    fn evict_managed(&mut self);

    // ── Frame Bracket ──────────────────────────────────────────────────────

    fn begin_frame(&mut self) -> Result<(), DeviceError>;

    /// Present / flip. The only point at which an implicit GPU fence is
    /// honored.
    fn end_frame(&mut self) -> Result<(), DeviceError>;

    fn set_target(&mut self, surface: RenderSurface) -> Result<(), DeviceError>;

    fn set_viewport(&mut self, viewport: Viewport) -> Result<(), DeviceError>;

    fn clear(
        &mut self,
        color: Option<[f32; 4]>,
        depth: Option<f32>,
    ) -> Result<(), DeviceError>;

    // ── State & Draw ───────────────────────────────────────────────────────

    /// Apply one granular state write. Failures are logged by the caller
    /// with the backend's error string and do not stop the frame.
    fn apply(&mut self, command: &StateCommand) -> Result<(), DeviceError>;

    fn draw(&mut self, call: &DrawCall) -> Result<(), DeviceError>;
}
