//! Geometry Buffers & Vertex Layouts
//!
//! [`GeometryBuffer`] is the logical CPU-side vertex/index run handed to the
//! renderer by the drawable layer. The renderer never owns these; it keeps a
//! [`ResourceRef`](crate::resources::ResourceRefs) per buffer mapping it to a
//! backend resource.
//!
//! The vertex layout is a closed description over the fixed set of attributes
//! this pipeline supports. Stride and attribute offsets are computed by
//! exhaustive match — there is deliberately no open-ended format registry.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a logical geometry buffer, used as the resource
/// registry key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GeometryBufferId(u64);

// ─── Vertex Layout ────────────────────────────────────────────────────────────

/// Skin weight configuration of a vertex layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum SkinWeights {
    /// Rigid geometry.
    #[default]
    None,
    /// One weight per vertex.
    One,
    /// Two weights per vertex.
    Two,
    /// Three weights per vertex.
    Three,
}

impl SkinWeights {
    /// Number of weight floats per vertex.
    #[must_use]
    pub fn count(self) -> u32 {
        match self {
            Self::None => 0,
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }
}

/// The fixed vertex attribute set: position, normal, packed diffuse and
/// specular colors, 0–8 UVW channels, optional skin weights and indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct VertexLayout {
    /// Number of 3-float UVW channels (0–8).
    pub uvw_count: u8,
    /// Skin weight configuration.
    pub weights: SkinWeights,
    /// Whether a packed 4×u8 bone-index word follows the weights.
    pub weight_indices: bool,
}

/// Maximum authored UVW channels per vertex.
pub const MAX_UVW_CHANNELS: u8 = 8;

impl VertexLayout {
    /// A rigid layout with the given UVW channel count.
    #[must_use]
    pub fn rigid(uvw_count: u8) -> Self {
        Self {
            uvw_count: uvw_count.min(MAX_UVW_CHANNELS),
            weights: SkinWeights::None,
            weight_indices: false,
        }
    }

    /// A skinned layout.
    #[must_use]
    pub fn skinned(uvw_count: u8, weights: SkinWeights, weight_indices: bool) -> Self {
        Self {
            uvw_count: uvw_count.min(MAX_UVW_CHANNELS),
            weights,
            weight_indices,
        }
    }

    /// Byte stride of one vertex.
    ///
    /// position (3×f32) + weights (n×f32) + indices (u32, optional) +
    /// normal (3×f32) + diffuse (u32) + specular (u32) + uvw (n×3×f32).
    #[must_use]
    pub fn stride(&self) -> u32 {
        let mut stride = 12; // position
        stride += self.weights.count() * 4;
        if self.weight_indices {
            stride += 4;
        }
        stride += 12; // normal
        stride += 4 + 4; // packed diffuse + specular
        stride += u32::from(self.uvw_count) * 12;
        stride
    }
}

impl Default for VertexLayout {
    fn default() -> Self {
        Self::rigid(1)
    }
}

// ─── Geometry Buffer ──────────────────────────────────────────────────────────

/// A contiguous run of vertices and indices with a fixed layout.
///
/// `volatile` buffers are regenerated by their owner every frame
/// (software-skinned, particle or decal geometry) and never own a dedicated
/// device allocation; they borrow ring space when visible. Static buffers
/// upload once and are only re-uploaded after an explicit
/// [`invalidate`](Self::invalidate).
#[derive(Debug)]
pub struct GeometryBuffer {
    id: GeometryBufferId,
    layout: VertexLayout,
    vertex_data: Vec<u8>,
    indices: Vec<u16>,
    volatile: bool,
    version: u64,
}

impl GeometryBuffer {
    #[must_use]
    pub fn new(layout: VertexLayout, volatile: bool) -> Self {
        Self {
            id: GeometryBufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed)),
            layout,
            vertex_data: Vec::new(),
            indices: Vec::new(),
            volatile,
            version: 1,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> GeometryBufferId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn layout(&self) -> VertexLayout {
        self.layout
    }

    #[inline]
    #[must_use]
    pub fn is_volatile(&self) -> bool {
        self.volatile
    }

    #[inline]
    #[must_use]
    pub fn vertex_data(&self) -> &[u8] {
        &self.vertex_data
    }

    #[inline]
    #[must_use]
    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    /// Current content version. Bumped by every mutation; the resource
    /// registry compares it against the last uploaded version.
    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn vertex_count(&self) -> u32 {
        let stride = self.layout.stride();
        if stride == 0 {
            return 0;
        }
        self.vertex_data.len() as u32 / stride
    }

    /// Replace the vertex bytes. Length must be a multiple of the layout
    /// stride; trailing partial vertices are truncated.
    pub fn set_vertex_data(&mut self, data: Vec<u8>) {
        let stride = self.layout.stride() as usize;
        let whole = (data.len() / stride) * stride;
        self.vertex_data = data;
        self.vertex_data.truncate(whole);
        self.version += 1;
    }

    pub fn set_indices(&mut self, indices: Vec<u16>) {
        self.indices = indices;
        self.version += 1;
    }

    /// Force a static buffer to re-upload on its next ensure.
    pub fn invalidate(&mut self) {
        self.version += 1;
    }
}
