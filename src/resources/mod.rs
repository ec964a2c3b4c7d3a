//! GPU Resource Lifecycle
//!
//! Three tightly-coupled pieces:
//!
//! - [`refs`]: the ResourceRef registry mapping logical objects to backend
//!   handles, with the transient-before-managed creation-order invariant.
//! - [`ring`]: the shared volatile vertex ring with generation-counter
//!   staleness guarding.
//! - [`targets`]: the pre-allocated offscreen render-target pool with
//!   power-of-two buckets and shared depth surfaces.

pub mod refs;
pub mod ring;
pub mod targets;

pub use refs::{ResourceRefs, VertexBinding};
pub use ring::{RingSlice, VolatileRing};
pub use targets::{AcquiredTarget, PoolTargetId, RenderTargetPool};
