//! Ember: a frame-lifecycle and render-state resolution engine.
//!
//! The crate turns a culled, sorted list of drawable spans — with their
//! materials, lights and shadow-caster submissions — into a minimal,
//! correctly ordered stream of GPU state changes and draw calls, while
//! managing GPU resource lifetime across device-loss events.
//!
//! The four load-bearing pieces:
//!
//! - [`resources`]: ResourceRef registry, volatile vertex ring and
//!   render-target pool, with the strict transient-before-managed
//!   allocation ordering the backend demands.
//! - [`material`]: multi-layer pass resolution, the force-on/force-off
//!   override algebra, and the state-diff engine that suppresses redundant
//!   device writes.
//! - [`shadow`]: per-frame shadow slaves — map generation, the two-stage
//!   penumbra blur, and multiplicative projection back onto the scene.
//! - [`frame`]: the [`Renderer`](frame::Renderer) context object that
//!   sequences it all and runs device-loss recovery.
//!
//! The GPU itself sits behind [`device::GpuDevice`]; the in-crate
//! [`device::RecordingDevice`] records the command stream for tracing and
//! tests.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod device;
pub mod errors;
pub mod frame;
pub mod geometry;
pub mod material;
pub mod resources;
pub mod scene;
pub mod shadow;

pub use config::{DisplayConfig, RendererSettings, RetryPolicy};
pub use device::{DeviceCaps, GpuDevice, RecordingDevice};
pub use errors::{EmberError, Result};
pub use frame::{FrameEvent, FrameReport, Renderer};
pub use geometry::{GeometryBuffer, VertexLayout};
pub use material::{Layer, Material, MaterialStore, PassResolver, StateDiffer, TextureStore};
pub use scene::{FrameInput, VisibleSpan};
pub use shadow::ShadowPipeline;
