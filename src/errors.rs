//! Error Types
//!
//! This module defines the error types used throughout the engine.
//!
//! # Overview
//!
//! The main error type [`EmberError`] covers all failure modes including:
//! - Pipeline initialization failures (no compatible device, no depth format)
//! - GPU resource creation and upload errors
//! - Device-loss and recovery errors
//!
//! Failures are graded: a bad material or an exhausted target pool is a
//! per-frame condition handled close to its origin (the span or shadow slave
//! is skipped); only device loss travels up to the frame controller. Nothing
//! in this crate panics across component boundaries.
//!
//! # Usage
//!
//! All public APIs return [`Result<T>`] which is an alias for
//! `std::result::Result<T, EmberError>`.

use thiserror::Error;

use crate::device::DeviceError;

/// The main error type for the Ember render engine.
///
/// Each variant provides specific context about what went wrong.
#[derive(Error, Debug)]
pub enum EmberError {
    // ========================================================================
    // Fatal Initialization Errors
    // ========================================================================
    /// No compatible graphics device was found during pipeline init.
    #[error("No compatible graphics device: {0}")]
    NoCompatibleDevice(String),

    /// The device reports no usable pixel depth format.
    #[error("No usable depth format (device offers none of the required formats)")]
    NoDepthFormat,

    /// The device capability profile is below the supported minimum.
    #[error("Device capabilities below minimum: {0}")]
    InsufficientCaps(String),

    // ========================================================================
    // Resource Lifecycle Errors
    // ========================================================================
    /// A managed-pool allocation was attempted before the transient-resource
    /// creation phase completed. The backend treats that ordering as
    /// undefined behavior, so it is surfaced as a hard error here.
    #[error("Managed allocation before transient phase completed: {0}")]
    TransientPhaseIncomplete(&'static str),

    /// A GPU resource could not be created or refilled.
    ///
    /// Callers treat this as non-fatal: the span or texture is skipped for
    /// the current frame.
    #[error("Resource creation failed for {context}: {source}")]
    ResourceCreation {
        /// What was being created.
        context: &'static str,
        /// Backend failure.
        source: DeviceError,
    },

    /// A volatile append exceeded the ring buffer's total capacity.
    #[error("Volatile append of {requested} bytes exceeds ring capacity of {capacity} bytes")]
    RingOverCapacity {
        /// Bytes requested by the append.
        requested: u32,
        /// Total ring capacity.
        capacity: u32,
    },

    // ========================================================================
    // Device Errors
    // ========================================================================
    /// The device was lost; the current frame is aborted and the recovery
    /// sequence takes over before the next frame proceeds.
    #[error("Graphics device lost")]
    DeviceLost,

    /// Device reset retries were exhausted and the fallback display
    /// configuration also failed.
    #[error("Device recovery failed after {attempts} reset attempts")]
    RecoveryFailed {
        /// Number of reset attempts made before giving up.
        attempts: u32,
    },

    /// Any other backend failure.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}

impl EmberError {
    /// Whether this error is device loss in any wrapping — the one
    /// condition that must abort the frame rather than skip a span.
    #[must_use]
    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            EmberError::DeviceLost
                | EmberError::Device(DeviceError::Lost)
                | EmberError::ResourceCreation {
                    source: DeviceError::Lost,
                    ..
                }
        )
    }
}

/// Alias for `Result<T, EmberError>`.
pub type Result<T> = std::result::Result<T, EmberError>;
