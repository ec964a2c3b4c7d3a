//! Device-Loss Recovery
//!
//! An explicit state machine replaces the nested sleep/retry loops the
//! problem usually attracts: `Healthy → Lost → Resetting{attempt} →
//! (Healthy | FallbackDefaults)`. Timing is data — the machine reports how
//! long to wait, the embedder decides how; the library never sleeps.
//!
//! Retries are bounded by the injected [`RetryPolicy`]. When they are
//! exhausted, one final reset is attempted with the reduced default display
//! configuration; only if that also fails does recovery report failure.

use std::time::Duration;

use log::{info, warn};

use crate::config::{DisplayConfig, RetryPolicy};
use crate::device::GpuDevice;

/// Where recovery stands.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecoveryState {
    /// Device healthy; frames render normally.
    Healthy,
    /// Loss detected; no reset attempted yet.
    Lost,
    /// Reset attempts in progress.
    Resetting {
        /// Attempts made so far.
        attempt: u32,
    },
    /// Retries exhausted and the fallback configuration also failed.
    FallbackFailed,
}

/// What the frame controller should do this frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecoveryStep {
    /// Proceed with rendering.
    Rendering,
    /// Skip this frame; retry after the given delay.
    Waiting(Duration),
    /// A reset just succeeded. Recreate transient resources and broadcast
    /// the recreation notice before rendering again.
    Recovered {
        /// Whether the reduced fallback display configuration had to be
        /// used.
        fell_back: bool,
    },
    /// Recovery is impossible; shut down.
    Failed,
}

/// The recovery state machine.
pub struct DeviceRecovery {
    state: RecoveryState,
    policy: RetryPolicy,
}

impl DeviceRecovery {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: RecoveryState::Healthy,
            policy,
        }
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Record a device-lost signal. Idempotent while already recovering.
    pub fn mark_lost(&mut self) {
        if self.state == RecoveryState::Healthy {
            warn!("graphics device lost; entering recovery");
            self.state = RecoveryState::Lost;
        }
    }

    /// Drive the machine one step. Call once per frame attempt; the caller
    /// must have released all default-pool resources before the first step
    /// after a loss.
    pub fn step(
        &mut self,
        device: &mut dyn GpuDevice,
        display: &DisplayConfig,
    ) -> RecoveryStep {
        match self.state {
            RecoveryState::Healthy => RecoveryStep::Rendering,
            RecoveryState::FallbackFailed => RecoveryStep::Failed,
            RecoveryState::Lost => {
                self.state = RecoveryState::Resetting { attempt: 0 };
                self.try_reset(device, display)
            }
            RecoveryState::Resetting { .. } => self.try_reset(device, display),
        }
    }

    fn try_reset(&mut self, device: &mut dyn GpuDevice, display: &DisplayConfig) -> RecoveryStep {
        let RecoveryState::Resetting { attempt } = self.state else {
            return RecoveryStep::Failed;
        };

        if attempt >= self.policy.max_attempts {
            // Last resort: the reduced default configuration.
            let fallback = DisplayConfig::reduced_default();
            return if device.reset(&fallback).is_ok() {
                info!(
                    "device reset succeeded on fallback {}x{} after {attempt} attempts",
                    fallback.width, fallback.height
                );
                self.state = RecoveryState::Healthy;
                RecoveryStep::Recovered { fell_back: true }
            } else {
                warn!("device reset failed even on fallback defaults");
                self.state = RecoveryState::FallbackFailed;
                RecoveryStep::Failed
            };
        }

        if device.reset(display).is_ok() {
            info!("device reset succeeded after {attempt} retr{}", if attempt == 1 { "y" } else { "ies" });
            self.state = RecoveryState::Healthy;
            RecoveryStep::Recovered { fell_back: false }
        } else {
            let delay = self.policy.delay_before(attempt);
            self.state = RecoveryState::Resetting {
                attempt: attempt + 1,
            };
            RecoveryStep::Waiting(delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCaps, DeviceStatus, FailureScript, RecordingDevice};

    fn lost_device(fail_resets: u32) -> RecordingDevice {
        let mut device = RecordingDevice::with_script(
            DeviceCaps::default(),
            FailureScript {
                lose_at_frame: Some(0),
                fail_resets,
                ..Default::default()
            },
        );
        assert!(device.begin_frame().is_err());
        assert_eq!(device.status(), DeviceStatus::Lost);
        device
    }

    #[test]
    fn recovers_after_scripted_failures() {
        let mut device = lost_device(2);
        let mut recovery = DeviceRecovery::new(RetryPolicy {
            max_attempts: 8,
            base_delay: Duration::from_millis(10),
        });
        recovery.mark_lost();

        let display = DisplayConfig::default();
        assert!(matches!(
            recovery.step(&mut device, &display),
            RecoveryStep::Waiting(_)
        ));
        assert!(matches!(
            recovery.step(&mut device, &display),
            RecoveryStep::Waiting(_)
        ));
        assert_eq!(
            recovery.step(&mut device, &display),
            RecoveryStep::Recovered { fell_back: false }
        );
        assert_eq!(recovery.state(), RecoveryState::Healthy);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let mut device = lost_device(3);
        let mut recovery = DeviceRecovery::new(RetryPolicy {
            max_attempts: 8,
            base_delay: Duration::from_millis(100),
        });
        recovery.mark_lost();
        let display = DisplayConfig::default();

        let RecoveryStep::Waiting(first) = recovery.step(&mut device, &display) else {
            panic!("expected waiting");
        };
        let RecoveryStep::Waiting(second) = recovery.step(&mut device, &display) else {
            panic!("expected waiting");
        };
        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(second, Duration::from_millis(200));
    }

    #[test]
    fn exhausted_retries_fall_back_to_reduced_defaults() {
        // Fails the 2 normal attempts; the fallback reset then succeeds.
        let mut device = lost_device(2);
        let mut recovery = DeviceRecovery::new(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        });
        recovery.mark_lost();
        let display = DisplayConfig::default();

        assert!(matches!(recovery.step(&mut device, &display), RecoveryStep::Waiting(_)));
        assert!(matches!(recovery.step(&mut device, &display), RecoveryStep::Waiting(_)));
        assert_eq!(
            recovery.step(&mut device, &display),
            RecoveryStep::Recovered { fell_back: true }
        );
    }

    #[test]
    fn fallback_failure_is_terminal() {
        let mut device = lost_device(3);
        let mut recovery = DeviceRecovery::new(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        });
        recovery.mark_lost();
        let display = DisplayConfig::default();

        assert!(matches!(recovery.step(&mut device, &display), RecoveryStep::Waiting(_)));
        assert!(matches!(recovery.step(&mut device, &display), RecoveryStep::Waiting(_)));
        assert_eq!(recovery.step(&mut device, &display), RecoveryStep::Failed);
        assert_eq!(recovery.step(&mut device, &display), RecoveryStep::Failed);
    }

    #[test]
    fn healthy_machine_just_renders() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        let mut recovery = DeviceRecovery::new(RetryPolicy::default());
        assert_eq!(
            recovery.step(&mut device, &DisplayConfig::default()),
            RecoveryStep::Rendering
        );
    }
}
