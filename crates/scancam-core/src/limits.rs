//! Shared hard limits and default timings for the rig.
//!
//! This module centralizes:
//! - Physical limits of the depth axis and camera clips
//! - Timeout durations for stage actions and device replies
//! - Retry counts for the settings handshake and camera invocations
//!
//! Configuration defaults are built from these constants so that a missing
//! config key and the documented default can never drift apart.

use std::time::Duration;

// =============================================================================
// Motion Limits
// =============================================================================

/// Fastest depth-axis speed the rig may use during a depth sweep (mm/s).
pub const MAX_Z_MOVE_SPEED: f64 = 3.0;

/// Depth-axis speed restored before every ordinary positioning move (mm/s).
pub const STANDARD_Z_SPEED: f64 = 1.0;

/// Longest clip the camera is asked to record (seconds).
pub const MAX_CLIP_LENGTH: f64 = 60.0;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default budget for a stage or stage group to finish an action (100 seconds).
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 100;

/// Default deadline for a blocking request to receive its reply (5 seconds).
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 5;

/// Timeout for graceful shutdown operations (2 seconds).
///
/// Used when stopping the transport reader task to allow in-flight replies to
/// drain before forcing termination.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Retry Limits
// =============================================================================

/// Attempts for each blocking settings query during the handshake.
pub const BLOCKING_RETRIES: u32 = 3;

/// Attempts for each camera invocation before giving up.
pub const MAX_CAMERA_TRIES: u32 = 3;

/// Resend attempts after a busy reply before the request is failed.
pub const MAX_BUSY_RETRIES: u32 = 5;

/// Convert a whole-second timeout into a [`Duration`].
pub fn secs(timeout_secs: u64) -> Duration {
    Duration::from_secs(timeout_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_limits_are_ordered() {
        assert!(STANDARD_Z_SPEED < MAX_Z_MOVE_SPEED);
        assert!(MAX_CLIP_LENGTH > 0.0);
    }

    #[test]
    fn test_secs() {
        assert_eq!(secs(100), Duration::from_secs(100));
        assert_eq!(secs(0), Duration::ZERO);
    }
}
