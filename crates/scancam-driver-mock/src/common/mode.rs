//! Operational modes for mock devices.
//!
//! - **Instant**: Moves and captures complete without delay
//! - **Realistic**: Moves take as long as the configured target speed implies

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests
    Realistic,
}
