//! Common infrastructure for mock devices.
//!
//! - **mode**: Operational modes (Instant, Realistic)
//! - **errors**: Error injection for the emulated chain

pub mod errors;
pub mod mode;

pub use errors::{ErrorConfig, ErrorScenario, Injected};
pub use mode::MockMode;
