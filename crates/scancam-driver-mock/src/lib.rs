//! Mock hardware for scancam.
//!
//! Simulated devices for testing without a rig. All delays use
//! `tokio::time`, so tests can run with a paused clock.
//!
//! # Available Mocks
//!
//! - [`MockChain`] - Emulated stage controller chain on an in-memory link
//! - [`MockCamera`] - Camera that records capture requests
//!
//! # Example
//!
//! ```rust,ignore
//! use scancam_driver_mock::MockChain;
//! use scancam_driver_zaber::StageSet;
//!
//! let (chain, transport) = MockChain::builder().axis(1).axis(2).axis(3).connect();
//! let stages = StageSet::connect(&config, transport).await?;
//! ```

pub mod common;
mod mock_camera;
mod mock_chain;

pub use common::{ErrorConfig, ErrorScenario, Injected, MockMode};
pub use mock_camera::{MockCamera, Recording};
pub use mock_chain::{MockAxisConfig, MockChain, MockChainBuilder};
