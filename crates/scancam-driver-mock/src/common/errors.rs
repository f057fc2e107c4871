//! Error injection framework for the emulated chain.
//!
//! Scenarios are matched against every frame the chain receives, in order.
//! The first scenario that applies decides the frame's fate.

use parking_lot::Mutex;
use std::sync::Arc;

/// A failure the chain can be told to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorScenario {
    /// Answer the next `times` frames to `address` with a busy error.
    Busy {
        /// Device address
        address: u8,
        /// Number of busy replies before the device recovers
        times: u32,
    },
    /// Answer every `command` frame to `address` with an error reply.
    Reject {
        /// Device address
        address: u8,
        /// Command code to reject
        command: u8,
        /// Sub-code carried in the error reply
        subcode: i32,
    },
    /// Never answer frames to `address`.
    Silent {
        /// Device address
        address: u8,
    },
}

/// What the chain should do with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injected {
    /// Process normally
    Pass,
    /// Reply busy
    Busy,
    /// Reply with an error sub-code
    Reject(i32),
    /// Swallow the frame
    Drop,
}

/// Error injection configuration for the mock chain
#[derive(Clone, Debug, Default)]
pub struct ErrorConfig {
    scenarios: Arc<Vec<ErrorScenario>>,
    /// Busy replies already produced, per scenario index
    busy_counts: Arc<Mutex<Vec<u32>>>,
}

impl ErrorConfig {
    /// No injected errors (default)
    pub fn none() -> Self {
        Self::default()
    }

    /// A single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios, checked in order
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        let counts = vec![0; scenarios.len()];
        Self {
            scenarios: Arc::new(scenarios),
            busy_counts: Arc::new(Mutex::new(counts)),
        }
    }

    /// Decide the fate of a frame.
    pub fn check(&self, address: u8, command: u8) -> Injected {
        let mut counts = self.busy_counts.lock();
        for (idx, scenario) in self.scenarios.iter().enumerate() {
            match *scenario {
                ErrorScenario::Silent { address: a } if a == address => return Injected::Drop,
                ErrorScenario::Reject {
                    address: a,
                    command: c,
                    subcode,
                } if a == address && c == command => return Injected::Reject(subcode),
                ErrorScenario::Busy { address: a, times } if a == address => {
                    if counts[idx] < times {
                        counts[idx] += 1;
                        return Injected::Busy;
                    }
                }
                _ => {}
            }
        }
        Injected::Pass
    }

    /// Busy replies produced so far across all scenarios.
    pub fn busy_replies(&self) -> u32 {
        self.busy_counts.lock().iter().sum()
    }
}
