//! Binary-protocol stepper stage driver for scancam.
//!
//! This crate talks to a daisy chain of stepper controllers over one serial
//! line:
//! - [`packet`]: the six-byte frame codec
//! - [`protocol`]: command, setting and error tables
//! - [`transport`]: the shared serial link and its reader task
//! - [`device`]: the per-axis queue and reply state machine
//! - [`stage_set`]: a named group of stages moved together
//!
//! # Usage
//!
//! ```rust,ignore
//! use scancam_driver_zaber::{SerialTransport, StageSet};
//!
//! let transport = SerialTransport::open(&config.serial).await?;
//! let stages = StageSet::connect(&config, transport).await?;
//! stages.move_group(&[("X", 60.0), ("theta", 90.0)], true).await?;
//! ```

pub mod device;
pub mod meta;
pub mod packet;
pub mod protocol;
pub mod stage_set;
pub mod transport;
pub mod units;

#[cfg(test)]
mod testing;

pub use device::{DeviceOptions, FaultRecord, ZaberDevice};
pub use meta::{MetaCommand, MetaStep};
pub use packet::Packet;
pub use protocol::{BaseCommand, CommandKind, DeviceFault, ErrorCode, MoveCommand, Setting};
pub use stage_set::StageSet;
pub use transport::{available_ports, PacketHandler, SerialTransport, Transport};
pub use units::UnitScale;
