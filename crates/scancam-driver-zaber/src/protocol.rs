//! Binary controller command tables
//!
//! Every request is `(address, command, data)` and every reply echoes the
//! command code. Error replies use command 255 with the sub-error code in
//! `data`. The codes below are fixed by the controller firmware.
//!
//! The tables are static: each command kind maps to one code and one name,
//! and reverse lookups go through the same tables.

use std::fmt;

/// Command code of an error reply.
pub const ERROR_REPLY: u8 = 255;

// =============================================================================
// Base Commands
// =============================================================================

/// Commands that are neither moves nor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)] // Controller manual names
pub enum BaseCommand {
    Reset = 0,
    Home = 1,
    Renumber = 2,
    StoreCurrentPosition = 16,
    ReturnStoredPosition = 17,
    ReadOrWriteMemory = 35,
    RestoreSettings = 36,
    ReturnSetting = 53,
    EchoData = 55,
    ReturnCurrentPosition = 60,
}

static BASE_COMMANDS: &[(BaseCommand, &str)] = &[
    (BaseCommand::Reset, "reset"),
    (BaseCommand::Home, "home"),
    (BaseCommand::Renumber, "renumber"),
    (BaseCommand::StoreCurrentPosition, "store_current_position"),
    (BaseCommand::ReturnStoredPosition, "return_stored_position"),
    (BaseCommand::ReadOrWriteMemory, "read_or_write_memory"),
    (BaseCommand::RestoreSettings, "restore_settings"),
    (BaseCommand::ReturnSetting, "return_setting"),
    (BaseCommand::EchoData, "echo_data"),
    (BaseCommand::ReturnCurrentPosition, "return_current_position"),
];

// =============================================================================
// Move Commands
// =============================================================================

/// Commands that start or stop motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)] // Controller manual names
pub enum MoveCommand {
    StoredPosition = 18,
    Absolute = 20,
    Relative = 21,
    ConstantSpeed = 22,
    Stop = 23,
}

static MOVE_COMMANDS: &[(MoveCommand, &str)] = &[
    (MoveCommand::StoredPosition, "stored_position"),
    (MoveCommand::Absolute, "absolute"),
    (MoveCommand::Relative, "relative"),
    (MoveCommand::ConstantSpeed, "constant_speed"),
    (MoveCommand::Stop, "stop"),
];

// =============================================================================
// Settings
// =============================================================================

/// Device settings. Writing uses the setting code directly; reading goes
/// through [`BaseCommand::ReturnSetting`] with the setting code as data.
///
/// Codes 46 (max relative move) and 49 (lock state) are left out because
/// some controllers on the chain do not implement them, which would stall
/// the initial settings handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
#[allow(missing_docs)] // Controller manual names
pub enum Setting {
    MicrostepResolution = 37,
    RunningCurrent = 38,
    HoldCurrent = 39,
    DeviceMode = 40,
    TargetSpeed = 42,
    Acceleration = 43,
    MaximumRange = 44,
    CurrentPosition = 45,
    HomeOffset = 47,
    AliasNumber = 48,
}

static SETTINGS: &[(Setting, &str)] = &[
    (Setting::MicrostepResolution, "microstep_resolution"),
    (Setting::RunningCurrent, "running_current"),
    (Setting::HoldCurrent, "hold_current"),
    (Setting::DeviceMode, "device_mode"),
    (Setting::TargetSpeed, "target_speed"),
    (Setting::Acceleration, "acceleration"),
    (Setting::MaximumRange, "maximum_range"),
    (Setting::CurrentPosition, "current_position"),
    (Setting::HomeOffset, "home_offset"),
    (Setting::AliasNumber, "alias_number"),
];

macro_rules! impl_table {
    ($ty:ty, $table:ident) => {
        impl $ty {
            /// Wire code.
            pub fn code(self) -> u8 {
                self as u8
            }

            /// Look up a kind by wire code.
            pub fn from_code(code: u8) -> Option<Self> {
                $table.iter().find(|(k, _)| k.code() == code).map(|(k, _)| *k)
            }

            /// Look up a kind by its table name.
            pub fn from_name(name: &str) -> Option<Self> {
                $table.iter().find(|(_, n)| *n == name).map(|(k, _)| *k)
            }

            /// Table name.
            pub fn name(self) -> &'static str {
                $table
                    .iter()
                    .find(|(k, _)| *k == self)
                    .map(|(_, n)| *n)
                    .unwrap_or("unknown")
            }

            /// Every entry of the table, in code order.
            pub fn all() -> impl Iterator<Item = Self> {
                $table.iter().map(|(k, _)| *k)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} ({})", self.name(), self.code())
            }
        }
    };
}

impl_table!(BaseCommand, BASE_COMMANDS);
impl_table!(MoveCommand, MOVE_COMMANDS);
impl_table!(Setting, SETTINGS);

impl Setting {
    /// Number of settings read during the initial handshake.
    pub fn count() -> usize {
        SETTINGS.len()
    }
}

// =============================================================================
// Command Kind
// =============================================================================

/// Any command the device understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Base command
    Base(BaseCommand),
    /// Move command
    Move(MoveCommand),
    /// Setting write (or a setting reply)
    Setting(Setting),
}

impl CommandKind {
    /// Wire code.
    pub fn code(self) -> u8 {
        match self {
            CommandKind::Base(c) => c.code(),
            CommandKind::Move(c) => c.code(),
            CommandKind::Setting(s) => s.code(),
        }
    }

    /// Classify a wire code. Returns `None` for codes outside the tables,
    /// including [`ERROR_REPLY`].
    pub fn from_code(code: u8) -> Option<Self> {
        BaseCommand::from_code(code)
            .map(CommandKind::Base)
            .or_else(|| MoveCommand::from_code(code).map(CommandKind::Move))
            .or_else(|| Setting::from_code(code).map(CommandKind::Setting))
    }

    /// Table name.
    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Base(c) => c.name(),
            CommandKind::Move(c) => c.name(),
            CommandKind::Setting(s) => s.name(),
        }
    }

    /// Whether this kind starts, redirects or stops motion.
    pub fn is_move(self) -> bool {
        matches!(self, CommandKind::Move(_))
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

// =============================================================================
// Error Codes
// =============================================================================

/// Named sub-error codes carried in error replies.
///
/// Sub-codes that are not named here are plain command codes, meaning
/// "invalid data for this command".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Another command is still executing; resend later
    Busy,
    /// Save Current Position register out of range
    SavePositionInvalid,
    /// Save Current Position issued before homing
    SavePositionNotHomed,
    /// Return Stored Position register out of range
    ReturnPositionInvalid,
    /// Move To Stored Position register out of range
    MovePositionInvalid,
    /// Move To Stored Position issued before homing
    MovePositionNotHomed,
    /// Relative move would pass a travel limit
    RelativePositionLimited,
    /// Settings are locked
    SettingsLocked,
    /// Bit 8 of device mode cannot be set on this device
    DisableAutoHomeInvalid,
    /// Bit 10 of device mode is reserved
    Bit10Invalid,
    /// Bit 12 of device mode is not supported
    HomeSwitchInvalid,
    /// Bit 13 of device mode is reserved
    Bit13Invalid,
}

static ERROR_CODES: &[(ErrorCode, i32, &str)] = &[
    (ErrorCode::Busy, 255, "busy"),
    (ErrorCode::SavePositionInvalid, 1600, "save_position_invalid"),
    (ErrorCode::SavePositionNotHomed, 1601, "save_position_not_homed"),
    (ErrorCode::ReturnPositionInvalid, 1700, "return_position_invalid"),
    (ErrorCode::MovePositionInvalid, 1800, "move_position_invalid"),
    (ErrorCode::MovePositionNotHomed, 1801, "move_position_not_homed"),
    (ErrorCode::RelativePositionLimited, 2146, "relative_position_limited"),
    (ErrorCode::SettingsLocked, 3600, "settings_locked"),
    (ErrorCode::DisableAutoHomeInvalid, 4008, "disable_auto_home_invalid"),
    (ErrorCode::Bit10Invalid, 4010, "bit_10_invalid"),
    (ErrorCode::HomeSwitchInvalid, 4012, "home_switch_invalid"),
    (ErrorCode::Bit13Invalid, 4013, "bit_13_invalid"),
];

impl ErrorCode {
    /// Sub-error value on the wire.
    pub fn value(self) -> i32 {
        ERROR_CODES
            .iter()
            .find(|(c, _, _)| *c == self)
            .map(|(_, v, _)| *v)
            .unwrap_or(-1)
    }

    /// Look up a named sub-error.
    pub fn from_value(value: i32) -> Option<Self> {
        ERROR_CODES
            .iter()
            .find(|(_, v, _)| *v == value)
            .map(|(c, _, _)| *c)
    }

    /// Table name.
    pub fn name(self) -> &'static str {
        ERROR_CODES
            .iter()
            .find(|(c, _, _)| *c == self)
            .map(|(_, _, n)| *n)
            .unwrap_or("unknown")
    }
}

/// Sub-code value of a busy error reply.
pub const BUSY: i32 = 255;

/// A decoded error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// The device is still executing a previous command.
    Busy,
    /// A command was rejected. `kind` is the command the sub-code refers to,
    /// found either as the sub-code itself or as `subcode / 100`.
    Rejected {
        /// Command the error belongs to
        kind: CommandKind,
        /// Raw sub-code
        subcode: i32,
    },
    /// A sub-code that maps to no known command.
    Unknown(i32),
}

impl DeviceFault {
    /// Decode the `data` field of an error reply.
    pub fn classify(subcode: i32) -> Self {
        if subcode == BUSY {
            return DeviceFault::Busy;
        }
        let direct = u8::try_from(subcode).ok().and_then(CommandKind::from_code);
        let category = u8::try_from(subcode / 100)
            .ok()
            .filter(|_| subcode >= 100)
            .and_then(CommandKind::from_code);
        match direct.or(category) {
            Some(kind) => DeviceFault::Rejected { kind, subcode },
            None => DeviceFault::Unknown(subcode),
        }
    }

    /// Raw sub-code.
    pub fn subcode(&self) -> i32 {
        match *self {
            DeviceFault::Busy => BUSY,
            DeviceFault::Rejected { subcode, .. } => subcode,
            DeviceFault::Unknown(subcode) => subcode,
        }
    }

    /// Command code the fault refers to, when known.
    pub fn command_code(&self) -> Option<u8> {
        match self {
            DeviceFault::Rejected { kind, .. } => Some(kind.code()),
            _ => None,
        }
    }

    /// Human-readable description.
    pub fn description(&self) -> String {
        match *self {
            DeviceFault::Busy => "busy".to_string(),
            DeviceFault::Rejected { kind, subcode } => match ErrorCode::from_value(subcode) {
                Some(named) => named.name().to_string(),
                None => format!("invalid {}", kind.name()),
            },
            DeviceFault::Unknown(subcode) => format!("unknown device error {}", subcode),
        }
    }
}
