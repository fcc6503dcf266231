use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest microstepping mode the driver boards accept (1/16 step).
pub const MAX_MICROSTEP: u8 = 4;

/// Identifier of one controlled pump head. The set of valid ids comes from
/// configuration; nothing below assumes there are exactly two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PumpId(pub u8);

impl fmt::Display for PumpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PumpId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u8>().map(PumpId)
    }
}

// Placeholder id for status payloads that omit the field; the reconciler
// always overwrites it with the id parsed from the topic.
impl Default for PumpId {
    fn default() -> Self {
        PumpId(0)
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("rpm must be a finite value >= 0, got {0}")]
    InvalidRpm(f64),
    #[error("microstep must be 0..={MAX_MICROSTEP}, got {0}")]
    InvalidMicrostep(u8),
}

/// Last known state of one pump, optimistic or authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpStatus {
    #[serde(default)]
    pub pump_id: PumpId,
    pub enable: bool,
    /// true = clockwise, false = counter-clockwise
    pub direction: bool,
    pub rpm: f64,
    pub microstep: u8,
}

impl PumpStatus {
    /// Startup state for a configured pump: disabled, clockwise, stopped,
    /// full step.
    pub fn default_for(pump_id: PumpId) -> Self {
        Self {
            pump_id,
            enable: false,
            direction: true,
            rpm: 0.0,
            microstep: 0,
        }
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        if !self.rpm.is_finite() || self.rpm < 0.0 {
            return Err(CommandError::InvalidRpm(self.rpm));
        }
        if self.microstep > MAX_MICROSTEP {
            return Err(CommandError::InvalidMicrostep(self.microstep));
        }
        Ok(())
    }

    /// Merge the fields present in `command`; absent fields are unchanged.
    pub fn apply(&mut self, command: &PumpCommand) {
        if let Some(enable) = command.enable {
            self.enable = enable;
        }
        if let Some(direction) = command.direction {
            self.direction = direction;
        }
        if let Some(rpm) = command.rpm {
            self.rpm = rpm;
        }
        if let Some(microstep) = command.microstep {
            self.microstep = microstep;
        }
    }
}

/// Partial command over the mutable pump fields. `None` means "leave
/// unchanged", never false/zero. Absent fields are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PumpCommand {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub microstep: Option<u8>,
}

impl PumpCommand {
    /// Safety-interlock command: force the motor off, touch nothing else.
    pub fn disable() -> Self {
        Self {
            enable: Some(false),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        if let Some(rpm) = self.rpm {
            if !rpm.is_finite() || rpm < 0.0 {
                return Err(CommandError::InvalidRpm(rpm));
            }
        }
        if let Some(microstep) = self.microstep {
            if microstep > MAX_MICROSTEP {
                return Err(CommandError::InvalidMicrostep(microstep));
            }
        }
        Ok(())
    }
}
