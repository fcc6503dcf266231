//! Output profiles: named, cyclic sequences of per-pump phases driven on a
//! fixed cadence by the scheduler.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pump::{CommandError, PumpCommand};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile '{0}' has no phases")]
    NoPhases(String),
    #[error("profile '{0}' interval must be a finite value > 0, got {1}")]
    InvalidInterval(String, f64),
    #[error("profile '{id}' phase {phase}: {source}")]
    InvalidPhase {
        id: String,
        phase: usize,
        source: CommandError,
    },
    #[error("failed to parse profile file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One step of a profile: a full command for each pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub pump1: PumpCommand,
    pub pump2: PumpCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileParameters {
    /// Seconds between phase transitions.
    pub interval_secs: f64,
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub parameters: ProfileParameters,
}

impl OutputProfile {
    pub fn validate(&self) -> Result<(), ProfileError> {
        let interval = self.parameters.interval_secs;
        if !interval.is_finite() || interval <= 0.0 {
            return Err(ProfileError::InvalidInterval(self.id.clone(), interval));
        }
        if self.parameters.phases.is_empty() {
            return Err(ProfileError::NoPhases(self.id.clone()));
        }
        for (i, phase) in self.parameters.phases.iter().enumerate() {
            for command in [&phase.pump1, &phase.pump2] {
                command.validate().map_err(|source| ProfileError::InvalidPhase {
                    id: self.id.clone(),
                    phase: i,
                    source,
                })?;
            }
        }
        Ok(())
    }

    pub fn phase_count(&self) -> usize {
        self.parameters.phases.len()
    }
}

/// Compact listing for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub interval_secs: f64,
    pub phase_count: usize,
}

impl From<&OutputProfile> for ProfileSummary {
    fn from(profile: &OutputProfile) -> Self {
        Self {
            id: profile.id.clone(),
            name: profile.name.clone(),
            description: profile.description.clone(),
            interval_secs: profile.parameters.interval_secs,
            phase_count: profile.phase_count(),
        }
    }
}

/// The configured set of profiles, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ProfileLibrary {
    profiles: Vec<OutputProfile>,
}

impl ProfileLibrary {
    pub fn new(profiles: Vec<OutputProfile>) -> Result<Self, ProfileError> {
        for profile in &profiles {
            profile.validate()?;
        }
        Ok(Self { profiles })
    }

    /// Stock library: the alternating square wave the instrument ships with.
    pub fn builtin() -> Self {
        let on = PumpCommand {
            enable: Some(true),
            direction: Some(true),
            rpm: Some(100.0),
            microstep: None,
        };
        let off = PumpCommand {
            enable: Some(false),
            direction: Some(true),
            rpm: Some(0.0),
            microstep: None,
        };
        Self {
            profiles: vec![OutputProfile {
                id: "alternating-square".to_string(),
                name: "Alternating Square Wave".to_string(),
                description: "Alternates between pumps with square wave pattern".to_string(),
                parameters: ProfileParameters {
                    interval_secs: 5.0,
                    phases: vec![
                        Phase {
                            pump1: on.clone(),
                            pump2: off.clone(),
                        },
                        Phase {
                            pump1: off,
                            pump2: on,
                        },
                    ],
                },
            }],
        }
    }

    /// Load a JSON array of profiles, e.g. from an operator-supplied file.
    pub fn from_json_str(json: &str) -> Result<Self, ProfileError> {
        let profiles: Vec<OutputProfile> = serde_json::from_str(json)?;
        Self::new(profiles)
    }

    pub fn get(&self, id: &str) -> Option<&OutputProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn summaries(&self) -> Vec<ProfileSummary> {
        self.profiles.iter().map(ProfileSummary::from).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_wave(interval_secs: f64, phases: usize) -> OutputProfile {
        OutputProfile {
            id: "test".into(),
            name: "Test".into(),
            description: String::new(),
            parameters: ProfileParameters {
                interval_secs,
                phases: (0..phases)
                    .map(|_| Phase {
                        pump1: PumpCommand::disable(),
                        pump2: PumpCommand::disable(),
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn builtin_library_is_valid() {
        let lib = ProfileLibrary::builtin();
        assert_eq!(lib.len(), 1);
        let profile = lib.get("alternating-square").unwrap();
        profile.validate().unwrap();
        assert_eq!(profile.phase_count(), 2);
        assert_eq!(profile.parameters.interval_secs, 5.0);
    }

    #[test]
    fn validation_rejects_empty_and_bad_interval() {
        assert!(matches!(
            square_wave(5.0, 0).validate(),
            Err(ProfileError::NoPhases(_))
        ));
        assert!(matches!(
            square_wave(0.0, 1).validate(),
            Err(ProfileError::InvalidInterval(_, _))
        ));
        assert!(matches!(
            square_wave(-1.0, 1).validate(),
            Err(ProfileError::InvalidInterval(_, _))
        ));
        assert!(square_wave(0.5, 1).validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_phase_commands() {
        let mut profile = square_wave(5.0, 2);
        profile.parameters.phases[1].pump2.rpm = Some(-3.0);
        assert!(matches!(
            profile.validate(),
            Err(ProfileError::InvalidPhase { phase: 1, .. })
        ));
    }

    #[test]
    fn library_loads_from_json() {
        let json = r#"[{
            "id": "steady",
            "name": "Steady",
            "description": "Both pumps at half speed",
            "parameters": {
                "interval_secs": 10.0,
                "phases": [{
                    "pump1": {"enable": true, "rpm": 50.0},
                    "pump2": {"enable": true, "rpm": 50.0}
                }]
            }
        }]"#;
        let lib = ProfileLibrary::from_json_str(json).unwrap();
        assert!(lib.get("steady").is_some());
        assert!(lib.get("missing").is_none());

        // An invalid profile fails the load, not a later start().
        let bad = json.replace("10.0", "0.0");
        assert!(ProfileLibrary::from_json_str(&bad).is_err());
    }
}
