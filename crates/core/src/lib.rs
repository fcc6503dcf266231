pub mod calc;
pub mod profile;
pub mod pump;
pub mod state;
pub mod topics;

pub use calc::{CalcError, PumpCalibration};
pub use profile::{OutputProfile, Phase, ProfileError, ProfileLibrary, ProfileSummary};
pub use pump::{CommandError, PumpCommand, PumpId, PumpStatus};
pub use state::StatusBoard;
