use std::collections::HashMap;
use std::env;

use anyhow::Context;
use pumplab_core::calc::PumpCalibration;
use pumplab_core::{ProfileLibrary, PumpId};

/// Everything the controller needs, injected once at startup: the pump-id
/// set, the head calibration, reservoir concentrations and the profile
/// library. No implicit globals.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub pump_ids: Vec<PumpId>,
    pub calibration: PumpCalibration,
    pub reservoir_conc: HashMap<PumpId, f64>,
    pub profiles: ProfileLibrary,
}

impl ControllerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut pump_ids = match env::var("PUMPLAB_PUMP_IDS") {
            Ok(v) if !v.is_empty() => parse_pump_ids(&v)
                .with_context(|| format!("invalid PUMPLAB_PUMP_IDS '{v}'"))?,
            _ => vec![PumpId(1), PumpId(2)],
        };
        pump_ids.sort();
        pump_ids.dedup();

        let mut calibration = PumpCalibration::default();
        if let Ok(v) = env::var("PUMPLAB_CAL_SLOPE") {
            calibration.slope = v
                .parse()
                .with_context(|| format!("invalid PUMPLAB_CAL_SLOPE '{v}'"))?;
        }
        if let Ok(v) = env::var("PUMPLAB_CAL_INTERCEPT") {
            calibration.intercept = v
                .parse()
                .with_context(|| format!("invalid PUMPLAB_CAL_INTERCEPT '{v}'"))?;
        }

        let reservoir_conc = match env::var("PUMPLAB_RESERVOIR_CONC") {
            Ok(v) if !v.is_empty() => parse_concentrations(&v)
                .with_context(|| format!("invalid PUMPLAB_RESERVOIR_CONC '{v}'"))?,
            _ => [(PumpId(1), 10.0), (PumpId(2), 20.0)].into_iter().collect(),
        };

        let profiles = match env::var("PUMPLAB_PROFILES_PATH") {
            Ok(path) if !path.is_empty() => {
                let json = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read profile file '{path}'"))?;
                ProfileLibrary::from_json_str(&json)
                    .with_context(|| format!("invalid profile file '{path}'"))?
            }
            _ => ProfileLibrary::builtin(),
        };

        Ok(Self {
            pump_ids,
            calibration,
            reservoir_conc,
            profiles,
        })
    }

    pub fn concentration_for(&self, pump_id: PumpId) -> f64 {
        self.reservoir_conc.get(&pump_id).copied().unwrap_or(0.0)
    }
}

fn parse_pump_ids(value: &str) -> anyhow::Result<Vec<PumpId>> {
    value
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<PumpId>()
                .with_context(|| format!("bad pump id '{part}'"))
        })
        .collect()
}

/// `"1:10.0,2:20.0"`: pump id to reservoir concentration (mM).
fn parse_concentrations(value: &str) -> anyhow::Result<HashMap<PumpId, f64>> {
    value
        .split(',')
        .map(|part| {
            let (id, conc) = part
                .split_once(':')
                .with_context(|| format!("expected 'id:conc', got '{part}'"))?;
            Ok((
                id.trim().parse::<PumpId>().with_context(|| format!("bad pump id '{id}'"))?,
                conc.trim()
                    .parse::<f64>()
                    .with_context(|| format!("bad concentration '{conc}'"))?,
            ))
        })
        .collect()
}
