//! Flow and blend math for the dual-pump head.
//!
//! A peristaltic head's volumetric flow is linear in rotational speed over
//! its working range, so a single slope/intercept pair per head is enough.
//! Two streams with known reservoir concentrations mix into one output
//! concentration weighted by their flows.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CalcError {
    #[error("mixing ratio must be within [0, 1], got {0}")]
    RatioOutOfRange(f64),
}

/// Linear calibration of one pump head: `flow = slope * rpm + intercept`
/// (mL/min). The defaults were measured for the lab's standard head; other
/// heads supply their own pair through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PumpCalibration {
    pub slope: f64,
    pub intercept: f64,
}

impl Default for PumpCalibration {
    fn default() -> Self {
        Self {
            slope: 0.0592,
            intercept: -0.1269,
        }
    }
}

impl PumpCalibration {
    pub fn flow_rate(&self, rpm: f64) -> f64 {
        self.slope * rpm + self.intercept
    }
}

/// Flow-weighted concentration of the combined stream, rounded to two
/// decimals. A non-positive total flow means nothing is moving; the blend
/// saturates to 0 rather than dividing by zero.
pub fn blended_concentration(flow1: f64, conc1: f64, flow2: f64, conc2: f64) -> f64 {
    let total = flow1 + flow2;
    if total <= 0.0 {
        return 0.0;
    }
    round2((conc1 * flow1 + conc2 * flow2) / total)
}

/// Ratio variant: `ratio` is the share of stream 1 in the output. Values
/// outside `[0, 1]` are rejected, never clamped.
pub fn blend_by_ratio(ratio: f64, conc1: f64, conc2: f64) -> Result<f64, CalcError> {
    if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
        return Err(CalcError::RatioOutOfRange(ratio));
    }
    Ok(round2(conc1 * ratio + conc2 * (1.0 - ratio)))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_rate_is_linear_in_rpm() {
        let cal = PumpCalibration::default();
        assert!((cal.flow_rate(100.0) - (0.0592 * 100.0 - 0.1269)).abs() < 1e-12);
        let custom = PumpCalibration {
            slope: 0.1,
            intercept: 0.0,
        };
        assert_eq!(custom.flow_rate(50.0), 5.0);
    }

    #[test]
    fn blend_weights_by_flow() {
        // Equal flows average the concentrations.
        assert_eq!(blended_concentration(1.0, 10.0, 1.0, 20.0), 15.0);
        // All flow from one side takes its concentration.
        assert_eq!(blended_concentration(2.0, 10.0, 0.0, 20.0), 10.0);
        assert_eq!(blended_concentration(1.0, 10.0, 3.0, 20.0), 17.5);
    }

    #[test]
    fn zero_or_negative_total_flow_saturates_to_zero() {
        assert_eq!(blended_concentration(0.0, 10.0, 0.0, 20.0), 0.0);
        assert_eq!(blended_concentration(-0.1269, 10.0, -0.1269, 20.0), 0.0);
    }

    #[test]
    fn ratio_blend_matches_formula() {
        assert_eq!(blend_by_ratio(1.0, 10.0, 20.0), Ok(10.0));
        assert_eq!(blend_by_ratio(0.0, 10.0, 20.0), Ok(20.0));
        assert_eq!(blend_by_ratio(0.5, 10.0, 20.0), Ok(15.0));
        assert_eq!(blend_by_ratio(0.25, 12.0, 18.0), Ok(16.5));
    }

    #[test]
    fn out_of_range_ratio_is_rejected_not_clamped() {
        assert_eq!(
            blend_by_ratio(1.01, 10.0, 20.0),
            Err(CalcError::RatioOutOfRange(1.01))
        );
        assert_eq!(
            blend_by_ratio(-0.01, 10.0, 20.0),
            Err(CalcError::RatioOutOfRange(-0.01))
        );
        assert!(blend_by_ratio(f64::NAN, 10.0, 20.0).is_err());
    }

    #[test]
    fn blend_rounds_to_two_decimals() {
        // 1/3 vs 2/3 flow split: (10 + 2*20) / 3 = 16.666...
        assert_eq!(blended_concentration(1.0, 10.0, 2.0, 20.0), 16.67);
    }
}
