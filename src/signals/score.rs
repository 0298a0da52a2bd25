use crate::core::{RiskLevel, Signals};
use crate::error::ScoreConfigError;

/// Slack for float rounding on top of the configured tolerance.
const SUM_EPSILON: f64 = 1e-9;

/// Validated signal weights. Never renormalized: a weight set that doesn't
/// sum to ~1.0 is rejected instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    dex: f64,
    whale: f64,
    cex: f64,
}

impl ScoreWeights {
    pub fn new(dex: f64, whale: f64, cex: f64, tolerance: f64) -> Result<Self, ScoreConfigError> {
        for (name, value) in [("dex", dex), ("whale", whale), ("cex", cex)] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ScoreConfigError::WeightOutOfRange { name, value });
            }
        }
        let sum = dex + whale + cex;
        if (sum - 1.0).abs() > tolerance.abs() + SUM_EPSILON {
            return Err(ScoreConfigError::WeightSum { sum, tolerance });
        }
        Ok(Self { dex, whale, cex })
    }

    pub fn dex(&self) -> f64 {
        self.dex
    }

    pub fn whale(&self) -> f64 {
        self.whale
    }

    pub fn cex(&self) -> f64 {
        self.cex
    }
}

/// Weighted total in [0, 100] and its risk level.
pub fn score(weights: &ScoreWeights, signals: &Signals) -> (f64, RiskLevel) {
    let total = compute_composite(weights, signals);
    (total, RiskLevel::from_score(total))
}

/// Weighted sum of the three signals, clamped to 0-100.
pub fn compute_composite(weights: &ScoreWeights, signals: &Signals) -> f64 {
    let total = signals.dex_activity * weights.dex
        + signals.whale_pressure * weights.whale
        + signals.cex_net_flow * weights.cex;
    if total.is_nan() {
        return 0.0;
    }
    total.clamp(0.0, 100.0)
}
