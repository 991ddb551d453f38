// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed length of the anomaly signature vector.
pub const SIGNATURE_DIMENSIONS: usize = 32;

/// Upper bound for `recurrence_score`.
pub const MAX_RECURRENCE_SCORE: f64 = 10.0;

/// Snapshot of one agent's onboard health state.
///
/// The anomaly signature is a fixed 32-element embedding produced by the
/// onboard classifiers (an external collaborator); elements are expected in
/// `[-1, 1]` for lossless quantization but are not range-checked here, only
/// clamped by the compressor.
///
/// # Invariants
///
/// - `anomaly_signature.len() == 32`
/// - `risk_score` in `[0, 1]`
/// - `recurrence_score` in `[0, 10]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub anomaly_signature: Vec<f32>,
    pub risk_score: f64,
    pub recurrence_score: f64,
    pub timestamp: DateTime<Utc>,
}

impl HealthSummary {
    pub fn new(
        anomaly_signature: Vec<f32>,
        risk_score: f64,
        recurrence_score: f64,
    ) -> Result<Self, HealthError> {
        Self::with_timestamp(anomaly_signature, risk_score, recurrence_score, Utc::now())
    }

    pub fn with_timestamp(
        anomaly_signature: Vec<f32>,
        risk_score: f64,
        recurrence_score: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, HealthError> {
        let summary = Self {
            anomaly_signature,
            risk_score,
            recurrence_score,
            timestamp,
        };
        summary.validate()?;
        Ok(summary)
    }

    /// Re-check the construction invariants. Used by the serializer when
    /// schema validation is enabled.
    pub fn validate(&self) -> Result<(), HealthError> {
        if self.anomaly_signature.len() != SIGNATURE_DIMENSIONS {
            return Err(HealthError::SignatureDimension(self.anomaly_signature.len()));
        }
        if !(0.0..=1.0).contains(&self.risk_score) {
            return Err(HealthError::RiskOutOfRange(self.risk_score));
        }
        if !(0.0..=MAX_RECURRENCE_SCORE).contains(&self.recurrence_score) {
            return Err(HealthError::RecurrenceOutOfRange(self.recurrence_score));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("anomaly signature must have exactly {SIGNATURE_DIMENSIONS} elements, got {0}")]
    SignatureDimension(usize),

    #[error("risk_score must be between 0.0 and 1.0, got {0}")]
    RiskOutOfRange(f64),

    #[error("recurrence_score must be between 0.0 and {MAX_RECURRENCE_SCORE}, got {0}")]
    RecurrenceOutOfRange(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_summary() {
        let summary = HealthSummary::new(vec![0.1; 32], 0.53, 3.14).unwrap();
        assert_eq!(summary.anomaly_signature.len(), SIGNATURE_DIMENSIONS);
        assert_eq!(summary.risk_score, 0.53);
    }

    #[test]
    fn test_rejects_wrong_signature_dimension() {
        let err = HealthSummary::new(vec![0.1; 31], 0.5, 0.0).unwrap_err();
        assert!(matches!(err, HealthError::SignatureDimension(31)));
    }

    #[test]
    fn test_rejects_risk_out_of_range() {
        assert!(matches!(
            HealthSummary::new(vec![0.0; 32], 1.2, 0.0).unwrap_err(),
            HealthError::RiskOutOfRange(_)
        ));
        assert!(matches!(
            HealthSummary::new(vec![0.0; 32], -0.1, 0.0).unwrap_err(),
            HealthError::RiskOutOfRange(_)
        ));
    }

    #[test]
    fn test_rejects_recurrence_out_of_range() {
        assert!(matches!(
            HealthSummary::new(vec![0.0; 32], 0.5, 10.5).unwrap_err(),
            HealthError::RecurrenceOutOfRange(_)
        ));
    }

    #[test]
    fn test_rejects_nan_scores() {
        assert!(HealthSummary::new(vec![0.0; 32], f64::NAN, 0.0).is_err());
        assert!(HealthSummary::new(vec![0.0; 32], 0.5, f64::NAN).is_err());
    }
}
