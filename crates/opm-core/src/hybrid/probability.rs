use serde::{Deserialize, Serialize};

use crate::error::OpmError;
use crate::OpmResult;

/// Relative deviation of the probability sum from its expected total that
/// is absorbed without a warning.
pub const PROBABILITY_TOLERANCE: f64 = 1e-4;

/// Units in which scenario probabilities are supplied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbabilityFormat {
    /// Probabilities sum to 100
    #[default]
    Percentage,
    /// Probabilities sum to 1
    Decimal,
}

impl ProbabilityFormat {
    pub fn expected_total(&self) -> f64 {
        match self {
            ProbabilityFormat::Percentage => 100.0,
            ProbabilityFormat::Decimal => 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbabilityValidation {
    pub format: ProbabilityFormat,
    pub expected_total: f64,
    /// Sum of the probabilities as supplied
    pub raw_total: f64,
    /// True when the raw sum was within tolerance of the expected total
    pub valid: bool,
    /// True when the weights were rescaled
    pub normalized: bool,
    /// Rescaled probabilities, in the configured units
    pub normalized_probabilities: Vec<f64>,
    /// Rescaled probabilities as decimals summing to 1
    pub weights: Vec<f64>,
    pub warnings: Vec<String>,
}

/// Rescale `raw` proportionally so it sums to the format's total.
/// Returns the input unchanged when it sums to zero.
pub fn normalize_probabilities(raw: &[f64], format: ProbabilityFormat) -> Vec<f64> {
    let total: f64 = raw.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return raw.to_vec();
    }
    let scale = format.expected_total() / total;
    raw.iter().map(|p| p * scale).collect()
}

/// Validate and normalise an unlabelled weight list. Weights are
/// identified by position in any error.
pub fn normalize_weights(
    raw: &[f64],
    format: ProbabilityFormat,
) -> OpmResult<ProbabilityValidation> {
    let ids: Vec<String> = (0..raw.len()).map(|i| i.to_string()).collect();
    let labelled: Vec<(&str, f64)> = ids
        .iter()
        .map(String::as_str)
        .zip(raw.iter().copied())
        .collect();
    validate_probabilities(&labelled, format, true)
}

/// Validate and normalise scenario probabilities.
///
/// Negative or non-finite weights and an all-zero set are errors. A sum off
/// the expected total by more than [`PROBABILITY_TOLERANCE`] is a warning
/// when normalisation is allowed and an error otherwise.
pub fn validate_probabilities(
    scenarios: &[(&str, f64)],
    format: ProbabilityFormat,
    allow_normalization: bool,
) -> OpmResult<ProbabilityValidation> {
    if scenarios.is_empty() {
        return Err(OpmError::InsufficientData(
            "At least one scenario required".into(),
        ));
    }

    for (id, p) in scenarios {
        if !p.is_finite() {
            return Err(OpmError::ProbabilityValidation {
                scenario_id: id.to_string(),
                reason: format!("probability must be finite (got {p})"),
            });
        }
        if *p < 0.0 {
            return Err(OpmError::ProbabilityValidation {
                scenario_id: id.to_string(),
                reason: format!("probability cannot be negative (got {p})"),
            });
        }
    }

    let raw: Vec<f64> = scenarios.iter().map(|(_, p)| *p).collect();
    let raw_total: f64 = raw.iter().sum();
    let expected_total = format.expected_total();
    let mut warnings = Vec::new();

    if raw_total <= 0.0 {
        return Err(OpmError::ProbabilityValidation {
            scenario_id: "*".into(),
            reason: "probabilities sum to zero".into(),
        });
    }

    let deviation = (raw_total - expected_total).abs() / expected_total;
    let valid = deviation <= PROBABILITY_TOLERANCE;
    if !valid {
        if !allow_normalization {
            return Err(OpmError::ProbabilityValidation {
                scenario_id: "*".into(),
                reason: format!(
                    "probabilities sum to {raw_total}, expected {expected_total}, and normalization is disabled"
                ),
            });
        }
        warnings.push(format!(
            "Probabilities sum to {raw_total} rather than {expected_total}; rescaled proportionally"
        ));
        if format == ProbabilityFormat::Percentage
            && (raw_total - 1.0).abs() <= PROBABILITY_TOLERANCE
        {
            warnings.push(
                "Probabilities sum to 1 under percentage format; decimal format may be intended"
                    .to_string(),
            );
        }
    }

    let normalized_probabilities = normalize_probabilities(&raw, format);
    let weights = normalized_probabilities
        .iter()
        .map(|p| p / expected_total)
        .collect();

    Ok(ProbabilityValidation {
        format,
        expected_total,
        raw_total,
        valid,
        normalized: raw_total != expected_total,
        normalized_probabilities,
        weights,
        warnings,
    })
}
