use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::debug;

use crate::breakpoints::allocation::class_fmv;
use crate::breakpoints::schedule::{BreakpointSchedule, CapitalStructureInput};
use crate::error::OpmError;
use crate::pricing::black_scholes::validate_params;
use crate::types::*;
use crate::OpmResult;

/// Upper limit on the number of points a single axis may sweep.
const MAX_SWEEP_POINTS: usize = 1_000;

/// Model input that a sensitivity axis can vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityParameter {
    Volatility,
    TimeToLiquidity,
    RiskFreeRate,
    DividendYield,
    EquityValue,
}

impl fmt::Display for SensitivityParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensitivityParameter::Volatility => "volatility",
            SensitivityParameter::TimeToLiquidity => "time_to_liquidity",
            SensitivityParameter::RiskFreeRate => "risk_free_rate",
            SensitivityParameter::DividendYield => "dividend_yield",
            SensitivityParameter::EquityValue => "equity_value",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitivityVariable {
    pub parameter: SensitivityParameter,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// Input for a two-way FMV sensitivity grid around a base valuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpmSensitivityInput {
    pub equity_value: Money,
    pub capital_structure: CapitalStructureInput,
    pub black_scholes: BlackScholesParams,
    pub security_class_id: String,
    /// Swept down the rows
    pub variable_1: SensitivityVariable,
    /// Swept across the columns
    pub variable_2: SensitivityVariable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitivityGrid {
    pub security_class_id: String,
    pub variable_1: SensitivityParameter,
    pub variable_2: SensitivityParameter,
    pub variable_1_values: Vec<f64>,
    pub variable_2_values: Vec<f64>,
    /// matrix[i][j] = FMV per share at (variable_1_values[i], variable_2_values[j]);
    /// `None` where the inputs were invalid
    pub matrix: Vec<Vec<Option<Money>>>,
    pub base_case_value: Option<Money>,
    /// (row, col) of the cell nearest the midpoint of both ranges
    pub base_case_position: (usize, usize),
}

/// Sweep values from min to max. The max is always included, even when
/// the step does not land on it.
fn generate_sweep_values(var: &SensitivityVariable) -> OpmResult<Vec<f64>> {
    let field = format!("variable:{}", var.parameter);
    if !(var.min.is_finite() && var.max.is_finite() && var.step.is_finite()) {
        return Err(OpmError::invalid_input(field, "Min, max and step must be finite"));
    }
    if var.step <= 0.0 {
        return Err(OpmError::invalid_input(field, "Step must be positive"));
    }
    if var.min > var.max {
        return Err(OpmError::invalid_input(field, "Min must be <= max"));
    }

    // Index-based so repeated addition does not drift past max
    let span = (var.max - var.min) / var.step;
    if span + 1e-9 >= MAX_SWEEP_POINTS as f64 {
        return Err(OpmError::invalid_input(
            field,
            format!("Sweep would produce more than {MAX_SWEEP_POINTS} points"),
        ));
    }
    let steps = (span + 1e-9).floor() as usize;
    if steps + 1 > MAX_SWEEP_POINTS {
        return Err(OpmError::invalid_input(
            field,
            format!("Sweep would produce more than {MAX_SWEEP_POINTS} points"),
        ));
    }
    let mut values: Vec<f64> = (0..=steps).map(|i| var.min + i as f64 * var.step).collect();
    if let Some(&last) = values.last() {
        if !same_boundary(last, var.max) && last < var.max {
            values.push(var.max);
        }
    }
    Ok(values)
}

/// Find the closest index to a target value.
fn closest_index(values: &[f64], target: f64) -> usize {
    values
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (**a - target)
                .abs()
                .partial_cmp(&(**b - target).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn apply(
    parameter: SensitivityParameter,
    value: f64,
    equity_value: &mut Money,
    params: &mut BlackScholesParams,
) {
    match parameter {
        SensitivityParameter::Volatility => params.volatility = value,
        SensitivityParameter::TimeToLiquidity => params.time_to_liquidity = value,
        SensitivityParameter::RiskFreeRate => params.risk_free_rate = value,
        SensitivityParameter::DividendYield => params.dividend_yield = value,
        SensitivityParameter::EquityValue => *equity_value = value,
    }
}

fn evaluate_cell(
    input: &OpmSensitivityInput,
    schedule: &BreakpointSchedule,
    class_index: usize,
    v1: f64,
    v2: f64,
) -> OpmResult<Money> {
    let mut equity_value = input.equity_value;
    let mut params = input.black_scholes.clone();
    apply(input.variable_1.parameter, v1, &mut equity_value, &mut params);
    apply(input.variable_2.parameter, v2, &mut equity_value, &mut params);

    if !equity_value.is_finite() || equity_value < 0.0 {
        return Err(OpmError::invalid_input(
            "equity_value",
            format!("must be finite and non-negative (got {equity_value})"),
        ));
    }
    validate_params(&params)?;
    Ok(class_fmv(equity_value, schedule, &params, class_index))
}

/// Two-way grid of one class's FMV per share.
///
/// Invalid cells (for example a negative dividend yield) are left empty and
/// reported as warnings; only malformed axes or an unknown class are errors.
pub fn calculate_sensitivity_grid(
    input: &OpmSensitivityInput,
) -> OpmResult<ComputationOutput<SensitivityGrid>> {
    let start = Instant::now();

    if input.variable_1.parameter == input.variable_2.parameter {
        return Err(OpmError::invalid_input(
            "variable_2",
            format!("must differ from variable_1 ({})", input.variable_1.parameter),
        ));
    }

    let schedule = input.capital_structure.resolve()?;
    let class_index = schedule
        .class_index(&input.security_class_id)
        .ok_or_else(|| {
            OpmError::invalid_input(
                "security_class_id",
                format!("no share class named '{}'", input.security_class_id),
            )
        })?;

    let v1_values = generate_sweep_values(&input.variable_1)?;
    let v2_values = generate_sweep_values(&input.variable_2)?;
    debug!(
        rows = v1_values.len(),
        cols = v2_values.len(),
        "evaluating sensitivity grid"
    );

    let mut warnings = schedule.warnings.clone();
    let mut matrix = Vec::with_capacity(v1_values.len());
    for &v1 in &v1_values {
        let mut row = Vec::with_capacity(v2_values.len());
        for &v2 in &v2_values {
            match evaluate_cell(input, &schedule, class_index, v1, v2) {
                Ok(fmv) => row.push(Some(fmv)),
                Err(e) => {
                    warnings.push(format!(
                        "Evaluation failed at ({}={v1}, {}={v2}): {e}",
                        input.variable_1.parameter, input.variable_2.parameter
                    ));
                    row.push(None);
                }
            }
        }
        matrix.push(row);
    }

    let mid1 = (input.variable_1.min + input.variable_1.max) / 2.0;
    let mid2 = (input.variable_2.min + input.variable_2.max) / 2.0;
    let base_row = closest_index(&v1_values, mid1);
    let base_col = closest_index(&v2_values, mid2);
    let base_case_value = matrix[base_row][base_col];

    let output = SensitivityGrid {
        security_class_id: input.security_class_id.clone(),
        variable_1: input.variable_1.parameter,
        variable_2: input.variable_2.parameter,
        variable_1_values: v1_values,
        variable_2_values: v2_values,
        matrix,
        base_case_value,
        base_case_position: (base_row, base_col),
    };

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "2-Way OPM Sensitivity Grid (FMV per share)",
        &serde_json::json!({
            "equity_value": input.equity_value,
            "black_scholes": input.black_scholes,
            "security_class_id": input.security_class_id,
            "variable_1": input.variable_1,
            "variable_2": input.variable_2,
        }),
        warnings,
        elapsed,
        output,
    ))
}
