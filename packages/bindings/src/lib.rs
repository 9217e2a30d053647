use napi::Result as NapiResult;
use napi_derive::napi;

/// Convert any Display error into a napi::Error.
fn to_napi_error(e: impl std::fmt::Display) -> napi::Error {
    napi::Error::from_reason(e.to_string())
}

// ---------------------------------------------------------------------------
// Breakpoints and allocation
// ---------------------------------------------------------------------------

#[napi]
pub fn calculate_breakpoints(input_json: String) -> NapiResult<String> {
    let input: opm_core::breakpoints::schedule::BreakpointInput =
        serde_json::from_str(&input_json).map_err(to_napi_error)?;
    let output = opm_core::breakpoints::schedule::calculate_breakpoints(&input)
        .map_err(to_napi_error)?;
    serde_json::to_string(&output).map_err(to_napi_error)
}

#[napi]
pub fn calculate_opm_allocation(input_json: String) -> NapiResult<String> {
    let input: opm_core::breakpoints::allocation::OpmAllocationInput =
        serde_json::from_str(&input_json).map_err(to_napi_error)?;
    let output = opm_core::breakpoints::allocation::calculate_opm_allocation(&input)
        .map_err(to_napi_error)?;
    serde_json::to_string(&output).map_err(to_napi_error)
}

// ---------------------------------------------------------------------------
// Backsolve
// ---------------------------------------------------------------------------

#[napi]
pub fn backsolve_equity_value(input_json: String) -> NapiResult<String> {
    let input: opm_core::backsolve::solver::BacksolveInput =
        serde_json::from_str(&input_json).map_err(to_napi_error)?;
    let output =
        opm_core::backsolve::solver::backsolve_equity_value(&input).map_err(to_napi_error)?;
    serde_json::to_string(&output).map_err(to_napi_error)
}

// ---------------------------------------------------------------------------
// Hybrid PWERM
// ---------------------------------------------------------------------------

#[napi]
pub fn evaluate_hybrid_pwerm(input_json: String) -> NapiResult<String> {
    let input: opm_core::hybrid::engine::HybridInput =
        serde_json::from_str(&input_json).map_err(to_napi_error)?;
    let output =
        opm_core::hybrid::engine::evaluate_hybrid_pwerm(&input).map_err(to_napi_error)?;
    serde_json::to_string(&output).map_err(to_napi_error)
}

#[napi]
pub fn normalize_probabilities(probabilities_json: String, format: String) -> NapiResult<String> {
    let raw: Vec<f64> = serde_json::from_str(&probabilities_json).map_err(to_napi_error)?;
    let format: opm_core::hybrid::probability::ProbabilityFormat =
        serde_json::from_value(serde_json::Value::String(format)).map_err(to_napi_error)?;
    let validation =
        opm_core::hybrid::probability::normalize_weights(&raw, format).map_err(to_napi_error)?;
    serde_json::to_string(&validation).map_err(to_napi_error)
}

// ---------------------------------------------------------------------------
// Sensitivity and assumptions
// ---------------------------------------------------------------------------

#[napi]
pub fn calculate_sensitivity_grid(input_json: String) -> NapiResult<String> {
    let input: opm_core::sensitivity::grid::OpmSensitivityInput =
        serde_json::from_str(&input_json).map_err(to_napi_error)?;
    let output =
        opm_core::sensitivity::grid::calculate_sensitivity_grid(&input).map_err(to_napi_error)?;
    serde_json::to_string(&output).map_err(to_napi_error)
}

#[napi]
pub fn convert_assumptions(input_json: String) -> NapiResult<String> {
    let input: opm_core::assumptions::AssumptionsPayload =
        serde_json::from_str(&input_json).map_err(to_napi_error)?;
    let output = opm_core::assumptions::convert_assumptions(&input).map_err(to_napi_error)?;
    serde_json::to_string(&output).map_err(to_napi_error)
}
