use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

use super::probability::{validate_probabilities, ProbabilityFormat, ProbabilityValidation};
use super::statistics::{weighted_statistics, WeightedStatistics};
use crate::backsolve::solver::{default_guess, solve, solve_monotone, BacksolveResult, SolverConfig};
use crate::breakpoints::allocation::{allocate, class_fmv, class_fmv_asymptote, FmvResult};
use crate::breakpoints::schedule::{BreakpointSchedule, CapitalStructureInput};
use crate::error::OpmError;
use crate::pricing::black_scholes::validate_params;
use crate::types::*;
use crate::OpmResult;

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

/// How a scenario obtains its equity value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioMode {
    /// Equity value supplied directly
    Manual,
    /// Equity value solved from a target FMV
    #[default]
    Backsolve,
}

/// Per-scenario replacement of individual Black-Scholes inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlackScholesOverride {
    pub time_to_liquidity: Option<Years>,
    pub risk_free_rate: Option<Rate>,
    pub volatility: Option<Rate>,
    pub dividend_yield: Option<Rate>,
}

impl BlackScholesOverride {
    /// Merge this override over `base`.
    pub fn apply(&self, base: &BlackScholesParams) -> BlackScholesParams {
        BlackScholesParams {
            time_to_liquidity: self.time_to_liquidity.unwrap_or(base.time_to_liquidity),
            risk_free_rate: self.risk_free_rate.unwrap_or(base.risk_free_rate),
            volatility: self.volatility.unwrap_or(base.volatility),
            dividend_yield: self.dividend_yield.unwrap_or(base.dividend_yield),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridScenario {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Raw weight in the input's probability format
    pub probability: f64,
    #[serde(default)]
    pub mode: ScenarioMode,
    /// Required in manual mode
    pub enterprise_value: Option<Money>,
    /// Falls back to the global target in backsolve mode
    pub target_fmv: Option<Money>,
    pub black_scholes: Option<BlackScholesOverride>,
    /// Replaces the global capital structure for this scenario
    #[serde(alias = "breakpoints")]
    pub capital_structure: Option<CapitalStructureInput>,
    pub security_class_id: Option<String>,
    pub solver: Option<SolverConfig>,
}

/// Inputs shared by every scenario unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridGlobals {
    pub capital_structure: CapitalStructureInput,
    pub black_scholes: BlackScholesParams,
    /// Class whose FMV is reported and backsolved
    pub security_class_id: String,
    pub target_fmv: Option<Money>,
    #[serde(default)]
    pub solver: SolverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridInput {
    pub scenarios: Vec<HybridScenario>,
    #[serde(alias = "global_params")]
    pub globals: HybridGlobals,
    #[serde(default)]
    pub probability_format: ProbabilityFormat,
    #[serde(default = "default_allow_normalization")]
    pub allow_normalization: bool,
    /// Solve one equity value at which the weighted FMV hits this target
    pub joint_target_fmv: Option<Money>,
}

fn default_allow_normalization() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub id: String,
    pub name: String,
    pub mode: ScenarioMode,
    /// Probability as supplied
    pub probability: f64,
    /// Probability after normalisation, in the input's format
    pub normalized_probability: f64,
    /// Normalised probability as a decimal
    pub weight: f64,
    pub enterprise_value: Money,
    pub calculated_fmv: Money,
    pub weighted_contribution: Money,
    pub converged: bool,
    pub iterations: u32,
    pub fmv_results: Vec<FmvResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backsolve: Option<BacksolveResult>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridPwermResult {
    /// Jointly backsolved equity value, when a joint target was given
    pub enterprise_value: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joint_backsolve: Option<BacksolveResult>,
    pub weighted_fmv: Money,
    pub scenario_results: Vec<ScenarioResult>,
    pub statistics: WeightedStatistics,
    pub probability_validation: ProbabilityValidation,
    pub converged: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Scenario resolution
// ---------------------------------------------------------------------------

/// A scenario with its effective parameters, schedule and weight.
struct ResolvedScenario<'a> {
    scenario: &'a HybridScenario,
    params: BlackScholesParams,
    schedule: BreakpointSchedule,
    class_index: usize,
    target_fmv: Option<Money>,
    solver: SolverConfig,
    normalized_probability: f64,
    weight: f64,
}

fn resolve_scenario<'a>(
    scenario: &'a HybridScenario,
    globals: &HybridGlobals,
    global_schedule: &BreakpointSchedule,
    joint: bool,
    normalized_probability: f64,
    weight: f64,
) -> OpmResult<ResolvedScenario<'a>> {
    let params = match &scenario.black_scholes {
        Some(over) => over.apply(&globals.black_scholes),
        None => globals.black_scholes.clone(),
    };
    validate_params(&params)?;

    let schedule = match &scenario.capital_structure {
        Some(structure) => structure.resolve()?,
        None => global_schedule.clone(),
    };

    let class_id = scenario
        .security_class_id
        .as_deref()
        .unwrap_or(&globals.security_class_id);
    let class_index = schedule.class_index(class_id).ok_or_else(|| {
        OpmError::invalid_input(
            "security_class_id",
            format!("no share class named '{class_id}'"),
        )
    })?;

    let solver = scenario.solver.clone().unwrap_or_else(|| globals.solver.clone());
    solver.validate()?;

    let target_fmv = scenario.target_fmv.or(globals.target_fmv);
    match scenario.mode {
        ScenarioMode::Manual => match scenario.enterprise_value {
            Some(v) if v.is_finite() && v >= 0.0 => {}
            Some(v) => {
                return Err(OpmError::invalid_input(
                    "enterprise_value",
                    format!("must be finite and non-negative (got {v})"),
                ))
            }
            None => {
                return Err(OpmError::invalid_input(
                    "enterprise_value",
                    "required for a manual scenario",
                ))
            }
        },
        ScenarioMode::Backsolve => {
            if !joint && target_fmv.is_none() {
                return Err(OpmError::invalid_input(
                    "target_fmv",
                    "required for a backsolve scenario",
                ));
            }
        }
    }

    Ok(ResolvedScenario {
        scenario,
        params,
        schedule,
        class_index,
        target_fmv,
        solver,
        normalized_probability,
        weight,
    })
}

// ---------------------------------------------------------------------------
// Scenario evaluation
// ---------------------------------------------------------------------------

fn scenario_result(
    ctx: &ResolvedScenario<'_>,
    enterprise_value: Money,
    calculated_fmv: Money,
    fmv_results: Vec<FmvResult>,
    backsolve: Option<BacksolveResult>,
    mut warnings: Vec<String>,
) -> ScenarioResult {
    let (converged, iterations, errors) = match &backsolve {
        Some(b) => {
            warnings.extend(b.warnings.iter().cloned());
            (b.converged, b.iterations, b.errors.clone())
        }
        None => (true, 0, Vec::new()),
    };
    ScenarioResult {
        id: ctx.scenario.id.clone(),
        name: ctx.scenario.name.clone(),
        mode: ctx.scenario.mode,
        probability: ctx.scenario.probability,
        normalized_probability: ctx.normalized_probability,
        weight: ctx.weight,
        enterprise_value,
        calculated_fmv,
        weighted_contribution: ctx.weight * calculated_fmv,
        converged,
        iterations,
        fmv_results,
        backsolve,
        errors,
        warnings,
    }
}

/// Allocate at a known equity value and read the class FMV off the result.
fn evaluate_at(
    ctx: &ResolvedScenario<'_>,
    enterprise_value: Money,
    backsolve: Option<BacksolveResult>,
) -> OpmResult<ScenarioResult> {
    let allocation = allocate(enterprise_value, &ctx.schedule, &ctx.params)?;
    let fmv = allocation.fmv_results[ctx.class_index].fmv_per_share;
    Ok(scenario_result(
        ctx,
        enterprise_value,
        fmv,
        allocation.fmv_results,
        backsolve,
        allocation.warnings,
    ))
}

/// Evaluate one scenario on its own: manual scenarios are allocated at their
/// equity value, backsolve scenarios solve for theirs.
fn evaluate_independent(ctx: &ResolvedScenario<'_>) -> OpmResult<ScenarioResult> {
    debug!(scenario = %ctx.scenario.id, mode = ?ctx.scenario.mode, "evaluating scenario");
    match (ctx.scenario.mode, ctx.scenario.enterprise_value, ctx.target_fmv) {
        (ScenarioMode::Manual, Some(ev), _) => evaluate_at(ctx, ev, None),
        (ScenarioMode::Backsolve, _, Some(target)) => {
            let class_name = &ctx.schedule.classes[ctx.class_index].name;
            let result = solve(target, class_name, &ctx.schedule, &ctx.params, &ctx.solver)?;
            if !result.converged {
                warn!(scenario = %ctx.scenario.id, "scenario backsolve did not converge");
            }
            let ev = result.enterprise_value;
            let fmv = result.actual_fmv;
            let allocation = allocate(ev, &ctx.schedule, &ctx.params)?;
            Ok(scenario_result(
                ctx,
                ev,
                fmv,
                allocation.fmv_results,
                Some(result),
                allocation.warnings,
            ))
        }
        _ => Err(OpmError::InsufficientData(
            "scenario has neither an enterprise value nor a target FMV".into(),
        )),
    }
}

/// Evaluate a scenario once the joint equity value is known.
fn evaluate_joint(
    ctx: &ResolvedScenario<'_>,
    joint: &BacksolveResult,
) -> OpmResult<ScenarioResult> {
    match (ctx.scenario.mode, ctx.scenario.enterprise_value) {
        (ScenarioMode::Manual, Some(ev)) => evaluate_at(ctx, ev, None),
        _ => {
            let mut result = evaluate_at(ctx, joint.enterprise_value, None)?;
            result.converged = joint.converged;
            result.iterations = joint.iterations;
            Ok(result)
        }
    }
}

#[cfg(feature = "parallel")]
fn map_scenarios<'a, F>(contexts: &[ResolvedScenario<'a>], f: F) -> Vec<OpmResult<ScenarioResult>>
where
    F: Fn(&ResolvedScenario<'a>) -> OpmResult<ScenarioResult> + Sync + Send,
{
    use rayon::prelude::*;
    contexts.par_iter().map(f).collect()
}

#[cfg(not(feature = "parallel"))]
fn map_scenarios<'a, F>(contexts: &[ResolvedScenario<'a>], f: F) -> Vec<OpmResult<ScenarioResult>>
where
    F: Fn(&ResolvedScenario<'a>) -> OpmResult<ScenarioResult>,
{
    contexts.iter().map(f).collect()
}

/// Solve for the single equity value at which the probability-weighted FMV
/// equals `target`.
fn joint_backsolve(
    target: Money,
    contexts: &[ResolvedScenario<'_>],
    config: &SolverConfig,
) -> OpmResult<BacksolveResult> {
    let solved: Vec<&ResolvedScenario<'_>> = contexts
        .iter()
        .filter(|c| c.scenario.mode == ScenarioMode::Backsolve)
        .collect();
    if solved.is_empty() {
        return Err(OpmError::invalid_input(
            "joint_target_fmv",
            "requires at least one backsolve scenario",
        ));
    }

    // Manual scenarios contribute a constant
    let fixed: Money = contexts
        .iter()
        .filter_map(|c| match (c.scenario.mode, c.scenario.enterprise_value) {
            (ScenarioMode::Manual, Some(ev)) => {
                Some(c.weight * class_fmv(ev, &c.schedule, &c.params, c.class_index))
            }
            _ => None,
        })
        .sum();

    let objective = |v: Money| -> Money {
        fixed
            + solved
                .iter()
                .map(|c| c.weight * class_fmv(v, &c.schedule, &c.params, c.class_index))
                .sum::<Money>()
    };

    let mut asymptote = fixed;
    for c in solved.iter().filter(|c| c.weight > 0.0) {
        asymptote += c.weight * class_fmv_asymptote(&c.schedule, &c.params, c.class_index);
    }

    let guess = solved
        .iter()
        .map(|c| default_guess(target, &c.schedule))
        .fold(1.0, f64::max);

    debug!(target_fmv = target, fixed, asymptote, guess, "joint hybrid backsolve");
    Ok(solve_monotone(target, &objective, asymptote, guess, config))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Evaluate every scenario and combine the results by probability.
///
/// Probabilities are validated before anything is priced. Resolution
/// problems in a scenario come back as [`OpmError::Scenario`]; a backsolve
/// that fails to converge does not, it is reported through `converged` and
/// `errors`.
pub fn evaluate(input: &HybridInput) -> OpmResult<HybridPwermResult> {
    let entries: Vec<(&str, f64)> = input
        .scenarios
        .iter()
        .map(|s| (s.id.as_str(), s.probability))
        .collect();
    let validation =
        validate_probabilities(&entries, input.probability_format, input.allow_normalization)?;

    validate_params(&input.globals.black_scholes)?;
    let global_schedule = input.globals.capital_structure.resolve()?;
    let joint = input.joint_target_fmv.is_some();

    let contexts = input
        .scenarios
        .iter()
        .enumerate()
        .map(|(i, scenario)| {
            resolve_scenario(
                scenario,
                &input.globals,
                &global_schedule,
                joint,
                validation.normalized_probabilities[i],
                validation.weights[i],
            )
            .map_err(|e| e.in_scenario(&scenario.id))
        })
        .collect::<OpmResult<Vec<_>>>()?;

    debug!(scenarios = contexts.len(), joint, "evaluating hybrid PWERM");

    let joint_result = match input.joint_target_fmv {
        Some(target) => Some(joint_backsolve(target, &contexts, &input.globals.solver)?),
        None => None,
    };

    let outcomes = match &joint_result {
        Some(j) => map_scenarios(&contexts, |c| {
            evaluate_joint(c, j).map_err(|e| e.in_scenario(&c.scenario.id))
        }),
        None => map_scenarios(&contexts, |c| {
            evaluate_independent(c).map_err(|e| e.in_scenario(&c.scenario.id))
        }),
    };
    let scenario_results = outcomes.into_iter().collect::<OpmResult<Vec<_>>>()?;

    let weighted_fmv: Money = scenario_results.iter().map(|r| r.weighted_contribution).sum();
    let fmvs: Vec<Money> = scenario_results.iter().map(|r| r.calculated_fmv).collect();
    let statistics = weighted_statistics(&fmvs, &validation.weights);

    let mut warnings = validation.warnings.clone();
    warnings.extend(global_schedule.warnings.iter().cloned());
    let mut errors = Vec::new();
    if let Some(j) = &joint_result {
        errors.extend(j.errors.iter().cloned());
        warnings.extend(j.warnings.iter().cloned());
    }
    for r in &scenario_results {
        errors.extend(r.errors.iter().map(|e| format!("[{}] {e}", r.id)));
        warnings.extend(r.warnings.iter().map(|w| format!("[{}] {w}", r.id)));
    }

    let converged = scenario_results.iter().all(|r| r.converged)
        && joint_result.as_ref().map_or(true, |j| j.converged);

    Ok(HybridPwermResult {
        enterprise_value: joint_result.as_ref().map(|j| j.enterprise_value),
        joint_backsolve: joint_result,
        weighted_fmv,
        scenario_results,
        statistics,
        probability_validation: validation,
        converged,
        errors,
        warnings,
    })
}

/// Hybrid PWERM valuation wrapped in the standard output envelope.
pub fn evaluate_hybrid_pwerm(
    input: &HybridInput,
) -> OpmResult<ComputationOutput<HybridPwermResult>> {
    let start = Instant::now();

    let result = evaluate(input)?;

    let mut warnings = result.warnings.clone();
    warnings.extend(result.errors.iter().cloned());

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Hybrid PWERM (probability-weighted OPM scenarios)",
        &serde_json::json!({
            "num_scenarios": input.scenarios.len(),
            "probability_format": input.probability_format,
            "security_class_id": input.globals.security_class_id,
            "joint_target_fmv": input.joint_target_fmv,
            "black_scholes": input.globals.black_scholes,
        }),
        warnings,
        elapsed,
        result,
    ))
}
