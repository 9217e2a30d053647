use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::breakpoints::allocation::{class_fmv, class_fmv_asymptote};
use crate::breakpoints::schedule::{validate_schedule, BreakpointSchedule, CapitalStructureInput};
use crate::error::OpmError;
use crate::pricing::black_scholes::validate_params;
use crate::types::*;
use crate::OpmResult;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Iteration controls for the backsolve search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Relative tolerance on |actual FMV - target FMV|
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Absolute floor under the relative tolerance
    #[serde(default = "default_absolute_tolerance")]
    pub absolute_tolerance: f64,
    /// Cap on Newton and bisection steps
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Cap on doublings of the upper bracket
    #[serde(default = "default_max_bracket_expansions")]
    pub max_bracket_expansions: u32,
    /// Finite-difference step relative to the current equity value
    #[serde(default = "default_derivative_step")]
    pub derivative_step: f64,
    #[serde(default)]
    pub initial_guess: Option<Money>,
    #[serde(default)]
    pub lower_bound: Money,
    /// Fixed upper end of the search; no bracket expansion when set
    #[serde(default)]
    pub upper_bound: Option<Money>,
    #[serde(default = "default_record_history")]
    pub record_history: bool,
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_absolute_tolerance() -> f64 {
    1e-9
}

fn default_max_iterations() -> u32 {
    100
}

fn default_max_bracket_expansions() -> u32 {
    60
}

fn default_derivative_step() -> f64 {
    1e-4
}

fn default_record_history() -> bool {
    true
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            tolerance: default_tolerance(),
            absolute_tolerance: default_absolute_tolerance(),
            max_iterations: default_max_iterations(),
            max_bracket_expansions: default_max_bracket_expansions(),
            derivative_step: default_derivative_step(),
            initial_guess: None,
            lower_bound: 0.0,
            upper_bound: None,
            record_history: default_record_history(),
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> OpmResult<()> {
        let positive = [
            ("solver.tolerance", self.tolerance),
            ("solver.absolute_tolerance", self.absolute_tolerance),
            ("solver.derivative_step", self.derivative_step),
        ];
        for (field, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(OpmError::invalid_input(field, format!("must be positive (got {value})")));
            }
        }
        if self.max_iterations == 0 {
            return Err(OpmError::invalid_input("solver.max_iterations", "must be at least 1"));
        }
        if !self.lower_bound.is_finite() || self.lower_bound < 0.0 {
            return Err(OpmError::invalid_input(
                "solver.lower_bound",
                "must be finite and non-negative",
            ));
        }
        if let Some(upper) = self.upper_bound {
            if !upper.is_finite() || upper <= self.lower_bound {
                return Err(OpmError::invalid_input(
                    "solver.upper_bound",
                    format!("must be finite and above lower_bound {}", self.lower_bound),
                ));
            }
        }
        if let Some(guess) = self.initial_guess {
            if !guess.is_finite() || guess < 0.0 {
                return Err(OpmError::invalid_input(
                    "solver.initial_guess",
                    "must be finite and non-negative",
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// States of the backsolve search.
///
/// Bracketing grows the upper bound until the target is enclosed. Newton
/// steps use a central-difference derivative; a step falls back to one
/// Bisection step when the derivative is non-finite or non-positive, the
/// step leaves the bracket, or the previous step failed to reduce the
/// residual. The search ends Converged when the residual is within
/// tolerance and Failed when an iteration cap is hit or the target is
/// unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverState {
    Bracketing,
    Newton,
    Bisection,
    Converged,
    Failed,
}

/// One objective evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub state: SolverState,
    pub equity_value: Money,
    pub fmv: Money,
    pub residual: Money,
    pub bracket_low: Money,
    pub bracket_high: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacksolveResult {
    /// Solved total equity value
    pub enterprise_value: Money,
    pub actual_fmv: Money,
    pub target_fmv: Money,
    /// actual_fmv - target_fmv
    pub error: Money,
    pub converged: bool,
    /// Newton and bisection steps taken
    pub iterations: u32,
    pub bracket_expansions: u32,
    pub final_state: SolverState,
    /// Absolute tolerance applied to the residual
    pub tolerance: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iteration_history: Vec<IterationRecord>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Input for a single-class backsolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacksolveInput {
    pub target_fmv: Money,
    /// Name of the class whose FMV per share is targeted
    pub security_class_id: String,
    pub capital_structure: CapitalStructureInput,
    pub black_scholes: BlackScholesParams,
    #[serde(default)]
    pub solver: SolverConfig,
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

struct Search<'a, F: Fn(Money) -> Money> {
    objective: &'a F,
    target: Money,
    tol: f64,
    lo: Money,
    hi: Money,
    iterations: u32,
    best: (Money, Money),
    history: Vec<IterationRecord>,
    record_history: bool,
}

impl<F: Fn(Money) -> Money> Search<'_, F> {
    fn record(&mut self, state: SolverState, x: Money, fx: Money) {
        trace!(?state, equity_value = x, fmv = fx, "backsolve evaluation");
        if (fx - self.target).abs() < (self.best.1 - self.target).abs() {
            self.best = (x, fx);
        }
        if self.record_history {
            self.history.push(IterationRecord {
                iteration: self.iterations,
                state,
                equity_value: x,
                fmv: fx,
                residual: fx - self.target,
                bracket_low: self.lo,
                bracket_high: self.hi,
            });
        }
    }

    /// Evaluate one Newton or bisection point and tighten the bracket.
    fn step(&mut self, state: SolverState, x: Money) -> Money {
        self.iterations += 1;
        let fx = (self.objective)(x);
        let residual = fx - self.target;
        if residual < 0.0 {
            self.lo = x;
        } else {
            self.hi = x;
        }
        self.record(state, x, fx);
        residual
    }

    fn slope(&self, x: Money, relative_step: f64) -> f64 {
        let h = relative_step * x.abs().max(1.0);
        let (a, b) = if x - h >= 0.0 { (x - h, x + h) } else { (x, x + h) };
        ((self.objective)(b) - (self.objective)(a)) / (b - a)
    }

    fn collapsed(&self) -> bool {
        self.hi - self.lo <= f64::EPSILON * self.hi.abs().max(1.0)
    }
}

fn finish<F: Fn(Money) -> Money>(
    search: Search<'_, F>,
    state: SolverState,
    expansions: u32,
    errors: Vec<String>,
    warnings: Vec<String>,
) -> BacksolveResult {
    let (x, fx) = search.best;
    BacksolveResult {
        enterprise_value: x,
        actual_fmv: fx,
        target_fmv: search.target,
        error: fx - search.target,
        converged: state == SolverState::Converged,
        iterations: search.iterations,
        bracket_expansions: expansions,
        final_state: state,
        tolerance: search.tol,
        iteration_history: search.history,
        errors,
        warnings,
    }
}

/// Find the equity value at which a non-decreasing `objective` reaches
/// `target`.
///
/// `asymptote` is the objective's limit as equity value grows without bound
/// and `default_guess` seeds the upper bracket when the configuration gives
/// neither an upper bound nor an initial guess. Never fails: unreachable
/// targets and exhausted iteration caps come back with `converged = false`.
pub fn solve_monotone<F>(
    target: Money,
    objective: &F,
    asymptote: Money,
    default_guess: Money,
    config: &SolverConfig,
) -> BacksolveResult
where
    F: Fn(Money) -> Money,
{
    let tol = (config.tolerance * target.abs()).max(config.absolute_tolerance);
    let lower = config.lower_bound.max(0.0);
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let mut search = Search {
        objective,
        target,
        tol: if tol.is_finite() { tol } else { config.absolute_tolerance },
        lo: lower,
        hi: lower,
        iterations: 0,
        best: (lower, f64::NAN),
        history: Vec::new(),
        record_history: config.record_history,
    };

    if !target.is_finite() || target <= 0.0 {
        errors.push(format!("Target FMV must be positive and finite (got {target})"));
        search.best = (lower, objective(lower));
        return finish(search, SolverState::Failed, 0, errors, warnings);
    }

    let floor = objective(lower);
    search.best = (lower, floor);
    if floor - target > tol {
        errors.push(format!(
            "Target FMV {target} is below the minimum achievable FMV {floor} at equity value {lower}"
        ));
        return finish(search, SolverState::Failed, 0, errors, warnings);
    }
    if (floor - target).abs() <= tol {
        return finish(search, SolverState::Converged, 0, errors, warnings);
    }
    if asymptote.is_finite() && target >= asymptote {
        errors.push(format!(
            "Target FMV {target} is at or above the asymptotic FMV {asymptote}; \
             no finite equity value reaches it"
        ));
        return finish(search, SolverState::Failed, 0, errors, warnings);
    }

    let seed = config
        .upper_bound
        .or(config.initial_guess)
        .unwrap_or(default_guess);
    search.hi = if seed > lower { seed } else { lower.max(1.0) * 2.0 };

    let mut state = SolverState::Bracketing;
    let mut expansions = 0;
    let mut f_lo = floor;
    let mut x = search.hi;
    let mut residual = f64::NAN;
    let mut previous_abs = f64::INFINITY;

    loop {
        match state {
            SolverState::Bracketing => {
                let f_hi = objective(search.hi);
                let hi = search.hi;
                search.record(SolverState::Bracketing, hi, f_hi);
                if (f_hi - target).abs() <= tol {
                    x = hi;
                    state = SolverState::Converged;
                } else if f_hi > target {
                    // Regula falsi start inside the bracket, unless a usable guess was given
                    x = match config.initial_guess {
                        Some(g) if g > search.lo && g < search.hi => g,
                        _ if f_hi > f_lo => {
                            search.lo + (target - f_lo) / (f_hi - f_lo) * (search.hi - search.lo)
                        }
                        _ => 0.5 * (search.lo + search.hi),
                    };
                    debug!(low = search.lo, high = search.hi, start = x, "target bracketed");
                    residual = search.step(SolverState::Newton, x);
                    previous_abs = residual.abs();
                    state = if residual.abs() <= tol {
                        SolverState::Converged
                    } else {
                        SolverState::Newton
                    };
                } else if config.upper_bound.is_some() {
                    errors.push(format!(
                        "Target FMV {target} exceeds FMV {f_hi} at the configured upper bound {hi}"
                    ));
                    state = SolverState::Failed;
                } else if expansions >= config.max_bracket_expansions {
                    errors.push(format!(
                        "Could not bracket target FMV {target} after {expansions} expansions \
                         (FMV {f_hi} at equity value {hi})"
                    ));
                    state = SolverState::Failed;
                } else {
                    expansions += 1;
                    search.lo = hi;
                    f_lo = f_hi;
                    search.hi = hi * 2.0;
                    debug!(expansions, high = search.hi, "expanding bracket");
                }
            }
            SolverState::Newton | SolverState::Bisection => {
                if search.iterations >= config.max_iterations {
                    errors.push(format!(
                        "Backsolve did not converge within {} iterations (residual {residual})",
                        config.max_iterations
                    ));
                    state = SolverState::Failed;
                    continue;
                }
                if search.collapsed() {
                    errors.push(format!(
                        "Bracket collapsed at equity value {} without reaching tolerance (residual {residual})",
                        search.hi
                    ));
                    state = SolverState::Failed;
                    continue;
                }

                let next_state = if state == SolverState::Newton {
                    let slope = search.slope(x, config.derivative_step);
                    let proposal = x - residual / slope;
                    if !slope.is_finite() || slope <= 0.0 {
                        debug!(slope, "derivative unusable, bisecting");
                        SolverState::Bisection
                    } else if !(proposal > search.lo && proposal < search.hi) {
                        debug!(proposal, "Newton step leaves bracket, bisecting");
                        SolverState::Bisection
                    } else {
                        x = proposal;
                        SolverState::Newton
                    }
                } else {
                    SolverState::Bisection
                };

                if next_state == SolverState::Bisection {
                    x = 0.5 * (search.lo + search.hi);
                }
                residual = search.step(next_state, x);
                state = if residual.abs() <= tol {
                    SolverState::Converged
                } else if next_state == SolverState::Newton && residual.abs() >= previous_abs {
                    debug!(residual, "Newton step did not reduce residual, bisecting");
                    SolverState::Bisection
                } else {
                    SolverState::Newton
                };
                previous_abs = residual.abs();
            }
            SolverState::Converged | SolverState::Failed => break,
        }
    }

    if state == SolverState::Converged {
        search.best = (x, objective(x));
        debug!(equity_value = x, iterations = search.iterations, "backsolve converged");
    } else {
        warn!(target_fmv = target, iterations = search.iterations, "backsolve failed to converge");
        warnings.push(format!(
            "Result is the closest point found, {} from target",
            search.best.1 - target
        ));
    }
    finish(search, state, expansions, errors, warnings)
}

/// Solve for the equity value at which `security_class_id` is worth
/// `target_fmv` per share.
///
/// Structural problems (unknown class, invalid parameters or schedule) are
/// errors. Unreachable targets and non-convergence are reported in the
/// result with `converged = false`.
pub fn solve(
    target_fmv: Money,
    security_class_id: &str,
    schedule: &BreakpointSchedule,
    params: &BlackScholesParams,
    config: &SolverConfig,
) -> OpmResult<BacksolveResult> {
    validate_params(params)?;
    validate_schedule(schedule)?;
    config.validate()?;

    let class_index = schedule.class_index(security_class_id).ok_or_else(|| {
        OpmError::invalid_input(
            "security_class_id",
            format!("no share class named '{security_class_id}'"),
        )
    })?;

    let asymptote = class_fmv_asymptote(schedule, params, class_index);
    let objective = |v: Money| class_fmv(v, schedule, params, class_index);

    Ok(solve_monotone(
        target_fmv,
        &objective,
        asymptote,
        default_guess(target_fmv, schedule),
        config,
    ))
}

/// Starting upper bracket: every preference paid plus the target on every share.
pub fn default_guess(target_fmv: Money, schedule: &BreakpointSchedule) -> Money {
    let shares: Shares = schedule.classes.iter().map(|c| c.total_shares).sum();
    let guess = schedule.top_finite_boundary() + target_fmv.max(0.0) * shares;
    if guess.is_finite() && guess > 0.0 {
        guess
    } else {
        1.0
    }
}

/// Backsolve the equity value implied by a class's fair value per share.
pub fn backsolve_equity_value(
    input: &BacksolveInput,
) -> OpmResult<ComputationOutput<BacksolveResult>> {
    let start = Instant::now();

    let schedule = input.capital_structure.resolve()?;
    let result = solve(
        input.target_fmv,
        &input.security_class_id,
        &schedule,
        &input.black_scholes,
        &input.solver,
    )?;

    let mut warnings = schedule.warnings.clone();
    warnings.extend(result.warnings.iter().cloned());
    warnings.extend(result.errors.iter().cloned());

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "OPM Backsolve (Newton-Raphson with bisection fallback)",
        &serde_json::json!({
            "target_fmv": input.target_fmv,
            "security_class_id": input.security_class_id,
            "black_scholes": input.black_scholes,
            "solver": input.solver,
        }),
        warnings,
        elapsed,
        result,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoints::allocation::allocate;
    use crate::breakpoints::schedule::{derive_breakpoints, ParticipationRule, ShareClass};
    use approx::assert_relative_eq;

    fn schedule() -> BreakpointSchedule {
        derive_breakpoints(&[
            ShareClass {
                name: "Preferred".into(),
                total_shares: 1_000_000.0,
                participation: vec![ParticipationRule {
                    from: 0.0,
                    to: Bound::Finite(1_000_000.0),
                    shares_participating: 1_000_000.0,
                }],
            },
            ShareClass {
                name: "Common".into(),
                total_shares: 4_000_000.0,
                participation: vec![ParticipationRule {
                    from: 1_000_000.0,
                    to: Bound::Unbounded,
                    shares_participating: 4_000_000.0,
                }],
            },
        ])
        .unwrap()
    }

    fn params() -> BlackScholesParams {
        BlackScholesParams {
            time_to_liquidity: 3.0,
            risk_free_rate: 0.04,
            volatility: 0.60,
            dividend_yield: 0.0,
        }
    }

    fn common_fmv_at(equity: f64) -> f64 {
        allocate(equity, &schedule(), &params()).unwrap().fmv_results[1].fmv_per_share
    }

    #[test]
    fn test_recovers_known_equity_value() {
        let target = common_fmv_at(5_000_000.0);
        let result = solve(target, "Common", &schedule(), &params(), &SolverConfig::default()).unwrap();

        assert!(result.converged, "errors: {:?}", result.errors);
        assert_eq!(result.final_state, SolverState::Converged);
        assert!(result.error.abs() <= result.tolerance);
        assert_relative_eq!(result.enterprise_value, 5_000_000.0, max_relative = 1e-4);
        assert!(result.iterations <= 100);
    }

    #[test]
    fn test_round_trip_through_allocator() {
        let target = 0.42;
        let result = solve(target, "Common", &schedule(), &params(), &SolverConfig::default()).unwrap();
        assert!(result.converged);
        let again = common_fmv_at(result.enterprise_value);
        assert!((again - target).abs() <= result.tolerance);
        assert_relative_eq!(again, result.actual_fmv, max_relative = 1e-12);
    }

    #[test]
    fn test_history_records_states() {
        let result = solve(0.9, "Common", &schedule(), &params(), &SolverConfig::default()).unwrap();
        assert!(result.converged);
        assert_eq!(result.iteration_history.first().map(|r| r.state), Some(SolverState::Bracketing));
        assert!(result
            .iteration_history
            .iter()
            .any(|r| matches!(r.state, SolverState::Newton | SolverState::Bisection)));

        let quiet = SolverConfig {
            record_history: false,
            ..SolverConfig::default()
        };
        let result = solve(0.9, "Common", &schedule(), &params(), &quiet).unwrap();
        assert!(result.iteration_history.is_empty());
    }

    #[test]
    fn test_non_positive_target_is_degenerate() {
        let result = solve(0.0, "Common", &schedule(), &params(), &SolverConfig::default()).unwrap();
        assert!(!result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_target_above_capped_asymptote() {
        // Preferred can never be worth more than e^(-rT) per share
        let result = solve(0.95, "Preferred", &schedule(), &params(), &SolverConfig::default()).unwrap();
        assert!(!result.converged);
        assert_eq!(result.final_state, SolverState::Failed);
        assert!(result.errors[0].contains("asymptotic"));
    }

    #[test]
    fn test_capped_class_below_asymptote_converges() {
        let result = solve(0.5, "Preferred", &schedule(), &params(), &SolverConfig::default()).unwrap();
        assert!(result.converged);
        let alloc = allocate(result.enterprise_value, &schedule(), &params()).unwrap();
        assert!((alloc.fmv_results[0].fmv_per_share - 0.5).abs() <= result.tolerance);
    }

    #[test]
    fn test_iteration_cap_reports_failure() {
        let config = SolverConfig {
            max_iterations: 1,
            tolerance: 1e-15,
            absolute_tolerance: 1e-15,
            ..SolverConfig::default()
        };
        let result = solve(1.7, "Common", &schedule(), &params(), &config).unwrap();
        assert!(!result.converged);
        assert_eq!(result.final_state, SolverState::Failed);
        assert!(result.iterations <= 1);
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn test_upper_bound_too_low() {
        let config = SolverConfig {
            upper_bound: Some(2_000_000.0),
            ..SolverConfig::default()
        };
        let result = solve(common_fmv_at(5_000_000.0), "Common", &schedule(), &params(), &config).unwrap();
        assert!(!result.converged);
        assert!(result.errors[0].contains("upper bound"));
    }

    #[test]
    fn test_target_below_floor_is_degenerate() {
        let config = SolverConfig {
            lower_bound: 20_000_000.0,
            ..SolverConfig::default()
        };
        let result = solve(0.5, "Common", &schedule(), &params(), &config).unwrap();
        assert!(!result.converged);
        assert_eq!(result.final_state, SolverState::Failed);
        assert_eq!(result.iterations, 0);
        assert!(result.errors[0].contains("minimum achievable"));
        assert_relative_eq!(result.enterprise_value, 20_000_000.0);
    }

    #[test]
    fn test_negative_time_is_an_error() {
        let mut p = params();
        p.time_to_liquidity = -1.0;
        assert!(solve(0.5, "Preferred", &schedule(), &p, &SolverConfig::default()).is_err());
    }

    #[test]
    fn test_unknown_class_is_an_error() {
        assert!(solve(1.0, "Series Z", &schedule(), &params(), &SolverConfig::default()).is_err());
    }

    #[test]
    fn test_flat_regions_fall_back_to_bisection() {
        // Flat below 10 and nearly flat above 11: Newton alone cannot get there
        let objective = |v: f64| {
            if v < 10.0 {
                0.0
            } else if v < 11.0 {
                v - 10.0
            } else {
                1.0 + (v - 11.0) * 1e-9
            }
        };
        let result = solve_monotone(0.5, &objective, f64::INFINITY, 100.0, &SolverConfig::default());
        assert!(result.converged, "errors: {:?}", result.errors);
        assert_relative_eq!(result.enterprise_value, 10.5, max_relative = 1e-6);
        assert!(result
            .iteration_history
            .iter()
            .any(|r| r.state == SolverState::Bisection));
    }

    #[test]
    fn test_input_envelope() {
        let target = common_fmv_at(8_000_000.0);
        let input: BacksolveInput = serde_json::from_value(serde_json::json!({
            "target_fmv": target,
            "security_class_id": "Common",
            "black_scholes": {"time_to_liquidity": 3, "risk_free_rate": 0.04, "volatility": 0.6},
            "capital_structure": {"schedule": schedule()},
            "solver": {"tolerance": 1e-8}
        }))
        .unwrap();
        assert_eq!(input.solver.max_iterations, 100);
        let out = backsolve_equity_value(&input).unwrap();
        assert!(out.result.converged);
        assert_relative_eq!(out.result.enterprise_value, 8_000_000.0, max_relative = 1e-5);
    }
}
