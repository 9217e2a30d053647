use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::warn;

use crate::breakpoints::schedule::{
    validate_schedule, Breakpoint, BreakpointSchedule, CapitalStructureInput,
};
use crate::error::OpmError;
use crate::pricing::black_scholes::{
    is_degenerate, price_breakpoint, validate_params, CallValuation,
};
use crate::types::*;
use crate::OpmResult;

// ---------------------------------------------------------------------------
// Input / output types
// ---------------------------------------------------------------------------

/// Input for a forward OPM allocation at a known equity value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpmAllocationInput {
    pub equity_value: Money,
    pub capital_structure: CapitalStructureInput,
    pub black_scholes: BlackScholesParams,
}

/// Per-class fair value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FmvResult {
    pub class_name: String,
    pub total_shares: Shares,
    pub total_value: Money,
    /// 0 when the class has no shares
    pub fmv_per_share: Money,
}

/// Fully priced breakpoint schedule plus per-class totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub equity_value: Money,
    pub breakpoints: Vec<Breakpoint>,
    pub fmv_results: Vec<FmvResult>,
    /// Sum of every class's total value
    pub total_allocated: Money,
    /// Call value struck at zero: the full option value of the equity
    pub total_equity_option_value: Money,
    /// Slice value that no class participated in
    pub unallocated_value: Money,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Slice pricing
// ---------------------------------------------------------------------------

struct SlicePricing {
    lower: CallValuation,
    slice_value: Money,
}

/// Price every breakpoint slice. Each boundary is priced once: the upper
/// call of slice i is the lower call of slice i + 1.
fn price_slices(
    equity_value: Money,
    schedule: &BreakpointSchedule,
    params: &BlackScholesParams,
) -> Vec<SlicePricing> {
    let lowers: Vec<CallValuation> = schedule
        .breakpoints
        .iter()
        .map(|bp| price_breakpoint(equity_value, Bound::Finite(bp.from), params))
        .collect();

    schedule
        .breakpoints
        .iter()
        .enumerate()
        .map(|(i, bp)| {
            let upper = match bp.to {
                Bound::Unbounded => 0.0,
                Bound::Finite(_) => match lowers.get(i + 1) {
                    Some(next) => next.call_value,
                    None => price_breakpoint(equity_value, bp.to, params).call_value,
                },
            };
            let raw = lowers[i].call_value - upper;
            SlicePricing {
                lower: lowers[i],
                // Floating noise never produces a negative slice
                slice_value: if raw > 0.0 { raw } else { 0.0 },
            }
        })
        .collect()
}

fn class_shares_in(bp: &Breakpoint, class_name: &str) -> Shares {
    bp.shares_participation
        .iter()
        .filter(|p| p.class_name == class_name)
        .map(|p| p.shares)
        .sum()
}

fn participating_total(bp: &Breakpoint) -> Shares {
    bp.shares_participation.iter().map(|p| p.shares).sum()
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Allocate the option value of `equity_value` across the schedule.
///
/// Each slice is priced as a call spread between its bounds and split pro
/// rata among the shares participating in it. Slices nobody participates in
/// are recorded with zero allocation and a warning.
pub fn allocate(
    equity_value: Money,
    schedule: &BreakpointSchedule,
    params: &BlackScholesParams,
) -> OpmResult<Allocation> {
    if !equity_value.is_finite() || equity_value < 0.0 {
        return Err(OpmError::InvalidInput {
            field: "equity_value".into(),
            reason: format!("must be finite and non-negative (got {equity_value})"),
        });
    }
    validate_params(params)?;
    validate_schedule(schedule)?;

    let mut warnings = Vec::new();
    if is_degenerate(params) {
        warnings.push(
            "Volatility or time to liquidity is non-positive; slices use intrinsic value".to_string(),
        );
    }

    let slices = price_slices(equity_value, schedule, params);
    let mut class_totals = vec![0.0; schedule.classes.len()];
    let mut unallocated = 0.0;

    let breakpoints: Vec<Breakpoint> = schedule
        .breakpoints
        .iter()
        .zip(slices.iter())
        .map(|(bp, slice)| {
            let mut priced = bp.clone();
            priced.d1 = slice.lower.d1;
            priced.d2 = slice.lower.d2;
            priced.option_value = slice.lower.call_value;
            priced.incremental_value = slice.slice_value;

            let total = participating_total(bp);
            priced.total_participating_shares = total;

            if total <= 0.0 {
                if slice.slice_value > 0.0 {
                    warn!(
                        breakpoint = bp.index,
                        slice_value = slice.slice_value,
                        "slice has no participating shares"
                    );
                    warnings.push(format!(
                        "Breakpoint {} [{}, {}) carries {} with no participating shares; left unallocated",
                        bp.index, bp.from, bp.to, slice.slice_value
                    ));
                    unallocated += slice.slice_value;
                }
                for part in priced.shares_participation.iter_mut() {
                    part.percent_of_total = 0.0;
                    part.incremental_value = 0.0;
                    part.incremental_percent = 0.0;
                }
                return priced;
            }

            let value_per_share = slice.slice_value / total;
            for part in priced.shares_participation.iter_mut() {
                part.percent_of_total = part.shares / total * 100.0;
                part.incremental_value = value_per_share * part.shares;
                part.incremental_percent = if slice.slice_value > 0.0 {
                    part.incremental_value / slice.slice_value * 100.0
                } else {
                    0.0
                };
                if let Some(ci) = schedule.class_index(&part.class_name) {
                    class_totals[ci] += part.incremental_value;
                }
            }
            priced
        })
        .collect();

    let fmv_results: Vec<FmvResult> = schedule
        .classes
        .iter()
        .zip(class_totals.iter())
        .map(|(class, &total_value)| FmvResult {
            class_name: class.name.clone(),
            total_shares: class.total_shares,
            total_value,
            fmv_per_share: if class.total_shares > 0.0 {
                total_value / class.total_shares
            } else {
                0.0
            },
        })
        .collect();

    let total_allocated = class_totals.iter().sum();
    let total_equity_option_value =
        price_breakpoint(equity_value, Bound::Finite(0.0), params).call_value;

    Ok(Allocation {
        equity_value,
        breakpoints,
        fmv_results,
        total_allocated,
        total_equity_option_value,
        unallocated_value: unallocated,
        warnings,
    })
}

/// FMV per share of one class, using the same slice arithmetic as
/// [`allocate`] without building the detailed breakdown.
///
/// The schedule and parameters are assumed to be validated.
pub fn class_fmv(
    equity_value: Money,
    schedule: &BreakpointSchedule,
    params: &BlackScholesParams,
    class_index: usize,
) -> Money {
    let Some(class) = schedule.classes.get(class_index) else {
        return 0.0;
    };
    if class.total_shares <= 0.0 {
        return 0.0;
    }
    let slices = price_slices(equity_value.max(0.0), schedule, params);
    let total_value: Money = schedule
        .breakpoints
        .iter()
        .zip(slices.iter())
        .map(|(bp, slice)| {
            let total = participating_total(bp);
            if total <= 0.0 {
                return 0.0;
            }
            slice.slice_value / total * class_shares_in(bp, &class.name)
        })
        .sum();
    total_value / class.total_shares
}

/// Limit of [`class_fmv`] as equity value grows without bound.
///
/// Infinite when the class participates in the unbounded range; otherwise
/// each finite slice `[a, b)` tends to `(b - a) * e^(-rT)`.
pub fn class_fmv_asymptote(
    schedule: &BreakpointSchedule,
    params: &BlackScholesParams,
    class_index: usize,
) -> Money {
    let Some(class) = schedule.classes.get(class_index) else {
        return 0.0;
    };
    if class.total_shares <= 0.0 {
        return 0.0;
    }
    let discount = (-params.risk_free_rate * params.time_to_liquidity).exp();
    let mut total_value = 0.0;
    for bp in &schedule.breakpoints {
        let total = participating_total(bp);
        let shares = class_shares_in(bp, &class.name);
        if total <= 0.0 || shares <= 0.0 {
            continue;
        }
        match bp.to {
            Bound::Unbounded => return f64::INFINITY,
            Bound::Finite(to) => total_value += (to - bp.from) * discount * shares / total,
        }
    }
    total_value / class.total_shares
}

/// Forward OPM allocation: price the schedule at a given equity value.
pub fn calculate_opm_allocation(
    input: &OpmAllocationInput,
) -> OpmResult<ComputationOutput<Allocation>> {
    let start = Instant::now();

    let schedule = input.capital_structure.resolve()?;
    let allocation = allocate(input.equity_value, &schedule, &input.black_scholes)?;

    let mut warnings = schedule.warnings.clone();
    warnings.extend(allocation.warnings.iter().cloned());

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "OPM Breakpoint Allocation (Black-Scholes)",
        &serde_json::json!({
            "equity_value": input.equity_value,
            "black_scholes": input.black_scholes,
            "num_breakpoints": schedule.breakpoints.len(),
        }),
        warnings,
        elapsed,
        allocation,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoints::capital_structure::{
        build_share_classes, CapitalStructure, SecurityClass, SecurityTerms,
    };
    use crate::breakpoints::schedule::{derive_breakpoints, ParticipationRule, ShareClass};
    use crate::pricing::black_scholes::price_call;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn two_class_schedule() -> BreakpointSchedule {
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

    fn venture_schedule() -> BreakpointSchedule {
        let structure = CapitalStructure {
            securities: vec![
                SecurityClass {
                    name: "Series B".into(),
                    shares: 2_000_000.0,
                    terms: SecurityTerms::Preferred {
                        liquidation_preference_per_share: 3.0,
                        preference_multiple: 1.0,
                        seniority: 1,
                        participating: false,
                        participation_cap: None,
                        conversion_ratio: 1.0,
                    },
                },
                SecurityClass {
                    name: "Series A".into(),
                    shares: 3_000_000.0,
                    terms: SecurityTerms::Preferred {
                        liquidation_preference_per_share: 1.0,
                        preference_multiple: 1.0,
                        seniority: 2,
                        participating: true,
                        participation_cap: Some(3.0),
                        conversion_ratio: 1.0,
                    },
                },
                SecurityClass {
                    name: "Common".into(),
                    shares: 8_000_000.0,
                    terms: SecurityTerms::Common,
                },
                SecurityClass {
                    name: "Options".into(),
                    shares: 1_500_000.0,
                    terms: SecurityTerms::Option { exercise_price: 0.5 },
                },
            ],
        };
        let (classes, _) = build_share_classes(&structure).unwrap();
        derive_breakpoints(&classes).unwrap()
    }

    #[test]
    fn test_two_class_concrete_scenario() {
        let schedule = two_class_schedule();
        let alloc = allocate(5_000_000.0, &schedule, &params()).unwrap();

        assert_eq!(alloc.breakpoints.len(), 2);
        let bp1 = &alloc.breakpoints[0];
        assert_eq!(bp1.shares_participation[0].percent_of_total, 100.0);
        assert_eq!(bp1.shares_participation[1].percent_of_total, 0.0);
        let bp2 = &alloc.breakpoints[1];
        assert_eq!(bp2.shares_participation[0].percent_of_total, 0.0);
        assert_eq!(bp2.shares_participation[1].percent_of_total, 100.0);

        // Independent Black-Scholes value at strike 0 (q = 0): the spot itself
        let reference = price_call(5_000_000.0, Bound::Finite(0.0), 3.0, 0.04, 0.60, 0.0).call_value;
        assert_relative_eq!(reference, 5_000_000.0, max_relative = 1e-12);
        assert_relative_eq!(alloc.total_allocated, reference, max_relative = 1e-6);

        // Preferred slice is the call spread [0, 1M)
        let upper = price_call(5_000_000.0, Bound::Finite(1_000_000.0), 3.0, 0.04, 0.60, 0.0);
        assert_relative_eq!(
            alloc.fmv_results[0].total_value,
            5_000_000.0 - upper.call_value,
            max_relative = 1e-12
        );
        assert_relative_eq!(bp2.d1, upper.d1);
        assert_relative_eq!(bp2.option_value, upper.call_value);
        assert!(alloc.fmv_results[1].fmv_per_share > 0.0);
        assert!(alloc.warnings.is_empty());
    }

    #[test]
    fn test_class_fmv_matches_allocate() {
        let schedule = venture_schedule();
        let alloc = allocate(20_000_000.0, &schedule, &params()).unwrap();
        for (ci, fmv) in alloc.fmv_results.iter().enumerate() {
            assert_relative_eq!(
                class_fmv(20_000_000.0, &schedule, &params(), ci),
                fmv.fmv_per_share,
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn test_monotonic_fmv_over_grid() {
        let schedule = venture_schedule();
        let top = 100.0 * 6_000_000.0;
        for ci in 0..schedule.classes.len() {
            let mut last: f64 = 0.0;
            for step in 0..50 {
                let v = top * step as f64 / 49.0;
                let fmv = class_fmv(v, &schedule, &params(), ci);
                assert!(fmv >= last - 1e-9 * last.max(1.0), "class {ci} fell at {v}");
                last = fmv;
            }
        }
    }

    #[test]
    fn test_zero_participation_slice_left_unallocated() {
        let schedule = derive_breakpoints(&[ShareClass {
            name: "Common".into(),
            total_shares: 100.0,
            participation: vec![ParticipationRule {
                from: 1_000.0,
                to: Bound::Unbounded,
                shares_participating: 100.0,
            }],
        }])
        .unwrap();
        let alloc = allocate(5_000.0, &schedule, &params()).unwrap();
        assert!(alloc.unallocated_value > 0.0);
        assert_eq!(alloc.breakpoints[0].shares_participation[0].incremental_value, 0.0);
        assert_relative_eq!(
            alloc.total_allocated + alloc.unallocated_value,
            alloc.total_equity_option_value,
            max_relative = 1e-9
        );
        assert_eq!(alloc.warnings.len(), 1);
    }

    #[test]
    fn test_zero_share_class_has_zero_fmv() {
        let mut schedule = two_class_schedule();
        schedule.classes[1].total_shares = 0.0;
        let alloc = allocate(5_000_000.0, &schedule, &params()).unwrap();
        assert_eq!(alloc.fmv_results[1].fmv_per_share, 0.0);
        assert!(alloc.fmv_results[1].total_value > 0.0);
    }

    #[test]
    fn test_degenerate_volatility_uses_intrinsic_value() {
        let mut p = params();
        p.volatility = 0.0;
        let alloc = allocate(5_000_000.0, &two_class_schedule(), &p).unwrap();
        assert_eq!(alloc.warnings.len(), 1);
        let disc = (-0.12f64).exp();
        assert_relative_eq!(alloc.fmv_results[0].total_value, 1_000_000.0 * disc, max_relative = 1e-12);
        assert_relative_eq!(alloc.total_allocated, 5_000_000.0, max_relative = 1e-12);
    }

    #[test]
    fn test_invalid_equity_value_rejected() {
        assert!(allocate(-1.0, &two_class_schedule(), &params()).is_err());
        assert!(allocate(f64::NAN, &two_class_schedule(), &params()).is_err());
    }

    #[test]
    fn test_asymptote() {
        let schedule = two_class_schedule();
        let pref = class_fmv_asymptote(&schedule, &params(), 0);
        assert_relative_eq!(pref, (-0.12f64).exp(), max_relative = 1e-12);
        assert!(class_fmv_asymptote(&schedule, &params(), 1).is_infinite());
        assert!(class_fmv(1e12, &schedule, &params(), 0) <= pref * (1.0 + 1e-9));
    }

    #[test]
    fn test_allocation_envelope() {
        let input: OpmAllocationInput = serde_json::from_value(serde_json::json!({
            "equity_value": 5000000,
            "black_scholes": {"time_to_liquidity": 3, "risk_free_rate": 0.04, "volatility": 0.6},
            "capital_structure": {"securities": {"securities": [
                {"name": "Series A", "shares": 1000000,
                 "terms": {"type": "preferred", "liquidation_preference_per_share": 1.0}},
                {"name": "Common", "shares": 4000000, "terms": {"type": "common"}}
            ]}}
        }))
        .unwrap();
        let out = calculate_opm_allocation(&input).unwrap();
        assert_eq!(out.result.breakpoints.len(), 3);
        assert_relative_eq!(out.result.total_allocated, 5_000_000.0, max_relative = 1e-6);
    }

    proptest! {
        #[test]
        fn prop_conservation_and_percent_closure(
            equity in 1.0e3f64..1.0e9,
            vol in 0.05f64..1.5,
            t in 0.1f64..10.0,
            r in 0.0f64..0.10,
            q in 0.0f64..0.05,
        ) {
            let p = BlackScholesParams {
                time_to_liquidity: t,
                risk_free_rate: r,
                volatility: vol,
                dividend_yield: q,
            };
            let schedule = venture_schedule();
            let alloc = allocate(equity, &schedule, &p).unwrap();

            let tol = 1e-6 * alloc.total_equity_option_value.max(1.0);
            prop_assert!((alloc.total_allocated - alloc.total_equity_option_value).abs() <= tol);

            for bp in &alloc.breakpoints {
                if bp.total_participating_shares > 0.0 {
                    let pct: f64 = bp.shares_participation.iter().map(|s| s.percent_of_total).sum();
                    prop_assert!((pct - 100.0).abs() <= 1e-6);
                }
            }
        }
    }
}
