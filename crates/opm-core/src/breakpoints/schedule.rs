use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;

use crate::breakpoints::capital_structure::{build_share_classes, CapitalStructure};
use crate::error::OpmError;
use crate::types::*;
use crate::OpmResult;

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

/// A range of total equity value in which a class participates with a fixed
/// number of shares. `to` is exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipationRule {
    pub from: Money,
    pub to: Bound,
    pub shares_participating: Shares,
}

/// A share class and the ranges in which it participates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareClass {
    pub name: String,
    pub total_shares: Shares,
    #[serde(default)]
    pub participation: Vec<ParticipationRule>,
}

/// The three ways a caller can describe a capital structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapitalStructureInput {
    /// Explicit participation rules per class
    ShareClasses(Vec<ShareClass>),
    /// Security terms; participation rules are derived
    Securities(CapitalStructure),
    /// A schedule derived earlier, reused as-is after validation
    Schedule(BreakpointSchedule),
}

impl CapitalStructureInput {
    /// Turn any accepted description into a validated schedule.
    pub fn resolve(&self) -> OpmResult<BreakpointSchedule> {
        match self {
            CapitalStructureInput::ShareClasses(classes) => derive_breakpoints(classes),
            CapitalStructureInput::Securities(structure) => {
                let (classes, warnings) = build_share_classes(structure)?;
                let mut schedule = derive_breakpoints(&classes)?;
                let mut all = warnings;
                all.append(&mut schedule.warnings);
                schedule.warnings = all;
                Ok(schedule)
            }
            CapitalStructureInput::Schedule(schedule) => {
                validate_schedule(schedule)?;
                Ok(schedule.clone())
            }
        }
    }
}

/// Input for a standalone breakpoint derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointInput {
    pub capital_structure: CapitalStructureInput,
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// One class's share of a breakpoint slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareParticipation {
    pub class_name: String,
    pub shares: Shares,
    /// Share of participating shares in this breakpoint (0-100)
    pub percent_of_total: f64,
    #[serde(default)]
    pub incremental_value: Money,
    /// Share of the slice value (0-100)
    #[serde(default)]
    pub incremental_percent: f64,
}

/// A contiguous range of equity value with constant participation.
///
/// Pricing fields stay at zero until the slice allocator fills them in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub index: usize,
    pub from: Money,
    pub to: Bound,
    #[serde(default)]
    pub d1: f64,
    #[serde(default)]
    pub d2: f64,
    /// Call value struck at `from`
    #[serde(default)]
    pub option_value: Money,
    /// Call value at `from` minus call value at `to`
    #[serde(default)]
    pub incremental_value: Money,
    pub total_participating_shares: Shares,
    pub shares_participation: Vec<ShareParticipation>,
}

/// Class roster entry carried alongside the breakpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSummary {
    pub name: String,
    pub total_shares: Shares,
}

/// Ordered, gap-free partition of the equity-value axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointSchedule {
    pub classes: Vec<ClassSummary>,
    pub breakpoints: Vec<Breakpoint>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl BreakpointSchedule {
    pub fn class_index(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|c| c.name == name)
    }

    /// Largest finite boundary, 0 for a flat structure.
    pub fn top_finite_boundary(&self) -> Money {
        self.breakpoints
            .iter()
            .filter_map(|bp| bp.to.finite())
            .fold(0.0, f64::max)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn capital_error(class: &ShareClass, rule_index: Option<usize>, reason: String) -> OpmError {
    OpmError::InvalidCapitalStructure {
        class_name: class.name.clone(),
        rule_index,
        reason,
    }
}

/// Structural checks on share classes that do not need the derived
/// boundaries. Returns warnings; hard problems are errors.
pub fn validate_share_classes(classes: &[ShareClass]) -> OpmResult<Vec<String>> {
    let mut warnings = Vec::new();

    if classes.is_empty() {
        return Err(OpmError::InsufficientData(
            "At least one share class required".into(),
        ));
    }

    let mut seen = HashSet::new();
    for class in classes {
        if class.name.trim().is_empty() {
            return Err(capital_error(class, None, "class name cannot be empty".into()));
        }
        if !seen.insert(class.name.as_str()) {
            return Err(capital_error(class, None, "duplicate class name".into()));
        }
        if !class.total_shares.is_finite() || class.total_shares < 0.0 {
            return Err(capital_error(
                class,
                None,
                format!("total_shares must be finite and non-negative (got {})", class.total_shares),
            ));
        }

        for (i, rule) in class.participation.iter().enumerate() {
            if !rule.from.is_finite() || rule.from < 0.0 {
                return Err(capital_error(
                    class,
                    Some(i),
                    format!("'from' must be finite and non-negative (got {})", rule.from),
                ));
            }
            if let Bound::Finite(to) = rule.to {
                if to <= rule.from || same_boundary(to, rule.from) {
                    return Err(capital_error(
                        class,
                        Some(i),
                        format!("empty or inverted range [{}, {to})", rule.from),
                    ));
                }
            }
            if !rule.shares_participating.is_finite() || rule.shares_participating < 0.0 {
                return Err(capital_error(
                    class,
                    Some(i),
                    format!(
                        "shares_participating must be finite and non-negative (got {})",
                        rule.shares_participating
                    ),
                ));
            }
        }

        // Overlap check on rules ordered by their lower bound
        let mut order: Vec<usize> = (0..class.participation.len()).collect();
        order.sort_by(|&a, &b| {
            class.participation[a]
                .from
                .partial_cmp(&class.participation[b].from)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for pair in order.windows(2) {
            let prev = &class.participation[pair[0]];
            let next = &class.participation[pair[1]];
            let overlaps = match prev.to {
                Bound::Unbounded => true,
                Bound::Finite(to) => next.from < to && !same_boundary(next.from, to),
            };
            if overlaps {
                return Err(capital_error(
                    class,
                    Some(pair[1]),
                    format!("overlaps rule {} [{}, {})", pair[0], prev.from, prev.to),
                ));
            }
        }

        if class.total_shares > 0.0 && class.participation.is_empty() {
            warnings.push(format!(
                "Class '{}' has {} shares but no participation rules; it will receive no value",
                class.name, class.total_shares
            ));
        }
    }

    Ok(warnings)
}

/// Check a caller-supplied schedule: sorted, contiguous, starting at 0 and
/// ending with the only unbounded range.
pub fn validate_schedule(schedule: &BreakpointSchedule) -> OpmResult<()> {
    if schedule.breakpoints.is_empty() {
        return Err(OpmError::InsufficientData(
            "Breakpoint schedule is empty".into(),
        ));
    }
    if schedule.classes.is_empty() {
        return Err(OpmError::InsufficientData(
            "Breakpoint schedule has no share classes".into(),
        ));
    }

    let mut names = HashSet::new();
    for class in &schedule.classes {
        if !names.insert(class.name.as_str()) {
            return Err(OpmError::InvalidInput {
                field: "classes".into(),
                reason: format!("duplicate class name '{}'", class.name),
            });
        }
        if !class.total_shares.is_finite() || class.total_shares < 0.0 {
            return Err(OpmError::InvalidInput {
                field: format!("classes:{}", class.name),
                reason: "total_shares must be finite and non-negative".into(),
            });
        }
    }

    let last = schedule.breakpoints.len() - 1;
    for (i, bp) in schedule.breakpoints.iter().enumerate() {
        let fail = |reason: String| OpmError::InvalidSchedule {
            breakpoint_index: i,
            reason,
        };

        if i == 0 && bp.from != 0.0 {
            return Err(fail(format!("first breakpoint must start at 0 (got {})", bp.from)));
        }
        if !bp.from.is_finite() {
            return Err(fail("'from' must be finite".into()));
        }
        match bp.to {
            Bound::Unbounded if i != last => {
                return Err(fail("only the last breakpoint may be unbounded".into()));
            }
            Bound::Finite(_) if i == last => {
                return Err(fail("last breakpoint must be unbounded".into()));
            }
            Bound::Finite(to) if to <= bp.from => {
                return Err(fail(format!("empty or inverted range [{}, {to})", bp.from)));
            }
            _ => {}
        }
        if i > 0 {
            let prev_to = schedule.breakpoints[i - 1].to;
            if !prev_to.same_as(&Bound::Finite(bp.from)) {
                return Err(fail(format!(
                    "not contiguous: previous range ends at {prev_to}, this one starts at {}",
                    bp.from
                )));
            }
        }
        for part in &bp.shares_participation {
            if !names.contains(part.class_name.as_str()) {
                return Err(fail(format!("unknown class '{}'", part.class_name)));
            }
            if !part.shares.is_finite() || part.shares < 0.0 {
                return Err(fail(format!(
                    "class '{}' has invalid participating shares {}",
                    part.class_name, part.shares
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Sorted, de-duplicated boundaries across every rule, always including 0.
fn collect_boundaries(classes: &[ShareClass]) -> Vec<Money> {
    let mut points = vec![0.0];
    for rule in classes.iter().flat_map(|c| c.participation.iter()) {
        points.push(rule.from);
        if let Bound::Finite(to) = rule.to {
            points.push(to);
        }
    }
    points.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    points.dedup_by(|later, earlier| same_boundary(*later, *earlier));
    points
}

/// Derive the breakpoint schedule for a set of share classes.
///
/// A rule covers a derived range only when its own `[from, to)` coincides
/// with it. A rule that another class's boundary cuts in two is rejected
/// rather than split, so participation is always stated explicitly.
pub fn derive_breakpoints(classes: &[ShareClass]) -> OpmResult<BreakpointSchedule> {
    let mut warnings = validate_share_classes(classes)?;

    let boundaries = collect_boundaries(classes);
    let ranges: Vec<(Money, Bound)> = boundaries
        .iter()
        .enumerate()
        .map(|(i, &from)| {
            let to = boundaries
                .get(i + 1)
                .map_or(Bound::Unbounded, |&next| Bound::Finite(next));
            (from, to)
        })
        .collect();

    // coverage[class][range] = shares participating, None when uncovered
    let mut coverage: Vec<Vec<Option<Shares>>> = vec![vec![None; ranges.len()]; classes.len()];
    for (ci, class) in classes.iter().enumerate() {
        for (ri, rule) in class.participation.iter().enumerate() {
            let start = ranges
                .iter()
                .position(|(from, _)| same_boundary(*from, rule.from))
                .ok_or_else(|| {
                    capital_error(class, Some(ri), format!("no derived range starts at {}", rule.from))
                })?;
            let (_, range_to) = ranges[start];
            if !range_to.same_as(&rule.to) {
                return Err(capital_error(
                    class,
                    Some(ri),
                    format!(
                        "range [{}, {}) spans the boundary at {range_to} set by another class; \
                         split the rule at that boundary",
                        rule.from, rule.to
                    ),
                ));
            }
            coverage[ci][start] = Some(rule.shares_participating);
        }
    }

    for (ci, class) in classes.iter().enumerate() {
        let covered: Vec<usize> = (0..ranges.len()).filter(|&r| coverage[ci][r].is_some()).collect();
        if let (Some(&first), Some(&last)) = (covered.first(), covered.last()) {
            for r in first..last {
                if coverage[ci][r].is_none() {
                    let (from, to) = ranges[r];
                    warnings.push(format!(
                        "Class '{}' has no participation rule for [{from}, {to}) between covered ranges; \
                         it receives nothing there",
                        class.name
                    ));
                }
            }
        }
        if class.total_shares > 0.0
            && !class.participation.is_empty()
            && coverage[ci].iter().all(|c| c.unwrap_or(0.0) == 0.0)
        {
            warnings.push(format!(
                "Class '{}' never participates with positive shares",
                class.name
            ));
        }
    }

    let breakpoints: Vec<Breakpoint> = ranges
        .iter()
        .enumerate()
        .map(|(ri, &(from, to))| {
            let total: Shares = coverage.iter().map(|c| c[ri].unwrap_or(0.0)).sum();
            if total <= 0.0 {
                warnings.push(format!(
                    "Breakpoint {ri} [{from}, {to}) has no participating shares; its value is not allocated"
                ));
            }
            let shares_participation = classes
                .iter()
                .enumerate()
                .map(|(ci, class)| {
                    let shares = coverage[ci][ri].unwrap_or(0.0);
                    ShareParticipation {
                        class_name: class.name.clone(),
                        shares,
                        percent_of_total: if total > 0.0 { shares / total * 100.0 } else { 0.0 },
                        incremental_value: 0.0,
                        incremental_percent: 0.0,
                    }
                })
                .collect();
            Breakpoint {
                index: ri,
                from,
                to,
                d1: 0.0,
                d2: 0.0,
                option_value: 0.0,
                incremental_value: 0.0,
                total_participating_shares: total,
                shares_participation,
            }
        })
        .collect();

    Ok(BreakpointSchedule {
        classes: classes
            .iter()
            .map(|c| ClassSummary {
                name: c.name.clone(),
                total_shares: c.total_shares,
            })
            .collect(),
        breakpoints,
        warnings,
    })
}

/// Derive and validate a breakpoint schedule from any capital structure form.
pub fn calculate_breakpoints(
    input: &BreakpointInput,
) -> OpmResult<ComputationOutput<BreakpointSchedule>> {
    let start = Instant::now();
    let schedule = input.capital_structure.resolve()?;
    let warnings = schedule.warnings.clone();

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "OPM Breakpoint Schedule",
        &serde_json::json!({
            "num_classes": schedule.classes.len(),
            "num_breakpoints": schedule.breakpoints.len(),
        }),
        warnings,
        elapsed,
        schedule,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rule(from: f64, to: Bound, shares: f64) -> ParticipationRule {
        ParticipationRule {
            from,
            to,
            shares_participating: shares,
        }
    }

    fn two_class() -> Vec<ShareClass> {
        vec![
            ShareClass {
                name: "Preferred".into(),
                total_shares: 1_000_000.0,
                participation: vec![rule(0.0, Bound::Finite(1_000_000.0), 1_000_000.0)],
            },
            ShareClass {
                name: "Common".into(),
                total_shares: 4_000_000.0,
                participation: vec![rule(1_000_000.0, Bound::Unbounded, 4_000_000.0)],
            },
        ]
    }

    #[test]
    fn test_two_class_ranges() {
        let schedule = derive_breakpoints(&two_class()).unwrap();
        let ranges: Vec<(f64, Bound)> = schedule.breakpoints.iter().map(|b| (b.from, b.to)).collect();
        assert_eq!(
            ranges,
            vec![(0.0, Bound::Finite(1_000_000.0)), (1_000_000.0, Bound::Unbounded)]
        );
        assert!(schedule.warnings.is_empty());

        let first = &schedule.breakpoints[0].shares_participation;
        assert_eq!(first[0].percent_of_total, 100.0);
        assert_eq!(first[1].percent_of_total, 0.0);
        let second = &schedule.breakpoints[1].shares_participation;
        assert_eq!(second[0].shares, 0.0);
        assert_eq!(second[1].percent_of_total, 100.0);
    }

    #[test]
    fn test_flat_structure_single_slice() {
        let classes = vec![ShareClass {
            name: "Common".into(),
            total_shares: 10.0,
            participation: vec![rule(0.0, Bound::Unbounded, 10.0)],
        }];
        let schedule = derive_breakpoints(&classes).unwrap();
        assert_eq!(schedule.breakpoints.len(), 1);
        assert_eq!(schedule.breakpoints[0].to, Bound::Unbounded);
        assert_eq!(schedule.breakpoints[0].total_participating_shares, 10.0);
    }

    #[test]
    fn test_contiguous_and_sorted() {
        let classes = vec![
            ShareClass {
                name: "B".into(),
                total_shares: 5.0,
                participation: vec![
                    rule(300.0, Bound::Finite(700.0), 5.0),
                    rule(700.0, Bound::Unbounded, 5.0),
                ],
            },
            ShareClass {
                name: "A".into(),
                total_shares: 1.0,
                participation: vec![
                    rule(0.0, Bound::Finite(300.0), 1.0),
                    rule(300.0, Bound::Finite(700.0), 1.0),
                    rule(700.0, Bound::Unbounded, 1.0),
                ],
            },
        ];
        let schedule = derive_breakpoints(&classes).unwrap();
        assert_eq!(schedule.breakpoints.len(), 3);
        assert_eq!(schedule.breakpoints[0].from, 0.0);
        for pair in schedule.breakpoints.windows(2) {
            assert!(pair[0].to.same_as(&Bound::Finite(pair[1].from)));
        }
        assert!(validate_schedule(&schedule).is_ok());
    }

    #[test]
    fn test_overlapping_rules_rejected() {
        let classes = vec![ShareClass {
            name: "A".into(),
            total_shares: 1.0,
            participation: vec![
                rule(0.0, Bound::Finite(500.0), 1.0),
                rule(400.0, Bound::Unbounded, 1.0),
            ],
        }];
        match derive_breakpoints(&classes) {
            Err(OpmError::InvalidCapitalStructure { class_name, rule_index, .. }) => {
                assert_eq!(class_name, "A");
                assert_eq!(rule_index, Some(1));
            }
            other => panic!("expected capital structure error, got {other:?}"),
        }
    }

    #[test]
    fn test_rule_straddling_foreign_boundary_rejected() {
        let classes = vec![
            ShareClass {
                name: "Common".into(),
                total_shares: 10.0,
                participation: vec![rule(0.0, Bound::Unbounded, 10.0)],
            },
            ShareClass {
                name: "Options".into(),
                total_shares: 2.0,
                participation: vec![rule(50.0, Bound::Unbounded, 2.0)],
            },
        ];
        let err = derive_breakpoints(&classes).unwrap_err();
        assert!(matches!(
            err,
            OpmError::InvalidCapitalStructure { ref class_name, rule_index: Some(0), .. }
                if class_name == "Common"
        ));
    }

    #[test]
    fn test_gap_in_coverage_is_a_warning() {
        let classes = vec![
            ShareClass {
                name: "Senior".into(),
                total_shares: 1.0,
                participation: vec![
                    rule(0.0, Bound::Finite(100.0), 1.0),
                    rule(100.0, Bound::Finite(200.0), 1.0),
                    rule(200.0, Bound::Unbounded, 1.0),
                ],
            },
            ShareClass {
                name: "Squeezed".into(),
                total_shares: 1.0,
                participation: vec![
                    rule(0.0, Bound::Finite(100.0), 1.0),
                    rule(200.0, Bound::Unbounded, 1.0),
                ],
            },
        ];
        let schedule = derive_breakpoints(&classes).unwrap();
        assert_eq!(schedule.warnings.len(), 1);
        assert!(schedule.warnings[0].contains("'Squeezed'"));
        assert_eq!(schedule.breakpoints[1].shares_participation[1].shares, 0.0);
    }

    #[test]
    fn test_unparticipated_range_is_a_warning() {
        let classes = vec![ShareClass {
            name: "Common".into(),
            total_shares: 1.0,
            participation: vec![rule(100.0, Bound::Unbounded, 1.0)],
        }];
        let schedule = derive_breakpoints(&classes).unwrap();
        assert_eq!(schedule.breakpoints[0].total_participating_shares, 0.0);
        assert!(schedule.warnings.iter().any(|w| w.contains("no participating shares")));
    }

    #[test]
    fn test_duplicate_and_invalid_classes() {
        let mut classes = two_class();
        classes[1].name = "Preferred".into();
        assert!(derive_breakpoints(&classes).is_err());

        let mut classes = two_class();
        classes[0].participation[0].shares_participating = -1.0;
        assert!(derive_breakpoints(&classes).is_err());

        let mut classes = two_class();
        classes[0].participation[0].to = Bound::Finite(0.0);
        assert!(derive_breakpoints(&classes).is_err());

        assert!(derive_breakpoints(&[]).is_err());
    }

    #[test]
    fn test_validate_schedule_rejects_gaps() {
        let mut schedule = derive_breakpoints(&two_class()).unwrap();
        schedule.breakpoints[1].from = 1_100_000.0;
        assert!(matches!(
            validate_schedule(&schedule),
            Err(OpmError::InvalidSchedule { breakpoint_index: 1, .. })
        ));

        let mut schedule = derive_breakpoints(&two_class()).unwrap();
        schedule.breakpoints[1].to = Bound::Finite(9e9);
        assert!(validate_schedule(&schedule).is_err());
    }

    #[test]
    fn test_schedule_input_round_trips_through_json() {
        let json = serde_json::json!({
            "capital_structure": {
                "share_classes": [
                    {"name": "Preferred", "total_shares": 1000000,
                     "participation": [{"from": 0, "to": 1000000, "shares_participating": 1000000}]},
                    {"name": "Common", "total_shares": 4000000,
                     "participation": [{"from": 1000000, "to": "unbounded", "shares_participating": 4000000}]}
                ]
            }
        });
        let input: BreakpointInput = serde_json::from_value(json).unwrap();
        let out = calculate_breakpoints(&input).unwrap();
        assert_eq!(out.result.breakpoints.len(), 2);
        assert_eq!(out.metadata.precision, "ieee754_f64");
    }
}
