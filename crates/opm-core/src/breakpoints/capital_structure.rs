use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::breakpoints::schedule::{ParticipationRule, ShareClass};
use crate::error::OpmError;
use crate::types::*;
use crate::OpmResult;

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

/// Economic terms of a security class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityTerms {
    Common,
    Preferred {
        /// Original issue price, the base of the preference
        liquidation_preference_per_share: Money,
        #[serde(default = "default_one")]
        preference_multiple: f64,
        /// 1 is most senior; equal ranks are paid pari passu
        #[serde(default = "default_seniority")]
        seniority: u32,
        #[serde(default)]
        participating: bool,
        /// Total per-share return cap as a multiple of the preference per
        /// share. Only meaningful for participating preferred.
        #[serde(default)]
        participation_cap: Option<f64>,
        /// Common shares received per preferred share on conversion
        #[serde(default = "default_one")]
        conversion_ratio: f64,
    },
    /// Options and warrants
    Option { exercise_price: Money },
}

fn default_one() -> f64 {
    1.0
}

fn default_seniority() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityClass {
    pub name: String,
    pub shares: Shares,
    pub terms: SecurityTerms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalStructure {
    pub securities: Vec<SecurityClass>,
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

/// A range of the equity axis with the weight each security holds in it.
struct Segment {
    from: Money,
    to: Bound,
    weights: Vec<Shares>,
}

/// Change to the residual participating set at a per-share value threshold.
struct ResidualEvent {
    threshold: Money,
    security: usize,
    delta: Shares,
}

fn security_error(sec: &SecurityClass, reason: impl Into<String>) -> OpmError {
    OpmError::InvalidCapitalStructure {
        class_name: sec.name.clone(),
        rule_index: None,
        reason: reason.into(),
    }
}

fn validate_security(sec: &SecurityClass, warnings: &mut Vec<String>) -> OpmResult<()> {
    if !sec.shares.is_finite() || sec.shares < 0.0 {
        return Err(security_error(sec, "shares must be finite and non-negative"));
    }
    match &sec.terms {
        SecurityTerms::Common => {}
        SecurityTerms::Preferred {
            liquidation_preference_per_share,
            preference_multiple,
            participating,
            participation_cap,
            conversion_ratio,
            ..
        } => {
            if !liquidation_preference_per_share.is_finite() || *liquidation_preference_per_share < 0.0
            {
                return Err(security_error(
                    sec,
                    "liquidation_preference_per_share must be finite and non-negative",
                ));
            }
            if !preference_multiple.is_finite() || *preference_multiple < 0.0 {
                return Err(security_error(sec, "preference_multiple must be finite and non-negative"));
            }
            if !conversion_ratio.is_finite() || *conversion_ratio <= 0.0 {
                return Err(security_error(sec, "conversion_ratio must be positive"));
            }
            if let Some(cap) = participation_cap {
                if !cap.is_finite() || *cap < *preference_multiple {
                    return Err(security_error(
                        sec,
                        format!("participation_cap {cap} must be at least the preference multiple {preference_multiple}"),
                    ));
                }
                if !participating {
                    warnings.push(format!(
                        "Security '{}' is non-participating; its participation cap is ignored",
                        sec.name
                    ));
                }
            }
        }
        SecurityTerms::Option { exercise_price } => {
            if !exercise_price.is_finite() || *exercise_price < 0.0 {
                return Err(security_error(sec, "exercise_price must be finite and non-negative"));
            }
        }
    }
    Ok(())
}

/// Preference tiers, most senior first: (segment width, per-security weights).
fn preference_stack(securities: &[SecurityClass]) -> Vec<(Money, Vec<Shares>)> {
    let mut tiers: BTreeMap<u32, Vec<(usize, Money)>> = BTreeMap::new();
    for (i, sec) in securities.iter().enumerate() {
        if let SecurityTerms::Preferred {
            liquidation_preference_per_share,
            preference_multiple,
            seniority,
            ..
        } = sec.terms
        {
            let amount = sec.shares * liquidation_preference_per_share * preference_multiple;
            if amount > 0.0 {
                tiers.entry(seniority).or_default().push((i, amount));
            }
        }
    }

    tiers
        .into_values()
        .map(|members| {
            let tier_amount: Money = members.iter().map(|(_, a)| a).sum();
            let tier_shares: Shares = members.iter().map(|(i, _)| securities[*i].shares).sum();
            let mut weights = vec![0.0; securities.len()];
            // Pari passu: split by preference amount, expressed in tier shares
            for (i, amount) in members {
                weights[i] = tier_shares * amount / tier_amount;
            }
            (tier_amount, weights)
        })
        .collect()
}

/// Membership changes of the residual (post-preference) participating set.
fn residual_events(securities: &[SecurityClass]) -> Vec<ResidualEvent> {
    let mut events = Vec::new();
    for (i, sec) in securities.iter().enumerate() {
        match sec.terms {
            SecurityTerms::Common => events.push(ResidualEvent {
                threshold: 0.0,
                security: i,
                delta: sec.shares,
            }),
            SecurityTerms::Option { exercise_price } => events.push(ResidualEvent {
                threshold: exercise_price,
                security: i,
                delta: sec.shares,
            }),
            SecurityTerms::Preferred {
                liquidation_preference_per_share,
                preference_multiple,
                participating,
                participation_cap,
                conversion_ratio,
                ..
            } => {
                let as_converted = sec.shares * conversion_ratio;
                let preference = liquidation_preference_per_share * preference_multiple;
                match (participating, participation_cap) {
                    (false, _) => events.push(ResidualEvent {
                        threshold: preference / conversion_ratio,
                        security: i,
                        delta: as_converted,
                    }),
                    (true, None) => events.push(ResidualEvent {
                        threshold: 0.0,
                        security: i,
                        delta: as_converted,
                    }),
                    (true, Some(cap)) => {
                        let cap_per_share = cap * liquidation_preference_per_share;
                        let stop = (cap_per_share - preference) / conversion_ratio;
                        let convert = cap_per_share / conversion_ratio;
                        if stop > 0.0 {
                            events.push(ResidualEvent {
                                threshold: 0.0,
                                security: i,
                                delta: as_converted,
                            });
                            events.push(ResidualEvent {
                                threshold: stop,
                                security: i,
                                delta: -as_converted,
                            });
                        }
                        events.push(ResidualEvent {
                            threshold: convert,
                            security: i,
                            delta: as_converted,
                        });
                    }
                }
            }
        }
    }
    events.sort_by(|a, b| {
        a.threshold
            .partial_cmp(&b.threshold)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    events
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Derive participation rules from security terms.
///
/// Preferences are stacked by seniority from zero. Above the stack, value
/// is tracked per as-converted common share: options join at their exercise
/// price, non-participating preferred converts once common is worth its
/// preference, and capped participating preferred drops out at its cap and
/// re-joins on conversion. Every class gets one rule per derived range, with
/// zero shares where it does not participate.
pub fn build_share_classes(
    structure: &CapitalStructure,
) -> OpmResult<(Vec<ShareClass>, Vec<String>)> {
    let securities = &structure.securities;
    let mut warnings = Vec::new();

    if securities.is_empty() {
        return Err(OpmError::InsufficientData(
            "At least one security required".into(),
        ));
    }
    for sec in securities {
        validate_security(sec, &mut warnings)?;
    }

    let mut segments: Vec<Segment> = Vec::new();
    let mut equity = 0.0;
    for (amount, weights) in preference_stack(securities) {
        segments.push(Segment {
            from: equity,
            to: Bound::Finite(equity + amount),
            weights,
        });
        equity += amount;
    }

    let events = residual_events(securities);
    let mut active = vec![0.0; securities.len()];
    let mut per_share = 0.0;
    let mut k = 0;
    loop {
        while k < events.len() && events[k].threshold <= per_share {
            let ev = &events[k];
            active[ev.security] = (active[ev.security] + ev.delta).max(0.0);
            k += 1;
        }

        let active_total: Shares = active.iter().sum();
        if k == events.len() {
            if active_total <= 0.0 {
                warnings.push(format!(
                    "No shares participate above equity value {equity}; that value is not allocated"
                ));
            }
            segments.push(Segment {
                from: equity,
                to: Bound::Unbounded,
                weights: active.clone(),
            });
            break;
        }

        let next = events[k].threshold;
        if active_total <= 0.0 {
            warnings.push(format!(
                "No shares participate between per-share values {per_share} and {next}; \
                 threshold treated as reached at equity value {equity}"
            ));
            per_share = next;
            continue;
        }

        let width = (next - per_share) * active_total;
        if !same_boundary(equity + width, equity) {
            segments.push(Segment {
                from: equity,
                to: Bound::Finite(equity + width),
                weights: active.clone(),
            });
            equity += width;
        }
        per_share = next;
    }

    let classes = securities
        .iter()
        .enumerate()
        .map(|(i, sec)| ShareClass {
            name: sec.name.clone(),
            total_shares: sec.shares,
            participation: segments
                .iter()
                .map(|seg| ParticipationRule {
                    from: seg.from,
                    to: seg.to,
                    shares_participating: seg.weights[i],
                })
                .collect(),
        })
        .collect();

    Ok((classes, warnings))
}
