use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

use crate::error::OpmError;
use crate::pricing::black_scholes::validate_params;
use crate::types::*;
use crate::OpmResult;

/// Day count used to turn a date span into years (ACT/365.25).
const DAYS_PER_YEAR: f64 = 365.25;

const VOLATILITY_KEYS: &[&str] = &[
    "volatility",
    "vol",
    "sigma",
    "equityvolatility",
    "expectedvolatility",
    "annualvolatility",
];
const RISK_FREE_KEYS: &[&str] = &[
    "riskfreerate",
    "riskfree",
    "riskfreeinterestrate",
    "rfr",
];
const TIME_KEYS: &[&str] = &[
    "timetoliquidity",
    "timetoliquidityyears",
    "yearstoliquidity",
    "expectedterm",
    "term",
    "timetoexit",
];
const DIVIDEND_KEYS: &[&str] = &["dividendyield", "dividendrate", "dividend"];
const VALUATION_DATE_KEYS: &[&str] = &["valuationdate", "asofdate", "measurementdate"];
const LIQUIDITY_DATE_KEYS: &[&str] = &[
    "liquiditydate",
    "liquidityeventdate",
    "exitdate",
    "expectedexitdate",
];

/// A single named assumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssumptionEntry {
    #[serde(alias = "name", alias = "id")]
    pub key: String,
    pub value: Value,
}

/// A group of assumptions as stored by a valuation workbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssumptionCategory {
    #[serde(alias = "name")]
    pub category: String,
    #[serde(alias = "items", alias = "fields")]
    pub assumptions: Vec<AssumptionEntry>,
}

/// Either an array of categories or a flat keyed object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssumptionsPayload {
    Categories(Vec<AssumptionCategory>),
    Flat(serde_json::Map<String, Value>),
}

impl AssumptionsPayload {
    fn entries(&self) -> Vec<(String, &Value)> {
        match self {
            AssumptionsPayload::Categories(categories) => categories
                .iter()
                .flat_map(|c| {
                    c.assumptions
                        .iter()
                        .map(move |a| (format!("{}.{}", c.category, a.key), &a.value))
                })
                .collect(),
            AssumptionsPayload::Flat(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        }
    }
}

/// Lowercase and drop everything but letters and digits, so
/// "Risk-Free Rate" and "risk_free_rate" compare equal.
fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Strip a category prefix ("Market.volatility" -> "volatility").
fn bare_key(qualified: &str) -> &str {
    qualified.rsplit('.').next().unwrap_or(qualified)
}

/// Parse a number, numeric string or percent string ("60%" -> 0.6).
fn parse_number(key: &str, value: &Value) -> OpmResult<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            match cleaned.strip_suffix('%') {
                Some(pct) => pct.trim().parse::<f64>().ok().map(|v| v / 100.0),
                None => cleaned.parse::<f64>().ok(),
            }
        }
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(OpmError::invalid_input(
            key,
            format!("expected a number or percent string, got {value}"),
        )),
    }
}

fn parse_date(key: &str, value: &Value) -> OpmResult<NaiveDate> {
    value
        .as_str()
        .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
        .ok_or_else(|| {
            OpmError::invalid_input(key, format!("expected a YYYY-MM-DD date, got {value}"))
        })
}

/// First entry whose key matches one of `aliases`. A second, different
/// value for the same field is reported as a warning.
fn lookup<'a>(
    entries: &'a [(String, &'a Value)],
    aliases: &[&str],
    field: &str,
    warnings: &mut Vec<String>,
) -> Option<(&'a str, &'a Value)> {
    let mut matches = entries
        .iter()
        .filter(|(k, _)| aliases.contains(&normalize_key(bare_key(k)).as_str()));
    let (key, value) = matches.next()?;
    for (other_key, other) in matches {
        if other != value {
            warnings.push(format!(
                "Assumption '{field}' given more than once; using '{key}' and ignoring '{other_key}'"
            ));
        }
    }
    Some((key.as_str(), *value))
}

fn require(found: Option<(&str, &Value)>, field: &str) -> OpmResult<f64> {
    match found {
        Some((key, value)) => parse_number(key, value),
        None => Err(OpmError::InsufficientData(format!(
            "missing assumption '{field}'"
        ))),
    }
}

/// Map a loosely keyed assumptions payload onto Black-Scholes parameters.
///
/// Time to liquidity may come from an explicit value or from a valuation
/// date and liquidity date. Dividend yield defaults to zero.
pub fn to_black_scholes_params(
    payload: &AssumptionsPayload,
) -> OpmResult<(BlackScholesParams, Vec<String>)> {
    let entries = payload.entries();
    let mut warnings = Vec::new();

    let volatility = require(
        lookup(&entries, VOLATILITY_KEYS, "volatility", &mut warnings),
        "volatility",
    )?;
    let risk_free_rate = require(
        lookup(&entries, RISK_FREE_KEYS, "risk_free_rate", &mut warnings),
        "risk_free_rate",
    )?;
    let dividend_yield = match lookup(&entries, DIVIDEND_KEYS, "dividend_yield", &mut warnings) {
        Some((key, value)) => parse_number(key, value)?,
        None => 0.0,
    };

    let explicit_time = lookup(&entries, TIME_KEYS, "time_to_liquidity", &mut warnings);
    let valuation_date = lookup(&entries, VALUATION_DATE_KEYS, "valuation_date", &mut warnings);
    let liquidity_date = lookup(&entries, LIQUIDITY_DATE_KEYS, "liquidity_date", &mut warnings);

    let time_to_liquidity = match (explicit_time, valuation_date, liquidity_date) {
        (Some((key, value)), dates_v, dates_l) => {
            if dates_v.is_some() && dates_l.is_some() {
                warnings.push(
                    "Both time to liquidity and liquidity dates given; using the explicit term"
                        .to_string(),
                );
            }
            parse_number(key, value)?
        }
        (None, Some((vk, vv)), Some((lk, lv))) => {
            let from = parse_date(vk, vv)?;
            let to = parse_date(lk, lv)?;
            if to < from {
                return Err(OpmError::invalid_input(
                    lk,
                    format!("liquidity date {to} is before valuation date {from}"),
                ));
            }
            (to - from).num_days() as f64 / DAYS_PER_YEAR
        }
        _ => {
            return Err(OpmError::InsufficientData(
                "missing assumption 'time_to_liquidity' (or valuation_date and liquidity_date)"
                    .into(),
            ))
        }
    };

    if volatility > 3.0 {
        warnings.push(format!(
            "Volatility {volatility} looks like a percentage; rates are expected as decimals"
        ));
    }
    if risk_free_rate.abs() > 1.0 {
        warnings.push(format!(
            "Risk-free rate {risk_free_rate} looks like a percentage; rates are expected as decimals"
        ));
    }

    let params = BlackScholesParams {
        time_to_liquidity,
        risk_free_rate,
        volatility,
        dividend_yield,
    };
    validate_params(&params)?;
    Ok((params, warnings))
}

/// Convert an assumptions payload, wrapped in the standard output envelope.
pub fn convert_assumptions(
    payload: &AssumptionsPayload,
) -> OpmResult<ComputationOutput<BlackScholesParams>> {
    let start = Instant::now();
    let (params, warnings) = to_black_scholes_params(payload)?;
    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Assumptions to Black-Scholes parameters",
        payload,
        warnings,
        elapsed,
        params,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse(value: Value) -> AssumptionsPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_category_payload() {
        let payload = parse(json!([
            { "category": "Market", "assumptions": [
                { "key": "Volatility", "value": "60%" },
                { "key": "Risk-Free Rate", "value": 0.04 }
            ]},
            { "category": "Exit", "assumptions": [
                { "key": "Time to Liquidity", "value": "3" }
            ]}
        ]));
        let (params, warnings) = to_black_scholes_params(&payload).unwrap();
        assert_eq!(
            params,
            BlackScholesParams {
                time_to_liquidity: 3.0,
                risk_free_rate: 0.04,
                volatility: 0.6,
                dividend_yield: 0.0,
            }
        );
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_flat_payload_with_aliases() {
        let payload = parse(json!({
            "sigma": 0.55,
            "rfr": "4.5 %",
            "expected_term": 2.5,
            "dividend_yield": "1%"
        }));
        let (params, _) = to_black_scholes_params(&payload).unwrap();
        assert_relative_eq!(params.volatility, 0.55);
        assert_relative_eq!(params.risk_free_rate, 0.045, max_relative = 1e-12);
        assert_relative_eq!(params.time_to_liquidity, 2.5);
        assert_relative_eq!(params.dividend_yield, 0.01, max_relative = 1e-12);
    }

    #[test]
    fn test_time_from_dates() {
        let payload = parse(json!({
            "volatility": 0.6,
            "risk_free_rate": 0.04,
            "valuation_date": "2024-01-01",
            "exit_date": "2026-01-01"
        }));
        let (params, _) = to_black_scholes_params(&payload).unwrap();
        assert_relative_eq!(params.time_to_liquidity, 731.0 / 365.25, max_relative = 1e-12);
    }

    #[test]
    fn test_dates_out_of_order_rejected() {
        let payload = parse(json!({
            "volatility": 0.6,
            "risk_free_rate": 0.04,
            "valuation_date": "2026-01-01",
            "liquidity_date": "2024-01-01"
        }));
        assert!(matches!(
            to_black_scholes_params(&payload).unwrap_err(),
            OpmError::InvalidInput { .. }
        ));
    }

    #[test]
    fn test_missing_and_malformed_values() {
        let missing = parse(json!({ "volatility": 0.6, "term": 3 }));
        assert!(matches!(
            to_black_scholes_params(&missing).unwrap_err(),
            OpmError::InsufficientData(_)
        ));

        let malformed = parse(json!({ "volatility": "high", "rfr": 0.04, "term": 3 }));
        match to_black_scholes_params(&malformed).unwrap_err() {
            OpmError::InvalidInput { field, .. } => assert_eq!(field, "volatility"),
            other => panic!("expected invalid input, got {other:?}"),
        }
    }

    #[test]
    fn test_percentage_looking_rate_warns() {
        let payload = parse(json!({ "volatility": 60, "rfr": 0.04, "term": 3 }));
        let (_, warnings) = to_black_scholes_params(&payload).unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_conflicting_duplicates_warn() {
        let payload = parse(json!([
            { "name": "A", "items": [ { "name": "vol", "value": 0.5 } ] },
            { "name": "B", "items": [
                { "name": "volatility", "value": 0.7 },
                { "name": "rfr", "value": 0.03 },
                { "name": "term", "value": 4 }
            ] }
        ]));
        let (params, warnings) = to_black_scholes_params(&payload).unwrap();
        assert_relative_eq!(params.volatility, 0.5);
        assert_eq!(warnings.len(), 1);
    }
}
