use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Monetary values (equity value, slice value, FMV). IEEE-754 throughout.
pub type Money = f64;

/// Rates expressed as decimals (0.05 = 5%). Never as percentages.
pub type Rate = f64;

/// Year fractions
pub type Years = f64;

/// Share counts. Fractional counts are allowed for as-converted figures.
pub type Shares = f64;

/// Relative tolerance used when two boundaries on the equity-value axis are
/// considered the same point.
pub const BOUNDARY_TOLERANCE: f64 = 1e-9;

/// Upper bound of a breakpoint range.
///
/// `Unbounded` is a dedicated variant rather than a large magic number, so a
/// legitimately huge finite equity value can never collide with it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BoundRepr", into = "BoundRepr")]
pub enum Bound {
    Finite(Money),
    Unbounded,
}

impl Bound {
    pub fn is_unbounded(&self) -> bool {
        matches!(self, Bound::Unbounded)
    }

    pub fn finite(&self) -> Option<Money> {
        match self {
            Bound::Finite(v) => Some(*v),
            Bound::Unbounded => None,
        }
    }

    /// Same point on the equity axis. Unbounded only matches unbounded.
    pub fn same_as(&self, other: &Bound) -> bool {
        match (self, other) {
            (Bound::Finite(a), Bound::Finite(b)) => same_boundary(*a, *b),
            (Bound::Unbounded, Bound::Unbounded) => true,
            _ => false,
        }
    }
}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Bound::Finite(a), Bound::Finite(b)) => a.partial_cmp(b),
            (Bound::Finite(_), Bound::Unbounded) => Some(Ordering::Less),
            (Bound::Unbounded, Bound::Finite(_)) => Some(Ordering::Greater),
            (Bound::Unbounded, Bound::Unbounded) => Some(Ordering::Equal),
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Finite(v) => write!(f, "{v}"),
            Bound::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Wire form of [`Bound`]: a JSON number or the string `"unbounded"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum BoundRepr {
    Finite(f64),
    Tag(String),
}

impl TryFrom<BoundRepr> for Bound {
    type Error = String;

    fn try_from(repr: BoundRepr) -> Result<Self, Self::Error> {
        match repr {
            BoundRepr::Finite(v) if v.is_finite() => Ok(Bound::Finite(v)),
            BoundRepr::Finite(v) => Err(format!("bound must be finite or \"unbounded\", got {v}")),
            BoundRepr::Tag(tag) => match tag.to_ascii_lowercase().as_str() {
                "unbounded" | "infinity" | "inf" => Ok(Bound::Unbounded),
                other => Err(format!("unknown bound '{other}'")),
            },
        }
    }
}

impl From<Bound> for BoundRepr {
    fn from(bound: Bound) -> Self {
        match bound {
            Bound::Finite(v) => BoundRepr::Finite(v),
            Bound::Unbounded => BoundRepr::Tag("unbounded".to_string()),
        }
    }
}

/// True when two finite boundaries denote the same point on the equity axis.
pub fn same_boundary(a: Money, b: Money) -> bool {
    (a - b).abs() <= BOUNDARY_TOLERANCE * a.abs().max(b.abs()).max(1.0)
}

/// Market parameters for Black-Scholes pricing of breakpoint strikes.
///
/// Spot (the total equity value) and strike (the breakpoint) are supplied per
/// call; everything else is fixed for a valuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackScholesParams {
    /// Years to the expected liquidity event
    pub time_to_liquidity: Years,
    pub risk_free_rate: Rate,
    pub volatility: Rate,
    #[serde(default)]
    pub dividend_yield: Rate,
}

/// Standard computation output envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationOutput<T: Serialize> {
    pub result: T,
    pub methodology: String,
    pub assumptions: serde_json::Value,
    pub warnings: Vec<String>,
    pub metadata: ComputationMetadata,
}

/// Metadata for every computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationMetadata {
    pub version: String,
    pub computation_time_us: u64,
    pub precision: String,
}

/// Helper to wrap computation results with metadata
pub fn with_metadata<T: Serialize>(
    methodology: &str,
    assumptions: &impl Serialize,
    warnings: Vec<String>,
    elapsed_us: u64,
    result: T,
) -> ComputationOutput<T> {
    ComputationOutput {
        result,
        methodology: methodology.to_string(),
        assumptions: serde_json::to_value(assumptions).unwrap_or_default(),
        warnings,
        metadata: ComputationMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            computation_time_us: elapsed_us,
            precision: "ieee754_f64".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_ordering() {
        assert!(Bound::Finite(1e300) < Bound::Unbounded);
        assert!(Bound::Finite(1.0) < Bound::Finite(2.0));
        assert!(Bound::Unbounded.same_as(&Bound::Unbounded));
        assert!(!Bound::Finite(f64::MAX).same_as(&Bound::Unbounded));
    }

    #[test]
    fn test_bound_wire_format() {
        let json = serde_json::to_string(&vec![Bound::Finite(1_000_000.0), Bound::Unbounded]).unwrap();
        assert_eq!(json, "[1000000.0,\"unbounded\"]");

        let back: Vec<Bound> = serde_json::from_str("[5, \"Infinity\"]").unwrap();
        assert_eq!(back, vec![Bound::Finite(5.0), Bound::Unbounded]);

        assert!(serde_json::from_str::<Bound>("\"huge\"").is_err());
    }

    #[test]
    fn test_same_boundary_relative() {
        assert!(same_boundary(1_000_000.0, 1_000_000.0 + 1e-4));
        assert!(!same_boundary(1_000_000.0, 1_000_001.0));
        assert!(same_boundary(0.0, 0.0));
    }

    #[test]
    fn test_dividend_yield_defaults_to_zero() {
        let params: BlackScholesParams = serde_json::from_str(
            r#"{"time_to_liquidity": 3, "risk_free_rate": 0.04, "volatility": 0.6}"#,
        )
        .unwrap();
        assert_eq!(params.dividend_yield, 0.0);
    }
}
