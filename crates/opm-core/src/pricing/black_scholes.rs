use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::f64::consts::SQRT_2;

use crate::error::OpmError;
use crate::types::*;
use crate::OpmResult;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Which branch of the pricer produced a valuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    /// Closed-form Black-Scholes
    Standard,
    /// Strike of zero: the call is worth the dividend-discounted spot
    ZeroStrike,
    /// Strike beyond the top breakpoint: no marginal option value
    UnboundedStrike,
    /// Volatility, time or spot non-positive: intrinsic value fallback
    Intrinsic,
}

/// European call valuation at one strike.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CallValuation {
    pub d1: f64,
    pub d2: f64,
    pub call_value: Money,
    pub mode: PricingMode,
}

// ---------------------------------------------------------------------------
// Normal distribution
// ---------------------------------------------------------------------------

/// Standard normal CDF via the complementary error function.
/// Phi(x) = erfc(-x / sqrt(2)) / 2, accurate well beyond 1e-9.
pub fn norm_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Price a European call on the total equity value.
///
/// Never fails: non-positive volatility, time or spot collapse to intrinsic
/// value and are signalled through [`PricingMode::Intrinsic`]. Callers that
/// need to reject non-finite parameters do so with [`validate_params`].
pub fn price_call(
    spot: Money,
    strike: Bound,
    time_years: Years,
    risk_free_rate: Rate,
    volatility: Rate,
    dividend_yield: Rate,
) -> CallValuation {
    let strike = match strike {
        Bound::Unbounded => {
            return CallValuation {
                d1: 0.0,
                d2: 0.0,
                call_value: 0.0,
                mode: PricingMode::UnboundedStrike,
            }
        }
        Bound::Finite(k) => k,
    };

    let t = time_years;
    let discounted_spot = spot * (-dividend_yield * t).exp();

    if volatility <= 0.0 || t <= 0.0 || spot <= 0.0 {
        let discounted_strike = strike * (-risk_free_rate * t).exp();
        return CallValuation {
            d1: 0.0,
            d2: 0.0,
            call_value: (discounted_spot - discounted_strike).max(0.0),
            mode: PricingMode::Intrinsic,
        };
    }

    if strike <= 0.0 {
        return CallValuation {
            d1: 0.0,
            d2: 0.0,
            call_value: discounted_spot,
            mode: PricingMode::ZeroStrike,
        };
    }

    let sigma_sqrt_t = volatility * t.sqrt();
    let d1 = ((spot / strike).ln()
        + (risk_free_rate - dividend_yield + volatility * volatility / 2.0) * t)
        / sigma_sqrt_t;
    let d2 = d1 - sigma_sqrt_t;
    let call_value =
        discounted_spot * norm_cdf(d1) - strike * (-risk_free_rate * t).exp() * norm_cdf(d2);

    CallValuation {
        d1,
        d2,
        // Deep out-of-the-money rounding can leave a tiny negative residue
        call_value: call_value.max(0.0),
        mode: PricingMode::Standard,
    }
}

/// [`price_call`] with the market parameters taken from `params`.
pub fn price_breakpoint(spot: Money, strike: Bound, params: &BlackScholesParams) -> CallValuation {
    price_call(
        spot,
        strike,
        params.time_to_liquidity,
        params.risk_free_rate,
        params.volatility,
        params.dividend_yield,
    )
}

/// True when these parameters force the intrinsic-value fallback.
pub fn is_degenerate(params: &BlackScholesParams) -> bool {
    params.volatility <= 0.0 || params.time_to_liquidity <= 0.0
}

/// Reject parameters no pricing branch can make sense of.
pub fn validate_params(params: &BlackScholesParams) -> OpmResult<()> {
    let fields = [
        ("time_to_liquidity", params.time_to_liquidity),
        ("risk_free_rate", params.risk_free_rate),
        ("volatility", params.volatility),
        ("dividend_yield", params.dividend_yield),
    ];
    for (field, value) in fields {
        if !value.is_finite() {
            return Err(OpmError::InvalidInput {
                field: field.into(),
                reason: format!("must be finite (got {value})"),
            });
        }
    }
    if params.dividend_yield < 0.0 {
        return Err(OpmError::InvalidInput {
            field: "dividend_yield".into(),
            reason: "cannot be negative".into(),
        });
    }
    if params.time_to_liquidity < 0.0 {
        return Err(OpmError::InvalidInput {
            field: "time_to_liquidity".into(),
            reason: "cannot be negative".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn params() -> BlackScholesParams {
        BlackScholesParams {
            time_to_liquidity: 3.0,
            risk_free_rate: 0.04,
            volatility: 0.60,
            dividend_yield: 0.0,
        }
    }

    #[test]
    fn test_norm_cdf_reference_values() {
        assert_abs_diff_eq!(norm_cdf(0.0), 0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(norm_cdf(1.0), 0.841_344_746_068_542_9, epsilon = 1e-10);
        assert_abs_diff_eq!(norm_cdf(-1.96), 0.024_997_895_148_220_435, epsilon = 1e-10);
        assert_abs_diff_eq!(norm_cdf(3.5), 0.999_767_370_920_964_2, epsilon = 1e-10);
        assert_abs_diff_eq!(norm_cdf(-40.0), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_textbook_call() {
        // Hull: S=42, K=40, r=10%, sigma=20%, T=0.5 -> c = 4.76
        let v = price_call(42.0, Bound::Finite(40.0), 0.5, 0.10, 0.20, 0.0);
        assert_eq!(v.mode, PricingMode::Standard);
        assert_abs_diff_eq!(v.d1, 0.7693, epsilon = 1e-4);
        assert_abs_diff_eq!(v.d2, 0.6278, epsilon = 1e-4);
        assert_abs_diff_eq!(v.call_value, 4.7594, epsilon = 1e-4);
    }

    #[test]
    fn test_unbounded_strike_is_worthless() {
        let v = price_breakpoint(5_000_000.0, Bound::Unbounded, &params());
        assert_eq!(v.call_value, 0.0);
        assert_eq!((v.d1, v.d2), (0.0, 0.0));
        assert_eq!(v.mode, PricingMode::UnboundedStrike);
    }

    #[test]
    fn test_huge_finite_strike_is_not_unbounded() {
        let v = price_breakpoint(5_000_000.0, Bound::Finite(f64::MAX), &params());
        assert_eq!(v.mode, PricingMode::Standard);
        assert_eq!(v.call_value, 0.0);
    }

    #[test]
    fn test_zero_strike_equals_discounted_spot() {
        let mut p = params();
        p.dividend_yield = 0.02;
        let v = price_breakpoint(1_000.0, Bound::Finite(0.0), &p);
        assert_eq!(v.mode, PricingMode::ZeroStrike);
        assert_relative_eq!(v.call_value, 1_000.0 * (-0.06f64).exp(), max_relative = 1e-12);
    }

    #[test]
    fn test_zero_volatility_falls_back_to_intrinsic() {
        let v = price_call(150.0, Bound::Finite(100.0), 1.0, 0.05, 0.0, 0.0);
        assert_eq!(v.mode, PricingMode::Intrinsic);
        assert_relative_eq!(v.call_value, 150.0 - 100.0 * (-0.05f64).exp(), max_relative = 1e-12);

        let otm = price_call(50.0, Bound::Finite(100.0), 0.0, 0.05, 0.3, 0.0);
        assert_eq!(otm.mode, PricingMode::Intrinsic);
        assert_eq!(otm.call_value, 0.0);
    }

    #[test]
    fn test_zero_spot_is_worthless() {
        let v = price_breakpoint(0.0, Bound::Finite(0.0), &params());
        assert_eq!(v.call_value, 0.0);
    }

    #[test]
    fn test_call_decreases_in_strike() {
        let p = params();
        let mut last = f64::INFINITY;
        for k in [0.0, 1e5, 1e6, 5e6, 1e7, 1e8] {
            let v = price_breakpoint(5_000_000.0, Bound::Finite(k), &p).call_value;
            assert!(v <= last);
            last = v;
        }
    }

    #[test]
    fn test_validate_params() {
        assert!(validate_params(&params()).is_ok());

        let mut p = params();
        p.volatility = f64::NAN;
        assert!(validate_params(&p).is_err());

        let mut p = params();
        p.dividend_yield = -0.01;
        assert!(validate_params(&p).is_err());

        let mut p = params();
        p.time_to_liquidity = -0.5;
        assert!(validate_params(&p).is_err());

        // Degenerate but valid: handled by the intrinsic fallback
        let mut p = params();
        p.volatility = 0.0;
        assert!(validate_params(&p).is_ok());
        assert!(is_degenerate(&p));
    }
}
