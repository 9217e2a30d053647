pub mod black_scholes;

pub use black_scholes::{
    is_degenerate, norm_cdf, price_breakpoint, price_call, validate_params, CallValuation,
    PricingMode,
};
