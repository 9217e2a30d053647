pub mod assumptions;
pub mod breakpoints;
pub mod error;
pub mod pricing;
pub mod types;

#[cfg(feature = "backsolve")]
pub mod backsolve;

#[cfg(feature = "hybrid")]
pub mod hybrid;

#[cfg(feature = "sensitivity")]
pub mod sensitivity;

pub use error::OpmError;
pub use types::*;

/// Standard result type for all OPM operations
pub type OpmResult<T> = Result<T, OpmError>;
