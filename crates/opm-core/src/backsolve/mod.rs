pub mod solver;

pub use solver::{
    backsolve_equity_value, default_guess, solve, solve_monotone, BacksolveInput, BacksolveResult,
    IterationRecord, SolverConfig, SolverState,
};
