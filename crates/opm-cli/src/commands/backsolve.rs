use clap::Args;
use serde_json::Value;

use opm_core::backsolve::solver::{self, BacksolveInput};

use crate::input;

/// Arguments for an equity value backsolve
#[derive(Args)]
pub struct BacksolveArgs {
    /// Path to JSON or YAML input file
    #[arg(long)]
    pub input: Option<String>,

    /// Override the target FMV per share
    #[arg(long)]
    pub target_fmv: Option<f64>,

    /// Override the share class being solved for
    #[arg(long = "class")]
    pub security_class_id: Option<String>,

    /// Omit the per-iteration history from the output
    #[arg(long)]
    pub no_history: bool,
}

pub fn run_backsolve(args: BacksolveArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let mut bs_input: BacksolveInput = input::load(args.input.as_deref(), "backsolve")?;
    if let Some(target) = args.target_fmv {
        bs_input.target_fmv = target;
    }
    if let Some(class) = args.security_class_id {
        bs_input.security_class_id = class;
    }
    if args.no_history {
        bs_input.solver.record_history = false;
    }
    let result = solver::backsolve_equity_value(&bs_input)?;
    Ok(serde_json::to_value(result)?)
}
