use clap::Args;
use serde_json::Value;

use opm_core::breakpoints::allocation::{self, OpmAllocationInput};
use opm_core::breakpoints::schedule::{self, BreakpointInput};

use crate::input;

/// Arguments for breakpoint derivation
#[derive(Args)]
pub struct BreakpointsArgs {
    /// Path to JSON or YAML input file
    #[arg(long)]
    pub input: Option<String>,
}

/// Arguments for a forward allocation
#[derive(Args)]
pub struct AllocateArgs {
    /// Path to JSON or YAML input file
    #[arg(long)]
    pub input: Option<String>,

    /// Override the equity value in the input
    #[arg(long)]
    pub equity_value: Option<f64>,
}

pub fn run_breakpoints(args: BreakpointsArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let bp_input: BreakpointInput = input::load(args.input.as_deref(), "breakpoint derivation")?;
    let result = schedule::calculate_breakpoints(&bp_input)?;
    Ok(serde_json::to_value(result)?)
}

pub fn run_allocate(args: AllocateArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let mut alloc_input: OpmAllocationInput =
        input::load(args.input.as_deref(), "OPM allocation")?;
    if let Some(ev) = args.equity_value {
        alloc_input.equity_value = ev;
    }
    let result = allocation::calculate_opm_allocation(&alloc_input)?;
    Ok(serde_json::to_value(result)?)
}
