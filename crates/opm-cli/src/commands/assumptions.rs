use clap::Args;
use serde_json::Value;

use opm_core::assumptions::{self, AssumptionsPayload};

use crate::input;

/// Arguments for assumptions conversion
#[derive(Args)]
pub struct AssumptionsArgs {
    /// Path to JSON or YAML input file
    #[arg(long)]
    pub input: Option<String>,
}

pub fn run_assumptions(args: AssumptionsArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let payload: AssumptionsPayload =
        input::load(args.input.as_deref(), "assumptions conversion")?;
    let result = assumptions::convert_assumptions(&payload)?;
    Ok(serde_json::to_value(result)?)
}
