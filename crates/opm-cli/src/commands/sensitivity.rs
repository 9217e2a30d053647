use clap::Args;
use serde_json::Value;

use opm_core::sensitivity::grid::{self, OpmSensitivityInput};

use crate::input;

/// Arguments for a two-way FMV sensitivity grid
#[derive(Args)]
pub struct SensitivityArgs {
    /// Path to JSON or YAML input file
    #[arg(long)]
    pub input: Option<String>,
}

pub fn run_sensitivity(args: SensitivityArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let sens_input: OpmSensitivityInput =
        input::load(args.input.as_deref(), "sensitivity analysis")?;
    let result = grid::calculate_sensitivity_grid(&sens_input)?;
    Ok(serde_json::to_value(result)?)
}
