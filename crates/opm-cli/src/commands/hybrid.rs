use clap::Args;
use serde_json::Value;

use opm_core::hybrid::engine::{self, HybridInput};

use crate::input;

/// Arguments for hybrid PWERM scenario weighting
#[derive(Args)]
pub struct HybridArgs {
    /// Path to JSON or YAML input file
    #[arg(long)]
    pub input: Option<String>,

    /// Solve one equity value whose weighted FMV equals this target
    #[arg(long)]
    pub joint_target_fmv: Option<f64>,

    /// Fail instead of rescaling probabilities that do not sum to the total
    #[arg(long)]
    pub strict_probabilities: bool,
}

pub fn run_hybrid(args: HybridArgs) -> Result<Value, Box<dyn std::error::Error>> {
    let mut hybrid_input: HybridInput = input::load(args.input.as_deref(), "hybrid PWERM")?;
    if args.joint_target_fmv.is_some() {
        hybrid_input.joint_target_fmv = args.joint_target_fmv;
    }
    if args.strict_probabilities {
        hybrid_input.allow_normalization = false;
    }
    let result = engine::evaluate_hybrid_pwerm(&hybrid_input)?;
    Ok(serde_json::to_value(result)?)
}
