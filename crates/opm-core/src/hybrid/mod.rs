pub mod engine;
pub mod probability;
pub mod statistics;

pub use engine::{
    evaluate, evaluate_hybrid_pwerm, BlackScholesOverride, HybridGlobals, HybridInput,
    HybridPwermResult, HybridScenario, ScenarioMode, ScenarioResult,
};
pub use probability::{
    normalize_probabilities, normalize_weights, validate_probabilities, ProbabilityFormat,
    ProbabilityValidation,
};
pub use statistics::{weighted_statistics, FmvPercentiles, WeightedStatistics};
