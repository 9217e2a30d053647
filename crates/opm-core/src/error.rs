use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpmError {
    #[error("Invalid input: {field} — {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Invalid capital structure: class '{class_name}'{} — {reason}", rule_suffix(.rule_index))]
    InvalidCapitalStructure {
        class_name: String,
        rule_index: Option<usize>,
        reason: String,
    },

    #[error("Invalid breakpoint schedule at breakpoint {breakpoint_index}: {reason}")]
    InvalidSchedule {
        breakpoint_index: usize,
        reason: String,
    },

    #[error("Probability validation failed for scenario '{scenario_id}': {reason}")]
    ProbabilityValidation { scenario_id: String, reason: String },

    #[error("Scenario '{scenario_id}': {source}")]
    Scenario {
        scenario_id: String,
        #[source]
        source: Box<OpmError>,
    },

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

fn rule_suffix(rule_index: &Option<usize>) -> String {
    match rule_index {
        Some(i) => format!(" (rule {i})"),
        None => String::new(),
    }
}

impl OpmError {
    pub(crate) fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        OpmError::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Attach the id of the hybrid scenario that raised this error.
    pub fn in_scenario(self, scenario_id: &str) -> Self {
        OpmError::Scenario {
            scenario_id: scenario_id.to_string(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for OpmError {
    fn from(e: serde_json::Error) -> Self {
        OpmError::SerializationError(e.to_string())
    }
}
