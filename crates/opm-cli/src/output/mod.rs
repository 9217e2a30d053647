pub mod csv_out;
pub mod json;
pub mod minimal;
pub mod table;

use crate::OutputFormat;
use colored::Colorize;
use serde_json::Value;

/// Process exit status when a solve ran but did not reach its target.
pub const EXIT_NOT_CONVERGED: i32 = 2;

/// Render a command result in the requested format.
pub fn format_output(format: &OutputFormat, value: &Value) {
    match format {
        OutputFormat::Json => json::print_json(value),
        OutputFormat::Table => table::print_table(value),
        OutputFormat::Csv => csv_out::print_csv(value),
        OutputFormat::Minimal => minimal::print_minimal(value),
    }
    if let Some(errors) = solver_errors(value) {
        eprintln!("{}: result did not converge", "warning".yellow().bold());
        for e in errors {
            eprintln!("  {e}");
        }
    }
}

/// Exit status for a rendered result. Backsolve and hybrid outputs that
/// report `converged: false` map to [`EXIT_NOT_CONVERGED`].
pub fn exit_code(value: &Value) -> i32 {
    match value.pointer("/result/converged") {
        Some(Value::Bool(false)) => EXIT_NOT_CONVERGED,
        _ => 0,
    }
}

fn solver_errors(value: &Value) -> Option<Vec<String>> {
    if exit_code(value) == 0 {
        return None;
    }
    let errors = value
        .pointer("/result/errors")
        .and_then(Value::as_array)
        .map(|errs| {
            errs.iter()
                .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                .collect()
        })
        .unwrap_or_default();
    Some(errors)
}
