use serde_json::Value;

/// Print just the key answer from the output.
///
/// Heuristic: a headline scalar if the result has one, otherwise one
/// `class: fmv_per_share` line per class, otherwise the first field.
pub fn print_minimal(value: &Value) {
    let result_obj = value
        .as_object()
        .and_then(|m| m.get("result"))
        .unwrap_or(value);

    // Hybrid, backsolve and sensitivity headlines
    let priority_keys = ["weighted_fmv", "enterprise_value", "base_case_value"];

    if let Value::Object(map) = result_obj {
        for key in &priority_keys {
            if let Some(val) = map.get(*key) {
                if !val.is_null() {
                    println!("{}", format_minimal(val));
                    return;
                }
            }
        }

        if let Some(Value::Array(fmvs)) = map.get("fmv_results") {
            for fmv in fmvs {
                let class = fmv.get("class_name").map(format_minimal).unwrap_or_default();
                let per_share = fmv.get("fmv_per_share").map(format_minimal).unwrap_or_default();
                println!("{class}: {per_share}");
            }
            return;
        }

        if let Some(Value::Array(breakpoints)) = map.get("breakpoints") {
            for bp in breakpoints {
                let from = bp.get("from").map(format_minimal).unwrap_or_default();
                let to = bp.get("to").map(format_minimal).unwrap_or_default();
                println!("[{from}, {to})");
            }
            return;
        }

        if let Some((key, val)) = map.iter().next() {
            println!("{}: {}", key, format_minimal(val));
            return;
        }
    }

    println!("{}", format_minimal(result_obj));
}

fn format_minimal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
