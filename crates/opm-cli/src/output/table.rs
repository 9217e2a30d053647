use serde_json::{Map, Value};
use tabled::{builder::Builder, Table};

/// Result arrays rendered as their own tables, in display order.
const DETAIL_ARRAYS: &[&str] = &["fmv_results", "scenario_results", "breakpoints", "classes"];

/// Format output as tables using the tabled crate.
///
/// Scalar result fields go into a Field/Value table; per-class, per-scenario
/// and per-breakpoint arrays each get a table of their own.
pub fn print_table(value: &Value) {
    match value {
        Value::Object(map) => {
            if let Some(result) = map.get("result") {
                print_result_table(result, map);
            } else {
                print_flat_object(map);
            }
        }
        Value::Array(arr) => print_array_table(arr),
        _ => println!("{}", value),
    }
}

fn print_result_table(result: &Value, envelope: &Map<String, Value>) {
    if let Value::Object(res_map) = result {
        let scalars: Map<String, Value> = res_map
            .iter()
            .filter(|(k, v)| !DETAIL_ARRAYS.contains(&k.as_str()) && !is_noise(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        print_flat_object(&scalars);

        for key in DETAIL_ARRAYS {
            if let Some(Value::Array(rows)) = res_map.get(*key) {
                println!("\n{}:", key);
                print_array_table(rows);
            }
        }

        if let Some(Value::Array(matrix)) = res_map.get("matrix") {
            println!("\nmatrix:");
            print_matrix(res_map, matrix);
        }
    } else {
        print_flat_object(envelope);
    }

    if let Some(Value::Array(warnings)) = envelope.get("warnings") {
        if !warnings.is_empty() {
            println!("\nWarnings:");
            for w in warnings {
                if let Value::String(s) = w {
                    println!("  - {}", s);
                }
            }
        }
    }

    if let Some(Value::String(meth)) = envelope.get("methodology") {
        println!("\nMethodology: {}", meth);
    }
}

/// Fields that are shown elsewhere or are too bulky for the summary table.
fn is_noise(key: &str, value: &Value) -> bool {
    matches!(key, "matrix" | "iteration_history" | "warnings")
        || matches!(value, Value::Array(a) if a.is_empty())
}

fn print_flat_object(map: &Map<String, Value>) {
    let mut builder = Builder::default();
    builder.push_record(["Field", "Value"]);
    for (key, val) in map {
        builder.push_record([key.as_str(), &format_value(val)]);
    }
    println!("{}", Table::from(builder));
}

fn print_array_table(arr: &[Value]) {
    if arr.is_empty() {
        println!("(empty)");
        return;
    }

    if let Some(Value::Object(first)) = arr.first() {
        let headers: Vec<String> = first.keys().cloned().collect();
        let mut builder = Builder::default();
        builder.push_record(&headers);

        for item in arr {
            if let Value::Object(map) = item {
                let row: Vec<String> = headers
                    .iter()
                    .map(|h| map.get(h.as_str()).map(format_value).unwrap_or_default())
                    .collect();
                builder.push_record(row);
            }
        }

        println!("{}", Table::from(builder));
    } else {
        for item in arr {
            println!("{}", format_value(item));
        }
    }
}

/// Sensitivity grid: variable_1 values down the side, variable_2 across the top.
fn print_matrix(res_map: &Map<String, Value>, matrix: &[Value]) {
    let empty = Vec::new();
    let rows = match res_map.get("variable_1_values") {
        Some(Value::Array(v)) => v,
        _ => &empty,
    };
    let cols = match res_map.get("variable_2_values") {
        Some(Value::Array(v)) => v,
        _ => &empty,
    };

    let corner = format!(
        "{} \\ {}",
        res_map.get("variable_1").map(format_value).unwrap_or_default(),
        res_map.get("variable_2").map(format_value).unwrap_or_default()
    );
    let mut builder = Builder::default();
    let mut header = vec![corner];
    header.extend(cols.iter().map(format_value));
    builder.push_record(header);

    for (i, row) in matrix.iter().enumerate() {
        let mut record = vec![rows.get(i).map(format_value).unwrap_or_default()];
        if let Value::Array(cells) = row {
            record.extend(cells.iter().map(format_value));
        }
        builder.push_record(record);
    }
    println!("{}", Table::from(builder));
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "-".to_string(),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(format_value).collect();
            items.join(", ")
        }
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}
