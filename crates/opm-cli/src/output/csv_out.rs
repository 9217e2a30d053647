use serde_json::{Map, Value};
use std::io;

type StdoutWriter<'a> = csv::Writer<io::StdoutLock<'a>>;

/// Result arrays that become the CSV rows, in order of preference.
const ROW_ARRAYS: &[&str] = &["scenario_results", "fmv_results", "breakpoints"];

/// Write output as CSV to stdout.
///
/// The most detailed per-row array in the result becomes the CSV body; a
/// sensitivity matrix is written as a grid; anything else as field,value.
pub fn print_csv(value: &Value) {
    let stdout = io::stdout();
    let mut wtr = csv::Writer::from_writer(stdout.lock());

    match value {
        Value::Object(map) => match map.get("result") {
            Some(Value::Object(result)) => write_result_csv(&mut wtr, result),
            _ => write_fields_csv(&mut wtr, map),
        },
        Value::Array(arr) => write_array_csv(&mut wtr, arr),
        _ => {
            let _ = wtr.write_record([&format_csv_value(value)]);
        }
    }

    let _ = wtr.flush();
}

fn write_result_csv(wtr: &mut StdoutWriter<'_>, result: &Map<String, Value>) {
    if let Some(Value::Array(matrix)) = result.get("matrix") {
        write_matrix_csv(wtr, result, matrix);
        return;
    }
    for key in ROW_ARRAYS {
        if let Some(Value::Array(rows)) = result.get(*key) {
            if !rows.is_empty() {
                write_array_csv(wtr, rows);
                return;
            }
        }
    }
    write_fields_csv(wtr, result);
}

fn write_fields_csv(wtr: &mut StdoutWriter<'_>, map: &Map<String, Value>) {
    let _ = wtr.write_record(["field", "value"]);
    for (key, val) in map {
        let _ = wtr.write_record([key.as_str(), &format_csv_value(val)]);
    }
}

fn write_matrix_csv(wtr: &mut StdoutWriter<'_>, result: &Map<String, Value>, matrix: &[Value]) {
    let row_values = result.get("variable_1_values").and_then(Value::as_array);
    let col_values = result.get("variable_2_values").and_then(Value::as_array);

    let mut header = vec![format!(
        "{}\\{}",
        result.get("variable_1").map(format_csv_value).unwrap_or_default(),
        result.get("variable_2").map(format_csv_value).unwrap_or_default()
    )];
    if let Some(cols) = col_values {
        header.extend(cols.iter().map(format_csv_value));
    }
    let _ = wtr.write_record(&header);

    for (i, row) in matrix.iter().enumerate() {
        let mut record = vec![row_values
            .and_then(|r| r.get(i))
            .map(format_csv_value)
            .unwrap_or_default()];
        if let Value::Array(cells) = row {
            record.extend(cells.iter().map(format_csv_value));
        }
        let _ = wtr.write_record(&record);
    }
}

fn write_array_csv(wtr: &mut StdoutWriter<'_>, arr: &[Value]) {
    if arr.is_empty() {
        return;
    }

    if let Some(Value::Object(first)) = arr.first() {
        let headers: Vec<&str> = first.keys().map(|k| k.as_str()).collect();
        let _ = wtr.write_record(&headers);

        for item in arr {
            if let Value::Object(map) = item {
                let row: Vec<String> = headers
                    .iter()
                    .map(|h| map.get(*h).map(format_csv_value).unwrap_or_default())
                    .collect();
                let _ = wtr.write_record(&row);
            }
        }
    } else {
        for item in arr {
            let _ = wtr.write_record([&format_csv_value(item)]);
        }
    }
}

fn format_csv_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
