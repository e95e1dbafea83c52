pub mod csv_out;
pub mod json;
pub mod minimal;
pub mod table;

use crate::OutputFormat;
use serde_json::Value;

/// Dispatch output to the appropriate formatter. A `{"sets": {...}}` value
/// from a multi-set run is printed set by set (JSON prints it whole).
pub fn format_output(format: &OutputFormat, value: &Value) {
    if let OutputFormat::Json = format {
        json::print_json(value);
        return;
    }
    match value.get("sets").and_then(Value::as_object) {
        Some(sets) => {
            for (name, set) in sets {
                if !matches!(format, OutputFormat::Csv) {
                    println!("== {} ==", name);
                }
                format_one(format, set);
            }
        }
        None => format_one(format, value),
    }
}

fn format_one(format: &OutputFormat, value: &Value) {
    match format {
        OutputFormat::Json => json::print_json(value),
        OutputFormat::Table => table::print_table(value),
        OutputFormat::Csv => csv_out::print_csv(value),
        OutputFormat::Minimal => minimal::print_minimal(value),
    }
}

/// Case rows of a scan envelope, if `value` is one.
pub(crate) fn cases(value: &Value) -> Option<&Vec<Value>> {
    value
        .get("result")
        .and_then(|r| r.get("feed"))
        .and_then(|f| f.get("cases"))
        .and_then(Value::as_array)
}

/// Per-record results of an ingest report, if `value` is one.
pub(crate) fn ingest_results(value: &Value) -> Option<&Vec<Value>> {
    value.get("results").and_then(Value::as_array)
}

pub(crate) fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(format_value).collect();
            items.join(", ")
        }
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Flattened row for one case.
pub(crate) fn case_row(case: &Value) -> Vec<String> {
    let field = |k: &str| case.get(k).map(format_value).unwrap_or_default();
    vec![
        field("id"),
        field("revision"),
        field("disposition"),
        field("risk_level"),
        field("score"),
        field("kinds"),
        field("entities"),
        field("transaction_ids"),
    ]
}

pub(crate) const CASE_HEADERS: [&str; 8] = [
    "case_id",
    "revision",
    "disposition",
    "risk_level",
    "score",
    "kinds",
    "entities",
    "transaction_ids",
];
