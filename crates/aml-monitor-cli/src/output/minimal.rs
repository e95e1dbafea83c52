use serde_json::Value;

use super::{cases, format_value};

/// Print a one-line answer: case counts by disposition for a scan, record
/// counts for an ingest report, otherwise the first field.
pub fn print_minimal(value: &Value) {
    if let Some(rows) = cases(value) {
        let count = |d: &str| {
            rows.iter()
                .filter(|c| c.get("disposition").and_then(Value::as_str) == Some(d))
                .count()
        };
        println!(
            "{} cases: {} escalated, {} open, {} closed_benign",
            rows.len(),
            count("escalated"),
            count("open"),
            count("closed_benign")
        );
        return;
    }

    if value.get("results").is_some() {
        let field = |k: &str| value.get(k).map(format_value).unwrap_or_default();
        println!(
            "{} accepted, {} duplicate, {} rejected",
            field("accepted"),
            field("duplicate"),
            field("rejected")
        );
        return;
    }

    if let Value::Object(map) = value {
        if let Some((key, val)) = map.iter().next() {
            println!("{}: {}", key, format_value(val));
            return;
        }
    }

    println!("{}", format_value(value));
}
