use serde_json::Value;
use tabled::{builder::Builder, Table};

use super::{case_row, cases, format_value, ingest_results, CASE_HEADERS};

/// Format output as tables using the tabled crate.
pub fn print_table(value: &Value) {
    if let Some(rows) = cases(value) {
        print_scan(value, rows);
    } else if let Some(results) = ingest_results(value) {
        print_records(results);
        print_field_table(value, &["accepted", "duplicate", "rejected"]);
    } else {
        print_flat_object(value);
    }
}

fn print_scan(envelope: &Value, rows: &[Value]) {
    if rows.is_empty() {
        println!("No cases.");
    } else {
        let mut builder = Builder::default();
        builder.push_record(CASE_HEADERS);
        for case in rows {
            builder.push_record(case_row(case));
        }
        println!("{}", Table::from(builder));

        println!("\nEvidence:");
        for case in rows {
            let id = case.get("id").map(format_value).unwrap_or_default();
            if let Some(Value::Array(evidence)) = case.get("evidence") {
                for e in evidence {
                    let kind = e.get("kind").map(format_value).unwrap_or_default();
                    let summary = e.get("summary").map(format_value).unwrap_or_default();
                    println!("  {} [{}] {}", id, kind, summary);
                }
            }
        }
    }

    if let Some(summary) = envelope.get("result").and_then(|r| r.get("summary")) {
        println!();
        print_flat_object(summary);
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

fn print_records(results: &[Value]) {
    let mut builder = Builder::default();
    builder.push_record(["transaction_id", "status", "reason"]);
    for r in results {
        builder.push_record(
            ["transaction_id", "status", "reason"]
                .map(|k| r.get(k).map(format_value).unwrap_or_default()),
        );
    }
    println!("{}", Table::from(builder));
}

fn print_field_table(value: &Value, keys: &[&str]) {
    let mut builder = Builder::default();
    builder.push_record(["Field", "Value"]);
    for key in keys {
        if let Some(v) = value.get(*key) {
            builder.push_record([key.to_string(), format_value(v)]);
        }
    }
    println!("{}", Table::from(builder));
}

fn print_flat_object(value: &Value) {
    match value {
        Value::Object(map) => {
            let mut builder = Builder::default();
            builder.push_record(["Field", "Value"]);
            for (key, val) in map {
                builder.push_record([key.as_str(), &format_value(val)]);
            }
            println!("{}", Table::from(builder));
        }
        _ => println!("{}", format_value(value)),
    }
}
