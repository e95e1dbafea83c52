use serde_json::Value;
use std::io;

use super::{case_row, cases, format_value, ingest_results, CASE_HEADERS};

/// Write output as CSV to stdout: one row per case for a scan, one row per
/// record for an ingest report, field/value pairs otherwise.
pub fn print_csv(value: &Value) {
    let stdout = io::stdout();
    let mut wtr = csv::Writer::from_writer(stdout.lock());

    if let Some(rows) = cases(value) {
        let _ = wtr.write_record(CASE_HEADERS);
        for case in rows {
            let _ = wtr.write_record(case_row(case));
        }
    } else if let Some(results) = ingest_results(value) {
        let headers = ["transaction_id", "status", "reason"];
        let _ = wtr.write_record(headers);
        for r in results {
            let _ = wtr.write_record(headers.map(|k| r.get(k).map(format_value).unwrap_or_default()));
        }
    } else if let Value::Object(map) = value {
        let _ = wtr.write_record(["field", "value"]);
        for (key, val) in map {
            let _ = wtr.write_record([key.as_str(), &format_value(val)]);
        }
    } else {
        let _ = wtr.write_record([&format_value(value)]);
    }

    let _ = wtr.flush();
}
