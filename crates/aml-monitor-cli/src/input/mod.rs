pub mod file;
pub mod stdin;

use aml_monitor_core::schema::TransactionBatch;
use serde_json::Value;

/// Read the input document from `--input` or, failing that, piped stdin.
pub fn read_document(path: Option<&str>, command: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        return file::read_json_value(path);
    }
    match stdin::read_piped_document()? {
        Some(document) => Ok(document),
        None => Err(format!("--input <file.json> or stdin required for {}", command).into()),
    }
}

/// Split a document into named batches.
///
/// A batch envelope (top-level `transactions`) or a bare array of records is
/// one batch named `input`. Otherwise every top-level key holding a
/// `transactions` array is a named set; `set` picks one of them.
pub fn batches(
    document: Value,
    set: Option<&str>,
) -> Result<Vec<(String, TransactionBatch)>, Box<dyn std::error::Error>> {
    if document.get("transactions").is_some() {
        let batch: TransactionBatch = serde_json::from_value(document)?;
        return Ok(vec![("input".to_string(), batch)]);
    }

    match document {
        Value::Array(records) => Ok(vec![(
            "input".to_string(),
            TransactionBatch {
                schema_version: None,
                transactions: records,
            },
        )]),
        Value::Object(map) => {
            let mut sets = Vec::new();
            for (name, value) in map {
                if value.get("transactions").is_none() {
                    continue;
                }
                if set.is_some_and(|wanted| wanted != name) {
                    continue;
                }
                let batch: TransactionBatch = serde_json::from_value(value)
                    .map_err(|e| format!("Failed to parse set '{}': {}", name, e))?;
                sets.push((name, batch));
            }
            if sets.is_empty() {
                return Err(match set {
                    Some(wanted) => format!("Set '{}' not found in input", wanted),
                    None => "No transaction sets found in input".to_string(),
                }
                .into());
            }
            Ok(sets)
        }
        _ => Err("Input must be a batch object, a map of named sets, or an array of records".into()),
    }
}
