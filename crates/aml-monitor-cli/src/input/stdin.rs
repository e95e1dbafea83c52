use serde_json::Value;
use std::io::{self, Read};

/// Transaction document piped on stdin, if any.
/// Returns None when stdin is a TTY or the pipe is empty.
pub fn read_piped_document() -> Result<Option<Value>, Box<dyn std::error::Error>> {
    if atty::is(atty::Stream::Stdin) {
        return Ok(None);
    }

    let mut buffer = String::new();
    io::stdin().read_to_string(&mut buffer)?;
    if buffer.trim().is_empty() {
        return Ok(None);
    }

    let document: Value = serde_json::from_str(&buffer)
        .map_err(|e| format!("Failed to parse stdin as JSON: {}", e))?;
    Ok(Some(document))
}
