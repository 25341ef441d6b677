//! Utility functions for chunkmesh

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::time::{SystemTime, UNIX_EPOCH};

/// Percent-encoding set for file ids embedded in node query strings.
/// File ids are opaque, so every character that would restructure a
/// query string must be escaped.
const FILE_ID_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&')
    .add(b'=')
    .add(b'+');

/// Encode a file id for use in a url query string
pub fn encode_file_id(file_id: &str) -> String {
    utf8_percent_encode(file_id, FILE_ID_ENCODE_SET).to_string()
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Validate a node url (must be an absolute http(s) url without trailing slash)
pub fn validate_node_url(url: &str) -> crate::Result<()> {
    if url.is_empty() {
        return Err(crate::Error::Validation("node url cannot be empty".into()));
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(crate::Error::Validation(format!(
            "node url must start with http:// or https://: {}",
            url
        )));
    }
    if url.ends_with('/') {
        return Err(crate::Error::Validation(format!(
            "node url must not end with a slash: {}",
            url
        )));
    }
    Ok(())
}
