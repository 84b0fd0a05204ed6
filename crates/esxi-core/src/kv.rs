//! `key = "value"` line format shared by VMX, VMSD and VMDK descriptors.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// One classified line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<'a> {
    /// Empty line, comment, or the `.encoding` header.
    Blank,
    Entry { key: &'a str, value: String },
    /// Anything that is not a key/value pair.
    Other(&'a str),
}

/// Classify a single line.
pub fn classify(line: &str) -> Line<'_> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with(".encoding") {
        return Line::Blank;
    }
    match line.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() && !key.trim().contains(' ') => Line::Entry {
            key: key.trim(),
            value: unquote(value.trim()),
        },
        _ => Line::Other(line),
    }
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

/// Parse every line of `content` as a key/value pair.
///
/// Unlike the lenient readers of hosted VMX files, any line that is neither
/// blank nor a pair is an error; `file` names the source in that error.
pub fn parse_map(file: &str, content: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for (number, line) in content.lines().enumerate() {
        match classify(line) {
            Line::Blank => {}
            Line::Entry { key, value } => {
                map.insert(key.to_string(), value);
            }
            Line::Other(text) => {
                return Err(Error::parse(
                    file,
                    format!("line {}: expected key = value, got '{}'", number + 1, text),
                ))
            }
        }
    }
    Ok(map)
}

/// Decode the `|XX` hex escapes used in VMX values.
pub fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'|' && i + 2 < bytes.len() {
            let high = (bytes[i + 1] as char).to_digit(16);
            let low = (bytes[i + 2] as char).to_digit(16);
            if let (Some(high), Some(low)) = (high, low) {
                out.push((high * 16 + low) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a number, naming `key` and `file` on failure.
pub fn number<T: std::str::FromStr>(file: &str, key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::parse(file, format!("invalid number for {}: '{}'", key, value)))
}
