//! Header block encoding.
//!
//! A header line is `KEY:VALUE`. The line is split on the first colon only, so
//! values may themselves contain colons. Each frame kind accepts a closed set
//! of keys; unknown keys, duplicates and control characters are rejected.

use super::FrameError;

/// Longest accepted tag or header line, excluding the newline.
pub const MAX_LINE_LEN: usize = 4096;

/// Parsed header block, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Parse header lines (without the blank terminator), accepting only `allowed` keys.
    pub fn parse<S: AsRef<str>>(lines: &[S], allowed: &[&str]) -> Result<Self, FrameError> {
        let mut fields: Vec<(String, String)> = Vec::with_capacity(lines.len());

        for line in lines {
            let line = line.as_ref();
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(format!("missing ':' in {line:?}")))?;

            if !allowed.contains(&key) {
                return Err(FrameError::MalformedHeader(format!("unknown key {key:?}")));
            }
            if fields.iter().any(|(k, _)| k == key) {
                return Err(FrameError::MalformedHeader(format!("duplicate key {key:?}")));
            }
            if value.chars().any(char::is_control) {
                return Err(FrameError::MalformedHeader(format!(
                    "control character in {key} value"
                )));
            }

            fields.push((key.to_string(), value.to_string()));
        }

        Ok(Self { fields })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get a field that must be present.
    pub fn require(&self, key: &str) -> Result<&str, FrameError> {
        self.get(key)
            .ok_or_else(|| FrameError::MalformedHeader(format!("missing {key}")))
    }

    /// Parse a `0`/`1` flag field.
    pub fn flag(&self, key: &str) -> Result<bool, FrameError> {
        match self.require(key)? {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(FrameError::MalformedHeader(format!(
                "{key} must be 0 or 1, got {other:?}"
            ))),
        }
    }
}

/// Append one `KEY:VALUE\n` line.
pub(crate) fn write_line(out: &mut Vec<u8>, key: &str, value: &str) {
    out.extend_from_slice(key.as_bytes());
    out.push(b':');
    out.extend_from_slice(value.as_bytes());
    out.push(b'\n');
}

/// Check that a filename is a single plain path component.
///
/// Received saves are written under a fixed directory, so separators, parent
/// references and control characters are never allowed.
pub fn validate_filename(name: &str) -> Result<(), FrameError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.len() > 255
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);

    if invalid {
        Err(FrameError::InvalidFilename(name.to_string()))
    } else {
        Ok(())
    }
}
