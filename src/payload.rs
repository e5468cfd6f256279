//! Trigger payload resolution.
//!
//! A deploy can be requested by service name alone, by an inline JSON
//! payload, or by a payload file. The three sources are mutually exclusive;
//! this module centralises the branching and file loading so the CLI and
//! library callers agree on the rules.

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::remote::expand_tilde;
use crate::spec::{RawDescriptor, ValidationError};

/// Errors raised while resolving a trigger payload.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum PayloadError {
    /// Raised when more than one payload source is supplied.
    #[error("pass exactly one of --service, --payload, or --payload-file")]
    Conflicting,
    /// Raised when no payload source is supplied.
    #[error("no service selected: pass --service, --payload, or --payload-file")]
    Missing,
    /// Raised when an inline payload is empty or only whitespace.
    #[error("payload must not be empty")]
    InlineEmpty,
    /// Raised when a file path is empty or only whitespace.
    #[error("payload file path must not be empty")]
    FilePathEmpty,
    /// Raised when a payload file is empty or only whitespace.
    #[error("payload file `{path}` is empty")]
    FileEmpty {
        /// Expanded path that was read.
        path: String,
    },
    /// Raised when reading the payload file fails.
    #[error("failed to read payload file `{path}`: {message}")]
    FileRead {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the payload is not a JSON object.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Resolves a raw descriptor from exactly one of the three sources.
///
/// # Errors
///
/// Returns [`PayloadError`] when the sources conflict, are absent or empty,
/// the file cannot be read, or the JSON is not an object.
pub fn resolve_descriptor(
    service: Option<&str>,
    inline: Option<&str>,
    file: Option<&str>,
) -> Result<RawDescriptor, PayloadError> {
    let supplied = [service.is_some(), inline.is_some(), file.is_some()]
        .into_iter()
        .filter(|present| *present)
        .count();
    if supplied > 1 {
        return Err(PayloadError::Conflicting);
    }

    if let Some(name) = service {
        return Ok(RawDescriptor::named(name.trim()));
    }

    if let Some(payload) = inline {
        if payload.trim().is_empty() {
            return Err(PayloadError::InlineEmpty);
        }
        return Ok(RawDescriptor::from_json(payload)?);
    }

    let Some(path) = file else {
        return Err(PayloadError::Missing);
    };
    if path.trim().is_empty() {
        return Err(PayloadError::FilePathEmpty);
    }

    let expanded = expand_tilde(path);
    let content = read_to_string_ambient(&expanded).map_err(|message| PayloadError::FileRead {
        path: expanded.clone(),
        message,
    })?;
    if content.trim().is_empty() {
        return Err(PayloadError::FileEmpty { path: expanded });
    }
    Ok(RawDescriptor::from_json(&content)?)
}

fn read_to_string_ambient(path: &str) -> Result<String, String> {
    let path_buf = Utf8Path::new(path);

    let (dir_path, file_path) = if path_buf.is_absolute() {
        let parent = path_buf
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path_buf}"))?;
        let file_name = path_buf
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path_buf}"))?;
        (parent, Utf8Path::new(file_name))
    } else {
        (Utf8Path::new("."), path_buf)
    };

    let dir =
        Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_path).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn service_name_becomes_a_minimal_descriptor() {
        let raw = resolve_descriptor(Some("demo"), None, None).expect("resolves");

        assert_eq!(raw, RawDescriptor::named("demo"));
    }

    #[test]
    fn inline_payload_is_parsed() {
        let raw = resolve_descriptor(None, Some(r#"{"service":"demo","port":"8080"}"#), None)
            .expect("resolves");

        assert_eq!(raw.service, Some(json!("demo")));
        assert_eq!(raw.port, Some(json!("8080")));
    }

    #[test]
    fn payload_file_is_read() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("payload.json");
        std::fs::write(&path, r#"{"service":"api"}"#).expect("write payload");
        let path_text = path.to_str().expect("utf-8 path");

        let raw = resolve_descriptor(None, None, Some(path_text)).expect("resolves");

        assert_eq!(raw.service, Some(json!("api")));
    }

    #[rstest]
    #[case(Some("demo"), Some("{}"), None)]
    #[case(Some("demo"), None, Some("payload.json"))]
    #[case(None, Some("{}"), Some("payload.json"))]
    fn multiple_sources_conflict(
        #[case] service: Option<&str>,
        #[case] inline: Option<&str>,
        #[case] file: Option<&str>,
    ) {
        assert_eq!(
            resolve_descriptor(service, inline, file),
            Err(PayloadError::Conflicting)
        );
    }

    #[rstest]
    #[case(None, None, PayloadError::Missing)]
    #[case(Some("  "), None, PayloadError::InlineEmpty)]
    #[case(None, Some(" "), PayloadError::FilePathEmpty)]
    fn empty_sources_are_rejected(
        #[case] inline: Option<&str>,
        #[case] file: Option<&str>,
        #[case] expected: PayloadError,
    ) {
        assert_eq!(resolve_descriptor(None, inline, file), Err(expected));
    }

    #[test]
    fn empty_payload_file_is_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("empty.json");
        std::fs::write(&path, "\n").expect("write payload");
        let path_text = path.to_str().expect("utf-8 path");

        let err = resolve_descriptor(None, None, Some(path_text)).expect_err("empty file");

        assert!(matches!(err, PayloadError::FileEmpty { .. }));
    }

    #[test]
    fn unreadable_payload_file_names_the_path() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("absent.json");
        let path_text = path.to_str().expect("utf-8 path");

        let err = resolve_descriptor(None, None, Some(path_text)).expect_err("missing file");

        assert!(matches!(err, PayloadError::FileRead { ref path, .. } if path == path_text));
    }

    #[test]
    fn non_object_payload_is_a_validation_error() {
        let err = resolve_descriptor(None, Some("[1, 2]"), None).expect_err("array payload");

        assert!(matches!(err, PayloadError::Invalid(ValidationError::Payload { .. })));
    }
}
