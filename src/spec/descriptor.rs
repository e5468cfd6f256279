//! Raw trigger payload and the lenient field readers used to resolve it.
//!
//! Payloads arrive from chat-ops style triggers where every field may be a
//! string, so readers accept both typed JSON values and their string
//! spellings. Empty strings and the literal quote pairs `""` and `''` count
//! as "not provided".

use serde::Deserialize;
use serde_json::Value;

use super::ValidationError;

/// Sparse service descriptor as delivered by the trigger payload.
///
/// Unknown fields are ignored so newer payloads keep working against older
/// binaries.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RawDescriptor {
    /// Service name.
    #[serde(default)]
    pub service: Option<Value>,
    /// Alias of `service`, consulted only when `service` is absent.
    #[serde(default)]
    pub name: Option<Value>,
    /// Public domain.
    #[serde(default)]
    pub domain: Option<Value>,
    /// Upstream port, as a number or numeric string.
    #[serde(default)]
    pub port: Option<Value>,
    /// Git remote for the service code.
    #[serde(default)]
    pub repo_url: Option<Value>,
    /// Prefix used to derive `repo_url` from the service name.
    #[serde(default)]
    pub repo_base: Option<Value>,
    /// Branch or tag to deploy.
    #[serde(default)]
    pub repo_ref: Option<Value>,
    /// Checkout directory on the host.
    #[serde(default)]
    pub working_dir: Option<Value>,
    /// Account the unit runs as.
    #[serde(default)]
    pub user: Option<Value>,
    /// Upstream address the proxy forwards to.
    #[serde(default)]
    pub upstream_host: Option<Value>,
    /// Path probed by the health check.
    #[serde(default)]
    pub health_path: Option<Value>,
    /// Directory served directly by the proxy.
    #[serde(default)]
    pub static_root: Option<Value>,
    /// Command run after each deploy.
    #[serde(default)]
    pub migrate_cmd: Option<Value>,
    /// Command that starts the service.
    #[serde(default)]
    pub start_cmd: Option<Value>,
    /// Command that stops the service.
    #[serde(default)]
    pub stop_cmd: Option<Value>,
    /// Command run after syncing code and before restarting.
    #[serde(default)]
    pub build_cmd: Option<Value>,
    /// Compose file passed to `docker compose -f`, relative to the working
    /// directory.
    #[serde(default)]
    pub compose_file: Option<Value>,
    /// Serve over plain HTTP and skip certificates.
    #[serde(default)]
    pub allow_plain_http: Option<Value>,
    /// Extra proxy locations, as an array or a JSON-encoded string.
    #[serde(default)]
    pub locations: Option<Value>,
}

impl RawDescriptor {
    /// Builds a descriptor carrying only a service name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            service: Some(Value::String(name.into())),
            ..Self::default()
        }
    }

    /// Parses a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Payload`] when `text` is not a JSON object.
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_str(text).map_err(|err| ValidationError::Payload {
            message: err.to_string(),
        })?;
        Self::from_value(value)
    }

    /// Parses a payload that has already been decoded into a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Payload`] when `value` is not an object.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        if !value.is_object() {
            return Err(ValidationError::Payload {
                message: format!("expected a JSON object, got {}", value_kind(&value)),
            });
        }
        serde_json::from_value(value).map_err(|err| ValidationError::Payload {
            message: err.to_string(),
        })
    }
}

/// Reads an optional text field, treating blanks and quote pairs as absent.
pub(super) fn read_text(field: &str, value: Option<&Value>) -> Result<Option<String>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => Ok(non_blank(raw)),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(other) => Err(ValidationError::field(
            field,
            format!("expected a string, got {}", value_kind(other)),
        )),
    }
}

/// Reads a TCP port from a number or a numeric string.
pub(super) fn read_port(field: &str, value: Option<&Value>) -> Result<Option<u16>, ValidationError> {
    let parsed = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(number)) => number.as_u64().and_then(|n| u16::try_from(n).ok()),
        Some(Value::String(raw)) => match non_blank(raw) {
            None => return Ok(None),
            Some(trimmed) => trimmed.parse::<u16>().ok(),
        },
        Some(other) => {
            return Err(ValidationError::field(
                field,
                format!("expected a port number, got {}", value_kind(other)),
            ));
        }
    };

    match parsed {
        Some(port) if port > 0 => Ok(Some(port)),
        _ => Err(ValidationError::field(
            field,
            "expected an integer between 1 and 65535",
        )),
    }
}

/// Reads a boolean from a JSON bool or a boolean-like string.
pub(super) fn read_flag(field: &str, value: Option<&Value>) -> Result<Option<bool>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(*flag)),
        Some(Value::String(raw)) => {
            let Some(trimmed) = non_blank(raw) else {
                return Ok(None);
            };
            match trimmed.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(Some(true)),
                "false" | "no" | "0" | "off" => Ok(Some(false)),
                _ => Err(ValidationError::field(
                    field,
                    format!("'{trimmed}' is not a boolean"),
                )),
            }
        }
        Some(other) => Err(ValidationError::field(
            field,
            format!("expected a boolean, got {}", value_kind(other)),
        )),
    }
}

fn non_blank(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "\"\"" || trimmed == "''" {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

pub(super) const fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
