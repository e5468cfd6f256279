//! Environment resolution and the env drop-in file format.
//!
//! A service receives either its own entry from the per-service mapping or,
//! when no mapping is configured at all, every available secret. The two
//! sources are never merged. Resolution is a pure function of its inputs so
//! compilers never read ambient state.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::spec::ValidationError;

/// Directory holding env drop-ins on the host.
pub const ENV_DIR: &str = "/etc/berth";

/// Resolved variables for one service, ordered by key.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EnvironmentSet {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSet {
    /// Builds a set from key/value pairs, rejecting keys that cannot appear in
    /// an env file.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidEnvKey`] naming the first bad key.
    pub fn from_pairs<I, K, V>(pairs: I, origin: &str) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut vars = BTreeMap::new();
        for (key, value) in pairs {
            let key_text = key.into();
            if !is_valid_key(&key_text) {
                return Err(ValidationError::InvalidEnvKey {
                    key: key_text,
                    origin: origin.to_owned(),
                });
            }
            vars.insert(key_text, value.into());
        }
        Ok(Self { vars })
    }

    /// Returns the value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Returns the number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns `true` when the set holds no variables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterates over variables in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

/// Per-service environment mapping, keyed by service name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServiceEnvMapping {
    services: BTreeMap<String, BTreeMap<String, String>>,
}

impl ServiceEnvMapping {
    /// Parses `{"service": {"KEY": "value"}}` JSON.
    ///
    /// Numbers and booleans are accepted and stored in their JSON spelling.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Environment`] when the document is not a
    /// two-level object of scalars.
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        const ORIGIN: &str = "service environment mapping";
        let Value::Object(root) = parse_json(ORIGIN, text)? else {
            return Err(shape_error(ORIGIN, "expected an object keyed by service name"));
        };

        let mut services = BTreeMap::new();
        for (service, entry) in root {
            let Value::Object(vars) = entry else {
                return Err(shape_error(
                    ORIGIN,
                    &format!("entry for '{service}' must be an object"),
                ));
            };
            let origin = format!("{ORIGIN} entry '{service}'");
            services.insert(service, flatten_scalars(&origin, vars)?);
        }
        Ok(Self { services })
    }

    /// Returns the variables configured for `service`.
    #[must_use]
    pub fn entry(&self, service: &str) -> Option<&BTreeMap<String, String>> {
        self.services.get(service)
    }
}

/// Flat set of every secret available to deployments.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SecretSet {
    secrets: BTreeMap<String, String>,
}

impl SecretSet {
    /// Parses a flat `{"KEY": "value"}` JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Environment`] when the document is not a
    /// flat object of scalars.
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        const ORIGIN: &str = "secret set";
        let Value::Object(root) = parse_json(ORIGIN, text)? else {
            return Err(shape_error(ORIGIN, "expected a flat object"));
        };
        Ok(Self {
            secrets: flatten_scalars(ORIGIN, root)?,
        })
    }

    /// Returns the number of secrets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Returns `true` when no secrets are available.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SecretSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            secrets: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Selects the environment for `service`.
///
/// With a mapping, the service's own entry is used and a missing entry means
/// an empty environment. Without a mapping, every secret is injected.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidEnvKey`] when the selected source holds a
/// key that cannot be written to an env file.
pub fn resolve_environment(
    service: &str,
    mapping: Option<&ServiceEnvMapping>,
    secrets: &SecretSet,
) -> Result<EnvironmentSet, ValidationError> {
    match mapping {
        Some(services) => services.entry(service).map_or_else(
            || Ok(EnvironmentSet::default()),
            |vars| {
                EnvironmentSet::from_pairs(
                    vars.iter().map(|(key, value)| (key.clone(), value.clone())),
                    &format!("service environment mapping entry '{service}'"),
                )
            },
        ),
        None => EnvironmentSet::from_pairs(
            secrets
                .secrets
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
            "secret set",
        ),
    }
}

/// Returns the drop-in path for `service` on the host.
#[must_use]
pub fn env_file_path(service: &str) -> String {
    format!("{ENV_DIR}/{service}.env")
}

/// Renders the env drop-in for `service`.
///
/// Values that a naive reader would misinterpret are double-quoted with
/// backslash escapes, so every value stays on one line.
///
/// # Examples
///
/// ```
/// use berth::environment::{EnvironmentSet, format_env_file, parse_env_file};
///
/// let env = EnvironmentSet::from_pairs([("GREETING", "hello\nworld")], "example").expect("valid");
/// let text = format_env_file("demo", &env);
/// assert!(text.contains("GREETING=\"hello\\nworld\"\n"));
/// assert_eq!(parse_env_file(&text).expect("parses"), env);
/// ```
#[must_use]
pub fn format_env_file(service: &str, env: &EnvironmentSet) -> String {
    let mut text = format!("# Managed by berth for {service}. Local edits are overwritten.\n");
    for (key, value) in env.iter() {
        let line = if needs_quoting(value) {
            format!("{key}=\"{}\"\n", escape_value(value))
        } else {
            format!("{key}={value}\n")
        };
        text.push_str(&line);
    }
    text
}

/// Parses an env drop-in written by [`format_env_file`].
///
/// Blank lines and `#` comments are skipped.
///
/// # Errors
///
/// Returns [`ValidationError::Environment`] naming the line that is not a
/// `KEY=VALUE` pair or holds a malformed quoted value, or
/// [`ValidationError::InvalidEnvKey`] for a bad key.
pub fn parse_env_file(text: &str) -> Result<EnvironmentSet, ValidationError> {
    let mut pairs = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let origin = format!("env file line {}", index + 1);
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, raw_value)) = trimmed.split_once('=') else {
            return Err(shape_error(&origin, "expected KEY=VALUE"));
        };
        let value = match raw_value.strip_prefix('"') {
            Some(quoted) => unescape_quoted(&origin, quoted)?,
            None => raw_value.to_owned(),
        };
        pairs.push((key.trim_end().to_owned(), value));
    }
    EnvironmentSet::from_pairs(pairs, "env file")
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn needs_quoting(value: &str) -> bool {
    value
        .chars()
        .any(|ch| ch.is_whitespace() || matches!(ch, '"' | '\'' | '\\' | '#' | '$' | '`'))
}

fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_quoted(origin: &str, quoted: &str) -> Result<String, ValidationError> {
    let mut value = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if chars.as_str().trim().is_empty() {
                    return Ok(value);
                }
                return Err(shape_error(origin, "unexpected text after closing quote"));
            }
            '\\' => match chars.next() {
                Some('n') => value.push('\n'),
                Some('r') => value.push('\r'),
                Some('t') => value.push('\t'),
                Some(escaped @ ('\\' | '"')) => value.push(escaped),
                Some(other) => {
                    return Err(shape_error(origin, &format!("unknown escape '\\{other}'")));
                }
                None => return Err(shape_error(origin, "dangling escape")),
            },
            other => value.push(other),
        }
    }
    Err(shape_error(origin, "missing closing quote"))
}

fn parse_json(origin: &str, text: &str) -> Result<Value, ValidationError> {
    serde_json::from_str(text).map_err(|err| shape_error(origin, &err.to_string()))
}

fn flatten_scalars(
    origin: &str,
    object: serde_json::Map<String, Value>,
) -> Result<BTreeMap<String, String>, ValidationError> {
    let mut flat = BTreeMap::new();
    for (key, value) in object {
        let text = match value {
            Value::String(text) => text,
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            Value::Null => String::new(),
            Value::Array(_) | Value::Object(_) => {
                return Err(shape_error(
                    origin,
                    &format!("value for '{key}' must be a scalar"),
                ));
            }
        };
        flat.insert(key, text);
    }
    Ok(flat)
}

fn shape_error(origin: &str, reason: &str) -> ValidationError {
    ValidationError::Environment {
        origin: origin.to_owned(),
        reason: reason.to_owned(),
    }
}
