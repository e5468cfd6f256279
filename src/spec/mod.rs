//! Service descriptor resolution.
//!
//! [`resolve`] is the only place that reads raw payload fields. It validates
//! the service name, applies every default, and returns a fully typed
//! [`ServiceSpec`]. Defaults depend only on the name and the explicit
//! overrides in the descriptor, never on process state, so the same payload
//! always resolves to the same spec.

use camino::Utf8Path;
use serde_json::Value;

mod descriptor;
mod error;

pub use descriptor::RawDescriptor;
pub use error::ValidationError;

use descriptor::{read_flag, read_port, read_text, value_kind};

/// Domain suffix appended to the service name when no domain is given.
pub const DEFAULT_DOMAIN_SUFFIX: &str = "example.com";
/// Upstream port used when the payload does not name one.
pub const DEFAULT_PORT: u16 = 3000;
/// Git host prefix used to derive the repository URL.
pub const DEFAULT_REPO_BASE: &str = "https://github.com/example";
/// Branch deployed when no ref is given.
pub const DEFAULT_REPO_REF: &str = "main";
/// Parent directory for service checkouts.
pub const DEFAULT_WORKING_ROOT: &str = "/opt";
/// Account the unit runs as by default.
pub const DEFAULT_USER: &str = "root";
/// Address the proxy forwards to by default.
pub const DEFAULT_UPSTREAM_HOST: &str = "127.0.0.1";
/// Health path probed by default.
pub const DEFAULT_HEALTH_PATH: &str = "/healthz";
/// Start command used when the payload does not name one.
pub const DEFAULT_START_CMD: &str = "docker compose up -d --remove-orphans";
/// Stop command paired with compose start commands.
pub const COMPOSE_STOP_CMD: &str = "docker compose down";
/// Stop command for direct processes, which systemd stops by signal.
pub const NOOP_STOP_CMD: &str = "/bin/true";

const MAX_NAME_LEN: usize = 63;
const MAX_DOMAIN_LEN: usize = 253;

/// Fully resolved description of one deployable service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceSpec {
    /// Unique service identifier, safe as a path segment and DNS label.
    pub name: String,
    /// Public domain served by the proxy.
    pub domain: String,
    /// Upstream TCP port.
    pub port: u16,
    /// Git remote holding the service code.
    pub repo_url: String,
    /// Branch or tag deployed.
    pub repo_ref: String,
    /// Checkout directory on the host.
    pub working_dir: String,
    /// Account the unit runs as.
    pub user: String,
    /// Address the proxy forwards to.
    pub upstream_host: String,
    /// Path probed by the health check.
    pub health_path: String,
    /// Directory served by the proxy before falling back to the upstream.
    pub static_root: Option<String>,
    /// Command run in the working directory after each deploy.
    pub migrate_cmd: Option<String>,
    /// Command that starts the service.
    pub start_cmd: String,
    /// Command that stops the service.
    pub stop_cmd: String,
    /// Command run after syncing code and before restarting.
    pub build_cmd: Option<String>,
    /// Compose file passed to `docker compose -f`, relative to the working
    /// directory. `None` lets compose find its default file.
    pub compose_file: Option<String>,
    /// Serve over plain HTTP without certificates.
    pub allow_plain_http: bool,
    /// Extra proxy locations in payload order.
    pub locations: Vec<LocationRule>,
}

impl ServiceSpec {
    /// Returns the default upstream URL, `http://{upstream_host}:{port}`.
    #[must_use]
    pub fn upstream_url(&self) -> String {
        format!("http://{}:{}", self.upstream_host, self.port)
    }

    /// Returns the public health-check URL.
    #[must_use]
    pub fn health_url(&self) -> String {
        let scheme = if self.allow_plain_http {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{}{}", self.domain, self.health_path)
    }

    /// Returns the runtime kind implied by the start command.
    #[must_use]
    pub fn runtime_kind(&self) -> RuntimeKind {
        RuntimeKind::detect(&self.start_cmd)
    }

    /// Returns the compose project derived from [`Self::compose_file`]: the
    /// name of the directory holding the file.
    #[must_use]
    pub fn compose_project(&self) -> Option<&str> {
        let file = self.compose_file.as_deref()?;
        let parent = match Utf8Path::new(file).parent() {
            Some(dir) if !dir.as_str().is_empty() => dir,
            _ => Utf8Path::new(&self.working_dir),
        };
        parent.file_name()
    }

    /// Returns the supervision unit name.
    #[must_use]
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.name)
    }
}

/// One additional reverse-proxy location.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocationRule {
    /// Location match path.
    pub path: String,
    /// Where matching requests are forwarded.
    pub proxy_pass: ProxyTarget,
    /// Drop the matched prefix when forwarding.
    pub strip_prefix: bool,
    /// Directives copied verbatim into the block.
    pub extra: String,
}

/// Forwarding target of a [`LocationRule`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProxyTarget {
    /// Forward to the service upstream.
    Upstream,
    /// Forward to an explicit URL.
    Explicit(String),
    /// Emit no proxy directive.
    Disabled,
}

/// How the service process is supervised.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuntimeKind {
    /// A container runtime keeps the process alive; the unit runs to completion.
    Compose,
    /// The unit owns the long-running process and restarts it on failure.
    DirectProcess,
}

impl RuntimeKind {
    /// Classifies a start command.
    ///
    /// # Examples
    ///
    /// ```
    /// use berth::spec::RuntimeKind;
    ///
    /// assert_eq!(RuntimeKind::detect("docker compose up -d"), RuntimeKind::Compose);
    /// assert_eq!(RuntimeKind::detect("/usr/bin/node server.js"), RuntimeKind::DirectProcess);
    /// ```
    #[must_use]
    pub fn detect(start_cmd: &str) -> Self {
        let lowered = start_cmd.to_ascii_lowercase();
        if lowered.contains("docker compose") || lowered.contains("docker-compose") {
            Self::Compose
        } else {
            Self::DirectProcess
        }
    }
}

/// Validates `raw` and applies every default.
///
/// # Errors
///
/// Returns [`ValidationError`] naming the first offending field. A malformed
/// `locations` value fails the whole resolution.
pub fn resolve(raw: &RawDescriptor) -> Result<ServiceSpec, ValidationError> {
    let name = resolve_name(raw)?;

    let domain = read_text("domain", raw.domain.as_ref())?
        .map(|domain| domain.to_ascii_lowercase())
        .unwrap_or_else(|| format!("{name}.{DEFAULT_DOMAIN_SUFFIX}"));
    validate_domain(&domain)?;

    let port = read_port("port", raw.port.as_ref())?.unwrap_or(DEFAULT_PORT);

    let repo_url = match read_text("repo_url", raw.repo_url.as_ref())? {
        Some(url) => url,
        None => {
            let base = read_text("repo_base", raw.repo_base.as_ref())?
                .unwrap_or_else(|| DEFAULT_REPO_BASE.to_owned());
            format!("{}/{name}.git", base.trim_end_matches('/'))
        }
    };
    require_token("repo_url", &repo_url)?;

    let repo_ref = read_text("repo_ref", raw.repo_ref.as_ref())?
        .unwrap_or_else(|| DEFAULT_REPO_REF.to_owned());
    require_token("repo_ref", &repo_ref)?;
    if repo_ref.starts_with('-') {
        return Err(ValidationError::field("repo_ref", "must not start with '-'"));
    }

    let working_dir = read_text("working_dir", raw.working_dir.as_ref())?
        .unwrap_or_else(|| format!("{DEFAULT_WORKING_ROOT}/{name}"));
    require_absolute("working_dir", &working_dir)?;

    let user = read_text("user", raw.user.as_ref())?.unwrap_or_else(|| DEFAULT_USER.to_owned());
    validate_user(&user)?;

    let upstream_host = read_text("upstream_host", raw.upstream_host.as_ref())?
        .unwrap_or_else(|| DEFAULT_UPSTREAM_HOST.to_owned());
    validate_upstream_host(&upstream_host)?;

    let health_path = read_text("health_path", raw.health_path.as_ref())?
        .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_owned());
    validate_location_path("health_path", &health_path)?;

    let static_root = read_text("static_root", raw.static_root.as_ref())?;
    if let Some(root) = static_root.as_deref() {
        require_absolute("static_root", root)?;
    }

    let start_cmd = read_text("start_cmd", raw.start_cmd.as_ref())?
        .unwrap_or_else(|| DEFAULT_START_CMD.to_owned());
    let stop_cmd = match read_text("stop_cmd", raw.stop_cmd.as_ref())? {
        Some(cmd) => cmd,
        None if RuntimeKind::detect(&start_cmd) == RuntimeKind::Compose => {
            COMPOSE_STOP_CMD.to_owned()
        }
        None => NOOP_STOP_CMD.to_owned(),
    };
    let migrate_cmd = read_text("migrate_cmd", raw.migrate_cmd.as_ref())?;
    let build_cmd = read_text("build_cmd", raw.build_cmd.as_ref())?;
    let compose_file = read_text("compose_file", raw.compose_file.as_ref())?;
    if let Some(file) = compose_file.as_deref() {
        require_token("compose_file", file)?;
        if file.starts_with('-') {
            return Err(ValidationError::field("compose_file", "must not start with '-'"));
        }
    }
    for (field, command) in [
        ("start_cmd", Some(start_cmd.as_str())),
        ("stop_cmd", Some(stop_cmd.as_str())),
        ("migrate_cmd", migrate_cmd.as_deref()),
        ("build_cmd", build_cmd.as_deref()),
    ] {
        if let Some(command) = command {
            require_single_line(field, command)?;
        }
    }

    let allow_plain_http = read_flag("allow_plain_http", raw.allow_plain_http.as_ref())?.unwrap_or(false);
    let locations = parse_locations(raw.locations.as_ref())?;

    Ok(ServiceSpec {
        name,
        domain,
        port,
        repo_url,
        repo_ref,
        working_dir,
        user,
        upstream_host,
        health_path,
        static_root,
        migrate_cmd,
        start_cmd,
        stop_cmd,
        build_cmd,
        compose_file,
        allow_plain_http,
        locations,
    })
}

/// Validates a service name for use as a path segment and DNS label.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidName`] describing the violated rule.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("must be at most 63 characters"));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
    {
        return Err(invalid(
            "may only contain lowercase letters, digits, and hyphens",
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("must not start or end with a hyphen"));
    }
    Ok(())
}

fn resolve_name(raw: &RawDescriptor) -> Result<String, ValidationError> {
    let service = read_text("service", raw.service.as_ref())?;
    let name = match service {
        Some(name) => name,
        None => read_text("name", raw.name.as_ref())?.ok_or(ValidationError::MissingName)?,
    };
    validate_name(&name)?;
    Ok(name)
}

fn parse_locations(value: Option<&Value>) -> Result<Vec<LocationRule>, ValidationError> {
    let items = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(raw)) => {
            if raw.trim().is_empty() {
                return Ok(Vec::new());
            }
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Array(items)) => items,
                Ok(Value::Null) => return Ok(Vec::new()),
                Ok(other) => {
                    return Err(ValidationError::field(
                        "locations",
                        format!("expected a JSON array, got {}", value_kind(&other)),
                    ));
                }
                Err(err) => {
                    return Err(ValidationError::field(
                        "locations",
                        format!("malformed JSON: {err}"),
                    ));
                }
            }
        }
        Some(other) => {
            return Err(ValidationError::field(
                "locations",
                format!("expected an array, got {}", value_kind(other)),
            ));
        }
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_location(index, item))
        .collect()
}

fn parse_location(index: usize, item: &Value) -> Result<LocationRule, ValidationError> {
    let Value::Object(fields) = item else {
        return Err(ValidationError::field(
            format!("locations[{index}]"),
            format!("expected an object, got {}", value_kind(item)),
        ));
    };
    let field = |name: &str| format!("locations[{index}].{name}");

    let path = read_text(&field("path"), fields.get("path"))?
        .ok_or_else(|| ValidationError::field(field("path"), "is required"))?;

    let proxy_pass = match fields.get("proxy_pass") {
        None | Some(Value::Null | Value::Bool(true)) => ProxyTarget::Upstream,
        Some(Value::Bool(false)) => ProxyTarget::Disabled,
        Some(Value::String(raw)) => match raw.trim() {
            "" => ProxyTarget::Upstream,
            target => ProxyTarget::Explicit(target.to_owned()),
        },
        Some(other) => {
            return Err(ValidationError::field(
                field("proxy_pass"),
                format!("expected a URL or false, got {}", value_kind(other)),
            ));
        }
    };

    let strip_prefix = read_flag(&field("strip_prefix"), fields.get("strip_prefix"))?.unwrap_or(false);

    let extra = match fields.get("extra") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(raw)) => raw.trim_end().to_owned(),
        Some(Value::Array(lines)) => {
            let mut collected = Vec::with_capacity(lines.len());
            for line in lines {
                let Value::String(line) = line else {
                    return Err(ValidationError::field(
                        field("extra"),
                        format!("expected lines of text, got {}", value_kind(line)),
                    ));
                };
                collected.push(line.trim_end());
            }
            collected.join("\n").trim_end().to_owned()
        }
        Some(other) => {
            return Err(ValidationError::field(
                field("extra"),
                format!("expected text, got {}", value_kind(other)),
            ));
        }
    };

    Ok(LocationRule {
        path,
        proxy_pass,
        strip_prefix,
        extra,
    })
}

/// Validates a public hostname.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidField`] for `domain` when a label is
/// empty, too long, or holds characters other than letters, digits, and
/// inner hyphens.
pub fn validate_domain(domain: &str) -> Result<(), ValidationError> {
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(ValidationError::field("domain", "must be at most 253 characters"));
    }
    for label in domain.split('.') {
        if label.is_empty() || label.len() > MAX_NAME_LEN {
            return Err(ValidationError::field(
                "domain",
                format!("'{domain}' has an empty or over-long label"),
            ));
        }
        if !label
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
            || label.starts_with('-')
            || label.ends_with('-')
        {
            return Err(ValidationError::field(
                "domain",
                format!("'{domain}' is not a valid hostname"),
            ));
        }
    }
    Ok(())
}

fn validate_upstream_host(host: &str) -> Result<(), ValidationError> {
    let valid = if host.contains(':') {
        host.strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .is_some_and(|address| {
                address.contains(':')
                    && address
                        .chars()
                        .all(|ch| ch.is_ascii_hexdigit() || matches!(ch, ':' | '.'))
            })
    } else {
        !host.is_empty()
            && host
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-'))
    };
    if valid {
        return Ok(());
    }
    let reason = if host.contains(':') {
        format!("'{host}' is not a hostname or address; IPv6 addresses need brackets")
    } else {
        format!("'{host}' is not a hostname or address")
    };
    Err(ValidationError::field("upstream_host", reason))
}

fn validate_user(user: &str) -> Result<(), ValidationError> {
    let valid = user
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
        && !user.starts_with('-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::field(
            "user",
            format!("'{user}' is not a valid account name"),
        ))
    }
}

/// Checks a path used inside a proxy `location` directive.
fn validate_location_path(field: &str, path: &str) -> Result<(), ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::field(field, "must start with '/'"));
    }
    if path
        .chars()
        .any(|ch| ch.is_whitespace() || matches!(ch, ';' | '{' | '}'))
    {
        return Err(ValidationError::field(
            field,
            "must not contain whitespace, ';', '{', or '}'",
        ));
    }
    Ok(())
}

fn require_absolute(field: &str, path: &str) -> Result<(), ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::field(field, "must be an absolute path"));
    }
    if path.contains(['{', '}']) {
        return Err(ValidationError::field(field, "must not contain '{' or '}'"));
    }
    require_token(field, path)
}

fn require_token(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.chars().any(|ch| ch.is_whitespace() || ch == ';') {
        return Err(ValidationError::field(
            field,
            "must not contain whitespace or ';'",
        ));
    }
    Ok(())
}

fn require_single_line(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.contains(['\n', '\r']) {
        return Err(ValidationError::field(field, "must be a single line"));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
