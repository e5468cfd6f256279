//! Supervision unit (systemd) compiler.
//!
//! Container services get a `oneshot` unit that stays active after the start
//! command returns; the container runtime owns the long-running process.
//! Direct processes get a `simple` unit that systemd restarts on any non-zero
//! exit with a growing delay. Both read their variables from the env drop-in
//! via `EnvironmentFile=`.

use crate::environment::{EnvironmentSet, env_file_path, format_env_file};
use crate::spec::{RuntimeKind, ServiceSpec};
use crate::template::{Placeholders, RenderError, render};

/// Directory systemd loads unit files from.
pub const UNIT_DIR: &str = "/etc/systemd/system";

const UNIT_TEMPLATE: &str = "\
# Managed by berth for __NAME__. Local edits are overwritten.
[Unit]
Description=__NAME__ (deployed by berth)
Wants=network-online.target
After=__AFTER__
__REQUIRES__
[Service]
Type=__TYPE__
User=__USER__
WorkingDirectory=__WORKING_DIR__
EnvironmentFile=-__ENV_FILE__
ExecStart=/bin/sh -c \"__START__\"
ExecStop=/bin/sh -c \"__STOP__\"
__POLICY__
[Install]
WantedBy=multi-user.target
";

/// Unit file text and the env drop-in it references.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompiledUnit {
    /// Contents of `{name}.service`.
    pub unit: String,
    /// Contents of the env drop-in.
    pub env_drop_in: String,
}

/// Compiles the unit file and env drop-in for `spec`.
///
/// # Errors
///
/// Returns [`RenderError`] if the unit template and its values disagree.
pub fn compile_unit(
    spec: &ServiceSpec,
    runtime: RuntimeKind,
    env: &EnvironmentSet,
) -> Result<CompiledUnit, RenderError> {
    let (service_type, after, requires, policy) = match runtime {
        RuntimeKind::Compose => (
            "oneshot",
            "network-online.target docker.service",
            "Requires=docker.service\n",
            "RemainAfterExit=yes\nRestart=no\nTimeoutStartSec=600\n",
        ),
        RuntimeKind::DirectProcess => (
            "simple",
            "network-online.target",
            "",
            "Restart=on-failure\nRestartSec=5s\nRestartSteps=5\nRestartMaxDelaySec=60s\n",
        ),
    };

    let values: Placeholders = [
        ("NAME", spec.name.clone()),
        ("AFTER", after.to_owned()),
        ("REQUIRES", requires.to_owned()),
        ("TYPE", service_type.to_owned()),
        ("USER", spec.user.clone()),
        ("WORKING_DIR", spec.working_dir.clone()),
        ("ENV_FILE", env_file_path(&spec.name)),
        ("START", exec_quote(&spec.start_cmd)),
        ("STOP", exec_quote(&spec.stop_cmd)),
        ("POLICY", policy.to_owned()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_owned(), value))
    .collect();

    Ok(CompiledUnit {
        unit: render(UNIT_TEMPLATE, &values)?,
        env_drop_in: format_env_file(&spec.name, env),
    })
}

/// Returns the host path the unit for `service` is installed at.
#[must_use]
pub fn unit_path(service: &str) -> String {
    format!("{UNIT_DIR}/{service}.service")
}

/// Escapes a command for a double-quoted systemd `Exec` argument.
///
/// `$` and `%` are doubled so systemd passes them through to the shell
/// instead of expanding them itself.
fn exec_quote(command: &str) -> String {
    let mut quoted = String::with_capacity(command.len());
    for ch in command.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '$' => quoted.push_str("$$"),
            '%' => quoted.push_str("%%"),
            other => quoted.push(other),
        }
    }
    quoted
}
