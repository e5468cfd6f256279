//! SSH transport configuration and the errors raised by the transport.
//!
//! [`RemoteConfig`] is loaded via `ortho-config`, which merges defaults,
//! configuration files, and environment variables in that order.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default directory on the deploy host that receives uploaded artifacts
/// before they are installed into place.
pub const DEFAULT_STAGING_DIR: &str = "/tmp";

/// Default SSH port of the deploy host.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Connection settings for the single deploy host.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BERTH_REMOTE",
    discovery(
        app_name = "berth",
        env_var = "BERTH_CONFIG_PATH",
        config_file_name = "berth.toml",
        dotfile_name = ".berth.toml",
        project_file_name = "berth.toml"
    )
)]
pub struct RemoteConfig {
    /// Hostname or address of the deploy host. Required.
    #[ortho_config(default = String::new())]
    pub host: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// SSH port exposed by the host.
    #[ortho_config(default = DEFAULT_SSH_PORT)]
    pub ssh_port: u16,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking. The deploy host is long lived, so
    /// checking stays on unless explicitly disabled.
    #[ortho_config(default = true)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; empty keeps the ssh client default.
    #[ortho_config(default = String::new())]
    pub ssh_known_hosts_file: String,
    /// Path to the SSH private key. Supports tilde expansion. When absent,
    /// the ssh client falls back to its default identities.
    pub ssh_identity_file: Option<String>,
    /// Directory on the host used to stage uploads.
    #[ortho_config(default = DEFAULT_STAGING_DIR.to_owned())]
    pub staging_dir: String,
}

/// Errors raised when loading the remote configuration from layered sources.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RemoteConfigLoadError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("remote configuration parsing failed: {0}")]
    Parse(String),
}

impl RemoteConfig {
    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when any required field is empty.
    pub fn validate(&self) -> Result<(), RemoteError> {
        Self::require_value(&self.host, "host")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.scp_bin, "scp_bin")?;
        Self::require_value(&self.staging_dir, "staging_dir")?;
        Self::require_optional_value(self.ssh_identity_file.as_deref(), "ssh_identity_file")?;
        if self.ssh_port == 0 {
            return Err(RemoteError::InvalidConfig {
                field: String::from("ssh_port"),
            });
        }
        Ok(())
    }

    /// Loads configuration from defaults, configuration files, and
    /// environment variables without parsing process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteConfigLoadError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, RemoteConfigLoadError> {
        Self::load_from_iter([std::ffi::OsString::from("berth")])
            .map_err(|err| RemoteConfigLoadError::Parse(err.to_string()))
    }

    /// Returns the `user@host` login target.
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}@{}", self.ssh_user, self.host)
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), RemoteError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(RemoteError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), RemoteError> {
        Self::require_optional_value(Some(value), field)
    }
}

/// Errors surfaced while talking to the deploy host.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when configuration is missing required values.
    #[error("missing {field}: set BERTH_REMOTE_{env_suffix} or add {field} to berth.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when a local file selected for upload does not exist.
    #[error("upload source missing: {path}")]
    MissingSource {
        /// Local path that was expected to exist.
        path: String,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a transport command or remote script exits non-zero.
    #[error("{program} exited with status {status_text}: {detail}")]
    CommandFailure {
        /// Command name or remote step label.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Captured stdout.
        stdout: String,
        /// Captured stderr.
        stderr: String,
        /// Trimmed output excerpt shown in the message.
        detail: String,
    },
}

impl RemoteError {
    /// Builds a [`RemoteError::CommandFailure`] from captured output.
    #[must_use]
    pub fn command_failure(
        program: impl Into<String>,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    ) -> Self {
        let status_text = status.map_or_else(|| String::from("unknown"), |code| code.to_string());
        let detail = failure_detail(&stdout, &stderr);
        Self::CommandFailure {
            program: program.into(),
            status,
            status_text,
            stdout,
            stderr,
            detail,
        }
    }
}

const DETAIL_LINES: usize = 5;

fn failure_detail(stdout: &str, stderr: &str) -> String {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    let lines: Vec<&str> = source
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.is_empty() {
        return String::from("no output");
    }
    let skip = lines.len().saturating_sub(DETAIL_LINES);
    lines.into_iter().skip(skip).collect::<Vec<_>>().join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", "", "no output")]
    #[case("out\n", "", "out")]
    #[case("out\n", "boom\n", "boom")]
    #[case("", "a\nb\nc\nd\ne\nf\n", "b | c | d | e | f")]
    fn failure_detail_prefers_stderr_tail(
        #[case] stdout: &str,
        #[case] stderr: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(failure_detail(stdout, stderr), expected);
    }

    #[test]
    fn command_failure_message_names_status_and_output() {
        let err = RemoteError::command_failure(
            "install-dependencies",
            Some(100),
            String::new(),
            String::from("E: Unable to locate package\n"),
        );
        assert_eq!(
            err.to_string(),
            "install-dependencies exited with status 100: E: Unable to locate package"
        );
    }
}
