//! SSH transport to the deploy host.
//!
//! The deploy host is reached through the system `ssh` and `scp` clients.
//! The transport exposes exactly two primitives: run a script and get its exit
//! code plus output, and copy a local file into the host's staging directory.
//! Everything else in the crate is expressed in terms of those two calls.

use std::ffi::OsString;

use camino::Utf8Path;
use shell_escape::unix::escape;
use tracing::debug;

mod config;
mod types;
mod util;

pub use config::{
    DEFAULT_SSH_PORT, DEFAULT_STAGING_DIR, RemoteConfig, RemoteConfigLoadError, RemoteError,
};
pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner, RemoteCommandOutput};
pub use util::expand_tilde;

/// Line printed by host-side scripts when they altered host state.
pub const CHANGE_MARKER: &str = "berth:changed";

/// Shell prologue applied to every remote script.
const SCRIPT_PROLOGUE: &str = "set -euo pipefail";

const ROOT_USER: &str = "root";

/// Runs scripts on, and copies files to, the configured deploy host.
#[derive(Clone, Debug)]
pub struct RemoteHost<R: CommandRunner> {
    config: RemoteConfig,
    runner: R,
}

impl RemoteHost<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: RemoteConfig) -> Result<Self, RemoteError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> RemoteHost<R> {
    /// Creates a new transport using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when configuration validation
    /// fails.
    pub fn new(config: RemoteConfig, runner: R) -> Result<Self, RemoteError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Executes `script` with bash on the host and returns its output.
    ///
    /// The script runs under `set -euo pipefail`. A non-zero exit status is
    /// returned as data, not as an error.
    ///
    /// # Errors
    ///
    /// Propagates any failure to spawn the ssh client.
    pub fn run(&self, script: &str) -> Result<RemoteCommandOutput, RemoteError> {
        let args = self.build_ssh_args(script);
        let output = self.runner.run(&self.config.ssh_bin, &args)?;

        Ok(RemoteCommandOutput {
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Executes `script` and fails unless it exits with status zero.
    ///
    /// `step` labels the script in the resulting error so operators can tell
    /// which host-side step failed.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CommandFailure`] carrying the exit code and
    /// captured output when the script fails, or any transport error.
    pub fn run_checked(&self, step: &str, script: &str) -> Result<RemoteCommandOutput, RemoteError> {
        debug!(step, host = %self.config.host, "running remote step");
        let output = self.run(script)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(RemoteError::command_failure(
            step,
            output.exit_code,
            output.stdout,
            output.stderr,
        ))
    }

    /// Copies `source` into the staging directory as `file_name` and returns
    /// the staged path on the host.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::MissingSource`] when the local file is absent, or
    /// [`RemoteError::CommandFailure`] when `scp` exits non-zero.
    pub fn upload(&self, source: &Utf8Path, file_name: &str) -> Result<String, RemoteError> {
        if !source.is_file() {
            return Err(RemoteError::MissingSource {
                path: source.to_string(),
            });
        }

        let staged = self.staged_path(file_name);
        let mut args = self.common_ssh_options("-P");
        args.push(OsString::from(source.as_str()));
        args.push(OsString::from(format!("{}:{staged}", self.config.target())));

        let output = self.runner.run(&self.config.scp_bin, &args)?;
        if output.is_success() {
            return Ok(staged);
        }
        Err(RemoteError::command_failure(
            self.config.scp_bin.clone(),
            output.code,
            output.stdout,
            output.stderr,
        ))
    }

    /// Returns the path a staged upload named `file_name` will occupy.
    #[must_use]
    pub fn staged_path(&self, file_name: &str) -> String {
        format!(
            "{}/{file_name}",
            self.config.staging_dir.trim_end_matches('/')
        )
    }

    fn build_ssh_args(&self, script: &str) -> Vec<OsString> {
        let mut args = self.common_ssh_options("-p");
        args.push(OsString::from(self.config.target()));
        args.push(OsString::from(wrap_script(
            script,
            self.config.ssh_user != ROOT_USER,
        )));
        args
    }

    fn common_ssh_options(&self, port_flag: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(port_flag),
            OsString::from(self.config.ssh_port.to_string()),
        ];

        if let Some(ref identity_file) = self.config.ssh_identity_file {
            let expanded = expand_tilde(identity_file);
            args.push(OsString::from("-i"));
            args.push(OsString::from(expanded));
        }

        if self.config.ssh_batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        args
    }
}

/// Wraps a script so the remote login shell hands it to bash verbatim.
///
/// Non-root logins elevate through non-interactive sudo; host scripts write
/// to system directories.
fn wrap_script(script: &str, elevate: bool) -> String {
    let body = format!("{SCRIPT_PROLOGUE}\n{script}");
    let launcher = if elevate { "sudo -n bash" } else { "bash" };
    format!("{launcher} -c {}", escape(body.into()))
}
