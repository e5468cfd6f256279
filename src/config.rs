//! Deployment configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::environment::{SecretSet, ServiceEnvMapping};
use crate::health::HealthPolicy;
use crate::pipeline::{CertFailurePolicy, EnvironmentInputs};
use crate::spec::ValidationError;

/// Settings shared by every deploy, derived from defaults, configuration
/// files, and environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BERTH",
    discovery(
        app_name = "berth",
        env_var = "BERTH_CONFIG_PATH",
        config_file_name = "berth.toml",
        dotfile_name = ".berth.toml",
        project_file_name = "berth.toml"
    )
)]
pub struct DeployConfig {
    /// Local directory receiving rendered artifacts.
    #[ortho_config(default = "generated".to_owned())]
    pub output_dir: String,
    /// Contact address for certificate registration. Required by phases that
    /// touch certificates.
    pub cert_email: Option<String>,
    /// Either `degrade` (keep deploying on placeholder material) or `fatal`.
    #[ortho_config(default = "degrade".to_owned())]
    pub cert_failure_policy: String,
    /// Renew real certificates expiring within this many days.
    #[ortho_config(default = 30)]
    pub cert_renew_before_days: u32,
    /// Health requests made before a deploy is declared failed.
    #[ortho_config(default = 10)]
    pub health_attempts: u32,
    /// Seconds between health requests.
    #[ortho_config(default = 3)]
    pub health_delay_secs: u64,
    /// Per-request health timeout in seconds.
    #[ortho_config(default = 10)]
    pub health_timeout_secs: u64,
    /// JSON object mapping service names to their environment. When set, each
    /// service receives exactly its own entry.
    pub service_envs_json: Option<String>,
    /// JSON object of every available secret, injected into every service
    /// when no per-service mapping is set.
    pub secrets_json: Option<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            output_dir: String::from("generated"),
            cert_email: None,
            cert_failure_policy: String::from("degrade"),
            cert_renew_before_days: 30,
            health_attempts: 10,
            health_delay_secs: 3,
            health_timeout_secs: 10,
            service_envs_json: None,
            secrets_json: None,
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to berth.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const CERT_EMAIL: FieldMetadata =
    FieldMetadata::new("certificate contact email", "BERTH_CERT_EMAIL", "cert_email");
const OUTPUT_DIR: FieldMetadata =
    FieldMetadata::new("artifact output directory", "BERTH_OUTPUT_DIR", "output_dir");

/// Error reported when a certificate phase runs without a contact email.
pub(crate) fn missing_cert_email() -> ConfigError {
    CERT_EMAIL.missing()
}

impl DeployConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("berth")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and `berth.toml` key that supply the value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for empty required values and
    /// [`ConfigError::InvalidValue`] for out-of-range ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_dir.trim().is_empty() {
            return Err(OUTPUT_DIR.missing());
        }
        self.failure_policy()?;
        if self.health_attempts == 0 {
            return Err(ConfigError::InvalidValue(String::from(
                "health_attempts must be at least 1 (BERTH_HEALTH_ATTEMPTS)",
            )));
        }
        if self.health_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(String::from(
                "health_timeout_secs must be at least 1 (BERTH_HEALTH_TIMEOUT_SECS)",
            )));
        }
        Ok(())
    }

    /// Returns the certificate contact email.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no email is configured.
    pub fn require_cert_email(&self) -> Result<&str, ConfigError> {
        self.cert_email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .ok_or_else(missing_cert_email)
    }

    /// Parses the configured certificate failure policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for anything other than
    /// `degrade` or `fatal`.
    pub fn failure_policy(&self) -> Result<CertFailurePolicy, ConfigError> {
        match self.cert_failure_policy.trim().to_ascii_lowercase().as_str() {
            "degrade" => Ok(CertFailurePolicy::Degrade),
            "fatal" => Ok(CertFailurePolicy::Fatal),
            other => Err(ConfigError::InvalidValue(format!(
                "cert_failure_policy must be 'degrade' or 'fatal', got '{other}' \
                 (BERTH_CERT_FAILURE_POLICY)"
            ))),
        }
    }

    /// Returns the health-check retry budget.
    #[must_use]
    pub const fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            attempts: self.health_attempts,
            delay: Duration::from_secs(self.health_delay_secs),
            timeout: Duration::from_secs(self.health_timeout_secs),
        }
    }

    /// Parses the environment sources.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Environment`] when either JSON document is
    /// malformed.
    pub fn environment_inputs(&self) -> Result<EnvironmentInputs, ValidationError> {
        let mapping = self
            .service_envs_json
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .map(ServiceEnvMapping::from_json)
            .transpose()?;
        let secrets = self
            .secrets_json
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .map(SecretSet::from_json)
            .transpose()?
            .unwrap_or_default();
        Ok(EnvironmentInputs { mapping, secrets })
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is outside its allowed range.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
