//! Error types for pipeline runs.

use thiserror::Error;

use super::artifacts::ArtifactError;
use super::phase::{DeploymentRun, Phase};
use crate::cert::CertificateError;
use crate::config::ConfigError;
use crate::health::HealthCheckFailure;
use crate::proxy::CompileError;
use crate::remote::RemoteError;
use crate::spec::ValidationError;
use crate::template::RenderError;

/// Cause of a failed phase.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Descriptor or environment input is unusable.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A template and its values disagree.
    #[error(transparent)]
    Render(#[from] RenderError),
    /// A location rule cannot be compiled.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// Rendered artifacts could not be written locally.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    /// A host command failed or the host was unreachable.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Certificate material could not be ensured.
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    /// The service never answered `200 OK`.
    #[error(transparent)]
    HealthCheck(#[from] HealthCheckFailure),
    /// Deploy configuration is missing a value the phase needs.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The phase needs a host but the pipeline was built without one.
    #[error("{phase} needs a deploy host: set BERTH_REMOTE_HOST or add host to berth.toml")]
    HostRequired {
        /// Phase that needed the host.
        phase: Phase,
    },
    /// The per-service lock file could not be opened or locked.
    #[error("cannot lock {path}: {message}")]
    Lock {
        /// Lock file or directory involved.
        path: camino::Utf8PathBuf,
        /// Underlying I/O error.
        message: String,
    },
    /// The run was cancelled before the phase started.
    #[error("run cancelled before {phase}")]
    Cancelled {
        /// Phase that did not start.
        phase: Phase,
    },
}

/// Failed pipeline run: the phase that failed, why, and the final run record.
#[derive(Debug, Error)]
#[error("{phase} failed: {error}")]
pub struct PipelineFailure {
    /// Phase that failed.
    pub phase: Phase,
    /// Cause of the failure.
    #[source]
    pub error: Box<PipelineError>,
    /// Run record in its `FAILED` state.
    pub run: Box<DeploymentRun>,
}

impl PipelineFailure {
    /// Returns the last HTTP status seen by a failed health check.
    #[must_use]
    pub fn last_health_status(&self) -> Option<u16> {
        match self.error.as_ref() {
            PipelineError::HealthCheck(failure) => failure.last_status(),
            _ => None,
        }
    }
}
