//! Phase state machine and the per-run record it mutates.

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One step of the deploy pipeline, in execution order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Phase {
    /// Validate and default the descriptor.
    Resolve,
    /// Compile proxy, unit and env artifacts locally.
    RenderConfigs,
    /// Install the env drop-in on the host.
    PushEnv,
    /// Install missing host packages.
    InstallDependencies,
    /// Install proxy and unit files on the host.
    DeployHostConfigs,
    /// Ensure TLS material for the domain.
    EnsureCertificate,
    /// Sync code, build, restart and migrate.
    DeployServiceCode,
    /// Poll the public health endpoint.
    HealthCheck,
    /// Terminal success.
    Done,
    /// Terminal failure.
    Failed,
}

impl Phase {
    /// Every working phase, in order.
    pub const SEQUENCE: [Self; 8] = [
        Self::Resolve,
        Self::RenderConfigs,
        Self::PushEnv,
        Self::InstallDependencies,
        Self::DeployHostConfigs,
        Self::EnsureCertificate,
        Self::DeployServiceCode,
        Self::HealthCheck,
    ];

    /// Returns the upper-case label used in logs and failure reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resolve => "RESOLVE",
            Self::RenderConfigs => "RENDER_CONFIGS",
            Self::PushEnv => "PUSH_ENV",
            Self::InstallDependencies => "INSTALL_DEPENDENCIES",
            Self::DeployHostConfigs => "DEPLOY_HOST_CONFIGS",
            Self::EnsureCertificate => "ENSURE_CERTIFICATE",
            Self::DeployServiceCode => "DEPLOY_SERVICE_CODE",
            Self::HealthCheck => "HEALTH_CHECK",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    /// Returns `true` for `DONE` and `FAILED`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a [`DeploymentRun`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunStatus {
    /// Created, no phase started.
    Pending,
    /// A phase is executing.
    Running,
    /// Reached `DONE`.
    Succeeded,
    /// Reached `FAILED`.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

/// Which phases a pipeline invocation executes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunPlan {
    /// Every phase.
    Full,
    /// Resolve and render artifacts locally.
    Render,
    /// Everything up to and including the certificate.
    Provision,
    /// Sync code, restart, and check health.
    Deploy,
    /// Restart the unit and check health without syncing code.
    Restart,
}

impl RunPlan {
    /// Returns the phases this plan executes, in order.
    #[must_use]
    pub const fn phases(self) -> &'static [Phase] {
        match self {
            Self::Full => &Phase::SEQUENCE,
            Self::Render => &[Phase::Resolve, Phase::RenderConfigs],
            Self::Provision => &[
                Phase::Resolve,
                Phase::RenderConfigs,
                Phase::PushEnv,
                Phase::InstallDependencies,
                Phase::DeployHostConfigs,
                Phase::EnsureCertificate,
            ],
            Self::Deploy | Self::Restart => &[
                Phase::Resolve,
                Phase::DeployServiceCode,
                Phase::HealthCheck,
            ],
        }
    }

    /// Returns `true` when any phase of the plan talks to the host.
    #[must_use]
    pub fn needs_host(self) -> bool {
        self.phases()
            .iter()
            .any(|phase| !matches!(phase, Phase::Resolve | Phase::RenderConfigs))
    }
}

/// Record of one pipeline execution.
///
/// Created when a run starts and mutated only by the orchestrator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentRun {
    /// Run identifier, used to correlate log lines.
    pub id: Uuid,
    /// Service being deployed. Taken from the raw payload until resolution
    /// succeeds.
    pub service_name: String,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// Phase currently executing, or the terminal phase.
    pub phase: Phase,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Phase that failed, when the run failed.
    pub failed_phase: Option<Phase>,
    /// Human-readable cause of the failure.
    pub last_error: Option<String>,
    /// Placeholder or stale TLS material is being served.
    pub degraded: bool,
    /// Phases that altered local or host state, in execution order.
    pub changed: Vec<Phase>,
}

impl DeploymentRun {
    /// Starts a pending run for `service_name`.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_name: service_name.into(),
            started_at: Utc::now(),
            phase: Phase::Resolve,
            status: RunStatus::Pending,
            failed_phase: None,
            last_error: None,
            degraded: false,
            changed: Vec::new(),
        }
    }

    /// Moves the run into `phase`.
    pub const fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.status = RunStatus::Running;
    }

    /// Records that `phase` altered state.
    pub fn mark_changed(&mut self, phase: Phase) {
        if !self.changed.contains(&phase) {
            self.changed.push(phase);
        }
    }

    /// Returns `true` when `phase` altered state during this run.
    #[must_use]
    pub fn changed_in(&self, phase: Phase) -> bool {
        self.changed.contains(&phase)
    }

    /// Moves the run to `DONE`.
    pub const fn succeed(&mut self) {
        self.phase = Phase::Done;
        self.status = RunStatus::Succeeded;
    }

    /// Moves the run to `FAILED`, recording where and why.
    pub fn fail(&mut self, phase: Phase, cause: impl fmt::Display) {
        self.failed_phase = Some(phase);
        self.last_error = Some(cause.to_string());
        self.phase = Phase::Failed;
        self.status = RunStatus::Failed;
    }
}
