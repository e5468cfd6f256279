//! Deploy pipeline orchestrator.
//!
//! A run walks the phases of its [`RunPlan`] strictly in order:
//!
//! `RESOLVE → RENDER_CONFIGS → PUSH_ENV → INSTALL_DEPENDENCIES →
//! DEPLOY_HOST_CONFIGS → ENSURE_CERTIFICATE → DEPLOY_SERVICE_CODE →
//! HEALTH_CHECK → DONE`
//!
//! The first failing phase moves the run to `FAILED` and stops it. Nothing
//! already applied to the host is rolled back; every phase converges, so a
//! fresh run picks up from wherever the last one stopped. Runs for the same
//! service are serialised through [`ServiceLocks`] inside one process and
//! through a [`ServiceLockFile`] across processes sharing an output
//! directory. A [`CancelFlag`] abandons a run between phases.

mod artifacts;
mod error;
mod locks;
mod phase;
mod scripts;

use std::io;

use camino::Utf8PathBuf;
use serde_json::Value;
use tracing::{info, warn};

pub use artifacts::{
    ArtifactError, ArtifactPaths, ArtifactStore, RenderedArtifacts, WriteOutcome,
};
pub use error::{PipelineError, PipelineFailure};
pub use locks::{CancelFlag, LOCK_DIR, ServiceLockFile, ServiceLocks};
pub use phase::{DeploymentRun, Phase, RunPlan, RunStatus};

use crate::cert::{CertStatus, CertificateManager, MaterialState};
use crate::config::{DeployConfig, missing_cert_email};
use crate::environment::{SecretSet, ServiceEnvMapping, resolve_environment};
use crate::health::{HealthPolicy, HealthProbe, HealthReport, ProbeRequest, wait_until_healthy};
use crate::proxy::compile_proxy_config;
use crate::remote::{CommandRunner, RemoteHost};
use crate::spec::{RawDescriptor, ServiceSpec, resolve};
use crate::unit::compile_unit;
use locks::LOCK_RETRY_DELAY;

const UNNAMED_SERVICE: &str = "<unnamed>";

/// What to do when certbot cannot issue or renew real material.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CertFailurePolicy {
    /// Keep serving the placeholder (or old certificate) and mark the run
    /// degraded.
    #[default]
    Degrade,
    /// Fail the run at `ENSURE_CERTIFICATE`.
    Fatal,
}

/// Environment sources a run selects from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EnvironmentInputs {
    /// Per-service mapping. When present it wins outright.
    pub mapping: Option<ServiceEnvMapping>,
    /// Every available secret, used when no mapping is configured.
    pub secrets: SecretSet,
}

/// Settings every run of a pipeline shares.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PipelineSettings {
    /// Local directory receiving rendered artifacts.
    pub output_dir: Utf8PathBuf,
    /// Certificate contact email.
    pub cert_email: Option<String>,
    /// Reaction to certbot failures.
    pub cert_failure_policy: CertFailurePolicy,
    /// Renewal window in days.
    pub cert_renew_before_days: u32,
    /// Health-check retry budget.
    pub health: HealthPolicy,
    /// Environment sources.
    pub environment: EnvironmentInputs,
}

impl PipelineSettings {
    /// Builds settings from a loaded [`DeployConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when the configuration fails
    /// validation, or [`PipelineError::Validation`] when an environment source
    /// is malformed.
    pub fn from_config(config: &DeployConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            output_dir: Utf8PathBuf::from(config.output_dir.trim()),
            cert_email: config
                .cert_email
                .as_deref()
                .map(str::trim)
                .filter(|email| !email.is_empty())
                .map(str::to_owned),
            cert_failure_policy: config.failure_policy()?,
            cert_renew_before_days: config.cert_renew_before_days,
            health: config.health_policy(),
            environment: config.environment_inputs()?,
        })
    }
}

/// Result of a successful run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunReport {
    /// Run record in its `DONE` state.
    pub run: DeploymentRun,
    /// Resolved service.
    pub spec: ServiceSpec,
    /// Where artifacts were written, when the plan rendered them.
    pub artifacts: Option<ArtifactPaths>,
    /// Certificate outcome, when the plan ensured one.
    pub certificate: Option<CertStatus>,
    /// Health outcome, when the plan checked health.
    pub health: Option<HealthReport>,
}

/// Compiles every artifact for `spec` without writing anything.
///
/// # Errors
///
/// Returns [`PipelineError`] for environment, compile, or render failures.
/// Either all three artifacts are produced or none is.
pub fn render_artifacts(
    spec: &ServiceSpec,
    environment: &EnvironmentInputs,
) -> Result<RenderedArtifacts, PipelineError> {
    let env = resolve_environment(&spec.name, environment.mapping.as_ref(), &environment.secrets)?;
    let proxy_config = compile_proxy_config(spec)?;
    let unit = compile_unit(spec, spec.runtime_kind(), &env)?;
    Ok(RenderedArtifacts {
        service: spec.name.clone(),
        proxy_config,
        unit: unit.unit,
        env_drop_in: unit.env_drop_in,
    })
}

/// Runs plans against one deploy host.
#[derive(Debug)]
pub struct Pipeline<R: CommandRunner, P: HealthProbe> {
    settings: PipelineSettings,
    store: ArtifactStore,
    host: Option<RemoteHost<R>>,
    probe: P,
    locks: ServiceLocks,
    cancel: CancelFlag,
}

#[derive(Debug, Default)]
struct Progress {
    artifacts: Option<ArtifactPaths>,
    certificate: Option<CertStatus>,
    health: Option<HealthReport>,
}

impl<R: CommandRunner, P: HealthProbe> Pipeline<R, P> {
    /// Creates a pipeline without a host. Only plans that stay local
    /// ([`RunPlan::Render`]) can run until [`Self::with_host`] is called.
    #[must_use]
    pub fn new(settings: PipelineSettings, probe: P) -> Self {
        let store = ArtifactStore::new(settings.output_dir.clone());
        Self {
            settings,
            store,
            host: None,
            probe,
            locks: ServiceLocks::new(),
            cancel: CancelFlag::new(),
        }
    }

    /// Attaches the deploy host.
    #[must_use]
    pub fn with_host(mut self, host: RemoteHost<R>) -> Self {
        self.host = Some(host);
        self
    }

    /// Shares a lock registry with other pipelines.
    #[must_use]
    pub fn with_locks(mut self, locks: ServiceLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Uses `flag` for cancellation.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = flag;
        self
    }

    /// Returns a handle that cancels this pipeline's runs.
    #[must_use]
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Returns the local artifact store.
    #[must_use]
    pub const fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Executes `plan` for the service `raw` describes.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineFailure`] naming the phase that failed, the cause,
    /// and the run record in its `FAILED` state.
    pub async fn execute(
        &self,
        raw: &RawDescriptor,
        plan: RunPlan,
    ) -> Result<RunReport, PipelineFailure> {
        let mut run = DeploymentRun::new(declared_name(raw));
        info!(run_id = %run.id, service = %run.service_name, ?plan, "deployment run started");

        self.begin(&mut run, Phase::Resolve)
            .map_err(|err| failure(&mut run, Phase::Resolve, err))?;
        let spec = resolve(raw).map_err(|err| failure(&mut run, Phase::Resolve, err.into()))?;
        run.service_name.clone_from(&spec.name);

        let _guard = self.locks.acquire(&spec.name).await;
        let mut lock_file = ServiceLockFile::open(self.store.root(), &spec.name).map_err(
            |(path, err)| {
                failure(
                    &mut run,
                    Phase::Resolve,
                    PipelineError::Lock {
                        path,
                        message: err.to_string(),
                    },
                )
            },
        )?;
        let lock_path = lock_file.path().to_path_buf();
        let mut waiting = false;
        let _host_guard = loop {
            match lock_file.lock_mut().try_write() {
                Ok(guard) => break guard,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !waiting {
                        info!(
                            service = %spec.name,
                            lock = %lock_path,
                            "waiting for another run of this service"
                        );
                        waiting = true;
                    }
                }
                Err(err) => {
                    let cause = PipelineError::Lock {
                        path: lock_path,
                        message: err.to_string(),
                    };
                    return Err(failure(&mut run, Phase::Resolve, cause));
                }
            }
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        };
        let mut progress = Progress::default();
        for &phase in plan.phases().iter().skip(1) {
            if let Err(err) = self.begin(&mut run, phase) {
                return Err(failure(&mut run, phase, err));
            }
            if let Err(err) = self
                .run_phase(phase, plan, &spec, &mut run, &mut progress)
                .await
            {
                return Err(failure(&mut run, phase, err));
            }
        }

        run.succeed();
        info!(
            run_id = %run.id,
            service = %run.service_name,
            degraded = run.degraded,
            changed = ?run.changed,
            "deployment run finished"
        );
        Ok(RunReport {
            run,
            spec,
            artifacts: progress.artifacts,
            certificate: progress.certificate,
            health: progress.health,
        })
    }

    fn begin(&self, run: &mut DeploymentRun, phase: Phase) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { phase });
        }
        run.enter(phase);
        info!(run_id = %run.id, service = %run.service_name, %phase, "phase started");
        Ok(())
    }

    async fn run_phase(
        &self,
        phase: Phase,
        plan: RunPlan,
        spec: &ServiceSpec,
        run: &mut DeploymentRun,
        progress: &mut Progress,
    ) -> Result<(), PipelineError> {
        let changed = match phase {
            Phase::RenderConfigs => {
                let rendered = render_artifacts(spec, &self.settings.environment)?;
                let outcome = self.store.write(&rendered)?;
                progress.artifacts = Some(outcome.paths);
                !outcome.changed.is_empty()
            }
            Phase::PushEnv => self.push_env(phase, spec)?,
            Phase::InstallDependencies => self
                .host(phase)?
                .run_checked(
                    "install-dependencies",
                    &scripts::install_dependencies(spec.runtime_kind()),
                )?
                .reported_change(),
            Phase::DeployHostConfigs => self.deploy_host_configs(phase, spec)?,
            Phase::EnsureCertificate => self.ensure_certificate(phase, spec, run, progress)?,
            Phase::DeployServiceCode => {
                let script = if plan == RunPlan::Restart {
                    scripts::restart_service(spec)
                } else {
                    let force_restart = run.changed_in(Phase::PushEnv)
                        || run.changed_in(Phase::DeployHostConfigs);
                    scripts::deploy_service_code(spec, force_restart)
                };
                self.host(phase)?
                    .run_checked("deploy-service-code", &script)?
                    .reported_change()
            }
            Phase::HealthCheck => {
                if !plan.phases().contains(&Phase::EnsureCertificate) {
                    self.detect_placeholder(phase, spec, run)?;
                }
                let request = ProbeRequest {
                    url: spec.health_url(),
                    verify_tls: !spec.allow_plain_http && !run.degraded,
                    timeout: self.settings.health.timeout,
                };
                let report = wait_until_healthy(&self.probe, &request, self.settings.health).await?;
                info!(url = %report.url, attempts = report.attempts, "service healthy");
                progress.health = Some(report);
                false
            }
            Phase::Resolve | Phase::Done | Phase::Failed => false,
        };
        if changed {
            run.mark_changed(phase);
        }
        Ok(())
    }

    fn host(&self, phase: Phase) -> Result<&RemoteHost<R>, PipelineError> {
        self.host
            .as_ref()
            .ok_or(PipelineError::HostRequired { phase })
    }

    fn push_env(&self, phase: Phase, spec: &ServiceSpec) -> Result<bool, PipelineError> {
        let host = self.host(phase)?;
        let paths = self.store.paths_for(&spec.name);
        let staged = host.upload(&paths.env_drop_in, &format!("berth-{}.env", spec.name))?;
        let output = host.run_checked("install-env", &scripts::install_env(&spec.name, &staged))?;
        Ok(output.reported_change())
    }

    fn deploy_host_configs(&self, phase: Phase, spec: &ServiceSpec) -> Result<bool, PipelineError> {
        let host = self.host(phase)?;
        let paths = self.store.paths_for(&spec.name);
        let staged_site = host.upload(&paths.proxy_config, &format!("berth-{}.conf", spec.name))?;
        let staged_unit = host.upload(&paths.unit, &format!("berth-{}.service", spec.name))?;
        let output = host.run_checked(
            "deploy-host-configs",
            &scripts::deploy_host_configs(spec, &staged_site, &staged_unit),
        )?;
        Ok(output.reported_change())
    }

    fn ensure_certificate(
        &self,
        phase: Phase,
        spec: &ServiceSpec,
        run: &mut DeploymentRun,
        progress: &mut Progress,
    ) -> Result<bool, PipelineError> {
        if spec.allow_plain_http {
            info!(service = %spec.name, "plain HTTP enabled; certificate skipped");
            return Ok(false);
        }
        let email = self
            .settings
            .cert_email
            .as_deref()
            .ok_or_else(missing_cert_email)?;
        let manager = CertificateManager::new(self.host(phase)?, self.settings.cert_renew_before_days);

        match manager.ensure_certificate(&spec.domain, email) {
            Ok(status) => {
                progress.certificate = Some(status);
                Ok(status.changed())
            }
            Err(err)
                if err.is_recoverable()
                    && self.settings.cert_failure_policy == CertFailurePolicy::Degrade =>
            {
                warn!(
                    service = %spec.name,
                    domain = %spec.domain,
                    error = %err,
                    "continuing with placeholder certificate material"
                );
                run.degraded = true;
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Marks the run degraded when the host still serves placeholder
    /// material, so the health check does not reject the certificate.
    fn detect_placeholder(
        &self,
        phase: Phase,
        spec: &ServiceSpec,
        run: &mut DeploymentRun,
    ) -> Result<(), PipelineError> {
        if spec.allow_plain_http {
            return Ok(());
        }
        let manager = CertificateManager::new(self.host(phase)?, self.settings.cert_renew_before_days);
        let state = manager.inspect(&spec.domain)?;
        if matches!(state, MaterialState::Missing | MaterialState::Placeholder) {
            warn!(service = %spec.name, domain = %spec.domain, ?state, "no real certificate on host");
            run.degraded = true;
        }
        Ok(())
    }
}

fn failure(run: &mut DeploymentRun, phase: Phase, error: PipelineError) -> PipelineFailure {
    run.fail(phase, &error);
    warn!(
        run_id = %run.id,
        service = %run.service_name,
        %phase,
        error = %error,
        "deployment run failed"
    );
    PipelineFailure {
        phase,
        error: Box::new(error),
        run: Box::new(run.clone()),
    }
}

fn declared_name(raw: &RawDescriptor) -> String {
    raw.service
        .as_ref()
        .or(raw.name.as_ref())
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(UNNAMED_SERVICE)
        .to_owned()
}
