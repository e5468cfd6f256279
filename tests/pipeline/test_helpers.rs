//! Shared fixtures for pipeline BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use berth::test_support::{ScriptedProbe, ScriptedRunner};
use berth::{
    CertFailurePolicy, EnvironmentInputs, HealthPolicy, Phase, PipelineSettings, RunReport,
};
use camino::Utf8PathBuf;
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct PipelineContext {
    pub runner: ScriptedRunner,
    pub probe: ScriptedProbe,
    pub settings: PipelineSettings,
    pub outcome: Option<PipelineOutcome>,
    pub(crate) _workspace: Arc<TempDir>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PipelineFailureSummary {
    pub phase: Phase,
    pub message: String,
    pub last_status: Option<u16>,
}

#[derive(Clone, Debug)]
pub enum PipelineOutcome {
    Success(Vec<RunReport>),
    Failure(PipelineFailureSummary),
}

#[derive(Clone, Debug, Error)]
pub enum PipelineTestError {
    #[error("failed to create workspace: {0}")]
    Workspace(String),
}

#[fixture]
pub fn pipeline_context_result() -> Result<PipelineContext, PipelineTestError> {
    build_pipeline_context()
}

#[fixture]
pub fn pipeline_context(
    pipeline_context_result: Result<PipelineContext, PipelineTestError>,
) -> PipelineContext {
    pipeline_context_result
        .unwrap_or_else(|err| panic!("pipeline context fixture should initialise: {err}"))
}

fn build_pipeline_context() -> Result<PipelineContext, PipelineTestError> {
    let workspace =
        TempDir::new().map_err(|err| PipelineTestError::Workspace(format!("tempdir: {err}")))?;
    let output_dir = Utf8PathBuf::from_path_buf(workspace.path().join("generated")).map_err(
        |path| PipelineTestError::Workspace(format!("non-utf8 tempdir path: {}", path.display())),
    )?;

    Ok(PipelineContext {
        runner: ScriptedRunner::new(),
        probe: ScriptedProbe::new(),
        settings: PipelineSettings {
            output_dir,
            cert_email: Some(String::from("ops@example.com")),
            cert_failure_policy: CertFailurePolicy::Degrade,
            cert_renew_before_days: 30,
            health: HealthPolicy {
                attempts: 3,
                delay: Duration::ZERO,
                timeout: Duration::from_secs(1),
            },
            environment: EnvironmentInputs::default(),
        },
        outcome: None,
        _workspace: Arc::new(workspace),
    })
}

/// Queues the host responses of a full run whose certificate is current.
///
/// `changed` decides whether each idempotent step reports a change.
pub fn script_full_run(runner: &ScriptedRunner, changed: bool) {
    let step = |scripted: &ScriptedRunner| {
        if changed {
            scripted.push_changed();
        } else {
            scripted.push_success();
        }
    };
    // env upload, env install, dependencies
    runner.push_success();
    step(runner);
    step(runner);
    // site and unit uploads, host configs
    runner.push_successes(2);
    step(runner);
    // certificate inspection, code deploy
    runner.push_stdout("valid\n");
    step(runner);
}
