//! BDD step definitions for deployment pipeline runs.

use berth::test_support::{ScriptedProbe, ScriptedRunner};
use berth::{Pipeline, PipelineFailure, RawDescriptor, RemoteHost, RunPlan};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{
    PipelineContext, PipelineFailureSummary, PipelineOutcome, script_full_run,
};
use crate::remote_config::remote_config;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a host where every step applies a change")]
fn changing_host(pipeline_context: PipelineContext) -> PipelineContext {
    script_full_run(&pipeline_context.runner, true);
    pipeline_context
}

#[given("a host that is rolled out twice")]
fn host_rolled_out_twice(pipeline_context: PipelineContext) -> PipelineContext {
    script_full_run(&pipeline_context.runner, true);
    script_full_run(&pipeline_context.runner, false);
    pipeline_context
}

#[given("a host whose certbot challenge fails")]
fn failing_certbot_host(pipeline_context: PipelineContext) -> PipelineContext {
    let runner = &pipeline_context.runner;
    runner.push_success();
    runner.push_changed();
    runner.push_success();
    runner.push_successes(2);
    runner.push_changed();
    runner.push_stdout("placeholder\n");
    runner.push_output(
        Some(1),
        "",
        "Challenge failed for domain demo.example.com\n",
    );
    runner.push_changed();
    pipeline_context
}

#[given("the health endpoint answers \"{status}\"")]
fn health_answers(pipeline_context: PipelineContext, status: u16) -> PipelineContext {
    pipeline_context.probe.push_status(status);
    pipeline_context
}

#[when("I run the \"{plan}\" plan for service \"{service}\"")]
fn run_plan(
    pipeline_context: PipelineContext,
    plan: String,
    service: String,
) -> Result<PipelineContext, StepError> {
    execute(pipeline_context, &plan, &service, 1)
}

#[when("the \"{plan}\" plan runs twice for service \"{service}\"")]
fn run_plan_twice(
    pipeline_context: PipelineContext,
    plan: String,
    service: String,
) -> Result<PipelineContext, StepError> {
    execute(pipeline_context, &plan, &service, 2)
}

#[then("the run reaches DONE")]
fn run_done(pipeline_context: &PipelineContext) -> Result<(), StepError> {
    let reports = successful_reports(pipeline_context)?;
    if reports.iter().all(|report| report.run.phase.as_str() == "DONE") {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "every run should finish in DONE",
        )))
    }
}

#[then("the run fails in phase \"{phase}\"")]
fn run_fails_in(pipeline_context: &PipelineContext, phase: String) -> Result<(), StepError> {
    let failure = failure_summary(pipeline_context)?;
    if failure.phase.as_str() == phase {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure in {phase}, got {}: {}",
            failure.phase, failure.message
        )))
    }
}

#[then("the last health status is \"{status}\"")]
fn last_health_status(pipeline_context: &PipelineContext, status: u16) -> Result<(), StepError> {
    let failure = failure_summary(pipeline_context)?;
    if failure.last_status == Some(status) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected last status {status}, got {:?}",
            failure.last_status
        )))
    }
}

#[then("the health check targeted \"{url}\"")]
fn health_target(pipeline_context: &PipelineContext, url: String) -> Result<(), StepError> {
    let requests = pipeline_context.probe.requests();
    if !requests.is_empty() && requests.iter().all(|request| request.url == url) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected probes of {url}, got {requests:?}"
        )))
    }
}

#[then("the host saw \"{count}\" calls")]
fn host_call_count(pipeline_context: &PipelineContext, count: usize) -> Result<(), StepError> {
    let invocations = pipeline_context.runner.invocations();
    if invocations.len() == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} host calls, got {}",
            invocations.len()
        )))
    }
}

#[then("the run is degraded")]
fn run_degraded(pipeline_context: &PipelineContext) -> Result<(), StepError> {
    let reports = successful_reports(pipeline_context)?;
    match reports.last() {
        Some(report) if report.run.degraded && report.certificate.is_none() => Ok(()),
        _ => Err(StepError::Assertion(String::from(
            "expected a degraded run without certificate status",
        ))),
    }
}

#[then("the last run reported no changes")]
fn last_run_unchanged(pipeline_context: &PipelineContext) -> Result<(), StepError> {
    let reports = successful_reports(pipeline_context)?;
    match reports {
        [first, second] if !first.run.changed.is_empty() && second.run.changed.is_empty() => {
            Ok(())
        }
        _ => Err(StepError::Assertion(format!(
            "expected a changing first run and an unchanged second run, got {:?}",
            reports
                .iter()
                .map(|report| report.run.changed.clone())
                .collect::<Vec<_>>()
        ))),
    }
}

fn execute(
    pipeline_context: PipelineContext,
    plan: &str,
    service: &str,
    repeats: usize,
) -> Result<PipelineContext, StepError> {
    let run_plan_kind = parse_plan(plan)?;
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let host = RemoteHost::new(remote_config(), pipeline_context.runner.clone())
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let pipeline: Pipeline<ScriptedRunner, ScriptedProbe> = Pipeline::new(
        pipeline_context.settings.clone(),
        pipeline_context.probe.clone(),
    )
    .with_host(host);
    let raw = RawDescriptor::named(service);

    let result = runtime.block_on(async {
        let mut reports = Vec::with_capacity(repeats);
        for _ in 0..repeats {
            reports.push(pipeline.execute(&raw, run_plan_kind).await?);
        }
        Ok::<_, PipelineFailure>(reports)
    });
    let outcome = match result {
        Ok(reports) => PipelineOutcome::Success(reports),
        Err(err) => PipelineOutcome::Failure(PipelineFailureSummary {
            phase: err.phase,
            message: err.to_string(),
            last_status: err.last_health_status(),
        }),
    };

    Ok(PipelineContext {
        outcome: Some(outcome),
        ..pipeline_context
    })
}

fn parse_plan(plan: &str) -> Result<RunPlan, StepError> {
    match plan {
        "full" => Ok(RunPlan::Full),
        "render" => Ok(RunPlan::Render),
        "provision" => Ok(RunPlan::Provision),
        "deploy" => Ok(RunPlan::Deploy),
        "restart" => Ok(RunPlan::Restart),
        other => Err(StepError::Assertion(format!("unknown plan {other}"))),
    }
}

fn successful_reports(
    pipeline_context: &PipelineContext,
) -> Result<&[berth::RunReport], StepError> {
    match pipeline_context.outcome {
        Some(PipelineOutcome::Success(ref reports)) => Ok(reports),
        Some(PipelineOutcome::Failure(ref failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

fn failure_summary(
    pipeline_context: &PipelineContext,
) -> Result<&PipelineFailureSummary, StepError> {
    match pipeline_context.outcome {
        Some(PipelineOutcome::Failure(ref failure)) => Ok(failure),
        Some(PipelineOutcome::Success(_)) => Err(StepError::Assertion(String::from(
            "expected failure outcome",
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}
