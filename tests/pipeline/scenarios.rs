//! BDD scenarios for deployment pipeline runs.

use rstest_bdd_macros::scenario;

use super::test_helpers::{PipelineContext, pipeline_context};


#[scenario(
    path = "tests/features/pipeline.feature",
    name = "Roll out a default service end to end"
)]
fn scenario_full_rollout(pipeline_context: PipelineContext) {
    drop(pipeline_context);
}

#[scenario(
    path = "tests/features/pipeline.feature",
    name = "Exhausted health checks fail the run"
)]
fn scenario_health_exhaustion(pipeline_context: PipelineContext) {
    drop(pipeline_context);
}

#[scenario(
    path = "tests/features/pipeline.feature",
    name = "A failed certbot challenge degrades the run"
)]
fn scenario_degraded_certificate(pipeline_context: PipelineContext) {
    drop(pipeline_context);
}

#[scenario(
    path = "tests/features/pipeline.feature",
    name = "Repeating an identical rollout changes nothing"
)]
fn scenario_idempotent_rollout(pipeline_context: PipelineContext) {
    drop(pipeline_context);
}

#[scenario(
    path = "tests/features/pipeline.feature",
    name = "Invalid service names stop before the host is contacted"
)]
fn scenario_invalid_service(pipeline_context: PipelineContext) {
    drop(pipeline_context);
}
