//! Core library for the berth deploy orchestrator.
//!
//! berth turns a sparse service descriptor into a reverse-proxy site, a
//! systemd unit and an env drop-in, then drives one host over SSH through a
//! phase-sequenced rollout that ends in a health check:
//! resolve → render → push env → install dependencies → deploy host configs →
//! ensure certificate → deploy code → health check.

pub mod cert;
pub mod config;
pub mod environment;
pub mod health;
pub mod payload;
pub mod pipeline;
pub mod proxy;
pub mod remote;
pub mod spec;
pub mod template;
pub mod test_support;
pub mod unit;

pub use cert::{CertStatus, CertificateError, CertificateManager, MaterialState};
pub use config::{ConfigError, DeployConfig};
pub use environment::{EnvironmentSet, SecretSet, ServiceEnvMapping, resolve_environment};
pub use health::{HealthCheckFailure, HealthPolicy, HealthProbe, HttpProbe, wait_until_healthy};
pub use payload::{PayloadError, resolve_descriptor};
pub use pipeline::{
    CancelFlag, CertFailurePolicy, DeploymentRun, EnvironmentInputs, Phase, Pipeline,
    PipelineError, PipelineFailure, PipelineSettings, RunPlan, RunReport, RunStatus,
    ServiceLockFile, ServiceLocks, render_artifacts,
};
pub use proxy::{CompileError, compile_proxy_config};
pub use remote::{
    CommandRunner, ProcessCommandRunner, RemoteConfig, RemoteConfigLoadError, RemoteError,
    RemoteHost,
};
pub use spec::{RawDescriptor, RuntimeKind, ServiceSpec, ValidationError, resolve};
pub use template::{RenderError, render};
pub use unit::{CompiledUnit, compile_unit};
