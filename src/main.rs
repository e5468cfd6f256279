//! Binary entry point for the berth CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use berth::health::ProbeSetupError;
use berth::{
    CertStatus, CertificateError, CertificateManager, DeployConfig, HttpProbe, PayloadError,
    Pipeline, PipelineFailure, PipelineSettings, ProcessCommandRunner, RemoteConfig, RemoteError,
    RemoteHost, RunPlan, RunReport, resolve_descriptor,
};

mod cli;

use cli::{CertArgs, Cli, ServiceArgs};

const LOG_ENV: &str = "BERTH_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Probe(#[from] ProbeSetupError),
    #[error(transparent)]
    Pipeline(#[from] Box<PipelineFailure>),
    #[error("ENSURE_CERTIFICATE failed: {0}")]
    Certificate(#[from] CertificateError),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Render(args) => run_plan(&args, RunPlan::Render).await,
        Cli::Provision(args) => run_plan(&args, RunPlan::Provision).await,
        Cli::Deploy(args) => run_plan(&args, RunPlan::Deploy).await,
        Cli::Restart(args) => run_plan(&args, RunPlan::Restart).await,
        Cli::Up(args) => run_plan(&args, RunPlan::Full).await,
        Cli::Cert(args) => run_cert(&args),
    }
}

async fn run_plan(args: &ServiceArgs, plan: RunPlan) -> Result<(), CliError> {
    let raw = resolve_descriptor(
        args.service.as_deref(),
        args.payload.as_deref(),
        args.payload_file.as_deref(),
    )?;
    let deploy_config = load_deploy_config()?;
    let settings =
        PipelineSettings::from_config(&deploy_config).map_err(|err| CliError::Config(err.to_string()))?;

    let mut pipeline = Pipeline::new(settings, HttpProbe::new()?);
    if plan.needs_host() {
        pipeline = pipeline.with_host(connect()?);
    }

    let report = pipeline.execute(&raw, plan).await.map_err(Box::new)?;
    write_report(io::stdout(), &report);
    Ok(())
}

fn run_cert(args: &CertArgs) -> Result<(), CliError> {
    let deploy_config = load_deploy_config()?;
    let email = match args.email.as_deref() {
        Some(email) => email.to_owned(),
        None => deploy_config
            .require_cert_email()
            .map_err(|err| CliError::Config(err.to_string()))?
            .to_owned(),
    };
    let host = connect()?;
    let status = CertificateManager::new(&host, deploy_config.cert_renew_before_days)
        .ensure_certificate(&args.domain, &email)?;
    writeln!(io::stdout(), "{}: certificate {}", args.domain, describe_status(status)).ok();
    Ok(())
}

fn load_deploy_config() -> Result<DeployConfig, CliError> {
    DeployConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))
}

fn connect() -> Result<RemoteHost<ProcessCommandRunner>, CliError> {
    let remote_config =
        RemoteConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    Ok(RemoteHost::with_process_runner(remote_config)?)
}

const fn describe_status(status: CertStatus) -> &'static str {
    match status {
        CertStatus::Issued => "issued",
        CertStatus::Renewed => "renewed",
        CertStatus::Current => "current",
    }
}

fn write_report(mut target: impl Write, report: &RunReport) {
    let run = &report.run;
    writeln!(
        target,
        "{}: {} (run {}, {})",
        run.service_name, run.phase, run.id, run.status
    )
    .ok();
    if let Some(ref paths) = report.artifacts {
        writeln!(target, "  proxy config: {}", paths.proxy_config).ok();
        writeln!(target, "  unit:         {}", paths.unit).ok();
        writeln!(target, "  env drop-in:  {}", paths.env_drop_in).ok();
    }
    if let Some(status) = report.certificate {
        writeln!(target, "  certificate:  {}", describe_status(status)).ok();
    }
    if let Some(ref health) = report.health {
        writeln!(
            target,
            "  health:       {} after {} attempt(s)",
            health.url, health.attempts
        )
        .ok();
    }
    let changed = if run.changed.is_empty() {
        String::from("nothing")
    } else {
        run.changed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    writeln!(target, "  changed:      {changed}").ok();
    if run.degraded {
        writeln!(target, "  degraded:     serving placeholder certificate material").ok();
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
