//! Command-line interface definitions for the `berth` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `berth` binary.
#[derive(Debug, Parser)]
#[command(
    name = "berth",
    about = "Compile proxy, unit and environment configs for one service and roll it out over SSH",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Render proxy, unit and env artifacts for one service locally.
    #[command(name = "render", about = "Render configs for one service without touching the host")]
    Render(ServiceArgs),
    /// Push env, install dependencies, deploy host configs and ensure the
    /// certificate.
    #[command(
        name = "provision",
        about = "Push env, install dependencies, install host configs and ensure the certificate"
    )]
    Provision(ServiceArgs),
    /// Sync code and deploy one service, then check its health.
    #[command(name = "deploy", about = "Sync code, restart and health-check one service")]
    Deploy(ServiceArgs),
    /// Restart one service and check its health.
    #[command(name = "restart", about = "Restart and health-check one service")]
    Restart(ServiceArgs),
    /// Issue or renew the certificate for one domain.
    #[command(name = "cert", about = "Issue or renew the certificate for one domain")]
    Cert(CertArgs),
    /// Run every phase for one service.
    #[command(name = "up", about = "Run the full pipeline for one service")]
    Up(ServiceArgs),
}

/// Selects the service a subcommand acts on.
#[derive(Debug, Args)]
#[group(id = "source", required = true, multiple = false)]
pub(crate) struct ServiceArgs {
    /// Service name; every other field takes its default.
    #[arg(long, value_name = "NAME", group = "source")]
    pub(crate) service: Option<String>,
    /// Trigger payload as inline JSON, for example '{"service":"demo"}'.
    #[arg(long, value_name = "JSON", group = "source")]
    pub(crate) payload: Option<String>,
    /// Trigger payload read from a JSON file.
    #[arg(long, value_name = "PATH", group = "source")]
    pub(crate) payload_file: Option<String>,
}

/// Arguments for the `berth cert` subcommand.
#[derive(Debug, Args)]
pub(crate) struct CertArgs {
    /// Domain to issue or renew a certificate for.
    #[arg(long, value_name = "DOMAIN")]
    pub(crate) domain: String,
    /// Contact email; overrides BERTH_CERT_EMAIL.
    #[arg(long, value_name = "EMAIL")]
    pub(crate) email: Option<String>,
}
