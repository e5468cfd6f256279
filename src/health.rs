//! Post-deploy health verification.
//!
//! The checker issues the configured health request up to a fixed number of
//! times with a fixed delay between attempts. Only `200 OK` counts as
//! healthy. When every attempt fails, the last observed status or transport
//! error is returned in a [`HealthCheckFailure`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Boxed future returned by [`HealthProbe::probe`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeOutcome> + Send + 'a>>;

/// Retry budget for a health check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HealthPolicy {
    /// Total number of requests, including the first.
    pub attempts: u32,
    /// Pause between consecutive requests.
    pub delay: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(3),
            timeout: Duration::from_secs(10),
        }
    }
}

/// One health request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProbeRequest {
    /// Absolute URL to fetch.
    pub url: String,
    /// Reject invalid certificates. Disabled while placeholder material is
    /// served.
    pub verify_tls: bool,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Result of a single health request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProbeOutcome {
    /// The server answered with this status code.
    Status(u16),
    /// The request failed before a status was received.
    Error(String),
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "HTTP status {code}"),
            Self::Error(message) => write!(f, "request error: {message}"),
        }
    }
}

/// Issues health requests.
pub trait HealthProbe {
    /// Performs one request and reports what happened.
    fn probe<'a>(&'a self, request: &'a ProbeRequest) -> ProbeFuture<'a>;
}

/// Successful health check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HealthReport {
    /// URL that answered.
    pub url: String,
    /// Attempt number that succeeded, starting at one.
    pub attempts: u32,
}

/// Health check that never observed `200 OK`.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("health check for {url} failed after {attempts} attempts; last result: {last}")]
pub struct HealthCheckFailure {
    /// URL that was probed.
    pub url: String,
    /// Number of requests made.
    pub attempts: u32,
    /// Outcome of the final request.
    pub last: ProbeOutcome,
}

impl HealthCheckFailure {
    /// Returns the last status code, if the final request got one.
    #[must_use]
    pub const fn last_status(&self) -> Option<u16> {
        match self.last {
            ProbeOutcome::Status(code) => Some(code),
            ProbeOutcome::Error(_) => None,
        }
    }
}

/// Polls `request` until it returns `200 OK` or the budget is spent.
///
/// A policy with zero attempts still makes one request.
///
/// # Errors
///
/// Returns [`HealthCheckFailure`] carrying the last outcome when no attempt
/// returned `200 OK`.
pub async fn wait_until_healthy<P>(
    probe: &P,
    request: &ProbeRequest,
    policy: HealthPolicy,
) -> Result<HealthReport, HealthCheckFailure>
where
    P: HealthProbe + ?Sized,
{
    let attempts = policy.attempts.max(1);
    let mut last = ProbeOutcome::Error(String::from("no request made"));

    for attempt in 1..=attempts {
        let outcome = probe.probe(request).await;
        debug!(url = %request.url, attempt, outcome = %outcome, "health probe");
        if outcome == ProbeOutcome::Status(200) {
            return Ok(HealthReport {
                url: request.url.clone(),
                attempts: attempt,
            });
        }
        last = outcome;
        if attempt < attempts {
            sleep(policy.delay).await;
        }
    }

    Err(HealthCheckFailure {
        url: request.url.clone(),
        attempts,
        last,
    })
}

/// Error raised when the HTTP client cannot be constructed.
#[derive(Debug, Error)]
#[error("failed to build HTTP client: {0}")]
pub struct ProbeSetupError(#[from] reqwest::Error);

/// [`HealthProbe`] backed by `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    strict: reqwest::Client,
    insecure: reqwest::Client,
}

impl HttpProbe {
    /// Builds the verifying and non-verifying clients.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeSetupError`] when the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, ProbeSetupError> {
        let strict = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let insecure = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { strict, insecure })
    }
}

impl HealthProbe for HttpProbe {
    fn probe<'a>(&'a self, request: &'a ProbeRequest) -> ProbeFuture<'a> {
        let client = if request.verify_tls {
            &self.strict
        } else {
            &self.insecure
        };
        Box::pin(async move {
            match client
                .get(&request.url)
                .timeout(request.timeout)
                .send()
                .await
            {
                Ok(response) => ProbeOutcome::Status(response.status().as_u16()),
                Err(err) => ProbeOutcome::Error(err.to_string()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedProbe;
    use rstest::{fixture, rstest};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[fixture]
    fn request() -> ProbeRequest {
        ProbeRequest {
            url: String::from("https://demo.example.com/healthz"),
            verify_tls: true,
            timeout: Duration::from_secs(1),
        }
    }

    fn quick(attempts: u32) -> HealthPolicy {
        HealthPolicy {
            attempts,
            delay: Duration::ZERO,
            timeout: Duration::from_secs(1),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn succeeds_once_status_is_ok(request: ProbeRequest) {
        let probe = ScriptedProbe::new();
        probe.push_error("connection refused");
        probe.push_status(502);
        probe.push_status(200);

        let report = wait_until_healthy(&probe, &request, quick(5))
            .await
            .expect("third attempt should pass");

        assert_eq!(report.attempts, 3);
        assert_eq!(probe.requests().len(), 3);
    }

    #[rstest]
    #[tokio::test]
    async fn exhausting_the_budget_reports_last_status(request: ProbeRequest) {
        let probe = ScriptedProbe::new();
        probe.push_status(503);

        let failure = wait_until_healthy(&probe, &request, quick(4))
            .await
            .expect_err("never healthy");

        assert_eq!(failure.attempts, 4);
        assert_eq!(failure.last_status(), Some(503));
        assert_eq!(probe.requests().len(), 4);
        assert!(failure.to_string().contains("HTTP status 503"), "{failure}");
    }

    #[rstest]
    #[tokio::test]
    async fn transport_errors_are_captured(request: ProbeRequest) {
        let probe = ScriptedProbe::new();
        probe.push_status(500);
        probe.push_error("timed out");

        let failure = wait_until_healthy(&probe, &request, quick(2))
            .await
            .expect_err("never healthy");

        assert_eq!(failure.last, ProbeOutcome::Error(String::from("timed out")));
        assert_eq!(failure.last_status(), None);
    }

    #[rstest]
    #[tokio::test]
    async fn redirects_are_not_healthy(request: ProbeRequest) {
        let probe = ScriptedProbe::new();
        probe.push_status(301);

        let failure = wait_until_healthy(&probe, &request, quick(1))
            .await
            .expect_err("redirect is not 200");

        assert_eq!(failure.last_status(), Some(301));
    }

    #[rstest]
    #[tokio::test]
    async fn zero_attempts_still_probes_once(request: ProbeRequest) {
        let probe = ScriptedProbe::new();
        probe.push_status(200);

        let report = wait_until_healthy(&probe, &request, quick(0))
            .await
            .expect("single probe passes");

        assert_eq!(report.attempts, 1);
    }

    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0_u8; 1024];
                let _read = socket.read(&mut buf).await;
                let response =
                    format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _written = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/healthz")
    }

    #[tokio::test]
    async fn http_probe_reports_server_status() {
        let url = serve_once("503 Service Unavailable").await;
        let probe = HttpProbe::new().expect("client builds");

        let outcome = probe
            .probe(&ProbeRequest {
                url,
                verify_tls: true,
                timeout: Duration::from_secs(5),
            })
            .await;

        assert_eq!(outcome, ProbeOutcome::Status(503));
    }

    #[tokio::test]
    async fn http_probe_reports_connection_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);
        let probe = HttpProbe::new().expect("client builds");

        let outcome = probe
            .probe(&ProbeRequest {
                url: format!("http://{addr}/healthz"),
                verify_tls: false,
                timeout: Duration::from_secs(5),
            })
            .await;

        assert!(matches!(outcome, ProbeOutcome::Error(_)), "{outcome}");
    }
}
