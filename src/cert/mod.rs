//! TLS certificate management on the deploy host.
//!
//! Material for a domain lives in `/etc/letsencrypt/live/{domain}/`. When no
//! material exists the manager first installs a short-lived self-signed
//! placeholder, marked by a `.berth-placeholder` file, so nginx can start and
//! answer the ACME challenge. It then asks certbot for real material through
//! the webroot. A real certificate close to expiry is renewed; one with time
//! left is left alone.
//!
//! Issuance and renewal failures are recoverable: the placeholder (or the
//! existing certificate) stays in place and the caller decides whether to
//! continue degraded. Transport and bootstrap failures are not.

use std::borrow::Cow;

use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{info, warn};

use crate::proxy::{CERTBOT_WEBROOT, LIVE_CERT_DIR};
use crate::remote::{CommandRunner, RemoteError, RemoteHost};
use crate::spec::validate_domain;

/// File marking placeholder material inside a live directory.
pub const PLACEHOLDER_MARKER: &str = ".berth-placeholder";

const SECONDS_PER_DAY: u64 = 86_400;
const PLACEHOLDER_BACKUP_DIR: &str = "/var/lib/berth/placeholder";
const RELOAD_NGINX: &str = "\
nginx -t
if systemctl is-active --quiet nginx; then
  systemctl reload nginx
else
  systemctl start nginx
fi";

/// Certificate material found on the host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MaterialState {
    /// No certificate or key.
    Missing,
    /// Self-signed placeholder material.
    Placeholder,
    /// Real material with more than the renewal window left.
    Valid,
    /// Real material inside the renewal window.
    Expiring,
}

/// Result of a successful [`CertificateManager::ensure_certificate`] call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertStatus {
    /// Real material was issued, replacing a placeholder.
    Issued,
    /// Expiring material was renewed.
    Renewed,
    /// Valid material was already present; nothing changed.
    Current,
}

impl CertStatus {
    /// Returns `true` when host state changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Current)
    }
}

/// Errors raised while ensuring certificate material.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Raised when the domain cannot be used in a certificate request.
    #[error("invalid certificate domain '{domain}'")]
    InvalidDomain {
        /// Domain as supplied.
        domain: String,
    },
    /// Raised when the contact email is missing or malformed.
    #[error("invalid certificate contact email '{email}': set BERTH_CERT_EMAIL or add cert_email to berth.toml")]
    InvalidEmail {
        /// Email as supplied.
        email: String,
    },
    /// Raised when the host reports a state the manager does not know.
    #[error("unexpected certificate state for {domain}: '{output}'")]
    UnknownState {
        /// Domain inspected.
        domain: String,
        /// Output of the inspection script.
        output: String,
    },
    /// Raised when the host cannot be inspected.
    #[error("failed to inspect certificate for {domain}: {source}")]
    Inspect {
        /// Domain inspected.
        domain: String,
        /// Transport or command failure.
        #[source]
        source: RemoteError,
    },
    /// Raised when placeholder material cannot be installed.
    #[error("failed to install placeholder certificate for {domain}: {source}")]
    Bootstrap {
        /// Domain being bootstrapped.
        domain: String,
        /// Transport or command failure.
        #[source]
        source: RemoteError,
    },
    /// Raised when certbot cannot issue real material.
    #[error("certificate issuance for {domain} failed: {source}")]
    Issuance {
        /// Domain requested.
        domain: String,
        /// Transport or command failure.
        #[source]
        source: RemoteError,
    },
    /// Raised when certbot cannot renew expiring material.
    #[error("certificate renewal for {domain} failed: {source}")]
    Renewal {
        /// Domain renewed.
        domain: String,
        /// Transport or command failure.
        #[source]
        source: RemoteError,
    },
}

impl CertificateError {
    /// Returns `true` when the proxy can keep serving existing material.
    ///
    /// Certbot exiting non-zero is recoverable. Failing to reach the host is
    /// not, even during issuance.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Issuance {
                source: RemoteError::CommandFailure { .. },
                ..
            } | Self::Renewal {
                source: RemoteError::CommandFailure { .. },
                ..
            }
        )
    }
}

/// Ensures certificate material through a [`RemoteHost`].
#[derive(Debug)]
pub struct CertificateManager<'a, R: CommandRunner> {
    host: &'a RemoteHost<R>,
    renew_before_days: u32,
}

impl<'a, R: CommandRunner> CertificateManager<'a, R> {
    /// Creates a manager that renews material expiring within
    /// `renew_before_days`.
    #[must_use]
    pub const fn new(host: &'a RemoteHost<R>, renew_before_days: u32) -> Self {
        Self {
            host,
            renew_before_days,
        }
    }

    /// Ensures usable material for `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError`]. Use
    /// [`CertificateError::is_recoverable`] to tell whether the placeholder
    /// or the previous certificate is still being served.
    pub fn ensure_certificate(
        &self,
        domain: &str,
        contact_email: &str,
    ) -> Result<CertStatus, CertificateError> {
        check_inputs(domain, contact_email)?;

        match self.inspect(domain)? {
            MaterialState::Valid => {
                info!(domain, "certificate is current");
                Ok(CertStatus::Current)
            }
            MaterialState::Expiring => {
                self.renew(domain)?;
                info!(domain, "certificate renewed");
                Ok(CertStatus::Renewed)
            }
            MaterialState::Missing => {
                self.bootstrap(domain)?;
                self.issue(domain, contact_email)?;
                info!(domain, "certificate issued");
                Ok(CertStatus::Issued)
            }
            MaterialState::Placeholder => {
                self.issue(domain, contact_email)?;
                info!(domain, "certificate issued");
                Ok(CertStatus::Issued)
            }
        }
    }

    /// Reports what material exists for `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError::Inspect`] when the host cannot be queried or
    /// [`CertificateError::UnknownState`] for unexpected output.
    pub fn inspect(&self, domain: &str) -> Result<MaterialState, CertificateError> {
        let window = u64::from(self.renew_before_days) * SECONDS_PER_DAY;
        let live = live_dir(domain);
        let script = format!(
            "\
live={live}
if [ ! -f \"$live/fullchain.pem\" ] || [ ! -f \"$live/privkey.pem\" ]; then
  echo missing
elif [ -f \"$live/{PLACEHOLDER_MARKER}\" ]; then
  echo placeholder
elif openssl x509 -checkend {window} -noout -in \"$live/fullchain.pem\" >/dev/null; then
  echo valid
else
  echo expiring
fi"
        );

        let output = self
            .host
            .run_checked("inspect-certificate", &script)
            .map_err(|source| CertificateError::Inspect {
                domain: domain.to_owned(),
                source,
            })?;

        let state = output
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .unwrap_or_default();
        match state {
            "missing" => Ok(MaterialState::Missing),
            "placeholder" => Ok(MaterialState::Placeholder),
            "valid" => Ok(MaterialState::Valid),
            "expiring" => Ok(MaterialState::Expiring),
            other => Err(CertificateError::UnknownState {
                domain: domain.to_owned(),
                output: other.to_owned(),
            }),
        }
    }

    /// Installs one-day self-signed material and starts or reloads nginx so
    /// the ACME challenge can be served.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError::Bootstrap`] when any step fails.
    pub fn bootstrap(&self, domain: &str) -> Result<(), CertificateError> {
        let live = live_dir(domain);
        let subject = quote(&format!("/CN={domain}"));
        let script = format!(
            "\
live={live}
mkdir -p \"$live\" {CERTBOT_WEBROOT}
openssl req -x509 -nodes -newkey rsa:2048 -days 1 \\
  -keyout \"$live/privkey.pem\" -out \"$live/fullchain.pem\" -subj {subject} >/dev/null 2>&1
touch \"$live/{PLACEHOLDER_MARKER}\"
{RELOAD_NGINX}"
        );

        self.host
            .run_checked("bootstrap-certificate", &script)
            .map_err(|source| CertificateError::Bootstrap {
                domain: domain.to_owned(),
                source,
            })?;
        info!(domain, "placeholder certificate installed");
        Ok(())
    }

    fn issue(&self, domain: &str, contact_email: &str) -> Result<(), CertificateError> {
        let live = live_dir(domain);
        let backup = quote(&format!("{PLACEHOLDER_BACKUP_DIR}/{domain}"));
        let quoted_domain = quote(domain);
        let email = quote(contact_email);
        let script = format!(
            "\
live={live}
backup={backup}
rm -rf \"$backup\"
mkdir -p \"$backup\"
cp -p \"$live\"/*.pem \"$backup\"/
rm -rf \"$live\" /etc/letsencrypt/renewal/{quoted_domain}.conf
if certbot certonly --webroot -w {CERTBOT_WEBROOT} -d {quoted_domain} --cert-name {quoted_domain} \\
    -m {email} --agree-tos --non-interactive; then
  rm -rf \"$backup\"
  {RELOAD_NGINX}
else
  status=$?
  mkdir -p \"$live\"
  cp -p \"$backup\"/*.pem \"$live\"/
  touch \"$live/{PLACEHOLDER_MARKER}\"
  exit \"$status\"
fi"
        );

        self.host
            .run_checked("issue-certificate", &script)
            .map_err(|source| {
                warn!(domain, error = %source, "certificate issuance failed; placeholder kept");
                CertificateError::Issuance {
                    domain: domain.to_owned(),
                    source,
                }
            })?;
        Ok(())
    }

    fn renew(&self, domain: &str) -> Result<(), CertificateError> {
        let quoted_domain = quote(domain);
        let script = format!(
            "\
certbot renew --cert-name {quoted_domain} --force-renewal --non-interactive
{RELOAD_NGINX}"
        );

        self.host
            .run_checked("renew-certificate", &script)
            .map_err(|source| {
                warn!(domain, error = %source, "certificate renewal failed; existing certificate kept");
                CertificateError::Renewal {
                    domain: domain.to_owned(),
                    source,
                }
            })?;
        Ok(())
    }
}

/// Returns the quoted live directory for `domain`.
fn live_dir(domain: &str) -> String {
    quote(&format!("{LIVE_CERT_DIR}/{domain}"))
}

fn quote(value: &str) -> String {
    escape(Cow::Borrowed(value)).into_owned()
}

fn check_inputs(domain: &str, contact_email: &str) -> Result<(), CertificateError> {
    if validate_domain(domain).is_err() {
        return Err(CertificateError::InvalidDomain {
            domain: domain.to_owned(),
        });
    }
    let email_ok = contact_email
        .split_once('@')
        .is_some_and(|(local, host)| !local.is_empty() && host.contains('.'))
        && !contact_email.chars().any(char::is_whitespace);
    if !email_ok {
        return Err(CertificateError::InvalidEmail {
            email: contact_email.to_owned(),
        });
    }
    Ok(())
}
