//! Reverse-proxy (nginx) config compiler.
//!
//! [`compile_proxy_config`] turns a [`ServiceSpec`] into one complete nginx
//! site file. In the default TLS mode the file holds two virtual hosts: a
//! port-80 host that answers ACME challenges and redirects everything else,
//! and a port-443 host carrying the security headers, the optional static
//! root, the default `/` proxy, the health location, and every extra
//! location in payload order. In plain-HTTP mode a single port-80 host serves
//! the same locations without TLS or HSTS.
//!
//! Compilation is deterministic: the same spec always yields the same bytes.

use crate::spec::ServiceSpec;
use crate::template::{Placeholders, render};

mod error;
mod location;

pub use error::CompileError;

use location::{block, compile_extra_locations, proxy_directives};

/// Webroot served for ACME HTTP-01 challenges.
pub const CERTBOT_WEBROOT: &str = "/var/www/certbot";
/// Directory holding live certificate material, one subdirectory per domain.
pub const LIVE_CERT_DIR: &str = "/etc/letsencrypt/live";
/// Shared TLS options file included by every TLS virtual host.
pub const SSL_OPTIONS_PATH: &str = "/etc/letsencrypt/options-ssl-nginx.conf";
/// Directory nginx loads site configs from.
pub const SITES_DIR: &str = "/etc/nginx/sites-enabled";

const REDIRECT_SERVER: &str = "\
server {
    listen 80;
    listen [::]:80;
    server_name __DOMAIN__;

    location /.well-known/acme-challenge/ {
        root __WEBROOT__;
    }

    location / {
        return 301 https://$host$request_uri;
    }
}
";

const TLS_SERVER: &str = "\
server {
    listen 443 ssl;
    listen [::]:443 ssl;
    server_name __DOMAIN__;

    ssl_certificate __LIVE_DIR__/__DOMAIN__/fullchain.pem;
    ssl_certificate_key __LIVE_DIR__/__DOMAIN__/privkey.pem;
    include __SSL_OPTIONS__;

    client_max_body_size 20m;
__HEADERS__
__LOCATIONS__}
";

const PLAIN_SERVER: &str = "\
server {
    listen 80;
    listen [::]:80;
    server_name __DOMAIN__;

    client_max_body_size 20m;
__HEADERS__
    location /.well-known/acme-challenge/ {
        root __WEBROOT__;
    }

__LOCATIONS__}
";

const BASE_HEADERS: [(&str, &str); 4] = [
    ("X-Frame-Options", "SAMEORIGIN"),
    ("X-XSS-Protection", "1; mode=block"),
    ("X-Content-Type-Options", "nosniff"),
    ("Referrer-Policy", "no-referrer-when-downgrade"),
];
const HSTS_HEADER: (&str, &str) = (
    "Strict-Transport-Security",
    "max-age=31536000; includeSubDomains; preload",
);

/// Compiles the nginx site config for `spec`.
///
/// # Errors
///
/// Returns [`CompileError`] when any extra location is malformed or collides
/// with another location. The whole compile fails; no location is skipped.
pub fn compile_proxy_config(spec: &ServiceSpec) -> Result<String, CompileError> {
    let extras = compile_extra_locations(spec)?;
    let locations = server_locations(spec, &extras);

    let mut config = format!(
        "# Managed by berth for {}. Local edits are overwritten.\n",
        spec.name
    );

    if spec.allow_plain_http {
        config.push_str(&render(
            PLAIN_SERVER,
            &placeholders([
                ("DOMAIN", spec.domain.clone()),
                ("WEBROOT", CERTBOT_WEBROOT.to_owned()),
                ("HEADERS", security_headers(false)),
                ("LOCATIONS", locations),
            ]),
        )?);
        return Ok(config);
    }

    config.push_str(&render(
        REDIRECT_SERVER,
        &placeholders([
            ("DOMAIN", spec.domain.clone()),
            ("WEBROOT", CERTBOT_WEBROOT.to_owned()),
        ]),
    )?);
    config.push('\n');
    config.push_str(&render(
        TLS_SERVER,
        &placeholders([
            ("DOMAIN", spec.domain.clone()),
            ("LIVE_DIR", LIVE_CERT_DIR.to_owned()),
            ("SSL_OPTIONS", SSL_OPTIONS_PATH.to_owned()),
            ("HEADERS", security_headers(true)),
            ("LOCATIONS", locations),
        ]),
    )?);
    Ok(config)
}

/// Returns the host path the site config for `service` is installed at.
#[must_use]
pub fn site_path(service: &str) -> String {
    format!("{SITES_DIR}/{service}.conf")
}

fn server_locations(spec: &ServiceSpec, extras: &[String]) -> String {
    let upstream = spec.upstream_url();
    let mut sections = Vec::with_capacity(extras.len() + 3);

    if let Some(root) = spec.static_root.as_deref() {
        sections.push(format!(
            "    root {root};\n    index index.html;\n\n{}\n{}",
            block("/", "        try_files $uri $uri/ @app;\n        expires -1;\n"),
            block("@app", &proxy_directives(&upstream)),
        ));
    } else {
        sections.push(block("/", &proxy_directives(&upstream)));
    }

    sections.push(block(
        &format!("= {}", spec.health_path),
        &format!("        access_log off;\n{}", proxy_directives(&upstream)),
    ));
    sections.extend(extras.iter().cloned());

    sections.join("\n")
}

fn security_headers(include_hsts: bool) -> String {
    let mut headers: Vec<(&str, &str)> = BASE_HEADERS.to_vec();
    if include_hsts {
        headers.push(HSTS_HEADER);
    }
    headers
        .into_iter()
        .map(|(name, value)| format!("    add_header {name} \"{value}\" always;\n"))
        .collect()
}

fn placeholders<const N: usize>(pairs: [(&str, String); N]) -> Placeholders {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}
