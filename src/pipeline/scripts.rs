//! Host-side scripts run by the pipeline phases.
//!
//! Every script converges: running it twice leaves the host as running it
//! once did. Scripts print [`CHANGE_MARKER`] when they altered host state.

use std::borrow::Cow;

use shell_escape::unix::escape;

use crate::environment::{ENV_DIR, env_file_path};
use crate::proxy::{CERTBOT_WEBROOT, LIVE_CERT_DIR, SSL_OPTIONS_PATH, site_path};
use crate::remote::CHANGE_MARKER;
use crate::spec::{RuntimeKind, ServiceSpec};
use crate::unit::unit_path;

const RELOAD_NGINX: &str = "\
  nginx -t
  if systemctl is-active --quiet nginx; then
    systemctl reload nginx
  else
    systemctl start nginx
  fi";

const SSL_OPTIONS: &str = "\
ssl_session_cache shared:le_nginx_SSL:10m;
ssl_session_timeout 1440m;
ssl_session_tickets off;
ssl_protocols TLSv1.2 TLSv1.3;
ssl_prefer_server_ciphers off;
";

pub(crate) fn quote(value: &str) -> String {
    escape(Cow::Borrowed(value)).into_owned()
}

/// Installs the packages a deploy needs, only when one is missing.
pub(crate) fn install_dependencies(runtime: RuntimeKind) -> String {
    let docker = match runtime {
        RuntimeKind::Compose => {
            "\
command -v docker >/dev/null 2>&1 || missing=\"$missing docker.io\"
docker compose version >/dev/null 2>&1 || missing=\"$missing docker-compose-plugin\"
"
        }
        RuntimeKind::DirectProcess => "",
    };
    format!(
        "\
if ! command -v systemctl >/dev/null 2>&1; then
  echo 'systemd is required on the deploy host' >&2
  exit 1
fi
missing=''
command -v nginx >/dev/null 2>&1 || missing=\"$missing nginx\"
command -v certbot >/dev/null 2>&1 || missing=\"$missing certbot\"
command -v git >/dev/null 2>&1 || missing=\"$missing git\"
command -v openssl >/dev/null 2>&1 || missing=\"$missing openssl\"
command -v curl >/dev/null 2>&1 || missing=\"$missing curl\"
{docker}if [ -n \"$missing\" ]; then
  export DEBIAN_FRONTEND=noninteractive
  apt-get update -qq
  apt-get install -y -qq $missing
  echo {CHANGE_MARKER}
fi"
    )
}

/// Moves a staged env drop-in into place when it differs.
pub(crate) fn install_env(service: &str, staged: &str) -> String {
    let target = quote(&env_file_path(service));
    let staged_path = quote(staged);
    format!(
        "\
install -d -m 0755 {ENV_DIR}
if ! cmp -s {staged_path} {target}; then
  install -m 0600 {staged_path} {target}
  echo {CHANGE_MARKER}
fi
rm -f {staged_path}"
    )
}

/// Installs the staged proxy site and unit, prepares the working directory,
/// and enables the unit.
///
/// nginx is reloaded here only when the site changed and its certificate
/// files already exist (or TLS is off). Otherwise the certificate bootstrap
/// performs the first reload.
pub(crate) fn deploy_host_configs(spec: &ServiceSpec, staged_site: &str, staged_unit: &str) -> String {
    let site = quote(&site_path(&spec.name));
    let unit = quote(&unit_path(&spec.name));
    let unit_name = quote(&spec.unit_name());
    let staged_site_path = quote(staged_site);
    let staged_unit_path = quote(staged_unit);
    let working_dir = quote(&spec.working_dir);
    let owner = quote(&spec.user);
    let reload_guard = if spec.allow_plain_http {
        String::from("true")
    } else {
        format!(
            "[ -f {} ]",
            quote(&format!("{LIVE_CERT_DIR}/{}/fullchain.pem", spec.domain))
        )
    };
    format!(
        "\
mkdir -p {CERTBOT_WEBROOT} \"$(dirname {site})\" \"$(dirname {SSL_OPTIONS_PATH})\"
if [ ! -f {SSL_OPTIONS_PATH} ]; then
  cat > {SSL_OPTIONS_PATH} <<'BERTH_SSL_OPTIONS'
{SSL_OPTIONS}BERTH_SSL_OPTIONS
  echo {CHANGE_MARKER}
fi
site_changed=0
if ! cmp -s {staged_site_path} {site}; then
  install -m 0644 {staged_site_path} {site}
  site_changed=1
  echo {CHANGE_MARKER}
fi
rm -f {staged_site_path}
if ! cmp -s {staged_unit_path} {unit}; then
  install -m 0644 {staged_unit_path} {unit}
  systemctl daemon-reload
  echo {CHANGE_MARKER}
fi
rm -f {staged_unit_path}
if [ ! -d {working_dir} ]; then
  install -d -m 0755 -o {owner} {working_dir}
  echo {CHANGE_MARKER}
fi
if ! systemctl is-enabled --quiet {unit_name}; then
  systemctl enable {unit_name}
  echo {CHANGE_MARKER}
fi
if [ \"$site_changed\" = 1 ] && {reload_guard}; then
{RELOAD_NGINX}
fi"
    )
}

/// Syncs the repository to the requested ref and, when anything changed,
/// rebuilds, restarts, and migrates.
///
/// `force_restart` is set when the env drop-in or unit changed earlier in the
/// run, so the service picks them up even without new code.
pub(crate) fn deploy_service_code(spec: &ServiceSpec, force_restart: bool) -> String {
    let working_dir = quote(&spec.working_dir);
    let repo = quote(&spec.repo_url);
    let git_ref = quote(&spec.repo_ref);
    let unit_name = quote(&spec.unit_name());
    let owner = quote(&spec.user);
    let restart_condition = if force_restart {
        String::from("true")
    } else {
        format!("[ \"$code_changed\" = 1 ] || ! systemctl is-active --quiet {unit_name}")
    };
    let activation = activation_steps(spec);
    format!(
        "\
wd={working_dir}
code_changed=0
if [ ! -d \"$wd/.git\" ]; then
  mkdir -p \"$wd\"
  git clone --quiet {repo} \"$wd\"
  code_changed=1
fi
before=$(git -C \"$wd\" rev-parse HEAD 2>/dev/null || echo none)
git -C \"$wd\" fetch --quiet --prune --tags origin
if git -C \"$wd\" rev-parse --verify --quiet \"origin/\"{git_ref}'^{{commit}}' >/dev/null; then
  target=\"origin/\"{git_ref}
else
  target={git_ref}
fi
git -C \"$wd\" checkout --quiet --force {git_ref}
git -C \"$wd\" reset --quiet --hard \"$target\"
after=$(git -C \"$wd\" rev-parse HEAD)
if [ \"$before\" != \"$after\" ]; then
  code_changed=1
fi
if [ \"$code_changed\" = 1 ]; then
  chown -R {owner} \"$wd\"
fi
if {restart_condition}; then
{activation}
  echo {CHANGE_MARKER}
fi"
    )
}

/// Restarts the unit and runs migrations without touching the code.
pub(crate) fn restart_service(spec: &ServiceSpec) -> String {
    let working_dir = quote(&spec.working_dir);
    let activation = activation_steps(spec);
    format!(
        "\
wd={working_dir}
if [ ! -d \"$wd\" ]; then
  echo \"working directory $wd is missing; deploy the service first\" >&2
  exit 1
fi
{activation}
echo {CHANGE_MARKER}"
    )
}

/// Pull, build, restart, migrate. Runs from the working directory.
fn activation_steps(spec: &ServiceSpec) -> String {
    let mut steps = vec![String::from("  cd \"$wd\"")];
    if spec.runtime_kind() == RuntimeKind::Compose {
        let env_file = quote(&env_file_path(&spec.name));
        let compose = spec.compose_file.as_deref().map_or_else(
            || String::from("docker compose"),
            |file| format!("docker compose -f {}", quote(file)),
        );
        steps.push(format!(
            "  if [ -f {env_file} ]; then\n    {compose} --env-file {env_file} pull --quiet --ignore-pull-failures\n  else\n    {compose} pull --quiet --ignore-pull-failures\n  fi"
        ));
        if let Some(project) = spec.compose_project() {
            let network = quote(&format!("{project}_default"));
            steps.push(format!(
                "  docker network inspect {network} >/dev/null 2>&1 || docker network create {network} >/dev/null"
            ));
        }
    }
    if let Some(build) = spec.build_cmd.as_deref() {
        steps.push(format!("  {}", in_service_env(spec, build)));
    }
    steps.push(format!("  systemctl restart {}", quote(&spec.unit_name())));
    if let Some(migrate) = spec.migrate_cmd.as_deref() {
        steps.push(format!("  {}", in_service_env(spec, migrate)));
    }
    steps.join("\n")
}

/// Runs `command` in a transient unit that sees what the service unit sees:
/// the env drop-in, the working directory and the service account.
fn in_service_env(spec: &ServiceSpec, command: &str) -> String {
    let properties = [
        format!("EnvironmentFile=-{}", env_file_path(&spec.name)),
        format!("WorkingDirectory={}", spec.working_dir),
        format!("User={}", spec.user),
    ];
    let mut parts = vec![String::from("systemd-run --quiet --wait --pipe --collect")];
    for property in &properties {
        parts.push(format!("-p {}", quote(property)));
    }
    parts.push(format!("-- sh -c {}", quote(command)));
    parts.join(" ")
}
