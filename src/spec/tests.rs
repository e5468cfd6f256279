//! Unit tests for descriptor resolution.

use super::*;
use rstest::rstest;
use serde_json::json;

fn descriptor(value: serde_json::Value) -> RawDescriptor {
    RawDescriptor::from_value(value).expect("descriptor should parse")
}

#[test]
fn minimal_descriptor_resolves_to_documented_defaults() {
    let spec = resolve(&descriptor(json!({ "service": "demo" }))).expect("resolve");

    assert_eq!(
        spec,
        ServiceSpec {
            name: String::from("demo"),
            domain: String::from("demo.example.com"),
            port: 3000,
            repo_url: String::from("https://github.com/example/demo.git"),
            repo_ref: String::from("main"),
            working_dir: String::from("/opt/demo"),
            user: String::from("root"),
            upstream_host: String::from("127.0.0.1"),
            health_path: String::from("/healthz"),
            static_root: None,
            migrate_cmd: None,
            start_cmd: String::from(DEFAULT_START_CMD),
            stop_cmd: String::from(COMPOSE_STOP_CMD),
            build_cmd: None,
            compose_file: None,
            allow_plain_http: false,
            locations: Vec::new(),
        }
    );
}

#[test]
fn resolution_is_deterministic() {
    let raw = descriptor(json!({ "service": "api", "port": "8080", "locations": "[]" }));
    assert_eq!(resolve(&raw), resolve(&raw));
}

#[test]
fn explicit_overrides_replace_defaults() {
    let spec = resolve(&descriptor(json!({
        "service": "shop",
        "domain": "Shop.Example.ORG",
        "port": "8080",
        "repo_base": "https://git.example.net/team/",
        "repo_ref": "release-2",
        "working_dir": "/srv/shop",
        "user": "www-data",
        "upstream_host": "10.0.0.5",
        "health_path": "/status",
        "static_root": "/srv/shop/public",
        "migrate_cmd": "./manage migrate",
        "start_cmd": "/usr/bin/node server.js",
        "allow_plain_http": "yes",
    })))
    .expect("resolve");

    assert_eq!(spec.domain, "shop.example.org");
    assert_eq!(spec.port, 8080);
    assert_eq!(spec.repo_url, "https://git.example.net/team/shop.git");
    assert_eq!(spec.repo_ref, "release-2");
    assert_eq!(spec.working_dir, "/srv/shop");
    assert_eq!(spec.user, "www-data");
    assert_eq!(spec.upstream_url(), "http://10.0.0.5:8080");
    assert_eq!(spec.static_root.as_deref(), Some("/srv/shop/public"));
    assert_eq!(spec.migrate_cmd.as_deref(), Some("./manage migrate"));
    assert_eq!(spec.stop_cmd, NOOP_STOP_CMD);
    assert_eq!(spec.runtime_kind(), RuntimeKind::DirectProcess);
    assert!(spec.allow_plain_http);
    assert_eq!(spec.health_url(), "http://shop.example.org/status");
}

#[test]
fn name_alias_is_used_when_service_is_absent() {
    let spec = resolve(&descriptor(json!({ "name": "worker" }))).expect("resolve");
    assert_eq!(spec.name, "worker");
}

#[test]
fn unknown_fields_are_ignored() {
    let spec = resolve(&descriptor(json!({ "service": "demo", "replicas": 3 })));
    assert!(spec.is_ok());
}

#[rstest]
#[case::absent(json!({}))]
#[case::empty(json!({ "service": "" }))]
#[case::quote_pair(json!({ "service": "\"\"" }))]
#[case::whitespace(json!({ "service": "   " }))]
fn missing_name_is_rejected(#[case] payload: serde_json::Value) {
    let err = resolve(&descriptor(payload)).expect_err("name is required");
    assert_eq!(err, ValidationError::MissingName);
}

#[rstest]
#[case("../etc")]
#[case("My_Service")]
#[case("-leading")]
#[case("trailing-")]
#[case("has space")]
#[case("a.b")]
fn unsafe_names_are_rejected(#[case] name: &str) {
    let err = resolve(&RawDescriptor::named(name)).expect_err("name should be rejected");
    assert!(
        matches!(err, ValidationError::InvalidName { .. }),
        "unexpected error: {err}"
    );
}

#[test]
fn overlong_name_is_rejected() {
    let name = "a".repeat(64);
    let err = validate_name(&name).expect_err("too long");
    assert!(err.to_string().contains("63"), "{err}");
}

#[rstest]
#[case::port_zero(json!({ "service": "demo", "port": 0 }), "port")]
#[case::port_text(json!({ "service": "demo", "port": "http" }), "port")]
#[case::port_overflow(json!({ "service": "demo", "port": 70000 }), "port")]
#[case::port_bool(json!({ "service": "demo", "port": true }), "port")]
#[case::domain(json!({ "service": "demo", "domain": "bad_domain.com" }), "domain")]
#[case::relative_dir(json!({ "service": "demo", "working_dir": "opt/demo" }), "working_dir")]
#[case::health(json!({ "service": "demo", "health_path": "healthz" }), "health_path")]
#[case::flag(json!({ "service": "demo", "allow_plain_http": "maybe" }), "allow_plain_http")]
#[case::multiline_cmd(json!({ "service": "demo", "start_cmd": "a\nb" }), "start_cmd")]
#[case::ref_option(json!({ "service": "demo", "repo_ref": "--upload-pack=x" }), "repo_ref")]
#[case::bare_ipv6(json!({ "service": "demo", "upstream_host": "::1" }), "upstream_host")]
#[case::unclosed_ipv6(json!({ "service": "demo", "upstream_host": "[::1" }), "upstream_host")]
#[case::host_with_port(json!({ "service": "demo", "upstream_host": "backend:8080" }), "upstream_host")]
#[case::brace_static_root(json!({ "service": "demo", "static_root": "/srv/{site}" }), "static_root")]
#[case::closing_brace_dir(json!({ "service": "demo", "working_dir": "/opt/demo}" }), "working_dir")]
#[case::compose_option(json!({ "service": "demo", "compose_file": "-p=evil" }), "compose_file")]
#[case::compose_spaces(json!({ "service": "demo", "compose_file": "a b.yml" }), "compose_file")]
fn invalid_fields_name_the_field(#[case] payload: serde_json::Value, #[case] field: &str) {
    let err = resolve(&descriptor(payload)).expect_err("field should be rejected");
    match err {
        ValidationError::InvalidField { field: reported, .. } => assert_eq!(reported, field),
        other => panic!("unexpected error: {other}"),
    }
}

#[rstest]
#[case::loopback("127.0.0.1")]
#[case::hostname("backend.internal")]
#[case::bracketed_ipv6("[::1]")]
#[case::bracketed_mapped("[::ffff:10.0.0.5]")]
fn upstream_hosts_accept_names_and_bracketed_addresses(#[case] host: &str) {
    let spec = resolve(&descriptor(json!({ "service": "demo", "upstream_host": host })))
        .expect("resolve");
    assert_eq!(spec.upstream_url(), format!("http://{host}:3000"));
}

#[rstest]
#[case::beside_the_checkout("docker-compose.yml", "demo")]
#[case::nested("deploy/compose.prod.yml", "deploy")]
#[case::absolute("/srv/stack/compose.yml", "stack")]
fn compose_project_is_the_directory_of_the_compose_file(
    #[case] file: &str,
    #[case] project: &str,
) {
    let spec = resolve(&descriptor(json!({ "service": "demo", "compose_file": file })))
        .expect("resolve");

    assert_eq!(spec.compose_file.as_deref(), Some(file));
    assert_eq!(spec.compose_project(), Some(project));
}

#[test]
fn compose_project_is_absent_without_a_compose_file() {
    let spec = resolve(&descriptor(json!({ "service": "demo" }))).expect("resolve");
    assert_eq!(spec.compose_project(), None);
}

#[test]
fn locations_string_is_parsed_as_json() {
    let spec = resolve(&descriptor(json!({
        "service": "demo",
        "locations": r#"[{"path":"/mcp/","strip_prefix":true,"proxy_pass":"http://127.0.0.1:4000"}]"#,
    })))
    .expect("resolve");

    assert_eq!(
        spec.locations,
        vec![LocationRule {
            path: String::from("/mcp/"),
            proxy_pass: ProxyTarget::Explicit(String::from("http://127.0.0.1:4000")),
            strip_prefix: true,
            extra: String::new(),
        }]
    );
}

#[test]
fn locations_array_keeps_order_and_options() {
    let spec = resolve(&descriptor(json!({
        "service": "demo",
        "locations": [
            { "path": "/ws/", "extra": ["proxy_http_version 1.1;", "proxy_read_timeout 600s;  "] },
            { "path": "/docs/", "proxy_pass": false, "extra": "alias /srv/docs/;\n" },
            { "path": "/api/", "proxy_pass": "", "strip_prefix": "on" },
        ],
    })))
    .expect("resolve");

    let [ws, docs, api] = spec.locations.as_slice() else {
        panic!("expected three locations, got {:?}", spec.locations);
    };
    assert_eq!(ws.path, "/ws/");
    assert_eq!(ws.extra, "proxy_http_version 1.1;\nproxy_read_timeout 600s;");
    assert_eq!(ws.proxy_pass, ProxyTarget::Upstream);
    assert_eq!(docs.path, "/docs/");
    assert_eq!(docs.proxy_pass, ProxyTarget::Disabled);
    assert_eq!(docs.extra, "alias /srv/docs/;");
    assert_eq!(api.path, "/api/");
    assert_eq!(api.proxy_pass, ProxyTarget::Upstream);
    assert!(api.strip_prefix);
}

#[rstest]
#[case::malformed_json(json!("[{\"path\": "), "locations")]
#[case::not_array(json!({ "path": "/x/" }), "locations")]
#[case::item_not_object(json!(["/x/"]), "locations[0]")]
#[case::missing_path(json!([{ "path": "/a/" }, { "extra": "x" }]), "locations[1].path")]
#[case::bad_proxy(json!([{ "path": "/a/", "proxy_pass": 4000 }]), "locations[0].proxy_pass")]
#[case::bad_strip(json!([{ "path": "/a/", "strip_prefix": "sometimes" }]), "locations[0].strip_prefix")]
fn malformed_locations_fail_resolution(#[case] locations: serde_json::Value, #[case] field: &str) {
    let err = resolve(&descriptor(json!({ "service": "demo", "locations": locations })))
        .expect_err("locations should be rejected");
    match err {
        ValidationError::InvalidField { field: reported, .. } => assert_eq!(reported, field),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn non_object_payload_is_rejected() {
    let err = RawDescriptor::from_json("[1, 2]").expect_err("arrays are not descriptors");
    assert!(matches!(err, ValidationError::Payload { .. }));
}

#[rstest]
#[case::positional_array(json!(["demo", null, "evil.example.org"]))]
#[case::string(json!("demo"))]
#[case::number(json!(7))]
fn only_objects_become_descriptors(#[case] payload: serde_json::Value) {
    let text = payload.to_string();

    let from_text = RawDescriptor::from_json(&text).expect_err("not an object");
    let from_value = RawDescriptor::from_value(payload).expect_err("not an object");

    for err in [from_text, from_value] {
        match err {
            ValidationError::Payload { ref message } => {
                assert!(message.contains("expected a JSON object"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

#[rstest]
#[case("docker compose up -d", RuntimeKind::Compose)]
#[case("Docker-Compose up", RuntimeKind::Compose)]
#[case("./bin/server --port 3000", RuntimeKind::DirectProcess)]
fn runtime_kind_follows_start_command(#[case] command: &str, #[case] expected: RuntimeKind) {
    assert_eq!(RuntimeKind::detect(command), expected);
}
