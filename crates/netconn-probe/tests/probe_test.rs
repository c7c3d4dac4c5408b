#![allow(clippy::unwrap_used)]
// Integration tests for `NetHttpProbe` using wiremock.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use netconn_probe::{
    Error, HttpProxy, NetHttpProbe, ProbeOptions, ProbeTarget, ProbeTransport, ProbeType,
    ProbeVerdict, StaticResolver,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn probe() -> NetHttpProbe {
    NetHttpProbe::new(
        100,
        ProbeTransport::default(),
        Arc::new(StaticResolver::new()),
    )
}

fn target(server: &MockServer, http_path: &str, https_path: &str) -> ProbeTarget {
    // Both "schemes" point at the plain-HTTP mock server; the classifier
    // does not care which transport carried the answer.
    ProbeTarget::parse(
        &format!("{}{http_path}", server.uri()),
        &format!("{}{https_path}", server.uri()),
    )
    .unwrap()
}

async fn mount(server: &MockServer, route: &str, template: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(template)
        .mount(server)
        .await;
}

// ── Classification ──────────────────────────────────────────────────

#[tokio::test]
async fn test_generate_204_is_successful() {
    let server = MockServer::start().await;
    mount(&server, "/generate_204", ResponseTemplate::new(204)).await;

    let outcome = probe()
        .send_probe(
            ProbeType::Http,
            &target(&server, "/generate_204", "/unused"),
            ProbeOptions::default(),
        )
        .await
        .unwrap();

    let http = outcome.http.unwrap();
    assert_eq!(http.code, 204);
    assert_eq!(http.verdict(), ProbeVerdict::Successful);
    assert!(outcome.https.is_none());
}

#[tokio::test]
async fn test_redirect_needs_portal_with_location() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/generate_204",
        ResponseTemplate::new(302).insert_header("Location", "http://portal.example/login"),
    )
    .await;

    let outcome = probe()
        .send_probe(
            ProbeType::Http,
            &target(&server, "/generate_204", "/unused"),
            ProbeOptions::default(),
        )
        .await
        .unwrap();

    let http = outcome.http.unwrap();
    assert_eq!(http.code, 302);
    assert!(http.is_need_portal());
    assert_eq!(
        http.redirect_url.as_deref(),
        Some("http://portal.example/login")
    );
}

#[tokio::test]
async fn test_redirect_url_falls_back_to_effective_url() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/portal",
        ResponseTemplate::new(200).set_body_string("<html>login here</html>"),
    )
    .await;

    let tgt = target(&server, "/portal", "/unused");
    let outcome = probe()
        .send_probe(ProbeType::Http, &tgt, ProbeOptions::default())
        .await
        .unwrap();

    let http = outcome.http.unwrap();
    assert!(http.is_need_portal());
    assert_eq!(http.redirect_url.as_deref(), Some(tgt.http_url.as_str()));
}

#[tokio::test]
async fn test_empty_ok_is_failed() {
    let server = MockServer::start().await;
    mount(&server, "/generate_204", ResponseTemplate::new(200)).await;

    let outcome = probe()
        .send_probe(
            ProbeType::Http,
            &target(&server, "/generate_204", "/unused"),
            ProbeOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.http.unwrap().verdict(), ProbeVerdict::Failed);
}

#[tokio::test]
async fn test_server_error_is_failed() {
    let server = MockServer::start().await;
    mount(&server, "/generate_204", ResponseTemplate::new(503)).await;

    let outcome = probe()
        .send_probe(
            ProbeType::Http,
            &target(&server, "/generate_204", "/unused"),
            ProbeOptions::default(),
        )
        .await
        .unwrap();

    assert!(outcome.http.unwrap().is_failed());
}

#[tokio::test]
async fn test_http_and_https_run_both() {
    let server = MockServer::start().await;
    mount(&server, "/http", ResponseTemplate::new(302)).await;
    mount(&server, "/https", ResponseTemplate::new(204)).await;

    let outcome = probe()
        .send_probe(
            ProbeType::HttpAndHttps,
            &target(&server, "/http", "/https"),
            ProbeOptions::default(),
        )
        .await
        .unwrap();

    assert!(outcome.http.unwrap().is_need_portal());
    assert!(outcome.https.unwrap().is_successful());
}

// ── Transport failures ──────────────────────────────────────────────

#[tokio::test]
async fn test_refused_connection_is_classified_not_error() {
    // Bind then drop a listener to get a port nobody answers on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let tgt = ProbeTarget::parse(
        &format!("http://127.0.0.1:{port}/generate_204"),
        &format!("http://127.0.0.1:{port}/generate_204"),
    )
    .unwrap();

    let outcome = probe()
        .send_probe(ProbeType::Http, &tgt, ProbeOptions::default())
        .await
        .unwrap();

    let http = outcome.http.unwrap();
    assert_eq!(http.code, 0);
    assert!(http.is_failed());
}

#[tokio::test]
async fn test_unresolvable_host_is_setup_error() {
    let tgt = ProbeTarget::parse(
        "http://probe.invalid/generate_204",
        "https://probe.invalid/generate_204",
    )
    .unwrap();

    let result = probe()
        .send_probe(ProbeType::Http, &tgt, ProbeOptions::default())
        .await;

    assert!(
        matches!(result, Err(Error::Resolve { .. })),
        "expected Resolve error, got: {result:?}"
    );
}

// ── Address pinning ─────────────────────────────────────────────────

#[tokio::test]
async fn test_named_host_is_pinned_to_resolved_address() {
    let server = MockServer::start().await;
    mount(&server, "/generate_204", ResponseTemplate::new(204)).await;
    let port = server.address().port();

    let resolver =
        StaticResolver::new().with_host("probe.test", vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    let probe = NetHttpProbe::new(101, ProbeTransport::default(), Arc::new(resolver));
    let url = Url::parse(&format!("http://probe.test:{port}/generate_204")).unwrap();
    let tgt = ProbeTarget::new(url.clone(), url);

    let outcome = probe
        .send_probe(ProbeType::Http, &tgt, ProbeOptions::default())
        .await
        .unwrap();

    assert!(outcome.http.unwrap().is_successful());
}

#[tokio::test]
async fn test_explicit_pinned_addresses_skip_resolver() {
    let server = MockServer::start().await;
    mount(&server, "/generate_204", ResponseTemplate::new(204)).await;
    let port = server.address().port();

    let url = Url::parse(&format!("http://unknown.test:{port}/generate_204")).unwrap();
    let tgt = ProbeTarget::new(url.clone(), url);
    let pinned = [IpAddr::V4(Ipv4Addr::LOCALHOST)];

    let outcome = probe()
        .send_probe(
            ProbeType::Http,
            &tgt,
            ProbeOptions {
                proxy: None,
                pinned: Some(&pinned),
            },
        )
        .await
        .unwrap();

    assert!(outcome.http.unwrap().is_successful());
}

#[tokio::test]
async fn test_empty_pinned_list_is_setup_error() {
    let url = Url::parse("http://probe.test/generate_204").unwrap();
    let tgt = ProbeTarget::new(url.clone(), url);

    let result = probe()
        .send_probe(
            ProbeType::Http,
            &tgt,
            ProbeOptions {
                proxy: None,
                pinned: Some(&[]),
            },
        )
        .await;

    assert!(matches!(result, Err(Error::NoAddress { .. })));
}

// ── Proxy ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_empty_proxy_falls_back_to_direct() {
    let server = MockServer::start().await;
    mount(&server, "/generate_204", ResponseTemplate::new(204)).await;

    let proxy = HttpProxy::default();
    let outcome = probe()
        .send_probe(
            ProbeType::Http,
            &target(&server, "/generate_204", "/unused"),
            ProbeOptions {
                proxy: Some(&proxy),
                pinned: None,
            },
        )
        .await
        .unwrap();

    assert!(outcome.http.unwrap().is_successful());
}

#[tokio::test]
async fn test_unreachable_proxy_is_classified_failure() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let proxy = HttpProxy::new("127.0.0.1", port);
    let tgt = ProbeTarget::parse(
        "http://probe.invalid/generate_204",
        "http://probe.invalid/generate_204",
    )
    .unwrap();

    let outcome = probe()
        .send_probe(
            ProbeType::Http,
            &tgt,
            ProbeOptions {
                proxy: Some(&proxy),
                pinned: None,
            },
        )
        .await
        .unwrap();

    // Nothing resolved locally; the proxy connect failure is a result.
    assert_eq!(outcome.http.unwrap().code, 0);
}
