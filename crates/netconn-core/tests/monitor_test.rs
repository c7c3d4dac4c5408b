#![allow(clippy::unwrap_used)]
// Detection verdicts against wiremock probe endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use netconn_core::callback::RecordingSupplierCallback;
use netconn_core::detection::{DetectionSink, MonitorContext, MonitorVerdict, NetMonitor};
use netconn_core::netsys::RecordingNetsys;
use netconn_core::{
    Arbiter, ArbiterConfig, ArbiterEvent, DetectionConfig, NetBearType, NetCap, NetCaps,
    NetDetectionStatus, NetId, NetLinkInfo, NetSupplierInfo,
};
use netconn_probe::{NetHttpProbe, StaticResolver};

// ── Helpers ─────────────────────────────────────────────────────────

const PORTAL: &str = "http://portal.example/login";

async fn mount(server: &MockServer, route: &str, template: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(template)
        .mount(server)
        .await;
}

fn portal() -> ResponseTemplate {
    ResponseTemplate::new(302).insert_header("Location", PORTAL)
}

/// Detection pointed at the mock server, with short waits.
fn detection(server: &MockServer, http: &str, https: &str) -> DetectionConfig {
    DetectionConfig {
        http_url: format!("{}{http}", server.uri()),
        https_url: format!("{}{https}", server.uri()),
        fallback_http_url: format!("{}/fallback_http", server.uri()),
        fallback_https_url: format!("{}/fallback_https", server.uri()),
        connect_timeout: Duration::from_secs(2),
        transfer_timeout: Duration::from_secs(2),
        primary_wait: Duration::from_millis(500),
        batch_wait: Duration::from_millis(500),
        init_delay: Duration::from_secs(60),
        ..DetectionConfig::default()
    }
}

fn context(config: DetectionConfig, bearer: NetBearType) -> MonitorContext {
    let config = Arc::new(config);
    MonitorContext {
        net_id: NetId(100),
        bearer,
        probe: NetHttpProbe::new(100, config.transport(), Arc::new(StaticResolver::new())),
        config,
        link: Arc::new(ArcSwap::from_pointee(NetLinkInfo::new("wlan0"))),
        global_proxy: Arc::new(ArcSwapOption::empty()),
        screen_on: Arc::new(AtomicBool::new(true)),
    }
}

fn monitor(
    config: DetectionConfig,
    bearer: NetBearType,
) -> (NetMonitor, mpsc::UnboundedReceiver<MonitorVerdict>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: DetectionSink = Arc::new(move |verdict| {
        let _ = tx.send(verdict);
    });
    (NetMonitor::new(context(config, bearer), sink), rx)
}

async fn next_verdict(rx: &mut mpsc::UnboundedReceiver<MonitorVerdict>) -> MonitorVerdict {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

// ── Verdict precedence ──────────────────────────────────────────────

#[tokio::test]
async fn test_http_redirect_outranks_https_success() {
    let server = MockServer::start().await;
    mount(&server, "/http", portal()).await;
    // A slow 204 so the redirect is always in hand at evaluation time.
    mount(
        &server,
        "/https",
        ResponseTemplate::new(204).set_delay(Duration::from_millis(300)),
    )
    .await;

    let (monitor, mut rx) = monitor(detection(&server, "/http", "/https"), NetBearType::Wifi);
    monitor.start(false);
    let verdict = next_verdict(&mut rx).await;

    assert_eq!(verdict.status, NetDetectionStatus::CaptivePortal);
    assert_eq!(verdict.redirect_url, PORTAL);
    assert!(verdict.changed);
    assert!(!verdict.report.probes.is_empty());
    // Portal keeps the loop alive for a re-check.
    assert!(monitor.is_detecting());
    monitor.stop();
}

#[tokio::test]
async fn test_https_success_validates_and_stops() {
    let server = MockServer::start().await;
    mount(&server, "/http", ResponseTemplate::new(204)).await;
    mount(&server, "/https", ResponseTemplate::new(204)).await;

    let (monitor, mut rx) = monitor(detection(&server, "/http", "/https"), NetBearType::Wifi);
    monitor.start(false);
    let verdict = next_verdict(&mut rx).await;

    assert_eq!(verdict.status, NetDetectionStatus::Verification);
    assert!(verdict.redirect_url.is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!monitor.is_detecting());
    assert_eq!(
        monitor.last_status(),
        Some(NetDetectionStatus::Verification)
    );
}

#[tokio::test]
async fn test_all_failures_are_invalid() {
    let server = MockServer::start().await;
    // Nothing mounted for the fallbacks either: wiremock answers 404.
    mount(&server, "/http", ResponseTemplate::new(500)).await;
    mount(&server, "/https", ResponseTemplate::new(500)).await;

    let (monitor, mut rx) = monitor(detection(&server, "/http", "/https"), NetBearType::Ethernet);
    monitor.start(false);
    let verdict = next_verdict(&mut rx).await;

    assert_eq!(verdict.status, NetDetectionStatus::Invalid);
    assert!(monitor.is_detecting());
    monitor.stop();
    assert!(!monitor.is_detecting());
}

#[tokio::test]
async fn test_repeat_verdict_reported_only_on_request() {
    let server = MockServer::start().await;
    mount(&server, "/http", ResponseTemplate::new(204)).await;
    mount(&server, "/https", ResponseTemplate::new(204)).await;

    let (monitor, mut rx) = monitor(detection(&server, "/http", "/https"), NetBearType::Wifi);
    monitor.start(false);
    assert!(next_verdict(&mut rx).await.changed);
    tokio::time::sleep(Duration::from_millis(50)).await;

    monitor.start(false);
    assert!(!next_verdict(&mut rx).await.changed);
    tokio::time::sleep(Duration::from_millis(50)).await;

    monitor.start(true);
    assert!(next_verdict(&mut rx).await.changed);
}

#[tokio::test]
async fn test_cellular_https_redirect_is_portal() {
    let server = MockServer::start().await;
    mount(&server, "/http", ResponseTemplate::new(500)).await;
    mount(&server, "/https", portal()).await;

    let (monitor, mut rx) = monitor(detection(&server, "/http", "/https"), NetBearType::Cellular);
    monitor.start(false);
    let verdict = next_verdict(&mut rx).await;
    assert_eq!(verdict.status, NetDetectionStatus::CaptivePortal);
    monitor.stop();
}

// ── Loop lifecycle ──────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_from_sink_keeps_new_loop_detecting() {
    let server = MockServer::start().await;
    // First cycle validates; later cycles see a dead http probe and an
    // https probe too slow to finish, so they come back invalid.
    Mock::given(method("GET"))
        .and(path("/http"))
        .respond_with(ResponseTemplate::new(204))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/https"))
        .respond_with(ResponseTemplate::new(204))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount(&server, "/http", ResponseTemplate::new(500)).await;
    mount(
        &server,
        "/https",
        ResponseTemplate::new(204).set_delay(Duration::from_millis(1500)),
    )
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle: Arc<OnceLock<NetMonitor>> = Arc::new(OnceLock::new());
    let restarted = Arc::new(AtomicBool::new(false));
    let sink: DetectionSink = {
        let handle = Arc::clone(&handle);
        let restarted = Arc::clone(&restarted);
        Arc::new(move |verdict: MonitorVerdict| {
            let _ = tx.send(verdict);
            if !restarted.swap(true, Ordering::SeqCst) {
                let monitor = handle.get().unwrap();
                monitor.stop();
                monitor.start(false);
            }
        })
    };
    let monitor = NetMonitor::new(
        context(detection(&server, "/http", "/https"), NetBearType::Wifi),
        sink,
    );
    handle.set(monitor.clone()).unwrap();

    monitor.start(false);
    let first = next_verdict(&mut rx).await;
    assert_eq!(first.status, NetDetectionStatus::Verification);

    // The replaced loop has returned by now; the new one is mid-cycle.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(monitor.is_detecting());

    let second = next_verdict(&mut rx).await;
    assert_eq!(second.status, NetDetectionStatus::Invalid);
    assert!(second.changed);
    assert!(monitor.is_detecting());

    // One loop left, parked on a 60 s backoff.
    let extra = tokio::time::timeout(Duration::from_millis(1500), rx.recv()).await;
    assert!(extra.is_err());
    monitor.stop();
}

#[tokio::test]
async fn test_start_during_initial_delay_runs_now_and_keeps_backoff() {
    let server = MockServer::start().await;
    mount(&server, "/http", ResponseTemplate::new(500)).await;
    mount(&server, "/https", ResponseTemplate::new(500)).await;

    let (monitor, mut rx) = monitor(detection(&server, "/http", "/https"), NetBearType::Wifi);
    monitor.start_after(Duration::from_secs(30), false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    monitor.start(false);

    let verdict = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(verdict.status, NetDetectionStatus::Invalid);

    // The re-trigger was spent on the first cycle, not on the backoff.
    let extra = tokio::time::timeout(Duration::from_millis(1500), rx.recv()).await;
    assert!(extra.is_err());
    assert!(monitor.is_detecting());
    monitor.stop();
}

// ── Through the arbiter ─────────────────────────────────────────────

#[tokio::test]
async fn test_portal_network_gets_portal_capability() {
    let server = MockServer::start().await;
    mount(&server, "/http", portal()).await;
    // A slow 204 so the redirect is always in hand at evaluation time.
    mount(
        &server,
        "/https",
        ResponseTemplate::new(204).set_delay(Duration::from_millis(300)),
    )
    .await;

    let config = ArbiterConfig {
        detection: detection(&server, "/http", "/https"),
        ..ArbiterConfig::default()
    };
    let arbiter = Arbiter::with_resolver(
        config,
        Arc::new(RecordingNetsys::new()),
        Arc::new(StaticResolver::new()),
    );
    arbiter.start().await;
    let mut events = arbiter.events();

    let caps = NetCaps::empty().with(NetCap::Internet).with(NetCap::NotVpn);
    let wifi = arbiter
        .register_net_supplier(NetBearType::Wifi, "ssid", caps, 1010)
        .await
        .unwrap();
    arbiter
        .register_net_supplier_callback(wifi, RecordingSupplierCallback::new())
        .await
        .unwrap();
    arbiter
        .update_net_supplier_info(wifi, NetSupplierInfo::available(), 1010)
        .await
        .unwrap();
    arbiter
        .update_net_link_info(wifi, NetLinkInfo::new("wlan0"), 1010)
        .await
        .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let ArbiterEvent::Detection(report) = events.recv().await.unwrap() {
                return report;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(report.status, NetDetectionStatus::CaptivePortal);
    assert_eq!(report.redirect_url.as_deref(), Some(PORTAL));

    let net = arbiter.all_nets(false).await.unwrap()[0];
    let caps = arbiter.net_capabilities(net).await.unwrap();
    assert!(caps.has_cap(NetCap::Portal));
    assert!(!caps.has_cap(NetCap::Validated));
    arbiter.shutdown().await;
}
