#![allow(clippy::unwrap_used)]
// End-to-end arbiter scenarios through the async API with recording
// collaborators.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use netconn_core::callback::{
    ConnEvent, RecordingConnCallback, RecordingFactoryResetCallback, RecordingSupplierCallback,
};
use netconn_core::netsys::RecordingNetsys;
use netconn_core::{
    Arbiter, ArbiterConfig, ArbiterEvent, CoreError, DetectionConfig, HttpProxy, InetAddr,
    NetBearType, NetCap, NetCaps, NetConnCallback, NetDetectionStatus, NetId, NetLinkInfo,
    NetSpecifier, NetSupplierInfo, SupplierId,
};
use netconn_probe::StaticResolver;

// ── Helpers ─────────────────────────────────────────────────────────

const UID: u32 = 1010;

fn quiet_config() -> ArbiterConfig {
    ArbiterConfig {
        detection: DetectionConfig {
            enabled: false,
            ..DetectionConfig::default()
        },
        ..ArbiterConfig::default()
    }
}

async fn started(config: ArbiterConfig) -> (Arbiter, Arc<RecordingNetsys>) {
    let netsys = Arc::new(RecordingNetsys::new());
    let arbiter = Arbiter::with_resolver(
        config,
        Arc::clone(&netsys) as _,
        Arc::new(StaticResolver::new()),
    );
    arbiter.start().await;
    (arbiter, netsys)
}

fn internet() -> NetCaps {
    NetCaps::empty()
        .with(NetCap::Internet)
        .with(NetCap::NotVpn)
}

fn link(iface: &str, last: u8) -> NetLinkInfo {
    NetLinkInfo {
        addresses: vec![InetAddr::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)),
            24,
        )],
        ..NetLinkInfo::new(iface)
    }
}

async fn bring_up(arbiter: &Arbiter, id: SupplierId, score: u8, iface: &str, last: u8) {
    arbiter
        .update_net_supplier_info(id, NetSupplierInfo::available().with_score(score), UID)
        .await
        .unwrap();
    arbiter
        .update_net_link_info(id, link(iface, last), UID)
        .await
        .unwrap();
}

async fn net_of(arbiter: &Arbiter, id: SupplierId) -> NetId {
    arbiter
        .suppliers()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.supplier_id == id)
        .unwrap()
        .net_id
}

async fn defaults(arbiter: &Arbiter) -> usize {
    arbiter
        .suppliers()
        .await
        .unwrap()
        .iter()
        .filter(|s| s.is_default)
        .count()
}

async fn wait_for_detection(
    events: &mut broadcast::Receiver<ArbiterEvent>,
    net: NetId,
) -> NetDetectionStatus {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let ArbiterEvent::Detection(report) = events.recv().await.unwrap() {
                if report.net_id == net {
                    return report.status;
                }
            }
        }
    })
    .await
    .unwrap()
}

/// Let the worker drain whatever watchers and timers posted.
async fn settle(arbiter: &Arbiter) {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    let _ = arbiter.default_net().await;
}

// ── Scenario 1: request before the network comes up ─────────────────

#[tokio::test]
async fn test_request_served_once_supplier_connects() {
    let (arbiter, netsys) = started(quiet_config()).await;
    let cell = arbiter
        .register_net_supplier(NetBearType::Cellular, "sim1", internet(), UID)
        .await
        .unwrap();

    let cb = RecordingConnCallback::new();
    arbiter
        .register_net_conn_callback(NetSpecifier::new(), cb.clone(), 0, 20_000)
        .await
        .unwrap();
    assert!(cb.events().is_empty());

    bring_up(&arbiter, cell, 0, "rmnet0", 2).await;
    let net = net_of(&arbiter, cell).await;

    assert_eq!(cb.names(), ["available", "capabilities", "properties"]);
    assert_eq!(cb.events()[0], ConnEvent::Available(net));
    assert_eq!(arbiter.default_net().await.unwrap(), Some(net));
    assert!(arbiter.has_default_net().await.unwrap());
    assert_eq!(
        netsys.calls_to("set_default_network"),
        [format!("set_default_network {net}")]
    );
    arbiter.shutdown().await;
}

// ── Scenario 2: validated default fails over ────────────────────────

#[tokio::test]
async fn test_default_fails_over_when_wifi_goes_away() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    let config = ArbiterConfig {
        detection: DetectionConfig {
            http_url: format!("{}/generate_204", server.uri()),
            https_url: format!("{}/generate_204", server.uri()),
            fallback_http_url: format!("{}/fallback", server.uri()),
            fallback_https_url: format!("{}/fallback", server.uri()),
            primary_wait: Duration::from_millis(500),
            batch_wait: Duration::from_millis(500),
            ..DetectionConfig::default()
        },
        ..ArbiterConfig::default()
    };
    let (arbiter, _) = started(config).await;
    let mut events = arbiter.events();

    let wifi_provider = RecordingSupplierCallback::new();
    let wifi = arbiter
        .register_net_supplier(NetBearType::Wifi, "home", internet(), UID)
        .await
        .unwrap();
    arbiter
        .register_net_supplier_callback(wifi, wifi_provider.clone())
        .await
        .unwrap();
    let cell = arbiter
        .register_net_supplier(NetBearType::Cellular, "sim1", internet(), UID)
        .await
        .unwrap();
    arbiter
        .register_net_supplier_callback(cell, RecordingSupplierCallback::new())
        .await
        .unwrap();
    assert_eq!(wifi_provider.requests(), 1);

    let wifi_net = net_of(&arbiter, wifi).await;
    let cell_net = net_of(&arbiter, cell).await;

    bring_up(&arbiter, wifi, 60, "wlan0", 2).await;
    assert_eq!(
        wait_for_detection(&mut events, wifi_net).await,
        NetDetectionStatus::Verification
    );
    bring_up(&arbiter, cell, 50, "rmnet0", 3).await;
    assert_eq!(
        wait_for_detection(&mut events, cell_net).await,
        NetDetectionStatus::Verification
    );
    assert_eq!(arbiter.default_net().await.unwrap(), Some(wifi_net));

    arbiter
        .update_net_supplier_info(wifi, NetSupplierInfo::default(), UID)
        .await
        .unwrap();
    assert_eq!(arbiter.default_net().await.unwrap(), Some(cell_net));
    assert_eq!(wifi_provider.releases(), 1);
    assert_eq!(defaults(&arbiter).await, 1);
    arbiter.shutdown().await;
}

// ── Scenario 4: unknown callback ────────────────────────────────────

#[tokio::test]
async fn test_unregister_unknown_callback_is_not_found() {
    let (arbiter, _) = started(quiet_config()).await;
    arbiter
        .register_net_conn_callback(NetSpecifier::internet(), RecordingConnCallback::new(), 0, 7)
        .await
        .unwrap();
    assert_eq!(arbiter.uid_request_count(7).await.unwrap(), 1);

    let stranger: Arc<dyn NetConnCallback> = RecordingConnCallback::new();
    let err = arbiter
        .unregister_net_conn_callback(stranger, 7)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::CallbackNotFound));
    assert!(err.is_not_found());
    assert_eq!(arbiter.uid_request_count(7).await.unwrap(), 1);
    arbiter.shutdown().await;
}

#[tokio::test]
async fn test_unregister_decrements_once() {
    let (arbiter, _) = started(quiet_config()).await;
    let cb = RecordingConnCallback::new();
    arbiter
        .register_net_conn_callback(NetSpecifier::internet(), cb.clone(), 0, 7)
        .await
        .unwrap();
    arbiter
        .unregister_net_conn_callback(cb.clone(), 7)
        .await
        .unwrap();
    assert_eq!(arbiter.uid_request_count(7).await.unwrap(), 0);
    assert!(matches!(
        arbiter.unregister_net_conn_callback(cb, 7).await,
        Err(CoreError::CallbackNotFound)
    ));
    assert_eq!(arbiter.requests().await.unwrap().len(), 1);
    arbiter.shutdown().await;
}

// ── Selection properties ────────────────────────────────────────────

#[tokio::test]
async fn test_equal_scores_resolve_to_lowest_supplier_id() {
    let (arbiter, _) = started(quiet_config()).await;
    let first = arbiter
        .register_net_supplier(NetBearType::Ethernet, "eth0", internet(), UID)
        .await
        .unwrap();
    let second = arbiter
        .register_net_supplier(NetBearType::Ethernet, "eth1", internet(), UID)
        .await
        .unwrap();
    bring_up(&arbiter, second, 80, "eth1", 3).await;
    bring_up(&arbiter, first, 80, "eth0", 2).await;
    let first_net = net_of(&arbiter, first).await;

    for _ in 0..3 {
        arbiter.update_net_caps(second, internet()).await.unwrap();
        assert_eq!(arbiter.default_net().await.unwrap(), Some(first_net));
    }
    arbiter.shutdown().await;
}

#[tokio::test]
async fn test_registration_is_idempotent() {
    let (arbiter, netsys) = started(quiet_config()).await;
    let a = arbiter
        .register_net_supplier(NetBearType::Wifi, "home", internet(), UID)
        .await
        .unwrap();
    let b = arbiter
        .register_net_supplier(NetBearType::Wifi, "home", internet(), UID)
        .await
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(arbiter.suppliers().await.unwrap().len(), 1);
    assert_eq!(arbiter.supplier_id(NetBearType::Wifi, "home").await.unwrap(), a);

    bring_up(&arbiter, a, 0, "wlan0", 2).await;
    assert_eq!(netsys.calls_to("create_physical_network").len(), 1);
    arbiter.shutdown().await;
}

#[tokio::test]
async fn test_single_default_and_no_dangling_assignments() {
    let (arbiter, _) = started(quiet_config()).await;
    let cb = RecordingConnCallback::new();
    arbiter
        .register_net_conn_callback(NetSpecifier::new(), cb.clone(), 0, 9)
        .await
        .unwrap();

    let mut ids = Vec::new();
    for (i, (bearer, ident)) in [
        (NetBearType::Cellular, "sim1"),
        (NetBearType::Wifi, "home"),
        (NetBearType::Ethernet, "eth0"),
    ]
    .into_iter()
    .enumerate()
    {
        let id = arbiter
            .register_net_supplier(bearer, ident, internet(), UID)
            .await
            .unwrap();
        bring_up(&arbiter, id, 0, ident, u8::try_from(i).unwrap() + 2).await;
        assert_eq!(defaults(&arbiter).await, 1);
        ids.push(id);
    }
    let eth_net = net_of(&arbiter, ids[2]).await;
    assert_eq!(arbiter.default_net().await.unwrap(), Some(eth_net));

    arbiter.unregister_net_supplier(ids[2], UID).await.unwrap();
    assert_eq!(defaults(&arbiter).await, 1);
    assert_eq!(cb.events().iter().filter(|e| **e == ConnEvent::Lost(eth_net)).count(), 1);

    let live: Vec<SupplierId> = arbiter
        .suppliers()
        .await
        .unwrap()
        .iter()
        .map(|s| s.supplier_id)
        .collect();
    for request in arbiter.requests().await.unwrap() {
        assert!(request.served_by.is_none_or(|id| live.contains(&id)));
    }

    for id in &ids[..2] {
        arbiter.unregister_net_supplier(*id, UID).await.unwrap();
    }
    assert_eq!(defaults(&arbiter).await, 0);
    assert_eq!(arbiter.default_net().await.unwrap(), None);
    assert!(
        arbiter
            .requests()
            .await
            .unwrap()
            .iter()
            .all(|r| r.served_by.is_none())
    );
    arbiter.shutdown().await;
}

#[tokio::test]
async fn test_internal_networks_hidden_from_untrusted_callers() {
    let (arbiter, _) = started(quiet_config()).await;
    let internal = arbiter
        .register_net_supplier(
            NetBearType::Cellular,
            "sim1",
            NetCaps::empty().with(NetCap::InternalDefault),
            UID,
        )
        .await
        .unwrap();
    bring_up(&arbiter, internal, 0, "rmnet1", 5).await;
    let net = net_of(&arbiter, internal).await;

    assert!(net.get() <= 50);
    assert!(arbiter.all_nets(false).await.unwrap().is_empty());
    assert_eq!(arbiter.all_nets(true).await.unwrap(), [net]);
    assert_eq!(arbiter.default_net().await.unwrap(), None);
    arbiter.shutdown().await;
}

// ── Request timers ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_timeout_zero_waits_forever_and_positive_fires_once() {
    let (arbiter, _) = started(quiet_config()).await;
    let forever = RecordingConnCallback::new();
    let bounded = RecordingConnCallback::new();
    arbiter
        .register_net_conn_callback(NetSpecifier::internet(), forever.clone(), 0, 3)
        .await
        .unwrap();
    arbiter
        .request_net_connection(NetSpecifier::internet(), bounded.clone(), 100, 3)
        .await
        .unwrap();
    assert_eq!(arbiter.uid_request_count(3).await.unwrap(), 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle(&arbiter).await;

    assert!(forever.events().is_empty());
    assert_eq!(bounded.names(), ["unavailable"]);
    assert_eq!(arbiter.uid_request_count(3).await.unwrap(), 1);
    assert_eq!(arbiter.requests().await.unwrap().len(), 2);
    arbiter.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_satisfied_request_never_times_out() {
    let (arbiter, _) = started(quiet_config()).await;
    let eth = arbiter
        .register_net_supplier(NetBearType::Ethernet, "eth0", internet(), UID)
        .await
        .unwrap();
    let cb = RecordingConnCallback::new();
    arbiter
        .request_net_connection(NetSpecifier::internet(), cb.clone(), 1000, 3)
        .await
        .unwrap();
    bring_up(&arbiter, eth, 0, "eth0", 2).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle(&arbiter).await;
    assert_eq!(cb.names(), ["available", "capabilities", "properties"]);
    arbiter.shutdown().await;
}

// ── Remote death ────────────────────────────────────────────────────

#[tokio::test]
async fn test_dead_consumer_is_unregistered() {
    let (arbiter, _) = started(quiet_config()).await;
    let cb = RecordingConnCallback::with_liveness();
    arbiter
        .register_net_conn_callback(NetSpecifier::internet(), cb.clone(), 0, 11)
        .await
        .unwrap();
    assert_eq!(arbiter.uid_request_count(11).await.unwrap(), 1);

    cb.kill();
    settle(&arbiter).await;
    assert_eq!(arbiter.uid_request_count(11).await.unwrap(), 0);
    assert_eq!(arbiter.requests().await.unwrap().len(), 1);
    arbiter.shutdown().await;
}

#[tokio::test]
async fn test_dead_supplier_is_unregistered() {
    let (arbiter, _) = started(quiet_config()).await;
    let provider = RecordingSupplierCallback::with_liveness();
    let wifi = arbiter
        .register_net_supplier(NetBearType::Wifi, "home", internet(), UID)
        .await
        .unwrap();
    arbiter
        .register_net_supplier_callback(wifi, provider.clone())
        .await
        .unwrap();
    bring_up(&arbiter, wifi, 0, "wlan0", 2).await;
    assert!(arbiter.default_net().await.unwrap().is_some());

    provider.kill();
    settle(&arbiter).await;
    assert!(arbiter.suppliers().await.unwrap().is_empty());
    assert_eq!(arbiter.default_net().await.unwrap(), None);
    arbiter.shutdown().await;
}

// ── Policy and lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn test_global_proxy_and_airplane_mode() {
    let (arbiter, _) = started(quiet_config()).await;
    let mut events = arbiter.events();

    arbiter
        .set_global_http_proxy(Some(HttpProxy::new("proxy.corp", 8080)))
        .await
        .unwrap();
    let proxy = arbiter.global_http_proxy().await.unwrap().unwrap();
    assert_eq!((proxy.host.as_str(), proxy.port), ("proxy.corp", 8080));
    arbiter.set_global_http_proxy(None).await.unwrap();
    assert!(arbiter.global_http_proxy().await.unwrap().is_none());

    arbiter.set_airplane_mode(true).await.unwrap();
    assert!(arbiter.airplane_mode().await.unwrap());
    let mut airplane = false;
    while let Ok(event) = events.try_recv() {
        airplane |= matches!(event, ArbiterEvent::AirplaneModeChanged { enabled: true });
    }
    assert!(airplane);
    arbiter.shutdown().await;
}

#[tokio::test]
async fn test_factory_reset_reaches_live_listeners() {
    let (arbiter, _) = started(quiet_config()).await;
    let settings = RecordingFactoryResetCallback::new();
    let remote = RecordingFactoryResetCallback::with_liveness();
    arbiter
        .register_net_factory_reset_callback(settings.clone())
        .await
        .unwrap();
    arbiter
        .register_net_factory_reset_callback(remote.clone())
        .await
        .unwrap();
    let err = arbiter
        .register_net_factory_reset_callback(settings.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidParameter { .. }));

    arbiter.set_airplane_mode(true).await.unwrap();
    remote.kill();
    settle(&arbiter).await;

    arbiter.factory_reset_network().await.unwrap();
    assert!(!arbiter.airplane_mode().await.unwrap());
    assert_eq!((settings.resets(), remote.resets()), (1, 0));

    arbiter
        .unregister_net_factory_reset_callback(settings.clone())
        .await
        .unwrap();
    arbiter.factory_reset_network().await.unwrap();
    assert_eq!(settings.resets(), 1);
    arbiter.shutdown().await;
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let (arbiter, _) = started(quiet_config()).await;
    assert!(matches!(
        arbiter.net_capabilities(NetId(4242)).await,
        Err(CoreError::NetworkNotFound { .. })
    ));
    assert!(matches!(
        arbiter.dual_stack_probe(NetId(4242), Duration::from_secs(1)).await,
        Err(CoreError::NetworkNotFound { .. })
    ));
    assert!(matches!(
        arbiter
            .update_net_caps(SupplierId(1), internet())
            .await,
        Err(CoreError::SupplierNotFound { .. })
    ));
    assert!(
        arbiter
            .supplier_id(NetBearType::Bluetooth, "pan")
            .await
            .unwrap_err()
            .is_not_found()
    );
    arbiter.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_suppliers_and_clears_default() {
    let (arbiter, netsys) = started(quiet_config()).await;
    let provider = RecordingSupplierCallback::new();
    let eth = arbiter
        .register_net_supplier(NetBearType::Ethernet, "eth0", internet(), UID)
        .await
        .unwrap();
    arbiter
        .register_net_supplier_callback(eth, provider.clone())
        .await
        .unwrap();
    bring_up(&arbiter, eth, 0, "eth0", 2).await;
    assert_eq!(provider.releases(), 0);

    arbiter.shutdown().await;
    assert_eq!(provider.releases(), 1);
    assert_eq!(netsys.calls_to("clear_default_network").len(), 1);
    assert!(matches!(
        arbiter.default_net().await,
        Err(CoreError::ArbiterStopped)
    ));
}
