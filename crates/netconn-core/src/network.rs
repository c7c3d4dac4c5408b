// ── Network ──
//
// Link container for one net id. Owns the authoritative link snapshot,
// programs diffs into netsys in a fixed order, and owns the detection
// monitor and dual-stack prober for the network.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use arc_swap::{ArcSwap, ArcSwapOption};
use indexmap::IndexSet;
use netconn_probe::{DnsResolver, HttpProxy, NetHttpProbe, ProbeTarget};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::callback::{NetDetectionCallback, same_callback};
use crate::config::{DetectionConfig, DualStackConfig, LinkLimits};
use crate::detection::{
    DetectionSink, DualStackProbe, MonitorContext, MonitorVerdict, NetMonitor,
};
use crate::error::CoreError;
use crate::model::{
    ArbiterEvent, LOCAL_NET_ID, NetBearType, NetDetectionStatus, NetId, NetLinkInfo,
    Route, SupplierId,
};
use crate::netsys::{NetsysController, NetsysResult};

/// Services every network shares. Built once by the arbiter.
#[derive(Clone)]
pub(crate) struct NetworkEnv {
    pub netsys: Arc<dyn NetsysController>,
    pub detection: Arc<DetectionConfig>,
    pub dual_stack: DualStackConfig,
    pub link_limits: LinkLimits,
    pub resolver: Arc<dyn DnsResolver>,
    pub global_proxy: Arc<ArcSwapOption<HttpProxy>>,
    pub screen_on: Arc<AtomicBool>,
    pub events: broadcast::Sender<ArbiterEvent>,
    pub sink: DetectionSink,
}

pub(crate) struct Network {
    net_id: NetId,
    supplier_id: SupplierId,
    bearer: NetBearType,
    internal: bool,
    env: Arc<NetworkEnv>,
    link: Arc<ArcSwap<NetLinkInfo>>,
    monitor: NetMonitor,
    dual_stack: Option<Arc<DualStackProbe>>,
    detection_callbacks: Vec<Arc<dyn NetDetectionCallback>>,
    physical_created: bool,
    is_default: bool,
    detection_status: NetDetectionStatus,
    redirect_url: String,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("net_id", &self.net_id)
            .field("supplier_id", &self.supplier_id)
            .field("bearer", &self.bearer)
            .field("iface", &self.link.load().iface_name)
            .field("is_default", &self.is_default)
            .field("detection_status", &self.detection_status)
            .finish_non_exhaustive()
    }
}

impl Network {
    pub fn new(
        net_id: NetId,
        supplier_id: SupplierId,
        bearer: NetBearType,
        internal: bool,
        env: Arc<NetworkEnv>,
    ) -> Self {
        let link = Arc::new(ArcSwap::from_pointee(NetLinkInfo::default()));
        let probe = NetHttpProbe::new(
            net_id.get(),
            env.detection.transport(),
            Arc::clone(&env.resolver),
        );
        let monitor = NetMonitor::new(
            MonitorContext {
                net_id,
                bearer,
                config: Arc::clone(&env.detection),
                probe: probe.clone(),
                link: Arc::clone(&link),
                global_proxy: Arc::clone(&env.global_proxy),
                screen_on: Arc::clone(&env.screen_on),
            },
            Arc::clone(&env.sink),
        );
        let dual_stack = match ProbeTarget::parse(&env.detection.http_url, &env.detection.https_url)
        {
            Ok(target) => Some(Arc::new(DualStackProbe::new(
                net_id,
                probe,
                Arc::clone(&env.resolver),
                target,
                env.dual_stack.clone(),
            ))),
            Err(e) => {
                warn!(%net_id, error = %e, "dual-stack probe disabled");
                None
            }
        };
        Self {
            net_id,
            supplier_id,
            bearer,
            internal,
            env,
            link,
            monitor,
            dual_stack,
            detection_callbacks: Vec::new(),
            physical_created: false,
            is_default: false,
            detection_status: NetDetectionStatus::Invalid,
            redirect_url: String::new(),
        }
    }

    pub fn net_id(&self) -> NetId {
        self.net_id
    }

    pub fn link_info(&self) -> Arc<NetLinkInfo> {
        self.link.load_full()
    }

    pub fn iface_name(&self) -> String {
        self.link.load().iface_name.clone()
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn detection_status(&self) -> NetDetectionStatus {
        self.detection_status
    }

    pub fn redirect_url(&self) -> &str {
        &self.redirect_url
    }

    pub fn is_detecting(&self) -> bool {
        self.monitor.is_detecting()
    }

    // ── Physical network lifecycle ──────────────────────────────────

    /// Create the OS network on availability, tear it down on loss.
    pub fn update_basic_network(&mut self, available: bool) {
        if available {
            self.create_basic_network();
        } else {
            self.release_basic_network();
        }
    }

    fn create_basic_network(&mut self) {
        if self.physical_created {
            return;
        }
        info!(net_id = %self.net_id, internal = self.internal, "creating physical network");
        let result = self.env.netsys.create_physical_network(self.net_id, self.internal);
        if self.apply("create_physical_network", result) {
            self.physical_created = true;
        }
    }

    fn release_basic_network(&mut self) {
        if !self.physical_created {
            return;
        }
        info!(net_id = %self.net_id, "destroying physical network");
        self.stop_detection();
        let old = self.link.load_full();
        let netsys = Arc::clone(&self.env.netsys);
        for addr in &old.addresses {
            let result = netsys.remove_address(self.net_id, &old.iface_name, addr);
            self.apply("remove_address", result);
        }
        if !old.iface_name.is_empty() {
            let result = netsys.remove_interface(self.net_id, &old.iface_name);
            self.apply("remove_interface", result);
        }
        let result = netsys.destroy_network(self.net_id);
        self.apply("destroy_network", result);
        self.link.store(Arc::new(NetLinkInfo::default()));
        self.physical_created = false;
    }

    // ── Link reconciliation ─────────────────────────────────────────

    /// Apply `new` on top of the current snapshot.
    ///
    /// `iface_shared` is true when another connected network uses the
    /// same interface; removals are then skipped outside VPN.
    /// `detect` asks for detection to start afterwards.
    pub fn update_net_link_info(&mut self, new: NetLinkInfo, iface_shared: bool, detect: bool) {
        let old = self.link.load_full();
        let keep_shared = iface_shared && self.bearer != NetBearType::Vpn;
        debug!(
            net_id = %self.net_id,
            old_iface = %old.iface_name,
            new_iface = %new.iface_name,
            shared = keep_shared,
            "reconciling link info"
        );

        self.update_stats_ident(&old, &new);
        self.update_interface(&old, &new, keep_shared);
        self.update_addresses(&old, &new, keep_shared);
        self.update_routes(&old, &new, keep_shared);
        self.update_dns(&old, &new);
        self.update_mtu(&old, &new);
        self.update_tcp_buffers(&old, &new);

        let same_addresses = !old.addresses.is_empty() && old.same_addresses(&new);
        self.link.store(Arc::new(new));

        if detect && self.env.detection.enabled {
            self.start_detection_debounced(same_addresses);
        }
    }

    fn update_stats_ident(&self, old: &NetLinkInfo, new: &NetLinkInfo) {
        if new.iface_name.is_empty() {
            return;
        }
        if old.iface_name != new.iface_name || old.ident != new.ident {
            let result = self
                .env
                .netsys
                .update_iface_stats_ident(&new.iface_name, &new.ident);
            self.apply("update_iface_stats_ident", result);
        }
    }

    fn update_interface(&self, old: &NetLinkInfo, new: &NetLinkInfo, keep_shared: bool) {
        if old.iface_name == new.iface_name {
            return;
        }
        let netsys = &self.env.netsys;
        if !new.iface_name.is_empty() {
            let result = netsys.add_interface(self.net_id, &new.iface_name);
            self.apply("add_interface", result);
        }
        if !old.iface_name.is_empty() && !keep_shared {
            let result = netsys.remove_interface(self.net_id, &old.iface_name);
            self.apply("remove_interface", result);
        }
    }

    fn update_addresses(&self, old: &NetLinkInfo, new: &NetLinkInfo, keep_shared: bool) {
        let netsys = &self.env.netsys;
        let moved = old.iface_name != new.iface_name;
        if !keep_shared {
            for addr in old.addresses.iter().filter(|a| moved || !new.addresses.contains(a)) {
                let result = netsys.remove_address(self.net_id, &old.iface_name, addr);
                self.apply("remove_address", result);
            }
        }
        for addr in new.addresses.iter().filter(|a| moved || !old.addresses.contains(a)) {
            let result = netsys.add_address(self.net_id, &new.iface_name, addr);
            self.apply("add_address", result);
        }
    }

    fn update_routes(&self, old: &NetLinkInfo, new: &NetLinkInfo, keep_shared: bool) {
        if !keep_shared {
            for route in old.routes.iter().filter(|r| !new.routes.contains(r)) {
                self.route_op("remove_route", route);
            }
        }
        for route in new.routes.iter().filter(|r| !old.routes.contains(r)) {
            self.route_op("add_route", route);
        }
    }

    /// Program a route, mirroring direct routes into the local table
    /// outside VPN.
    fn route_op(&self, op: &'static str, route: &Route) {
        let netsys = &self.env.netsys;
        let call = |net_id: NetId| match op {
            "add_route" => netsys.add_route(net_id, route),
            _ => netsys.remove_route(net_id, route),
        };
        self.apply(op, call(self.net_id));
        if self.bearer != NetBearType::Vpn && route.is_direct() && !route.is_default() {
            self.apply(op, call(LOCAL_NET_ID));
        }
    }

    fn update_dns(&self, old: &NetLinkInfo, new: &NetLinkInfo) {
        if old.dns == new.dns && old.domain == new.domain && !old.dns.is_empty() {
            return;
        }
        let servers = capped_dns(&new.dns, self.env.link_limits);
        let domains: Vec<String> = if new.domain.is_empty() {
            Vec::new()
        } else {
            vec![new.domain.clone()]
        };
        let result = self
            .env
            .netsys
            .set_resolver_config(self.net_id, &servers, &domains);
        self.apply("set_resolver_config", result);
    }

    fn update_mtu(&self, old: &NetLinkInfo, new: &NetLinkInfo) {
        if new.mtu == 0 || (new.mtu == old.mtu && new.iface_name == old.iface_name) {
            return;
        }
        let result = self.env.netsys.set_mtu(&new.iface_name, new.mtu);
        self.apply("set_mtu", result);
    }

    fn update_tcp_buffers(&self, old: &NetLinkInfo, new: &NetLinkInfo) {
        if new.tcp_buffer_sizes.is_empty() || new.tcp_buffer_sizes == old.tcp_buffer_sizes {
            return;
        }
        let result = self.env.netsys.set_tcp_buffer_sizes(&new.tcp_buffer_sizes);
        self.apply("set_tcp_buffer_sizes", result);
    }

    /// Log and publish a failed netsys call. Returns whether it succeeded.
    fn apply(&self, operation: &'static str, result: NetsysResult) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(net_id = %self.net_id, operation, reason = %e.reason, "link apply failed");
                let _ = self.env.events.send(ArbiterEvent::LinkApplyFailed {
                    net_id: self.net_id,
                    operation: operation.to_owned(),
                    reason: e.reason,
                });
                false
            }
        }
    }

    // ── Default network ─────────────────────────────────────────────

    pub fn set_default(&mut self) {
        if self.is_default {
            return;
        }
        let result = self.env.netsys.set_default_network(self.net_id);
        self.apply("set_default_network", result);
        self.is_default = true;
        if self.detection_status != NetDetectionStatus::Verification
            && self.env.detection.enabled
            && self.physical_created
        {
            self.monitor.start(false);
        }
    }

    /// Clear the flag. `program` also clears the OS default, which is
    /// skipped when another network takes over in the same pass.
    pub fn clear_default(&mut self, program: bool) {
        if !self.is_default {
            return;
        }
        if program {
            let result = self.env.netsys.clear_default_network();
            self.apply("clear_default_network", result);
        }
        self.is_default = false;
    }

    pub fn flush_dns_cache(&self) {
        let result = self.env.netsys.flush_dns_cache(self.net_id);
        self.apply("flush_dns_cache", result);
    }

    // ── Detection ───────────────────────────────────────────────────

    pub fn start_detection(&self, need_report: bool) {
        self.monitor.start(need_report);
    }

    fn start_detection_debounced(&self, same_addresses: bool) {
        let recent = self
            .monitor
            .cycle_started()
            .is_some_and(|t| Instant::now().saturating_duration_since(t) < self.env.detection.relink_window);
        if same_addresses && recent {
            debug!(net_id = %self.net_id, "identical addresses shortly after last cycle, debouncing");
            self.monitor
                .start_after(self.env.detection.relink_debounce, false);
        } else {
            self.monitor.start(false);
        }
    }

    pub fn stop_detection(&self) {
        self.monitor.stop();
    }

    pub fn dual_stack(&self) -> Result<Arc<DualStackProbe>, CoreError> {
        self.dual_stack
            .clone()
            .ok_or(CoreError::ServiceNotReady {
                component: "dual-stack probe",
            })
    }

    /// Record a verdict and notify detection listeners when it changed.
    pub fn record_verdict(&mut self, verdict: &MonitorVerdict) {
        if verdict.changed {
            for callback in &self.detection_callbacks {
                callback.on_detection_result(self.net_id, verdict.status, &verdict.redirect_url);
            }
        }
        self.detection_status = verdict.status;
        self.redirect_url.clone_from(&verdict.redirect_url);
    }

    pub fn register_detection_callback(&mut self, callback: Arc<dyn NetDetectionCallback>) {
        if self
            .detection_callbacks
            .iter()
            .any(|c| same_callback(c, &callback))
        {
            debug!(net_id = %self.net_id, "detection callback already registered");
            return;
        }
        self.detection_callbacks.push(callback);
    }

    pub fn unregister_detection_callback(&mut self, callback: &Arc<dyn NetDetectionCallback>) {
        self.detection_callbacks.retain(|c| !same_callback(c, callback));
    }

    pub fn detection_callback_count(&self) -> usize {
        self.detection_callbacks.len()
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.monitor.stop();
    }
}

/// First `max_ipv4_dns` v4 and `max_ipv6_dns` v6 servers, deduplicated,
/// v4 first.
pub(crate) fn capped_dns(servers: &[IpAddr], limits: LinkLimits) -> Vec<IpAddr> {
    let unique: IndexSet<IpAddr> = servers.iter().copied().collect();
    let v4 = unique
        .iter()
        .filter(|a| a.is_ipv4())
        .take(limits.max_ipv4_dns);
    let v6 = unique
        .iter()
        .filter(|a| a.is_ipv6())
        .take(limits.max_ipv6_dns);
    v4.chain(v6).copied().collect()
}
