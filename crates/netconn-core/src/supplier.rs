// ── Net supplier ──
//
// One registered provider of a network: its capabilities, connection
// state, the requests it is serving and the call-outs that ask the
// provider to bring the network up or down.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use strum::Display;
use tracing::{debug, info, warn};

use crate::callback::NetSupplierCallback;
use crate::model::{
    NetAllCapabilities, NetBearType, NetCap, NetCaps, NetDetectionStatus, NetId, NetLinkInfo,
    NetSupplierInfo, RequestId, SupplierId,
};
use crate::network::Network;

/// Score reported by a supplier the user explicitly accepted.
pub const MAX_SCORE: u8 = 100;
pub const VALIDATION_PENALTY: u8 = 40;
pub const POOR_QUALITY_PENALTY: u8 = 20;

/// Connection lifecycle of a supplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NetConnState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Quality {
    #[default]
    Unknown,
    Good,
    Poor,
}

/// Tracks whether the provider was asked to connect and whether it has
/// been told to release since.
#[derive(Debug, Clone, Copy, Default)]
struct CallOuts {
    requested: bool,
    release_sent: bool,
}

// ── Scoring policy ──────────────────────────────────────────────────

type ScoreCheck = fn(&Supplier) -> Option<u8>;

/// Evaluated in order; the first check that answers wins.
const SCORE_POLICY: [(&str, ScoreCheck); 4] = [
    ("user-override", user_override),
    ("first-detection-pending", first_detection_pending),
    ("unvalidated", unvalidated),
    ("poor-quality", poor_quality),
];

fn user_override(s: &Supplier) -> Option<u8> {
    s.accept_unvalidated.then_some(MAX_SCORE)
}

fn first_detection_pending(s: &Supplier) -> Option<u8> {
    s.last_detection
        .is_none()
        .then(|| s.base_score().saturating_sub(VALIDATION_PENALTY))
}

fn unvalidated(s: &Supplier) -> Option<u8> {
    (!s.all_caps.caps.has(NetCap::Validated))
        .then(|| s.base_score().saturating_sub(VALIDATION_PENALTY))
}

fn poor_quality(s: &Supplier) -> Option<u8> {
    (s.quality == Quality::Poor && !s.once_suppressed)
        .then(|| s.base_score().saturating_sub(POOR_QUALITY_PENALTY))
}

// ── Supplier ────────────────────────────────────────────────────────

pub(crate) struct Supplier {
    id: SupplierId,
    bearer: NetBearType,
    ident: String,
    uid: u32,
    /// Capabilities as registered; part of the registration identity.
    registered_caps: NetCaps,
    /// Live capabilities, including VALIDATED / PORTAL and bandwidth.
    all_caps: NetAllCapabilities,
    info: NetSupplierInfo,
    network: Network,
    callback: Option<Arc<dyn NetSupplierCallback>>,
    state: NetConnState,
    request_list: BTreeSet<RequestId>,
    best_requests: BTreeSet<RequestId>,
    call_outs: CallOuts,
    last_detection: Option<NetDetectionStatus>,
    quality: Quality,
    once_suppressed: bool,
    accept_unvalidated: bool,
    restrict_background: bool,
}

impl std::fmt::Debug for Supplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supplier")
            .field("id", &self.id)
            .field("bearer", &self.bearer)
            .field("ident", &self.ident)
            .field("state", &self.state)
            .field("caps", &self.all_caps.caps)
            .field("requests", &self.request_list)
            .field("best_for", &self.best_requests)
            .finish_non_exhaustive()
    }
}

impl Supplier {
    pub fn new(
        id: SupplierId,
        bearer: NetBearType,
        ident: String,
        caps: NetCaps,
        uid: u32,
        network: Network,
    ) -> Self {
        let all_caps = NetAllCapabilities {
            caps,
            bearer_types: BTreeSet::from([bearer]),
            ..NetAllCapabilities::default()
        };
        Self {
            id,
            bearer,
            ident,
            uid,
            registered_caps: caps,
            all_caps,
            info: NetSupplierInfo::default(),
            network,
            callback: None,
            state: NetConnState::Idle,
            request_list: BTreeSet::new(),
            best_requests: BTreeSet::new(),
            call_outs: CallOuts::default(),
            last_detection: None,
            quality: Quality::Unknown,
            once_suppressed: false,
            accept_unvalidated: false,
            restrict_background: false,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn id(&self) -> SupplierId {
        self.id
    }

    pub fn bearer(&self) -> NetBearType {
        self.bearer
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn net_id(&self) -> NetId {
        self.network.net_id()
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn registered_caps(&self) -> NetCaps {
        self.registered_caps
    }

    pub fn capabilities(&self) -> &NetAllCapabilities {
        &self.all_caps
    }

    pub fn has_cap(&self, cap: NetCap) -> bool {
        self.all_caps.caps.has(cap)
    }

    /// Internal-default networks only serve requests that ask for them.
    pub fn is_internal(&self) -> bool {
        self.registered_caps.has(NetCap::InternalDefault)
    }

    pub fn info(&self) -> &NetSupplierInfo {
        &self.info
    }

    pub fn is_available(&self) -> bool {
        self.info.is_available
    }

    pub fn state(&self) -> NetConnState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == NetConnState::Connected
    }

    pub fn link_info(&self) -> Arc<NetLinkInfo> {
        self.network.link_info()
    }

    pub fn request_list(&self) -> &BTreeSet<RequestId> {
        &self.request_list
    }

    pub fn best_requests(&self) -> &BTreeSet<RequestId> {
        &self.best_requests
    }

    pub fn is_default(&self) -> bool {
        self.network.is_default()
    }

    pub fn restrict_background(&self) -> bool {
        self.restrict_background
    }

    pub fn set_restrict_background(&mut self, restrict: bool) {
        self.restrict_background = restrict;
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    pub fn set_callback(&mut self, callback: Option<Arc<dyn NetSupplierCallback>>) {
        self.callback = callback;
    }

    // ── Scoring ─────────────────────────────────────────────────────

    /// Bearer default, unless the provider pushed an explicit score.
    pub fn base_score(&self) -> u8 {
        if self.info.score == 0 {
            self.bearer.base_score()
        } else {
            self.info.score
        }
    }

    /// Score used when comparing suppliers.
    pub fn real_score(&self) -> u8 {
        SCORE_POLICY
            .iter()
            .find_map(|(_, check)| check(self))
            .unwrap_or_else(|| self.base_score())
    }

    /// Name of the policy that decided the current score, for logs.
    pub fn score_reason(&self) -> &'static str {
        SCORE_POLICY
            .iter()
            .find(|(_, check)| check(self).is_some())
            .map_or("base", |(name, _)| name)
    }

    // ── Provider-pushed state ───────────────────────────────────────

    /// Apply pushed info. Returns whether availability flipped.
    pub fn update_supplier_info(&mut self, info: NetSupplierInfo) -> bool {
        let was_available = self.info.is_available;
        self.all_caps.link_up_bandwidth_kbps = info.link_up_bandwidth_kbps;
        self.all_caps.link_down_bandwidth_kbps = info.link_down_bandwidth_kbps;
        self.info = info;
        if was_available == self.info.is_available {
            return false;
        }

        self.network.update_basic_network(self.info.is_available);
        if self.info.is_available {
            self.call_outs.release_sent = false;
        } else {
            self.state = NetConnState::Disconnected;
            self.all_caps.caps.remove(NetCap::Validated);
            self.all_caps.caps.remove(NetCap::Portal);
            self.last_detection = None;
        }
        info!(
            supplier_id = %self.id,
            available = self.info.is_available,
            state = %self.state,
            "supplier availability changed"
        );
        true
    }

    /// Reconcile link state and mark the supplier connected. Detection
    /// starts afterwards for internet-capable, non-VPN networks.
    pub fn update_net_link_info(&mut self, link: NetLinkInfo, iface_shared: bool, allow_detection: bool) {
        let detect = allow_detection
            && self.has_cap(NetCap::Internet)
            && self.bearer != NetBearType::Vpn;
        self.network.update_net_link_info(link, iface_shared, detect);
        self.state = NetConnState::Connected;
    }

    /// Replace the dynamic capability set, keeping detection-owned bits.
    pub fn update_caps(&mut self, caps: NetCaps) {
        let mut next = caps;
        for cap in [NetCap::Validated, NetCap::Portal] {
            if self.all_caps.caps.has(cap) {
                next.insert(cap);
            }
        }
        self.registered_caps = caps;
        self.all_caps.caps = next;
    }

    // ── Request bookkeeping ─────────────────────────────────────────

    /// Remember `req` and ask the provider to connect unless it is
    /// already up.
    pub fn request_to_connect(&mut self, req: RequestId, ident_filter: bool) {
        self.request_list.insert(req);
        if matches!(
            self.state,
            NetConnState::Connecting | NetConnState::Connected
        ) {
            return;
        }
        if self.info.is_available && !ident_filter {
            return;
        }
        self.call_outs.release_sent = false;
        let Some(callback) = self.callback.clone() else {
            return;
        };
        debug!(supplier_id = %self.id, request_id = %req, "requesting provider connect");
        match callback.request_network(&self.ident, self.registered_caps) {
            Ok(()) => {
                self.call_outs.requested = true;
                self.state = NetConnState::Connecting;
            }
            Err(e) => {
                warn!(supplier_id = %self.id, error = %e, "provider connect call-out failed");
                self.state = NetConnState::Idle;
            }
        }
    }

    pub fn select_as_best(&mut self, req: RequestId) {
        self.request_list.insert(req);
        self.best_requests.insert(req);
    }

    pub fn remove_best_request(&mut self, req: RequestId) {
        self.best_requests.remove(&req);
    }

    /// React to the winning score for `req`. Gives up the request when a
    /// strictly better supplier took it.
    pub fn receive_best_score(&mut self, req: RequestId, best_score: u8, best: SupplierId) {
        if best == self.id {
            return;
        }
        if self.request_list.is_empty() {
            self.release_if_idle();
            return;
        }
        if !self.request_list.contains(&req) {
            return;
        }
        if self.real_score() < best_score {
            debug!(
                supplier_id = %self.id,
                request_id = %req,
                best = %best,
                best_score,
                "request taken by a better supplier"
            );
            self.request_list.remove(&req);
            self.best_requests.remove(&req);
            if self.request_list.is_empty() {
                self.release_if_idle();
            }
        }
    }

    /// Drop `req`. Returns false when the supplier did not hold it.
    pub fn cancel_request(&mut self, req: RequestId) -> bool {
        if !self.request_list.remove(&req) {
            return false;
        }
        self.best_requests.remove(&req);
        if self.request_list.is_empty() {
            self.release_if_idle();
        }
        true
    }

    fn release_if_idle(&mut self) {
        if !self.has_cap(NetCap::Internet) {
            return;
        }
        self.disconnect();
    }

    /// Ask the provider to release the network.
    pub fn disconnect(&mut self) {
        let engaged = self.call_outs.requested
            || matches!(
                self.state,
                NetConnState::Connecting | NetConnState::Connected
            );
        if !engaged || self.call_outs.release_sent {
            return;
        }
        let Some(callback) = self.callback.clone() else {
            return;
        };
        info!(supplier_id = %self.id, ident = %self.ident, "requesting provider release");
        match callback.release_network(&self.ident, self.registered_caps) {
            Ok(()) => {
                self.call_outs.release_sent = true;
                self.call_outs.requested = false;
            }
            Err(e) => warn!(supplier_id = %self.id, error = %e, "provider release call-out failed"),
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    /// Fold a detection status into the capability set and flags.
    pub fn set_net_valid(&mut self, status: NetDetectionStatus) {
        let caps = &mut self.all_caps.caps;
        match status {
            NetDetectionStatus::Verification => {
                caps.insert(NetCap::Validated);
                if caps.has(NetCap::Portal) {
                    caps.remove(NetCap::Portal);
                    self.network.flush_dns_cache();
                }
                self.last_detection = Some(status);
            }
            NetDetectionStatus::CaptivePortal => {
                caps.insert(NetCap::Portal);
                caps.remove(NetCap::Validated);
                self.last_detection = Some(status);
            }
            NetDetectionStatus::QualityGood => {
                self.quality = Quality::Good;
                self.once_suppressed = true;
            }
            NetDetectionStatus::QualityPoor => {
                self.quality = Quality::Poor;
            }
            NetDetectionStatus::AcceptUnvalidated => {
                self.accept_unvalidated = true;
            }
            NetDetectionStatus::Invalid | NetDetectionStatus::Unknown => {
                caps.remove(NetCap::Validated);
                caps.remove(NetCap::Portal);
                self.last_detection = Some(status);
            }
        }
        debug!(
            supplier_id = %self.id,
            %status,
            caps = %self.all_caps.caps,
            score = self.real_score(),
            reason = self.score_reason(),
            "supplier validation updated"
        );
    }

    pub fn is_validated(&self) -> bool {
        self.has_cap(NetCap::Validated)
    }

    pub fn accepts_unvalidated(&self) -> bool {
        self.accept_unvalidated
    }

    pub fn last_detection(&self) -> Option<NetDetectionStatus> {
        self.last_detection
    }

    // ── Default network ─────────────────────────────────────────────

    pub fn set_default(&mut self) {
        self.network.set_default();
    }

    pub fn clear_default(&mut self, program: bool) {
        self.network.clear_default(program);
    }
}
