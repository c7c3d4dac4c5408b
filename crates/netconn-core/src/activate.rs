// ── Net activate (consumer request) ──
//
// One consumer's standing ask for connectivity. Holds the specifier,
// the callback, the supplier currently serving it (by id only) and the
// availability timer.

use std::sync::Arc;

use tokio::task::AbortHandle;
use tracing::debug;

use crate::callback::NetConnCallback;
use crate::model::{
    CallbackType, NetAllCapabilities, NetBearType, NetCap, NetCaps, NetHandle, NetLinkInfo,
    NetSpecifier, RegisterType, RequestId, SupplierId,
};
use crate::supplier::Supplier;

/// Ident a request uses to match any wifi supplier.
const IDENT_WIFI: &str = "wifi";

/// A notification addressed to one request.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Notice<'a> {
    Available(NetHandle),
    CapabilitiesChange(NetHandle, &'a NetAllCapabilities),
    ConnectionPropertiesChange(NetHandle, &'a NetLinkInfo),
    Lost(NetHandle),
    Unavailable,
    BlockStatusChange(NetHandle, bool),
}

impl Notice<'_> {
    fn callback_type(&self) -> CallbackType {
        match self {
            Self::Available(_) => CallbackType::Available,
            Self::CapabilitiesChange(..) => CallbackType::UpdateCap,
            Self::ConnectionPropertiesChange(..) => CallbackType::UpdateLink,
            Self::Lost(_) => CallbackType::Lost,
            Self::Unavailable => CallbackType::Unavailable,
            Self::BlockStatusChange(..) => CallbackType::BlockStatus,
        }
    }

    fn net(&self) -> Option<NetHandle> {
        match *self {
            Self::Available(net)
            | Self::CapabilitiesChange(net, _)
            | Self::ConnectionPropertiesChange(net, _)
            | Self::Lost(net)
            | Self::BlockStatusChange(net, _) => Some(net),
            Self::Unavailable => None,
        }
    }
}

pub(crate) struct NetRequest {
    id: RequestId,
    uid: u32,
    register_type: RegisterType,
    specifier: NetSpecifier,
    callback: Option<Arc<dyn NetConnCallback>>,
    timeout_ms: u32,
    /// Counted against the internal-default per-uid bucket.
    internal_bucket: bool,
    assigned: Option<SupplierId>,
    frozen: bool,
    /// Last callback swallowed while frozen.
    suppressed: Option<CallbackType>,
    last_net: Option<NetHandle>,
    timer: Option<AbortHandle>,
}

impl std::fmt::Debug for NetRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetRequest")
            .field("id", &self.id)
            .field("uid", &self.uid)
            .field("register_type", &self.register_type)
            .field("specifier", &self.specifier)
            .field("assigned", &self.assigned)
            .field("frozen", &self.frozen)
            .finish_non_exhaustive()
    }
}

impl NetRequest {
    pub fn new(
        id: RequestId,
        uid: u32,
        register_type: RegisterType,
        specifier: NetSpecifier,
        callback: Option<Arc<dyn NetConnCallback>>,
        timeout_ms: u32,
    ) -> Self {
        let internal_bucket = specifier.capabilities.has_cap(NetCap::InternalDefault)
            || specifier.capabilities.has_bearer(NetBearType::Cellular);
        Self {
            id,
            uid,
            register_type,
            specifier,
            callback,
            timeout_ms,
            internal_bucket,
            assigned: None,
            frozen: false,
            suppressed: None,
            last_net: None,
            timer: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn register_type(&self) -> RegisterType {
        self.register_type
    }

    pub fn specifier(&self) -> &NetSpecifier {
        &self.specifier
    }

    pub fn callback(&self) -> Option<&Arc<dyn NetConnCallback>> {
        self.callback.as_ref()
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn internal_bucket(&self) -> bool {
        self.internal_bucket
    }

    pub fn assigned(&self) -> Option<SupplierId> {
        self.assigned
    }

    pub fn set_assigned(&mut self, supplier: Option<SupplierId>) {
        self.assigned = supplier;
        if supplier.is_some() {
            self.cancel_timer();
        }
    }

    pub fn has_ident_filter(&self) -> bool {
        !self.specifier.ident.is_empty()
    }

    pub fn wants(&self, cap: NetCap) -> bool {
        self.specifier.capabilities.has_cap(cap)
    }

    // ── Matching ────────────────────────────────────────────────────

    /// Whether `supplier` can serve this request.
    pub fn matches(&self, supplier: &Supplier, skip_ident_check: bool) -> bool {
        if supplier.is_internal() && !self.wants(NetCap::InternalDefault) {
            return false;
        }
        self.match_caps(supplier.capabilities().caps)
            && self.match_bearer(supplier.bearer())
            && self.match_ident(supplier.ident(), supplier.bearer(), skip_ident_check)
            && self.match_bandwidth(supplier.capabilities())
    }

    fn match_caps(&self, offered: NetCaps) -> bool {
        let wanted = self.specifier.caps();
        if wanted.is_empty() {
            return offered.has(NetCap::Internet);
        }
        offered.contains_all(wanted)
    }

    fn match_bearer(&self, bearer: NetBearType) -> bool {
        let wanted = &self.specifier.capabilities.bearer_types;
        wanted.is_empty() || wanted.contains(&bearer)
    }

    fn match_ident(&self, ident: &str, bearer: NetBearType, skip_ident_check: bool) -> bool {
        let wanted = self.specifier.ident.as_str();
        ident.is_empty()
            || wanted.is_empty()
            || wanted == IDENT_WIFI
            || wanted == ident
            || (skip_ident_check && bearer == NetBearType::Wifi)
    }

    fn match_bandwidth(&self, offered: &NetAllCapabilities) -> bool {
        let wanted = &self.specifier.capabilities;
        offered.link_up_bandwidth_kbps >= wanted.link_up_bandwidth_kbps
            && offered.link_down_bandwidth_kbps >= wanted.link_down_bandwidth_kbps
    }

    // ── Timer ───────────────────────────────────────────────────────

    pub fn set_timer(&mut self, handle: AbortHandle) {
        self.cancel_timer();
        self.timer = Some(handle);
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    // ── Delivery ────────────────────────────────────────────────────

    /// Deliver `notice`, or remember it while the owning app is frozen.
    pub fn notify(&mut self, notice: Notice<'_>) {
        if let Some(net) = notice.net() {
            self.last_net = Some(net);
        }
        let Some(callback) = self.callback.clone() else {
            return;
        };
        if self.frozen {
            self.remember_suppressed(notice.callback_type());
            debug!(request_id = %self.id, uid = self.uid, kind = %notice.callback_type(), "callback held for frozen app");
            return;
        }
        match notice {
            Notice::Available(net) => callback.net_available(net),
            Notice::CapabilitiesChange(net, caps) => callback.net_capabilities_change(net, caps),
            Notice::ConnectionPropertiesChange(net, link) => {
                callback.net_connection_properties_change(net, link);
            }
            Notice::Lost(net) => callback.net_lost(net),
            Notice::Unavailable => callback.net_unavailable(),
            Notice::BlockStatusChange(net, blocked) => {
                callback.net_block_status_change(net, blocked);
            }
        }
    }

    /// A pending Available is not downgraded by later capability or
    /// link updates; the replay delivers all three anyway.
    fn remember_suppressed(&mut self, kind: CallbackType) {
        let keep_available = self.suppressed == Some(CallbackType::Available)
            && matches!(kind, CallbackType::UpdateCap | CallbackType::UpdateLink);
        if !keep_available {
            self.suppressed = Some(kind);
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Set the frozen flag. Unfreezing hands back the callback type
    /// that was held, if any, and the net it concerned.
    pub fn set_frozen(&mut self, frozen: bool) -> Option<(CallbackType, Option<NetHandle>)> {
        self.frozen = frozen;
        if frozen {
            return None;
        }
        self.suppressed.take().map(|kind| (kind, self.last_net))
    }
}

impl Drop for NetRequest {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
