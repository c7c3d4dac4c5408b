// ── Command API ──
//
// Every arbiter operation flows through a unified `Command` enum. The
// worker drains one queue of `Task`s: commands from the facade plus
// internal events (detection verdicts, request timers, callback deaths).

use std::sync::Arc;

use netconn_probe::HttpProxy;
use strum::IntoStaticStr;

use crate::callback::{
    NetConnCallback, NetDetectionCallback, NetFactoryResetCallback, NetSupplierCallback,
};
use crate::detection::{DualStackProbe, MonitorVerdict};
use crate::error::CoreError;
use crate::model::{
    NetAllCapabilities, NetBearType, NetCaps, NetId, NetLinkInfo, NetSpecifier, NetSupplierInfo,
    RegisterType, RequestId, RequestSnapshot, SupplierId, SupplierSnapshot,
};

/// A command envelope sent through the task queue.
/// Contains the command and a oneshot response channel.
pub(crate) struct CommandEnvelope {
    pub command: Command,
    pub response_tx: tokio::sync::oneshot::Sender<Result<CommandResult, CoreError>>,
}

/// Everything the worker processes, in arrival order.
pub(crate) enum Task {
    Command(CommandEnvelope),
    Verdict(MonitorVerdict),
    RequestTimeout(RequestId),
    CallbackDied(Arc<dyn NetConnCallback>),
    SupplierDied(SupplierId),
    FactoryResetCallbackDied(Arc<dyn NetFactoryResetCallback>),
}

/// All operations the arbiter accepts.
#[derive(IntoStaticStr)]
pub enum Command {
    // ── Supplier operations ──────────────────────────────────────────
    RegisterNetSupplier {
        bearer: NetBearType,
        ident: String,
        caps: NetCaps,
        uid: u32,
    },
    UnregisterNetSupplier {
        supplier_id: SupplierId,
        uid: u32,
    },
    RegisterNetSupplierCallback {
        supplier_id: SupplierId,
        callback: Arc<dyn NetSupplierCallback>,
    },
    UnregisterNetSupplierCallback {
        supplier_id: SupplierId,
    },
    UpdateNetSupplierInfo {
        supplier_id: SupplierId,
        info: NetSupplierInfo,
        uid: u32,
    },
    UpdateNetLinkInfo {
        supplier_id: SupplierId,
        link: NetLinkInfo,
        uid: u32,
    },
    UpdateNetCaps {
        supplier_id: SupplierId,
        caps: NetCaps,
    },

    // ── Request operations ───────────────────────────────────────────
    RegisterNetConnCallback {
        specifier: NetSpecifier,
        callback: Arc<dyn NetConnCallback>,
        timeout_ms: u32,
        uid: u32,
        register_type: RegisterType,
    },
    UnregisterNetConnCallback {
        callback: Arc<dyn NetConnCallback>,
        uid: u32,
    },
    SetAppFrozen {
        uid: u32,
        frozen: bool,
    },

    // ── Detection operations ─────────────────────────────────────────
    NetDetection {
        net_id: NetId,
    },
    NetDetectionForDnsHealth {
        net_id: NetId,
        healthy: bool,
    },
    RegisterNetDetectionCallback {
        net_id: NetId,
        callback: Arc<dyn NetDetectionCallback>,
    },
    UnregisterNetDetectionCallback {
        net_id: NetId,
        callback: Arc<dyn NetDetectionCallback>,
    },
    UpdateNetQuality {
        supplier_id: SupplierId,
        good: bool,
    },
    AcceptUnvalidated {
        net_id: NetId,
    },
    SetDetectionSuspended {
        suspended: bool,
    },
    DualStackProbe {
        net_id: NetId,
    },

    // ── Policy operations ────────────────────────────────────────────
    SetAirplaneMode {
        enabled: bool,
    },
    SetGlobalHttpProxy {
        proxy: Option<HttpProxy>,
    },
    SetRestrictBackground {
        restrict: bool,
    },
    HandleScreenEvent {
        screen_on: bool,
    },
    RegisterNetFactoryResetCallback {
        callback: Arc<dyn NetFactoryResetCallback>,
    },
    UnregisterNetFactoryResetCallback {
        callback: Arc<dyn NetFactoryResetCallback>,
    },
    FactoryResetNetwork,

    // ── Queries ──────────────────────────────────────────────────────
    GetDefaultNet,
    GetAllNets {
        trusted: bool,
    },
    GetSpecificNet {
        bearer: NetBearType,
    },
    GetNetIdsByIdent {
        ident: String,
    },
    GetSupplierId {
        bearer: NetBearType,
        ident: String,
    },
    GetIfaceName {
        bearer: NetBearType,
        ident: String,
    },
    GetConnectionProperties {
        net_id: NetId,
    },
    GetNetCapabilities {
        net_id: NetId,
    },
    GetAirplaneMode,
    GetGlobalHttpProxy,
    GetRestrictBackground,
    ListSuppliers,
    ListRequests,
    UidRequestCount {
        uid: u32,
    },
}

impl Command {
    /// Variant name, for logs.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a successfully executed command.
#[derive(Debug, Clone)]
pub enum CommandResult {
    Ok,
    Bool(bool),
    Count(usize),
    SupplierId(SupplierId),
    RequestId(RequestId),
    NetId(Option<NetId>),
    NetIds(Vec<NetId>),
    Iface(String),
    LinkInfo(Arc<NetLinkInfo>),
    Capabilities(NetAllCapabilities),
    Proxy(Option<HttpProxy>),
    DualStack(Arc<DualStackProbe>),
    Suppliers(Vec<SupplierSnapshot>),
    Requests(Vec<RequestSnapshot>),
}
