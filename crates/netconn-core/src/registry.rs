// ── Registry ──
//
// All arbitration state and every operation that changes it. Owned by
// the worker task and only ever touched from there, so nothing in here
// locks. Suppliers and requests refer to each other by id and are
// re-resolved through the maps on every use.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use netconn_probe::HttpProxy;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activate::{NetRequest, Notice};
use crate::callback::{
    NetConnCallback, NetFactoryResetCallback, NetSupplierCallback, same_callback,
};
use crate::command::{Command, CommandResult, Task};
use crate::config::{ArbiterConfig, RequestLimits};
use crate::detection::{DualStackProbe, MonitorVerdict};
use crate::error::CoreError;
use crate::model::ids::{
    IdAllocator, MAX_INTERNAL_NET_ID, MAX_NET_ID, MAX_REQUEST_ID, MIN_INTERNAL_NET_ID, MIN_NET_ID,
    MIN_REQUEST_ID, SUPPLIER_ID_BASE,
};
use crate::model::{
    ArbiterEvent, CallbackType, DEFAULT_REQUEST_ID, NetBearType, NetCap,
    NetCaps, NetDetectionStatus, NetHandle, NetId, NetLinkInfo, NetSpecifier, NetSupplierInfo,
    RegisterType, RequestId, RequestSnapshot, SupplierId, SupplierSnapshot,
};
use crate::network::{Network, NetworkEnv};
use crate::supplier::Supplier;

/// Which update to fan out to the requests a supplier serves.
#[derive(Debug, Clone, Copy)]
enum Fanout {
    Caps,
    Link,
    BlockStatus,
}

/// Factory reset listeners a single arbiter accepts.
const MAX_FACTORY_RESET_CALLBACKS: usize = 200;

/// A factory reset listener and the watcher on its liveness token.
struct FactoryResetListener {
    callback: Arc<dyn NetFactoryResetCallback>,
    watcher: Option<AbortHandle>,
}

/// Process-wide switches.
#[derive(Debug, Clone, Copy, Default)]
struct Policy {
    airplane_mode: bool,
    restrict_background: bool,
    detection_suspended: bool,
}

pub(crate) struct Registry {
    env: Arc<NetworkEnv>,
    limits: RequestLimits,
    mms_disabled: bool,
    queue: mpsc::WeakUnboundedSender<Task>,
    shutdown: CancellationToken,

    suppliers: BTreeMap<SupplierId, Supplier>,
    requests: BTreeMap<RequestId, NetRequest>,
    default_supplier: Option<SupplierId>,

    next_supplier_id: u32,
    net_ids: IdAllocator,
    internal_net_ids: IdAllocator,
    request_ids: IdAllocator,
    uid_requests: HashMap<u32, usize>,
    uid_internal_requests: HashMap<u32, usize>,

    supplier_watchers: HashMap<SupplierId, AbortHandle>,
    request_watchers: HashMap<RequestId, AbortHandle>,
    frozen_uids: BTreeSet<u32>,
    factory_reset_listeners: Vec<FactoryResetListener>,
    policy: Policy,
}

impl Registry {
    pub fn new(
        config: &ArbiterConfig,
        env: Arc<NetworkEnv>,
        queue: mpsc::WeakUnboundedSender<Task>,
        shutdown: CancellationToken,
    ) -> Self {
        let default_request = NetRequest::new(
            DEFAULT_REQUEST_ID,
            0,
            RegisterType::Register,
            NetSpecifier::internet(),
            None,
            0,
        );
        Self {
            env,
            limits: config.limits,
            mms_disabled: config.mms_disabled,
            queue,
            shutdown,
            suppliers: BTreeMap::new(),
            requests: BTreeMap::from([(DEFAULT_REQUEST_ID, default_request)]),
            default_supplier: None,
            next_supplier_id: SUPPLIER_ID_BASE,
            net_ids: IdAllocator::new(MIN_NET_ID, MAX_NET_ID),
            internal_net_ids: IdAllocator::new(MIN_INTERNAL_NET_ID, MAX_INTERNAL_NET_ID),
            request_ids: IdAllocator::new(MIN_REQUEST_ID, MAX_REQUEST_ID),
            uid_requests: HashMap::new(),
            uid_internal_requests: HashMap::new(),
            supplier_watchers: HashMap::new(),
            request_watchers: HashMap::new(),
            frozen_uids: BTreeSet::new(),
            factory_reset_listeners: Vec::new(),
            policy: Policy::default(),
        }
    }

    // ── Task dispatch ───────────────────────────────────────────────

    pub fn run(&mut self, task: Task) {
        match task {
            Task::Command(envelope) => {
                let name = envelope.command.name();
                let result = self.route(envelope.command);
                if let Err(ref e) = result {
                    debug!(command = name, error = %e, "command rejected");
                }
                let _ = envelope.response_tx.send(result);
            }
            Task::Verdict(verdict) => self.handle_verdict(&verdict),
            Task::RequestTimeout(req_id) => self.handle_request_timeout(req_id),
            Task::CallbackDied(callback) => self.handle_callback_died(&callback),
            Task::SupplierDied(supplier_id) => {
                warn!(%supplier_id, "supplier callback died, unregistering");
                if let Err(e) = self.unregister_net_supplier(supplier_id, None) {
                    debug!(%supplier_id, error = %e, "dead supplier already gone");
                }
            }
            Task::FactoryResetCallbackDied(callback) => {
                warn!("factory reset callback died, unregistering");
                self.unregister_factory_reset_callback(&callback);
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn route(&mut self, command: Command) -> Result<CommandResult, CoreError> {
        let ok = |()| CommandResult::Ok;
        match command {
            // ── Supplier operations ──
            Command::RegisterNetSupplier {
                bearer,
                ident,
                caps,
                uid,
            } => self
                .register_net_supplier(bearer, ident, caps, uid)
                .map(CommandResult::SupplierId),
            Command::UnregisterNetSupplier { supplier_id, uid } => {
                self.unregister_net_supplier(supplier_id, Some(uid)).map(ok)
            }
            Command::RegisterNetSupplierCallback {
                supplier_id,
                callback,
            } => self
                .register_net_supplier_callback(supplier_id, &callback)
                .map(ok),
            Command::UnregisterNetSupplierCallback { supplier_id } => {
                self.unregister_net_supplier_callback(supplier_id).map(ok)
            }
            Command::UpdateNetSupplierInfo {
                supplier_id,
                info,
                uid,
            } => self.update_net_supplier_info(supplier_id, info, uid).map(ok),
            Command::UpdateNetLinkInfo {
                supplier_id,
                link,
                uid,
            } => self.update_net_link_info(supplier_id, link, uid).map(ok),
            Command::UpdateNetCaps { supplier_id, caps } => {
                self.update_net_caps(supplier_id, caps).map(ok)
            }

            // ── Request operations ──
            Command::RegisterNetConnCallback {
                specifier,
                callback,
                timeout_ms,
                uid,
                register_type,
            } => self
                .register_net_conn_callback(specifier, callback, timeout_ms, uid, register_type)
                .map(CommandResult::RequestId),
            Command::UnregisterNetConnCallback { callback, uid } => {
                self.unregister_net_conn_callback(&callback, uid).map(ok)
            }
            Command::SetAppFrozen { uid, frozen } => {
                self.set_app_frozen(uid, frozen);
                Ok(CommandResult::Ok)
            }

            // ── Detection operations ──
            Command::NetDetection { net_id } => self.net_detection(net_id).map(ok),
            Command::NetDetectionForDnsHealth { net_id, healthy } => self
                .net_detection_for_dns_health(net_id, healthy)
                .map(ok),
            Command::RegisterNetDetectionCallback { net_id, callback } => {
                self.network_mut(net_id)?
                    .register_detection_callback(callback);
                Ok(CommandResult::Ok)
            }
            Command::UnregisterNetDetectionCallback { net_id, callback } => {
                self.network_mut(net_id)?
                    .unregister_detection_callback(&callback);
                Ok(CommandResult::Ok)
            }
            Command::UpdateNetQuality { supplier_id, good } => {
                self.update_net_quality(supplier_id, good).map(ok)
            }
            Command::AcceptUnvalidated { net_id } => self.accept_unvalidated(net_id).map(ok),
            Command::SetDetectionSuspended { suspended } => {
                self.set_detection_suspended(suspended);
                Ok(CommandResult::Ok)
            }
            Command::DualStackProbe { net_id } => {
                self.dual_stack(net_id).map(CommandResult::DualStack)
            }

            // ── Policy operations ──
            Command::SetAirplaneMode { enabled } => {
                self.set_airplane_mode(enabled);
                Ok(CommandResult::Ok)
            }
            Command::SetGlobalHttpProxy { proxy } => {
                self.set_global_http_proxy(proxy);
                Ok(CommandResult::Ok)
            }
            Command::SetRestrictBackground { restrict } => {
                self.set_restrict_background(restrict);
                Ok(CommandResult::Ok)
            }
            Command::HandleScreenEvent { screen_on } => {
                self.handle_screen_event(screen_on);
                Ok(CommandResult::Ok)
            }
            Command::RegisterNetFactoryResetCallback { callback } => {
                self.register_factory_reset_callback(callback).map(ok)
            }
            Command::UnregisterNetFactoryResetCallback { callback } => {
                self.unregister_factory_reset_callback(&callback);
                Ok(CommandResult::Ok)
            }
            Command::FactoryResetNetwork => {
                self.factory_reset_network();
                Ok(CommandResult::Ok)
            }

            // ── Queries ──
            Command::GetDefaultNet => Ok(CommandResult::NetId(self.default_net())),
            Command::GetAllNets { trusted } => Ok(CommandResult::NetIds(self.all_nets(trusted))),
            Command::GetSpecificNet { bearer } => {
                Ok(CommandResult::NetIds(self.specific_nets(bearer)))
            }
            Command::GetNetIdsByIdent { ident } => {
                Ok(CommandResult::NetIds(self.net_ids_by_ident(&ident)))
            }
            Command::GetSupplierId { bearer, ident } => self
                .supplier_id_for(bearer, &ident)
                .map(CommandResult::SupplierId),
            Command::GetIfaceName { bearer, ident } => self
                .iface_name_by_type(bearer, &ident)
                .map(CommandResult::Iface),
            Command::GetConnectionProperties { net_id } => self
                .supplier_by_net(net_id)
                .map(|s| CommandResult::LinkInfo(s.link_info())),
            Command::GetNetCapabilities { net_id } => self
                .supplier_by_net(net_id)
                .map(|s| CommandResult::Capabilities(s.capabilities().clone())),
            Command::GetAirplaneMode => Ok(CommandResult::Bool(self.policy.airplane_mode)),
            Command::GetGlobalHttpProxy => Ok(CommandResult::Proxy(
                self.env.global_proxy.load_full().map(|p| (*p).clone()),
            )),
            Command::GetRestrictBackground => {
                Ok(CommandResult::Bool(self.policy.restrict_background))
            }
            Command::ListSuppliers => Ok(CommandResult::Suppliers(self.supplier_snapshots())),
            Command::ListRequests => Ok(CommandResult::Requests(self.request_snapshots())),
            Command::UidRequestCount { uid } => Ok(CommandResult::Count(self.uid_request_count(uid))),
        }
    }

    // ── Lookups ─────────────────────────────────────────────────────

    fn supplier(&self, supplier_id: SupplierId) -> Result<&Supplier, CoreError> {
        self.suppliers
            .get(&supplier_id)
            .ok_or(CoreError::SupplierNotFound { supplier_id })
    }

    fn supplier_mut(&mut self, supplier_id: SupplierId) -> Result<&mut Supplier, CoreError> {
        self.suppliers
            .get_mut(&supplier_id)
            .ok_or(CoreError::SupplierNotFound { supplier_id })
    }

    fn supplier_id_by_net(&self, net_id: NetId) -> Option<SupplierId> {
        self.suppliers
            .values()
            .find(|s| s.net_id() == net_id)
            .map(Supplier::id)
    }

    fn supplier_by_net(&self, net_id: NetId) -> Result<&Supplier, CoreError> {
        self.suppliers
            .values()
            .find(|s| s.net_id() == net_id)
            .ok_or(CoreError::NetworkNotFound { net_id })
    }

    fn network_mut(&mut self, net_id: NetId) -> Result<&mut Network, CoreError> {
        self.suppliers
            .values_mut()
            .find(|s| s.net_id() == net_id)
            .map(Supplier::network_mut)
            .ok_or(CoreError::NetworkNotFound { net_id })
    }

    fn request_by_callback(&self, callback: &Arc<dyn NetConnCallback>) -> Option<RequestId> {
        self.requests
            .values()
            .find(|r| r.callback().is_some_and(|c| same_callback(c, callback)))
            .map(NetRequest::id)
    }

    fn check_uid(supplier: &Supplier, uid: u32, operation: &'static str) {
        if supplier.uid() != uid {
            warn!(
                supplier_id = %supplier.id(),
                owner = supplier.uid(),
                caller = uid,
                operation,
                "caller uid differs from supplier owner"
            );
        }
    }

    // ── Supplier operations ─────────────────────────────────────────

    /// Register a supplier, or return the existing id for an identical
    /// (bearer, ident, caps) registration.
    pub fn register_net_supplier(
        &mut self,
        bearer: NetBearType,
        ident: String,
        caps: NetCaps,
        uid: u32,
    ) -> Result<SupplierId, CoreError> {
        if let Some(existing) = self.suppliers.values().find(|s| {
            s.bearer() == bearer && s.ident() == ident && s.registered_caps() == caps
        }) {
            debug!(supplier_id = %existing.id(), %bearer, %ident, "supplier already registered");
            return Ok(existing.id());
        }

        let internal = caps.has(NetCap::InternalDefault);
        let in_use = |id: u32| self.suppliers.values().any(|s| s.net_id().get() == id);
        let (allocator, range) = if internal {
            (&mut self.internal_net_ids, "internal")
        } else {
            (&mut self.net_ids, "normal")
        };
        let net_id = allocator
            .next(in_use)
            .map(NetId)
            .ok_or(CoreError::NetIdExhausted { range })?;

        let supplier_id = self.allocate_supplier_id();
        let network = Network::new(net_id, supplier_id, bearer, internal, Arc::clone(&self.env));
        let supplier = Supplier::new(supplier_id, bearer, ident.clone(), caps, uid, network);
        self.suppliers.insert(supplier_id, supplier);

        info!(%supplier_id, %net_id, %bearer, %ident, %caps, uid, "supplier registered");
        let _ = self.env.events.send(ArbiterEvent::SupplierRegistered {
            supplier_id,
            bearer,
            ident,
        });
        Ok(supplier_id)
    }

    fn allocate_supplier_id(&mut self) -> SupplierId {
        loop {
            let candidate = SupplierId(self.next_supplier_id);
            self.next_supplier_id = self.next_supplier_id.checked_add(1).unwrap_or(SUPPLIER_ID_BASE);
            if !self.suppliers.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Remove a supplier. `uid` is the caller; `None` skips the owner
    /// check (remote death).
    pub fn unregister_net_supplier(
        &mut self,
        supplier_id: SupplierId,
        uid: Option<u32>,
    ) -> Result<(), CoreError> {
        let supplier = self.supplier(supplier_id)?;
        if let Some(uid) = uid {
            Self::check_uid(supplier, uid, "unregister_net_supplier");
        }
        if self.default_supplier == Some(supplier_id) {
            self.make_default(None);
        }
        self.fan_out_lost(supplier_id, false);

        if let Some(mut supplier) = self.suppliers.remove(&supplier_id) {
            supplier.update_supplier_info(NetSupplierInfo::default());
            info!(%supplier_id, net_id = %supplier.net_id(), "supplier unregistered");
        }
        if let Some(watcher) = self.supplier_watchers.remove(&supplier_id) {
            watcher.abort();
        }
        let _ = self
            .env
            .events
            .send(ArbiterEvent::SupplierUnregistered { supplier_id });
        self.find_best_for_all();
        Ok(())
    }

    /// Attach the provider callback and solicit every matching request.
    pub fn register_net_supplier_callback(
        &mut self,
        supplier_id: SupplierId,
        callback: &Arc<dyn NetSupplierCallback>,
    ) -> Result<(), CoreError> {
        self.supplier_mut(supplier_id)?
            .set_callback(Some(Arc::clone(callback)));
        if let Some(token) = callback.liveness() {
            let handle = self.spawn_watcher(token, Task::SupplierDied(supplier_id));
            if let Some(old) = self.supplier_watchers.insert(supplier_id, handle) {
                old.abort();
            }
        }
        self.send_all_requests_to_network(supplier_id);
        Ok(())
    }

    pub fn unregister_net_supplier_callback(
        &mut self,
        supplier_id: SupplierId,
    ) -> Result<(), CoreError> {
        self.supplier_mut(supplier_id)?.set_callback(None);
        if let Some(watcher) = self.supplier_watchers.remove(&supplier_id) {
            watcher.abort();
        }
        Ok(())
    }

    pub fn update_net_supplier_info(
        &mut self,
        supplier_id: SupplierId,
        info: NetSupplierInfo,
        uid: u32,
    ) -> Result<(), CoreError> {
        let supplier = self.supplier_mut(supplier_id)?;
        Self::check_uid(supplier, uid, "update_net_supplier_info");
        debug!(%supplier_id, available = info.is_available, score = info.score, "supplier info update");
        supplier.update_supplier_info(info);
        if supplier.is_available() {
            self.fan_out(supplier_id, Fanout::Caps);
        } else {
            self.fan_out_lost(supplier_id, true);
        }
        self.find_best_for_all();
        Ok(())
    }

    pub fn update_net_link_info(
        &mut self,
        supplier_id: SupplierId,
        link: NetLinkInfo,
        uid: u32,
    ) -> Result<(), CoreError> {
        Self::check_uid(self.supplier(supplier_id)?, uid, "update_net_link_info");
        let iface_shared = !link.iface_name.is_empty()
            && self.suppliers.values().any(|s| {
                s.id() != supplier_id
                    && s.is_connected()
                    && s.network().iface_name() == link.iface_name
            });
        let allow_detection = !self.policy.detection_suspended;
        self.supplier_mut(supplier_id)?
            .update_net_link_info(link, iface_shared, allow_detection);
        self.fan_out(supplier_id, Fanout::Link);
        self.find_best_for_all();
        Ok(())
    }

    pub fn update_net_caps(
        &mut self,
        supplier_id: SupplierId,
        caps: NetCaps,
    ) -> Result<(), CoreError> {
        self.supplier_mut(supplier_id)?.update_caps(caps);
        self.fan_out(supplier_id, Fanout::Caps);
        self.find_best_for_all();
        Ok(())
    }

    // ── Request operations ──────────────────────────────────────────

    pub fn register_net_conn_callback(
        &mut self,
        specifier: NetSpecifier,
        callback: Arc<dyn NetConnCallback>,
        timeout_ms: u32,
        uid: u32,
        register_type: RegisterType,
    ) -> Result<RequestId, CoreError> {
        if self.mms_disabled && specifier.capabilities.has_cap(NetCap::Mms) {
            return Err(CoreError::PolicyDisabled {
                capability: NetCap::Mms.to_string(),
            });
        }
        if let Some(request_id) = self.request_by_callback(&callback) {
            return Err(CoreError::DuplicateCallback { request_id });
        }
        let outstanding = self.requests.len().saturating_sub(1);
        if outstanding >= self.limits.max_requests {
            return Err(CoreError::TooManyRequests {
                limit: self.limits.max_requests,
            });
        }

        let requests = &self.requests;
        let id = self
            .request_ids
            .next(|raw| requests.contains_key(&RequestId(raw)))
            .map(RequestId)
            .ok_or(CoreError::TooManyRequests {
                limit: self.limits.max_requests,
            })?;
        let mut request = NetRequest::new(
            id,
            uid,
            register_type,
            specifier,
            Some(Arc::clone(&callback)),
            timeout_ms,
        );

        let (bucket, limit) = if request.internal_bucket() {
            (
                &mut self.uid_internal_requests,
                self.limits.max_internal_requests_per_uid,
            )
        } else {
            (&mut self.uid_requests, self.limits.max_requests_per_uid)
        };
        let count = bucket.entry(uid).or_insert(0);
        if *count >= limit {
            return Err(CoreError::UidRequestQuotaExceeded { uid, limit });
        }
        *count += 1;

        if self.frozen_uids.contains(&uid) {
            request.set_frozen(true);
        }
        self.requests.insert(id, request);
        if let Some(token) = callback.liveness() {
            let handle = self.spawn_watcher(token, Task::CallbackDied(Arc::clone(&callback)));
            self.request_watchers.insert(id, handle);
        }
        info!(request_id = %id, uid, %register_type, timeout_ms, "request registered");

        match self.find_best_for_request(id) {
            Some((supplier_id, _)) => self.assign(id, supplier_id),
            None => {
                self.send_request_to_all(id);
                self.arm_timeout(id);
            }
        }
        Ok(id)
    }

    pub fn unregister_net_conn_callback(
        &mut self,
        callback: &Arc<dyn NetConnCallback>,
        uid: u32,
    ) -> Result<(), CoreError> {
        let req_id = self
            .request_by_callback(callback)
            .ok_or(CoreError::CallbackNotFound)?;
        let owner = self.requests.get(&req_id).map(NetRequest::uid);
        if owner.is_some_and(|owner| owner != uid) {
            warn!(request_id = %req_id, owner = ?owner, caller = uid, "caller uid differs from request owner");
        }
        self.release_request(req_id);
        info!(request_id = %req_id, "request unregistered");
        Ok(())
    }

    /// Drop every supplier hold on `req_id` and forget it.
    fn release_request(&mut self, req_id: RequestId) {
        for supplier in self.suppliers.values_mut() {
            supplier.cancel_request(req_id);
        }
        self.remove_request(req_id);
    }

    fn remove_request(&mut self, req_id: RequestId) {
        let Some(request) = self.requests.remove(&req_id) else {
            return;
        };
        let bucket = if request.internal_bucket() {
            &mut self.uid_internal_requests
        } else {
            &mut self.uid_requests
        };
        let uid = request.uid();
        let remaining = bucket.get(&uid).copied().unwrap_or(0).saturating_sub(1);
        if remaining == 0 {
            bucket.remove(&uid);
        } else {
            bucket.insert(uid, remaining);
        }
        if let Some(watcher) = self.request_watchers.remove(&req_id) {
            watcher.abort();
        }
    }

    fn handle_request_timeout(&mut self, req_id: RequestId) {
        let Some(request) = self.requests.get_mut(&req_id) else {
            return;
        };
        if request.assigned().is_some() {
            return;
        }
        info!(request_id = %req_id, "request timed out unsatisfied");
        request.notify(Notice::Unavailable);
        let register_type = request.register_type();
        for supplier in self.suppliers.values_mut() {
            supplier.cancel_request(req_id);
        }
        if register_type == RegisterType::Request {
            self.remove_request(req_id);
        }
    }

    fn handle_callback_died(&mut self, callback: &Arc<dyn NetConnCallback>) {
        let Some(req_id) = self.request_by_callback(callback) else {
            debug!("dead callback already unregistered");
            return;
        };
        warn!(request_id = %req_id, "consumer callback died, unregistering");
        self.release_request(req_id);
    }

    fn arm_timeout(&mut self, req_id: RequestId) {
        let Some(request) = self.requests.get_mut(&req_id) else {
            return;
        };
        if request.timeout_ms() == 0 {
            return;
        }
        let delay = Duration::from_millis(u64::from(request.timeout_ms()));
        let queue = self.queue.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                let _ = queue.send(Task::RequestTimeout(req_id));
            }
        });
        request.set_timer(handle.abort_handle());
    }

    /// Post `task` once `token` is cancelled, unless the arbiter stops
    /// first.
    fn spawn_watcher(&self, token: CancellationToken, task: Task) -> AbortHandle {
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = token.cancelled() => {
                    if let Some(queue) = queue.upgrade() {
                        let _ = queue.send(task);
                    }
                }
            }
        })
        .abort_handle()
    }

    pub fn set_app_frozen(&mut self, uid: u32, frozen: bool) {
        let changed = if frozen {
            self.frozen_uids.insert(uid)
        } else {
            self.frozen_uids.remove(&uid)
        };
        if !changed {
            return;
        }
        info!(uid, frozen, "app frozen state changed");
        let ids: Vec<RequestId> = self
            .requests
            .values()
            .filter(|r| r.uid() == uid)
            .map(NetRequest::id)
            .collect();
        for req_id in ids {
            let held = self
                .requests
                .get_mut(&req_id)
                .and_then(|r| r.set_frozen(frozen));
            if let Some((kind, net)) = held {
                self.replay_held(req_id, kind, net);
            }
        }
    }

    fn replay_held(&mut self, req_id: RequestId, kind: CallbackType, net: Option<NetHandle>) {
        let Some(request) = self.requests.get_mut(&req_id) else {
            return;
        };
        let served = request.assigned().and_then(|id| self.suppliers.get(&id));
        debug!(request_id = %req_id, %kind, "replaying held callback");
        match (kind, served) {
            (CallbackType::Available, Some(supplier)) => deliver_available(request, supplier),
            (CallbackType::UpdateCap, Some(supplier)) => request.notify(
                Notice::CapabilitiesChange(supplier.net_id(), supplier.capabilities()),
            ),
            (CallbackType::UpdateLink, Some(supplier)) => {
                let link = supplier.link_info();
                request.notify(Notice::ConnectionPropertiesChange(supplier.net_id(), &link));
            }
            (CallbackType::BlockStatus, Some(supplier)) => request.notify(
                Notice::BlockStatusChange(supplier.net_id(), supplier.restrict_background()),
            ),
            (CallbackType::Lost, _) => {
                if let Some(net) = net {
                    request.notify(Notice::Lost(net));
                }
            }
            (CallbackType::Unavailable, _) => request.notify(Notice::Unavailable),
            (_, None) => debug!(request_id = %req_id, %kind, "held callback no longer applies"),
        }
    }

    // ── Best-network selection ──────────────────────────────────────

    /// Re-run selection for every request, default request included.
    fn find_best_for_all(&mut self) {
        let ids: Vec<RequestId> = self.requests.keys().copied().collect();
        for req_id in ids {
            let best = self.find_best_for_request(req_id);
            if req_id == DEFAULT_REQUEST_ID {
                self.make_default(best.map(|(id, _)| id));
            }
            match best {
                Some((supplier_id, score)) => {
                    self.send_best_score_all(req_id, score, supplier_id);
                    self.assign(req_id, supplier_id);
                }
                None => self.not_find_best(req_id),
            }
        }
    }

    /// Highest-scoring connected supplier that matches. Ascending id
    /// order and a strict comparison make the lowest id win ties.
    fn find_best_for_request(&self, req_id: RequestId) -> Option<(SupplierId, u8)> {
        let request = self.requests.get(&req_id)?;
        let mut best: Option<(SupplierId, u8)> = None;
        for (id, supplier) in &self.suppliers {
            if !supplier.is_connected() || !request.matches(supplier, false) {
                continue;
            }
            let score = supplier.real_score();
            if score > best.map_or(0, |(_, s)| s) {
                best = Some((*id, score));
            }
        }
        best
    }

    fn assign(&mut self, req_id: RequestId, supplier_id: SupplierId) {
        let Some(request) = self.requests.get_mut(&req_id) else {
            return;
        };
        let previous = request.assigned();
        if previous == Some(supplier_id) {
            return;
        }
        request.set_assigned(Some(supplier_id));
        if let Some(old) = previous.and_then(|id| self.suppliers.get_mut(&id)) {
            old.remove_best_request(req_id);
        }
        let Some(supplier) = self.suppliers.get_mut(&supplier_id) else {
            return;
        };
        supplier.select_as_best(req_id);
        debug!(
            request_id = %req_id,
            %supplier_id,
            previous = ?previous,
            score = supplier.real_score(),
            "request assigned"
        );
        deliver_available(request, supplier);
    }

    fn not_find_best(&mut self, req_id: RequestId) {
        let Some(request) = self.requests.get_mut(&req_id) else {
            return;
        };
        if let Some(previous) = request.assigned() {
            request.set_assigned(None);
            if let Some(supplier) = self.suppliers.get_mut(&previous) {
                supplier.remove_best_request(req_id);
                request.notify(Notice::Lost(supplier.net_id()));
            }
        }
        self.send_request_to_all(req_id);
    }

    fn send_best_score_all(&mut self, req_id: RequestId, score: u8, best: SupplierId) {
        for supplier in self.suppliers.values_mut() {
            if supplier.is_internal() {
                continue;
            }
            supplier.receive_best_score(req_id, score, best);
        }
    }

    /// Solicit `req_id` from every supplier that could serve it.
    fn send_request_to_all(&mut self, req_id: RequestId) {
        let Some(request) = self.requests.get(&req_id) else {
            return;
        };
        let ident_filter = request.has_ident_filter();
        for supplier in self.suppliers.values_mut() {
            if request.matches(supplier, true) {
                supplier.request_to_connect(req_id, ident_filter);
            }
        }
    }

    /// Solicit every outstanding request from one supplier.
    fn send_all_requests_to_network(&mut self, supplier_id: SupplierId) {
        let Some(supplier) = self.suppliers.get_mut(&supplier_id) else {
            return;
        };
        for request in self.requests.values() {
            if request.matches(supplier, false) {
                supplier.request_to_connect(request.id(), request.has_ident_filter());
            }
        }
    }

    fn make_default(&mut self, next: Option<SupplierId>) {
        let previous = self.default_supplier;
        if previous == next {
            return;
        }
        let previous_net = previous
            .and_then(|id| self.suppliers.get_mut(&id))
            .map(|s| {
                s.clear_default(next.is_none());
                s.net_id()
            });
        let current_net = next
            .and_then(|id| self.suppliers.get_mut(&id))
            .map(|s| {
                s.set_default();
                s.net_id()
            });
        self.default_supplier = next;
        info!(previous = ?previous_net, current = ?current_net, "default network changed");
        let _ = self.env.events.send(ArbiterEvent::DefaultNetworkChanged {
            previous: previous_net,
            current: current_net,
        });
        self.request_standby_networks();
    }

    /// While the default network is unvalidated, ask every lower-scored,
    /// non-internal supplier to come up as a standby.
    fn request_standby_networks(&mut self) {
        let Some(default) = self.default_supplier.and_then(|id| self.suppliers.get(&id)) else {
            return;
        };
        if default.is_validated() || default.accepts_unvalidated() {
            return;
        }
        let default_id = default.id();
        let default_score = default.base_score();
        let Some(request) = self.requests.get(&DEFAULT_REQUEST_ID) else {
            return;
        };
        info!(supplier_id = %default_id, "default network unvalidated, requesting standby networks");
        for supplier in self.suppliers.values_mut() {
            if supplier.id() == default_id
                || supplier.base_score() >= default_score
                || supplier.is_internal()
                || !request.matches(supplier, true)
            {
                continue;
            }
            supplier.request_to_connect(DEFAULT_REQUEST_ID, false);
        }
    }

    // ── Fan-out ─────────────────────────────────────────────────────

    fn fan_out(&mut self, supplier_id: SupplierId, kind: Fanout) {
        let Some(supplier) = self.suppliers.get(&supplier_id) else {
            return;
        };
        let net = supplier.net_id();
        let link = supplier.link_info();
        for req_id in supplier.best_requests() {
            let Some(request) = self.requests.get_mut(req_id) else {
                continue;
            };
            match kind {
                Fanout::Caps => {
                    request.notify(Notice::CapabilitiesChange(net, supplier.capabilities()));
                }
                Fanout::Link => request.notify(Notice::ConnectionPropertiesChange(net, &link)),
                Fanout::BlockStatus => request.notify(Notice::BlockStatusChange(
                    net,
                    supplier.restrict_background(),
                )),
            }
        }
    }

    /// Deliver Lost to every request `supplier_id` serves and detach
    /// them. `cancel_holds` also drops the supplier's hold on each, which
    /// releases the provider once nothing is left.
    fn fan_out_lost(&mut self, supplier_id: SupplierId, cancel_holds: bool) {
        let Some(supplier) = self.suppliers.get_mut(&supplier_id) else {
            return;
        };
        let net = supplier.net_id();
        let served: Vec<RequestId> = supplier.best_requests().iter().copied().collect();
        for req_id in served {
            if cancel_holds {
                supplier.cancel_request(req_id);
            } else {
                supplier.remove_best_request(req_id);
            }
            if let Some(request) = self.requests.get_mut(&req_id) {
                request.set_assigned(None);
                request.notify(Notice::Lost(net));
            }
        }
    }

    // ── Detection ───────────────────────────────────────────────────

    fn handle_verdict(&mut self, verdict: &MonitorVerdict) {
        let _ = self
            .env
            .events
            .send(ArbiterEvent::Detection(Arc::clone(&verdict.report)));
        let Some(supplier_id) = self.supplier_id_by_net(verdict.net_id) else {
            debug!(net_id = %verdict.net_id, "verdict for a network that is gone");
            return;
        };
        if let Some(supplier) = self.suppliers.get_mut(&supplier_id) {
            supplier.network_mut().record_verdict(verdict);
        }
        if verdict.changed {
            self.handle_detection_result(supplier_id, verdict.status);
        }
    }

    /// Fold a detection, quality or override status into scoring and
    /// re-run selection.
    pub fn handle_detection_result(&mut self, supplier_id: SupplierId, status: NetDetectionStatus) {
        let Some(supplier) = self.suppliers.get_mut(&supplier_id) else {
            return;
        };
        supplier.set_net_valid(status);
        info!(
            %supplier_id,
            %status,
            score = supplier.real_score(),
            reason = supplier.score_reason(),
            "detection result applied"
        );
        self.fan_out(supplier_id, Fanout::Caps);
        self.find_best_for_all();
        if status != NetDetectionStatus::Verification && self.default_supplier == Some(supplier_id)
        {
            self.request_standby_networks();
        }
    }

    pub fn net_detection(&mut self, net_id: NetId) -> Result<(), CoreError> {
        self.network_mut(net_id)?.start_detection(true);
        Ok(())
    }

    /// Re-detect when DNS health contradicts the last verdict.
    pub fn net_detection_for_dns_health(
        &mut self,
        net_id: NetId,
        healthy: bool,
    ) -> Result<(), CoreError> {
        let network = self.network_mut(net_id)?;
        let verified = network.detection_status() == NetDetectionStatus::Verification;
        if healthy != verified && !network.is_detecting() {
            debug!(%net_id, healthy, verified, "dns health contradicts last verdict");
            network.start_detection(false);
        }
        Ok(())
    }

    pub fn update_net_quality(
        &mut self,
        supplier_id: SupplierId,
        good: bool,
    ) -> Result<(), CoreError> {
        self.supplier(supplier_id)?;
        let status = if good {
            NetDetectionStatus::QualityGood
        } else {
            NetDetectionStatus::QualityPoor
        };
        self.handle_detection_result(supplier_id, status);
        Ok(())
    }

    pub fn accept_unvalidated(&mut self, net_id: NetId) -> Result<(), CoreError> {
        let supplier_id = self
            .supplier_id_by_net(net_id)
            .ok_or(CoreError::NetworkNotFound { net_id })?;
        self.handle_detection_result(supplier_id, NetDetectionStatus::AcceptUnvalidated);
        Ok(())
    }

    pub fn set_detection_suspended(&mut self, suspended: bool) {
        if self.policy.detection_suspended == suspended {
            return;
        }
        self.policy.detection_suspended = suspended;
        info!(suspended, "network detection suspension changed");
        if suspended {
            for supplier in self.suppliers.values() {
                supplier.network().stop_detection();
            }
        } else if let Some(default) = self.default_supplier.and_then(|id| self.suppliers.get(&id)) {
            default.network().start_detection(false);
        }
    }

    pub fn dual_stack(&mut self, net_id: NetId) -> Result<Arc<DualStackProbe>, CoreError> {
        self.network_mut(net_id)?.dual_stack()
    }

    // ── Policy ──────────────────────────────────────────────────────

    pub fn set_airplane_mode(&mut self, enabled: bool) {
        self.policy.airplane_mode = enabled;
        info!(enabled, "airplane mode set");
        let _ = self
            .env
            .events
            .send(ArbiterEvent::AirplaneModeChanged { enabled });
    }

    pub fn set_global_http_proxy(&mut self, proxy: Option<HttpProxy>) {
        let proxy = proxy.filter(|p| !p.is_empty());
        info!(
            host = proxy.as_ref().map_or("", |p| p.host.as_str()),
            "global http proxy set"
        );
        self.env.global_proxy.store(proxy.clone().map(Arc::new));
        let _ = self
            .env
            .events
            .send(ArbiterEvent::GlobalHttpProxyChanged { proxy });
    }

    pub fn set_restrict_background(&mut self, restrict: bool) {
        if self.policy.restrict_background == restrict {
            return;
        }
        self.policy.restrict_background = restrict;
        info!(restrict, "background restriction changed");
        let vpns: Vec<SupplierId> = self
            .suppliers
            .values_mut()
            .filter(|s| s.bearer() == NetBearType::Vpn)
            .map(|s| {
                s.set_restrict_background(restrict);
                s.id()
            })
            .collect();
        for supplier_id in vpns {
            self.fan_out(supplier_id, Fanout::BlockStatus);
        }
    }

    pub fn handle_screen_event(&mut self, screen_on: bool) {
        self.env.screen_on.store(screen_on, Ordering::Release);
        if !screen_on {
            return;
        }
        for supplier in self.suppliers.values() {
            let network = supplier.network();
            if supplier.bearer() == NetBearType::Wifi
                && network.detection_status() == NetDetectionStatus::CaptivePortal
            {
                debug!(net_id = %supplier.net_id(), "screen on, re-checking portal");
                network.start_detection(false);
            }
        }
    }

    // ── Factory reset ───────────────────────────────────────────────

    pub fn register_factory_reset_callback(
        &mut self,
        callback: Arc<dyn NetFactoryResetCallback>,
    ) -> Result<(), CoreError> {
        if self.factory_reset_listeners.len() >= MAX_FACTORY_RESET_CALLBACKS {
            return Err(CoreError::InvalidParameter {
                message: format!(
                    "at most {MAX_FACTORY_RESET_CALLBACKS} factory reset callbacks may be registered"
                ),
            });
        }
        if self
            .factory_reset_listeners
            .iter()
            .any(|l| same_callback(&l.callback, &callback))
        {
            return Err(CoreError::InvalidParameter {
                message: "factory reset callback already registered".into(),
            });
        }
        let watcher = callback.liveness().map(|token| {
            self.spawn_watcher(token, Task::FactoryResetCallbackDied(Arc::clone(&callback)))
        });
        self.factory_reset_listeners
            .push(FactoryResetListener { callback, watcher });
        info!(
            count = self.factory_reset_listeners.len(),
            "factory reset callback registered"
        );
        Ok(())
    }

    /// Unknown callbacks are ignored.
    pub fn unregister_factory_reset_callback(&mut self, callback: &Arc<dyn NetFactoryResetCallback>) {
        let before = self.factory_reset_listeners.len();
        self.factory_reset_listeners.retain(|l| {
            let same = same_callback(&l.callback, callback);
            if same {
                if let Some(watcher) = &l.watcher {
                    watcher.abort();
                }
            }
            !same
        });
        if self.factory_reset_listeners.len() == before {
            debug!("factory reset callback not registered");
        } else {
            info!("factory reset callback unregistered");
        }
    }

    /// Turn airplane mode off and tell every listener.
    pub fn factory_reset_network(&mut self) {
        info!(
            listeners = self.factory_reset_listeners.len(),
            "factory resetting network"
        );
        self.set_airplane_mode(false);
        for listener in &self.factory_reset_listeners {
            listener.callback.on_net_factory_reset();
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn default_net(&self) -> Option<NetId> {
        self.default_supplier
            .and_then(|id| self.suppliers.get(&id))
            .map(Supplier::net_id)
    }

    /// Connected networks. Internal networks are only listed for
    /// trusted callers.
    pub fn all_nets(&self, trusted: bool) -> Vec<NetId> {
        self.suppliers
            .values()
            .filter(|s| s.is_connected() && (trusted || !s.is_internal()))
            .map(Supplier::net_id)
            .collect()
    }

    pub fn specific_nets(&self, bearer: NetBearType) -> Vec<NetId> {
        self.suppliers
            .values()
            .filter(|s| s.bearer() == bearer)
            .map(Supplier::net_id)
            .collect()
    }

    pub fn net_ids_by_ident(&self, ident: &str) -> Vec<NetId> {
        self.suppliers
            .values()
            .filter(|s| s.ident() == ident)
            .map(Supplier::net_id)
            .collect()
    }

    fn find_supplier(&self, bearer: NetBearType, ident: &str) -> Result<&Supplier, CoreError> {
        self.suppliers
            .values()
            .find(|s| s.bearer() == bearer && (ident.is_empty() || s.ident() == ident))
            .ok_or_else(|| CoreError::SupplierNotRegistered {
                bearer: bearer.to_string(),
                ident: ident.to_owned(),
            })
    }

    pub fn supplier_id_for(&self, bearer: NetBearType, ident: &str) -> Result<SupplierId, CoreError> {
        self.find_supplier(bearer, ident).map(Supplier::id)
    }

    pub fn iface_name_by_type(&self, bearer: NetBearType, ident: &str) -> Result<String, CoreError> {
        self.find_supplier(bearer, ident)
            .map(|s| s.network().iface_name())
    }

    pub fn uid_request_count(&self, uid: u32) -> usize {
        self.uid_requests.get(&uid).copied().unwrap_or(0)
            + self.uid_internal_requests.get(&uid).copied().unwrap_or(0)
    }

    fn supplier_snapshots(&self) -> Vec<SupplierSnapshot> {
        self.suppliers
            .values()
            .map(|s| SupplierSnapshot {
                supplier_id: s.id(),
                net_id: s.net_id(),
                bearer: s.bearer(),
                ident: s.ident().to_owned(),
                available: s.is_available(),
                state: s.state().to_string(),
                caps: s.capabilities().caps,
                score: s.real_score(),
                score_reason: s.score_reason(),
                detection: s.network().detection_status(),
                is_default: s.is_default(),
                iface: s.network().iface_name(),
                requests: s.request_list().len(),
                serving: s.best_requests().len(),
            })
            .collect()
    }

    fn request_snapshots(&self) -> Vec<RequestSnapshot> {
        self.requests
            .values()
            .map(|r| RequestSnapshot {
                request_id: r.id(),
                uid: r.uid(),
                register_type: r.register_type(),
                ident: r.specifier().ident.clone(),
                caps: r.specifier().caps(),
                served_by: r.assigned(),
                frozen: r.is_frozen(),
            })
            .collect()
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Stop every monitor, release every supplier and forget all state.
    pub fn shutdown(&mut self) {
        for (_, watcher) in self.supplier_watchers.drain() {
            watcher.abort();
        }
        for (_, watcher) in self.request_watchers.drain() {
            watcher.abort();
        }
        for listener in self.factory_reset_listeners.drain(..) {
            if let Some(watcher) = listener.watcher {
                watcher.abort();
            }
        }
        self.make_default(None);
        for supplier in self.suppliers.values_mut() {
            supplier.network().stop_detection();
            supplier.disconnect();
        }
        info!(
            suppliers = self.suppliers.len(),
            requests = self.requests.len(),
            "registry shut down"
        );
        self.requests.clear();
        self.suppliers.clear();
    }
}

/// Available, then capabilities, then link properties.
fn deliver_available(request: &mut NetRequest, supplier: &Supplier) {
    let net = supplier.net_id();
    request.notify(Notice::Available(net));
    request.notify(Notice::CapabilitiesChange(net, supplier.capabilities()));
    let link = supplier.link_info();
    request.notify(Notice::ConnectionPropertiesChange(net, &link));
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicBool;

    use arc_swap::ArcSwapOption;
    use tokio::sync::broadcast;

    use super::*;
    use crate::callback::{
        ConnEvent, RecordingConnCallback, RecordingFactoryResetCallback, RecordingSupplierCallback,
    };
    use crate::config::{DetectionConfig, DualStackConfig, LinkLimits};
    use crate::model::{InetAddr, NetAllCapabilities};
    use crate::netsys::RecordingNetsys;

    struct Harness {
        registry: Registry,
        events: broadcast::Receiver<ArbiterEvent>,
        queue: mpsc::UnboundedReceiver<Task>,
        _tx: mpsc::UnboundedSender<Task>,
    }

    fn harness(config: ArbiterConfig) -> Harness {
        let (events, rx) = broadcast::channel(64);
        let (tx, queue) = mpsc::unbounded_channel();
        let env = Arc::new(NetworkEnv {
            netsys: Arc::new(RecordingNetsys::new()),
            detection: Arc::new(DetectionConfig {
                enabled: false,
                ..DetectionConfig::default()
            }),
            dual_stack: DualStackConfig::default(),
            link_limits: LinkLimits::default(),
            resolver: Arc::new(netconn_probe::StaticResolver::new()),
            global_proxy: Arc::new(ArcSwapOption::empty()),
            screen_on: Arc::new(AtomicBool::new(true)),
            events,
            sink: Arc::new(|_: MonitorVerdict| {}),
        });
        let registry = Registry::new(&config, env, tx.downgrade(), CancellationToken::new());
        Harness {
            registry,
            events: rx,
            queue,
            _tx: tx,
        }
    }

    fn internet() -> NetCaps {
        NetCaps::empty()
            .with(NetCap::Internet)
            .with(NetCap::NotVpn)
    }

    fn link(iface: &str, last: u8) -> NetLinkInfo {
        NetLinkInfo {
            addresses: vec![InetAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 24)],
            ..NetLinkInfo::new(iface)
        }
    }

    /// Register, mark available and push a link.
    fn connect(reg: &mut Registry, bearer: NetBearType, ident: &str, score: u8) -> SupplierId {
        let id = reg
            .register_net_supplier(bearer, ident.into(), internet(), 1000)
            .unwrap();
        reg.update_net_supplier_info(id, NetSupplierInfo::available().with_score(score), 1000)
            .unwrap();
        reg.update_net_link_info(id, link(ident, score), 1000).unwrap();
        id
    }

    fn caps_of(registry: &Registry, supplier_id: SupplierId) -> NetAllCapabilities {
        registry.suppliers[&supplier_id].capabilities().clone()
    }

    fn drain(rx: &mut broadcast::Receiver<ArbiterEvent>) -> Vec<ArbiterEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn default_request_exists_from_start() {
        let h = harness(ArbiterConfig::default());
        let requests = h.registry.request_snapshots();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_id, DEFAULT_REQUEST_ID);
        assert_eq!(h.registry.default_net(), None);
    }

    #[test]
    fn validated_default_fails_over_on_validation_loss() {
        let mut h = harness(ArbiterConfig::default());
        let wifi = connect(&mut h.registry, NetBearType::Wifi, "ssid", 60);
        let cell = connect(&mut h.registry, NetBearType::Cellular, "sim1", 50);
        h.registry
            .handle_detection_result(cell, NetDetectionStatus::Verification);
        h.registry
            .handle_detection_result(wifi, NetDetectionStatus::Verification);
        let wifi_net = h.registry.suppliers[&wifi].net_id();
        let cell_net = h.registry.suppliers[&cell].net_id();
        assert_eq!(h.registry.default_net(), Some(wifi_net));
        drain(&mut h.events);

        h.registry
            .handle_detection_result(wifi, NetDetectionStatus::Invalid);
        assert_eq!(h.registry.default_net(), Some(cell_net));
        let changes: Vec<_> = drain(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                ArbiterEvent::DefaultNetworkChanged { previous, current } => {
                    Some((previous, current))
                }
                _ => None,
            })
            .collect();
        assert_eq!(changes, [(Some(wifi_net), Some(cell_net))]);
        assert!(!caps_of(&h.registry, wifi).has_cap(NetCap::Validated));
    }

    #[test]
    fn equal_scores_pick_lowest_supplier_id() {
        let mut h = harness(ArbiterConfig::default());
        let first = connect(&mut h.registry, NetBearType::Ethernet, "eth0", 70);
        let _second = connect(&mut h.registry, NetBearType::Ethernet, "eth1", 70);
        assert_eq!(
            h.registry.default_net(),
            Some(h.registry.suppliers[&first].net_id())
        );
    }

    #[test]
    fn unregistering_serving_supplier_delivers_lost() {
        let mut h = harness(ArbiterConfig::default());
        let cell = connect(&mut h.registry, NetBearType::Cellular, "sim1", 50);
        let net = h.registry.suppliers[&cell].net_id();
        let cb = RecordingConnCallback::new();
        h.registry
            .register_net_conn_callback(NetSpecifier::new(), cb.clone(), 0, 10, RegisterType::Register)
            .unwrap();
        assert_eq!(cb.names(), ["available", "capabilities", "properties"]);

        h.registry.unregister_net_supplier(cell, Some(1000)).unwrap();
        assert_eq!(cb.events().last(), Some(&ConnEvent::Lost(net)));
        assert_eq!(cb.names().iter().filter(|n| **n == "lost").count(), 1);
        assert_eq!(h.registry.default_net(), None);
        assert!(
            h.registry
                .request_snapshots()
                .iter()
                .all(|r| r.served_by.is_none())
        );
    }

    #[test]
    fn registration_is_idempotent_per_identity() {
        let mut h = harness(ArbiterConfig::default());
        let a = h
            .registry
            .register_net_supplier(NetBearType::Wifi, "ssid".into(), internet(), 1)
            .unwrap();
        let b = h
            .registry
            .register_net_supplier(NetBearType::Wifi, "ssid".into(), internet(), 1)
            .unwrap();
        let c = h
            .registry
            .register_net_supplier(NetBearType::Wifi, "other".into(), internet(), 1)
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, SupplierId(SUPPLIER_ID_BASE));
        assert_eq!(h.registry.specific_nets(NetBearType::Wifi).len(), 2);
    }

    #[test]
    fn internal_suppliers_use_reserved_net_ids() {
        let mut h = harness(ArbiterConfig::default());
        let id = h
            .registry
            .register_net_supplier(
                NetBearType::Cellular,
                "sim1".into(),
                NetCaps::empty().with(NetCap::InternalDefault),
                1,
            )
            .unwrap();
        let net = h.registry.suppliers[&id].net_id().get();
        assert!((MIN_INTERNAL_NET_ID..=MAX_INTERNAL_NET_ID).contains(&net));
    }

    #[test]
    fn per_uid_quota_and_duplicates() {
        let mut h = harness(ArbiterConfig {
            limits: RequestLimits {
                max_requests_per_uid: 1,
                ..RequestLimits::default()
            },
            ..ArbiterConfig::default()
        });
        let cb = RecordingConnCallback::new();
        let spec = NetSpecifier::internet();
        h.registry
            .register_net_conn_callback(spec.clone(), cb.clone(), 0, 7, RegisterType::Register)
            .unwrap();
        assert!(matches!(
            h.registry
                .register_net_conn_callback(spec.clone(), cb, 0, 7, RegisterType::Register),
            Err(CoreError::DuplicateCallback { .. })
        ));
        assert!(matches!(
            h.registry.register_net_conn_callback(
                spec,
                RecordingConnCallback::new(),
                0,
                7,
                RegisterType::Register
            ),
            Err(CoreError::UidRequestQuotaExceeded { uid: 7, limit: 1 })
        ));
        // Cellular requests count against the separate bucket.
        h.registry
            .register_net_conn_callback(
                NetSpecifier::new().with_bearer(NetBearType::Cellular),
                RecordingConnCallback::new(),
                0,
                7,
                RegisterType::Register,
            )
            .unwrap();
        assert_eq!(h.registry.uid_request_count(7), 2);
    }

    #[test]
    fn mms_requests_can_be_disabled() {
        let mut h = harness(ArbiterConfig {
            mms_disabled: true,
            ..ArbiterConfig::default()
        });
        let err = h
            .registry
            .register_net_conn_callback(
                NetSpecifier::new().with_cap(NetCap::Mms),
                RecordingConnCallback::new(),
                0,
                1,
                RegisterType::Request,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::PolicyDisabled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unsatisfied_request_times_out_and_is_removed() {
        let mut h = harness(ArbiterConfig::default());
        let cb = RecordingConnCallback::new();
        h.registry
            .register_net_conn_callback(NetSpecifier::new(), cb.clone(), 100, 3, RegisterType::Request)
            .unwrap();
        assert_eq!(h.registry.uid_request_count(3), 1);

        let task = h.queue.recv().await.unwrap();
        assert!(matches!(task, Task::RequestTimeout(_)));
        h.registry.run(task);
        assert_eq!(cb.names(), ["unavailable"]);
        assert_eq!(h.registry.uid_request_count(3), 0);
        assert_eq!(h.registry.request_snapshots().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn register_kind_survives_its_timeout() {
        let mut h = harness(ArbiterConfig::default());
        let cb = RecordingConnCallback::new();
        h.registry
            .register_net_conn_callback(NetSpecifier::new(), cb.clone(), 50, 3, RegisterType::Register)
            .unwrap();
        let task = h.queue.recv().await.unwrap();
        h.registry.run(task);
        assert_eq!(cb.names(), ["unavailable"]);
        assert_eq!(h.registry.request_snapshots().len(), 2);
    }

    #[test]
    fn lost_fan_out_releases_provider() {
        let mut h = harness(ArbiterConfig::default());
        let wifi = h
            .registry
            .register_net_supplier(NetBearType::Wifi, "ssid".into(), internet(), 1000)
            .unwrap();
        let provider = RecordingSupplierCallback::new();
        h.registry
            .register_net_supplier_callback(wifi, &(provider.clone() as Arc<dyn NetSupplierCallback>))
            .unwrap();
        assert_eq!(provider.requests(), 1);
        h.registry
            .update_net_supplier_info(wifi, NetSupplierInfo::available(), 1000)
            .unwrap();
        h.registry
            .update_net_link_info(wifi, link("wlan0", 2), 1000)
            .unwrap();
        assert!(h.registry.default_net().is_some());

        h.registry
            .update_net_supplier_info(wifi, NetSupplierInfo::default(), 1000)
            .unwrap();
        assert_eq!(provider.releases(), 1);
        assert_eq!(h.registry.default_net(), None);
    }

    #[test]
    fn restrict_background_notifies_vpn_consumers() {
        let mut h = harness(ArbiterConfig::default());
        let vpn = h
            .registry
            .register_net_supplier(NetBearType::Vpn, "tun0".into(), NetCaps::empty().with(NetCap::Internet), 1)
            .unwrap();
        h.registry
            .update_net_supplier_info(vpn, NetSupplierInfo::available(), 1)
            .unwrap();
        h.registry.update_net_link_info(vpn, link("tun0", 9), 1).unwrap();
        let net = h.registry.suppliers[&vpn].net_id();
        let cb = RecordingConnCallback::new();
        h.registry
            .register_net_conn_callback(
                NetSpecifier::new().with_bearer(NetBearType::Vpn),
                cb.clone(),
                0,
                4,
                RegisterType::Register,
            )
            .unwrap();
        cb.clear();

        h.registry.set_restrict_background(true);
        h.registry.set_restrict_background(true);
        assert_eq!(cb.events(), [ConnEvent::BlockStatusChange(net, true)]);
    }

    #[test]
    fn frozen_app_gets_available_replayed() {
        let mut h = harness(ArbiterConfig::default());
        let cb = RecordingConnCallback::new();
        h.registry.set_app_frozen(5, true);
        h.registry
            .register_net_conn_callback(NetSpecifier::new(), cb.clone(), 0, 5, RegisterType::Register)
            .unwrap();
        connect(&mut h.registry, NetBearType::Ethernet, "eth0", 70);
        assert!(cb.events().is_empty());

        h.registry.set_app_frozen(5, false);
        assert_eq!(cb.names(), ["available", "capabilities", "properties"]);
    }

    #[test]
    fn airplane_and_proxy_are_broadcast() {
        let mut h = harness(ArbiterConfig::default());
        h.registry.set_airplane_mode(true);
        h.registry
            .set_global_http_proxy(Some(HttpProxy::new("proxy.test", 3128)));
        h.registry.set_global_http_proxy(Some(HttpProxy::default()));
        let events = drain(&mut h.events);
        assert!(matches!(
            events[0],
            ArbiterEvent::AirplaneModeChanged { enabled: true }
        ));
        assert!(matches!(
            &events[1],
            ArbiterEvent::GlobalHttpProxyChanged { proxy: Some(p) } if p.host == "proxy.test"
        ));
        assert!(matches!(
            events[2],
            ArbiterEvent::GlobalHttpProxyChanged { proxy: None }
        ));
        assert!(h.registry.env.global_proxy.load().is_none());
    }

    #[test]
    fn factory_reset_clears_airplane_and_notifies_listeners() {
        let mut h = harness(ArbiterConfig::default());
        let first = RecordingFactoryResetCallback::new();
        let second = RecordingFactoryResetCallback::new();
        h.registry
            .register_factory_reset_callback(first.clone())
            .unwrap();
        h.registry
            .register_factory_reset_callback(second.clone())
            .unwrap();
        assert!(matches!(
            h.registry.register_factory_reset_callback(first.clone()),
            Err(CoreError::InvalidParameter { .. })
        ));

        h.registry.set_airplane_mode(true);
        drain(&mut h.events);
        h.registry.factory_reset_network();
        assert!(!h.registry.policy.airplane_mode);
        assert!(matches!(
            drain(&mut h.events)[..],
            [ArbiterEvent::AirplaneModeChanged { enabled: false }]
        ));
        assert_eq!((first.resets(), second.resets()), (1, 1));

        let first_dyn: Arc<dyn NetFactoryResetCallback> = first.clone();
        h.registry.unregister_factory_reset_callback(&first_dyn);
        h.registry.unregister_factory_reset_callback(&first_dyn);
        h.registry.factory_reset_network();
        assert_eq!((first.resets(), second.resets()), (1, 2));
    }

    #[test]
    fn factory_reset_listener_count_is_capped() {
        let mut h = harness(ArbiterConfig::default());
        for _ in 0..MAX_FACTORY_RESET_CALLBACKS {
            h.registry
                .register_factory_reset_callback(RecordingFactoryResetCallback::new())
                .unwrap();
        }
        assert!(matches!(
            h.registry
                .register_factory_reset_callback(RecordingFactoryResetCallback::new()),
            Err(CoreError::InvalidParameter { .. })
        ));
    }

    #[tokio::test]
    async fn dead_factory_reset_listener_is_dropped() {
        let mut h = harness(ArbiterConfig::default());
        let cb = RecordingFactoryResetCallback::with_liveness();
        h.registry
            .register_factory_reset_callback(cb.clone())
            .unwrap();

        cb.kill();
        let task = h.queue.recv().await.unwrap();
        assert!(matches!(task, Task::FactoryResetCallbackDied(_)));
        h.registry.run(task);
        h.registry.factory_reset_network();
        assert_eq!(cb.resets(), 0);
        assert!(h.registry.factory_reset_listeners.is_empty());
    }

    #[test]
    fn queries_filter_internal_networks() {
        let mut h = harness(ArbiterConfig::default());
        let eth = connect(&mut h.registry, NetBearType::Ethernet, "eth0", 70);
        let internal = h
            .registry
            .register_net_supplier(
                NetBearType::Cellular,
                "sim1".into(),
                NetCaps::empty().with(NetCap::InternalDefault),
                1,
            )
            .unwrap();
        h.registry
            .update_net_supplier_info(internal, NetSupplierInfo::available(), 1)
            .unwrap();
        h.registry
            .update_net_link_info(internal, link("rmnet1", 3), 1)
            .unwrap();

        let eth_net = h.registry.suppliers[&eth].net_id();
        assert_eq!(h.registry.all_nets(false), [eth_net]);
        assert_eq!(h.registry.all_nets(true).len(), 2);
        assert_eq!(h.registry.net_ids_by_ident("eth0"), [eth_net]);
        assert_eq!(
            h.registry
                .iface_name_by_type(NetBearType::Ethernet, "")
                .unwrap(),
            "eth0"
        );
        assert!(
            h.registry
                .supplier_id_for(NetBearType::Wifi, "x")
                .unwrap_err()
                .is_not_found()
        );
    }
}
