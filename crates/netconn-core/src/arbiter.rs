// ── Connectivity arbiter ──
//
// Public entry point. Every operation becomes a `Task` on one queue and
// a single worker applies them in order against the registry, so
// suppliers, requests and the default network are only ever touched
// from that worker.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use netconn_probe::{DnsResolver, HttpProxy, SystemResolver};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::callback::{
    NetConnCallback, NetDetectionCallback, NetFactoryResetCallback, NetSupplierCallback,
};
use crate::command::{Command, CommandEnvelope, CommandResult, Task};
use crate::config::ArbiterConfig;
use crate::detection::{DetectionSink, DualStackOutcome, MonitorVerdict};
use crate::error::CoreError;
use crate::model::{
    ArbiterEvent, ArbiterState, NetAllCapabilities, NetBearType, NetCaps, NetHandle, NetId,
    NetLinkInfo, NetSpecifier, NetSupplierInfo, RegisterType, RequestId, RequestSnapshot,
    SupplierId, SupplierSnapshot,
};
use crate::netsys::NetsysController;
use crate::network::NetworkEnv;
use crate::registry::Registry;

const EVENT_CHANNEL_SIZE: usize = 256;

// ── Arbiter ──────────────────────────────────────────────────────

/// Handle to the connectivity arbiter.
///
/// Cheaply cloneable via `Arc<ArbiterInner>`. Nothing runs until
/// [`start()`](Self::start); after [`shutdown()`](Self::shutdown) every
/// operation fails with [`CoreError::ArbiterStopped`].
#[derive(Clone)]
pub struct Arbiter {
    inner: Arc<ArbiterInner>,
}

struct ArbiterInner {
    config: ArbiterConfig,
    state: watch::Sender<ArbiterState>,
    event_tx: broadcast::Sender<ArbiterEvent>,
    task_tx: mpsc::UnboundedSender<Task>,
    worker: Mutex<Option<(Registry, mpsc::UnboundedReceiver<Task>)>>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Arbiter {
    /// Create an arbiter that programs routing through `netsys` and
    /// resolves probe hosts with the system resolver.
    pub fn new(config: ArbiterConfig, netsys: Arc<dyn NetsysController>) -> Self {
        Self::with_resolver(config, netsys, Arc::new(SystemResolver))
    }

    pub fn with_resolver(
        config: ArbiterConfig,
        netsys: Arc<dyn NetsysController>,
        resolver: Arc<dyn DnsResolver>,
    ) -> Self {
        let (state, _) = watch::channel(ArbiterState::Idle);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let verdicts = task_tx.downgrade();
        let sink: DetectionSink = Arc::new(move |verdict: MonitorVerdict| {
            if let Some(tx) = verdicts.upgrade() {
                let _ = tx.send(Task::Verdict(verdict));
            }
        });
        let env = Arc::new(NetworkEnv {
            netsys,
            detection: Arc::new(config.detection.clone()),
            dual_stack: config.dual_stack.clone(),
            link_limits: config.link,
            resolver,
            global_proxy: Arc::new(ArcSwapOption::empty()),
            screen_on: Arc::new(AtomicBool::new(true)),
            events: event_tx.clone(),
            sink,
        });
        let registry = Registry::new(&config, env, task_tx.downgrade(), cancel.clone());

        Self {
            inner: Arc::new(ArbiterInner {
                config,
                state,
                event_tx,
                task_tx,
                worker: Mutex::new(Some((registry, task_rx))),
                cancel,
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.inner.config
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Spawn the worker. Calling it again is a no-op.
    pub async fn start(&self) {
        let Some((registry, rx)) = self.inner.worker.lock().await.take() else {
            debug!("arbiter already started");
            return;
        };
        let cancel = self.inner.cancel.clone();
        self.inner
            .task_handles
            .lock()
            .await
            .push(tokio::spawn(worker_task(registry, rx, cancel)));
        self.inner.state.send_replace(ArbiterState::Running);
        info!("arbiter started");
    }

    /// Stop the worker. Queued commands are answered with
    /// [`CoreError::ArbiterStopped`], every monitor is stopped and every
    /// supplier released.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        self.inner.state.send_replace(ArbiterState::Stopped);
        info!("arbiter stopped");
    }

    /// Subscribe to lifecycle changes.
    pub fn state(&self) -> watch::Receiver<ArbiterState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to service-wide notifications.
    pub fn events(&self) -> broadcast::Receiver<ArbiterEvent> {
        self.inner.event_tx.subscribe()
    }

    // ── Command execution ────────────────────────────────────────

    /// Queue `command` and wait for the worker's answer.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, CoreError> {
        match *self.inner.state.borrow() {
            ArbiterState::Running => {}
            ArbiterState::Idle => return Err(CoreError::ServiceNotReady { component: "arbiter" }),
            ArbiterState::Stopped => return Err(CoreError::ArbiterStopped),
        }
        let (tx, rx) = oneshot::channel();
        self.inner
            .task_tx
            .send(Task::Command(CommandEnvelope {
                command,
                response_tx: tx,
            }))
            .map_err(|_| CoreError::ArbiterStopped)?;
        rx.await.map_err(|_| CoreError::ArbiterStopped)?
    }

    async fn execute_ok(&self, command: Command) -> Result<(), CoreError> {
        match self.execute(command).await? {
            CommandResult::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn execute_net_ids(&self, command: Command) -> Result<Vec<NetId>, CoreError> {
        match self.execute(command).await? {
            CommandResult::NetIds(ids) => Ok(ids),
            other => Err(unexpected(&other)),
        }
    }

    async fn execute_bool(&self, command: Command) -> Result<bool, CoreError> {
        match self.execute(command).await? {
            CommandResult::Bool(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    // ── Supplier operations ──────────────────────────────────────

    pub async fn register_net_supplier(
        &self,
        bearer: NetBearType,
        ident: impl Into<String>,
        caps: NetCaps,
        uid: u32,
    ) -> Result<SupplierId, CoreError> {
        let command = Command::RegisterNetSupplier {
            bearer,
            ident: ident.into(),
            caps,
            uid,
        };
        match self.execute(command).await? {
            CommandResult::SupplierId(id) => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    /// Same as [`register_net_supplier`](Self::register_net_supplier)
    /// for callers holding an untyped bearer value.
    pub async fn register_net_supplier_raw(
        &self,
        bearer: u32,
        ident: impl Into<String>,
        caps: NetCaps,
        uid: u32,
    ) -> Result<SupplierId, CoreError> {
        let bearer = NetBearType::try_from(bearer)?;
        self.register_net_supplier(bearer, ident, caps, uid).await
    }

    pub async fn unregister_net_supplier(
        &self,
        supplier_id: SupplierId,
        uid: u32,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::UnregisterNetSupplier { supplier_id, uid })
            .await
    }

    pub async fn register_net_supplier_callback(
        &self,
        supplier_id: SupplierId,
        callback: Arc<dyn NetSupplierCallback>,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::RegisterNetSupplierCallback {
            supplier_id,
            callback,
        })
        .await
    }

    pub async fn unregister_net_supplier_callback(
        &self,
        supplier_id: SupplierId,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::UnregisterNetSupplierCallback { supplier_id })
            .await
    }

    pub async fn update_net_supplier_info(
        &self,
        supplier_id: SupplierId,
        info: NetSupplierInfo,
        uid: u32,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::UpdateNetSupplierInfo {
            supplier_id,
            info,
            uid,
        })
        .await
    }

    pub async fn update_net_link_info(
        &self,
        supplier_id: SupplierId,
        link: NetLinkInfo,
        uid: u32,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::UpdateNetLinkInfo {
            supplier_id,
            link,
            uid,
        })
        .await
    }

    pub async fn update_net_caps(
        &self,
        supplier_id: SupplierId,
        caps: NetCaps,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::UpdateNetCaps { supplier_id, caps })
            .await
    }

    // ── Request operations ───────────────────────────────────────

    /// Register a long-lived listener. `timeout_ms == 0` waits forever.
    pub async fn register_net_conn_callback(
        &self,
        specifier: NetSpecifier,
        callback: Arc<dyn NetConnCallback>,
        timeout_ms: u32,
        uid: u32,
    ) -> Result<RequestId, CoreError> {
        self.register_request(specifier, callback, timeout_ms, uid, RegisterType::Register)
            .await
    }

    /// Ask for a network on demand. The request is dropped when its
    /// timeout fires unsatisfied.
    pub async fn request_net_connection(
        &self,
        specifier: NetSpecifier,
        callback: Arc<dyn NetConnCallback>,
        timeout_ms: u32,
        uid: u32,
    ) -> Result<RequestId, CoreError> {
        self.register_request(specifier, callback, timeout_ms, uid, RegisterType::Request)
            .await
    }

    async fn register_request(
        &self,
        specifier: NetSpecifier,
        callback: Arc<dyn NetConnCallback>,
        timeout_ms: u32,
        uid: u32,
        register_type: RegisterType,
    ) -> Result<RequestId, CoreError> {
        let command = Command::RegisterNetConnCallback {
            specifier,
            callback,
            timeout_ms,
            uid,
            register_type,
        };
        match self.execute(command).await? {
            CommandResult::RequestId(id) => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn unregister_net_conn_callback(
        &self,
        callback: Arc<dyn NetConnCallback>,
        uid: u32,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::UnregisterNetConnCallback { callback, uid })
            .await
    }

    pub async fn set_app_frozen(&self, uid: u32, frozen: bool) -> Result<(), CoreError> {
        self.execute_ok(Command::SetAppFrozen { uid, frozen }).await
    }

    /// Outstanding requests owned by `uid`, both buckets.
    pub async fn uid_request_count(&self, uid: u32) -> Result<usize, CoreError> {
        match self.execute(Command::UidRequestCount { uid }).await? {
            CommandResult::Count(count) => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    // ── Detection operations ─────────────────────────────────────

    /// Re-detect `net_id`. The verdict is reported even if unchanged.
    pub async fn net_detection(&self, net_id: NetId) -> Result<(), CoreError> {
        self.execute_ok(Command::NetDetection { net_id }).await
    }

    pub async fn net_detection_for_dns_health(
        &self,
        net_id: NetId,
        healthy: bool,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::NetDetectionForDnsHealth { net_id, healthy })
            .await
    }

    pub async fn register_net_detection_callback(
        &self,
        net_id: NetId,
        callback: Arc<dyn NetDetectionCallback>,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::RegisterNetDetectionCallback { net_id, callback })
            .await
    }

    pub async fn unregister_net_detection_callback(
        &self,
        net_id: NetId,
        callback: Arc<dyn NetDetectionCallback>,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::UnregisterNetDetectionCallback { net_id, callback })
            .await
    }

    pub async fn update_net_quality(
        &self,
        supplier_id: SupplierId,
        good: bool,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::UpdateNetQuality { supplier_id, good })
            .await
    }

    /// The user chose to keep using `net_id` without validation.
    pub async fn accept_unvalidated(&self, net_id: NetId) -> Result<(), CoreError> {
        self.execute_ok(Command::AcceptUnvalidated { net_id }).await
    }

    pub async fn set_detection_suspended(&self, suspended: bool) -> Result<(), CoreError> {
        self.execute_ok(Command::SetDetectionSuspended { suspended })
            .await
    }

    /// Probe the IPv4 and IPv6 stacks of `net_id`.
    ///
    /// The prober is fetched through the worker but runs outside it, so
    /// a slow probe never holds up other operations.
    pub async fn dual_stack_probe(
        &self,
        net_id: NetId,
        timeout: Duration,
    ) -> Result<DualStackOutcome, CoreError> {
        let probe = match self.execute(Command::DualStackProbe { net_id }).await? {
            CommandResult::DualStack(probe) => probe,
            other => return Err(unexpected(&other)),
        };
        probe.run(timeout).await
    }

    // ── Policy operations ────────────────────────────────────────

    pub async fn set_airplane_mode(&self, enabled: bool) -> Result<(), CoreError> {
        self.execute_ok(Command::SetAirplaneMode { enabled }).await
    }

    pub async fn airplane_mode(&self) -> Result<bool, CoreError> {
        self.execute_bool(Command::GetAirplaneMode).await
    }

    /// Set or clear the global proxy. An empty host clears it.
    pub async fn set_global_http_proxy(&self, proxy: Option<HttpProxy>) -> Result<(), CoreError> {
        self.execute_ok(Command::SetGlobalHttpProxy { proxy }).await
    }

    pub async fn global_http_proxy(&self) -> Result<Option<HttpProxy>, CoreError> {
        match self.execute(Command::GetGlobalHttpProxy).await? {
            CommandResult::Proxy(proxy) => Ok(proxy),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn set_restrict_background(&self, restrict: bool) -> Result<(), CoreError> {
        self.execute_ok(Command::SetRestrictBackground { restrict })
            .await
    }

    pub async fn restrict_background(&self) -> Result<bool, CoreError> {
        self.execute_bool(Command::GetRestrictBackground).await
    }

    pub async fn handle_screen_event(&self, screen_on: bool) -> Result<(), CoreError> {
        self.execute_ok(Command::HandleScreenEvent { screen_on })
            .await
    }

    // ── Factory reset ────────────────────────────────────────────

    /// At most 200 listeners; registering the same one twice is rejected.
    pub async fn register_net_factory_reset_callback(
        &self,
        callback: Arc<dyn NetFactoryResetCallback>,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::RegisterNetFactoryResetCallback { callback })
            .await
    }

    pub async fn unregister_net_factory_reset_callback(
        &self,
        callback: Arc<dyn NetFactoryResetCallback>,
    ) -> Result<(), CoreError> {
        self.execute_ok(Command::UnregisterNetFactoryResetCallback { callback })
            .await
    }

    /// Clear airplane mode and notify every factory reset listener.
    pub async fn factory_reset_network(&self) -> Result<(), CoreError> {
        self.execute_ok(Command::FactoryResetNetwork).await
    }

    // ── Queries ──────────────────────────────────────────────────

    pub async fn default_net(&self) -> Result<Option<NetHandle>, CoreError> {
        match self.execute(Command::GetDefaultNet).await? {
            CommandResult::NetId(net) => Ok(net),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn has_default_net(&self) -> Result<bool, CoreError> {
        Ok(self.default_net().await?.is_some())
    }

    /// Connected networks. Internal networks are listed only for
    /// `trusted` callers.
    pub async fn all_nets(&self, trusted: bool) -> Result<Vec<NetId>, CoreError> {
        self.execute_net_ids(Command::GetAllNets { trusted }).await
    }

    pub async fn specific_nets(&self, bearer: NetBearType) -> Result<Vec<NetId>, CoreError> {
        self.execute_net_ids(Command::GetSpecificNet { bearer }).await
    }

    pub async fn net_ids_by_ident(&self, ident: impl Into<String>) -> Result<Vec<NetId>, CoreError> {
        self.execute_net_ids(Command::GetNetIdsByIdent {
            ident: ident.into(),
        })
        .await
    }

    pub async fn supplier_id(
        &self,
        bearer: NetBearType,
        ident: impl Into<String>,
    ) -> Result<SupplierId, CoreError> {
        let command = Command::GetSupplierId {
            bearer,
            ident: ident.into(),
        };
        match self.execute(command).await? {
            CommandResult::SupplierId(id) => Ok(id),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn iface_name_by_type(
        &self,
        bearer: NetBearType,
        ident: impl Into<String>,
    ) -> Result<String, CoreError> {
        let command = Command::GetIfaceName {
            bearer,
            ident: ident.into(),
        };
        match self.execute(command).await? {
            CommandResult::Iface(name) => Ok(name),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn connection_properties(&self, net_id: NetId) -> Result<Arc<NetLinkInfo>, CoreError> {
        match self.execute(Command::GetConnectionProperties { net_id }).await? {
            CommandResult::LinkInfo(link) => Ok(link),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn net_capabilities(&self, net_id: NetId) -> Result<NetAllCapabilities, CoreError> {
        match self.execute(Command::GetNetCapabilities { net_id }).await? {
            CommandResult::Capabilities(caps) => Ok(caps),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn suppliers(&self) -> Result<Vec<SupplierSnapshot>, CoreError> {
        match self.execute(Command::ListSuppliers).await? {
            CommandResult::Suppliers(list) => Ok(list),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn requests(&self) -> Result<Vec<RequestSnapshot>, CoreError> {
        match self.execute(Command::ListRequests).await? {
            CommandResult::Requests(list) => Ok(list),
            other => Err(unexpected(&other)),
        }
    }
}

// ── Worker ───────────────────────────────────────────────────────

/// Apply tasks in arrival order until cancelled, then fail whatever is
/// still queued and tear the registry down.
async fn worker_task(
    mut registry: Registry,
    mut rx: mpsc::UnboundedReceiver<Task>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            task = rx.recv() => {
                let Some(task) = task else { break };
                registry.run(task);
            }
        }
    }

    rx.close();
    let mut dropped = 0_usize;
    while let Ok(task) = rx.try_recv() {
        if let Task::Command(envelope) = task {
            let _ = envelope.response_tx.send(Err(CoreError::ArbiterStopped));
        }
        dropped += 1;
    }
    debug!(dropped, "task queue drained");
    registry.shutdown();
}

fn unexpected(result: &CommandResult) -> CoreError {
    CoreError::Internal(format!("unexpected command result: {result:?}"))
}
