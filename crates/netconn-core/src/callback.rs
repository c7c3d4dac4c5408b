// ── Consumer and supplier callbacks ──
//
// Callbacks are invoked synchronously from the arbiter worker and must
// not block. A callback that lives in another process or task exposes a
// liveness token; once it is cancelled the arbiter cleans up exactly as
// if the callback had been unregistered.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::model::{NetAllCapabilities, NetCaps, NetDetectionStatus, NetHandle, NetId, NetLinkInfo};

/// Connectivity notifications delivered to one consumer request.
pub trait NetConnCallback: Send + Sync {
    fn net_available(&self, net: NetHandle);
    fn net_capabilities_change(&self, net: NetHandle, caps: &NetAllCapabilities);
    fn net_connection_properties_change(&self, net: NetHandle, link: &NetLinkInfo);
    fn net_lost(&self, net: NetHandle);
    fn net_unavailable(&self);
    fn net_block_status_change(&self, net: NetHandle, blocked: bool);

    /// Cancelled when the remote end of this callback dies.
    fn liveness(&self) -> Option<CancellationToken> {
        None
    }
}

/// A provider call-out failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("supplier callback failed: {0}")]
pub struct SupplierCallbackError(pub String);

/// Connect / disconnect call-outs to a network provider.
pub trait NetSupplierCallback: Send + Sync {
    fn request_network(&self, ident: &str, caps: NetCaps) -> Result<(), SupplierCallbackError>;
    fn release_network(&self, ident: &str, caps: NetCaps) -> Result<(), SupplierCallbackError>;

    fn liveness(&self) -> Option<CancellationToken> {
        None
    }
}

/// Per-network detection verdict listener.
pub trait NetDetectionCallback: Send + Sync {
    fn on_detection_result(&self, net_id: NetId, status: NetDetectionStatus, redirect_url: &str);
}

/// Told when the device's network settings are reset to factory state.
pub trait NetFactoryResetCallback: Send + Sync {
    fn on_net_factory_reset(&self);

    fn liveness(&self) -> Option<CancellationToken> {
        None
    }
}

/// Identity of a shared callback object.
pub(crate) fn same_callback<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::ptr_eq(a, b)
}

// ── Logging implementations ─────────────────────────────────────────

/// Logs every notification at info level.
#[derive(Debug, Clone, Default)]
pub struct TracingConnCallback {
    pub label: String,
}

impl TracingConnCallback {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl NetConnCallback for TracingConnCallback {
    fn net_available(&self, net: NetHandle) {
        info!(label = %self.label, %net, "net available");
    }

    fn net_capabilities_change(&self, net: NetHandle, caps: &NetAllCapabilities) {
        info!(label = %self.label, %net, caps = %caps.caps, "net capabilities changed");
    }

    fn net_connection_properties_change(&self, net: NetHandle, link: &NetLinkInfo) {
        info!(label = %self.label, %net, iface = %link.iface_name, "net connection properties changed");
    }

    fn net_lost(&self, net: NetHandle) {
        info!(label = %self.label, %net, "net lost");
    }

    fn net_unavailable(&self) {
        info!(label = %self.label, "net unavailable");
    }

    fn net_block_status_change(&self, net: NetHandle, blocked: bool) {
        info!(label = %self.label, %net, blocked, "net block status changed");
    }
}

// ── Recording implementations ───────────────────────────────────────

/// One notification as seen by a [`RecordingConnCallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    Available(NetHandle),
    CapabilitiesChange(NetHandle, NetAllCapabilities),
    ConnectionPropertiesChange(NetHandle, NetLinkInfo),
    Lost(NetHandle),
    Unavailable,
    BlockStatusChange(NetHandle, bool),
}

impl ConnEvent {
    /// Short name without payload, handy for order assertions.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Available(_) => "available",
            Self::CapabilitiesChange(..) => "capabilities",
            Self::ConnectionPropertiesChange(..) => "properties",
            Self::Lost(_) => "lost",
            Self::Unavailable => "unavailable",
            Self::BlockStatusChange(..) => "block",
        }
    }
}

/// Keeps every notification in arrival order.
#[derive(Debug, Default)]
pub struct RecordingConnCallback {
    events: Mutex<Vec<ConnEvent>>,
    liveness: Option<CancellationToken>,
}

impl RecordingConnCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A callback whose death can be simulated with [`kill`](Self::kill).
    pub fn with_liveness() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            liveness: Some(CancellationToken::new()),
        })
    }

    pub fn kill(&self) {
        if let Some(token) = &self.liveness {
            token.cancel();
        }
    }

    pub fn events(&self) -> Vec<ConnEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(ConnEvent::name).collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push(&self, event: ConnEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl NetConnCallback for RecordingConnCallback {
    fn net_available(&self, net: NetHandle) {
        self.push(ConnEvent::Available(net));
    }

    fn net_capabilities_change(&self, net: NetHandle, caps: &NetAllCapabilities) {
        self.push(ConnEvent::CapabilitiesChange(net, caps.clone()));
    }

    fn net_connection_properties_change(&self, net: NetHandle, link: &NetLinkInfo) {
        self.push(ConnEvent::ConnectionPropertiesChange(net, link.clone()));
    }

    fn net_lost(&self, net: NetHandle) {
        self.push(ConnEvent::Lost(net));
    }

    fn net_unavailable(&self) {
        self.push(ConnEvent::Unavailable);
    }

    fn net_block_status_change(&self, net: NetHandle, blocked: bool) {
        self.push(ConnEvent::BlockStatusChange(net, blocked));
    }

    fn liveness(&self) -> Option<CancellationToken> {
        self.liveness.clone()
    }
}

/// A provider call-out as seen by a [`RecordingSupplierCallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupplierCall {
    Request { ident: String, caps: NetCaps },
    Release { ident: String, caps: NetCaps },
}

/// Records provider call-outs and always succeeds.
#[derive(Debug, Default)]
pub struct RecordingSupplierCallback {
    calls: Mutex<Vec<SupplierCall>>,
    liveness: Option<CancellationToken>,
}

impl RecordingSupplierCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_liveness() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            liveness: Some(CancellationToken::new()),
        })
    }

    pub fn kill(&self) {
        if let Some(token) = &self.liveness {
            token.cancel();
        }
    }

    pub fn calls(&self) -> Vec<SupplierCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn requests(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, SupplierCall::Request { .. }))
            .count()
    }

    pub fn releases(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, SupplierCall::Release { .. }))
            .count()
    }

    fn push(&self, call: SupplierCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl NetSupplierCallback for RecordingSupplierCallback {
    fn request_network(&self, ident: &str, caps: NetCaps) -> Result<(), SupplierCallbackError> {
        self.push(SupplierCall::Request {
            ident: ident.to_owned(),
            caps,
        });
        Ok(())
    }

    fn release_network(&self, ident: &str, caps: NetCaps) -> Result<(), SupplierCallbackError> {
        self.push(SupplierCall::Release {
            ident: ident.to_owned(),
            caps,
        });
        Ok(())
    }

    fn liveness(&self) -> Option<CancellationToken> {
        self.liveness.clone()
    }
}

/// Counts factory reset notifications.
#[derive(Debug, Default)]
pub struct RecordingFactoryResetCallback {
    resets: AtomicUsize,
    liveness: Option<CancellationToken>,
}

impl RecordingFactoryResetCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_liveness() -> Arc<Self> {
        Arc::new(Self {
            resets: AtomicUsize::new(0),
            liveness: Some(CancellationToken::new()),
        })
    }

    pub fn kill(&self) {
        if let Some(token) = &self.liveness {
            token.cancel();
        }
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl NetFactoryResetCallback for RecordingFactoryResetCallback {
    fn on_net_factory_reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn liveness(&self) -> Option<CancellationToken> {
        self.liveness.clone()
    }
}
