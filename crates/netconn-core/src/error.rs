// ── Core error types ──
//
// Errors returned synchronously from arbiter operations. Probe failures
// during detection never surface here: the monitor folds them into a
// failed verdict. The `From<netconn_probe::Error>` impl only covers
// one-shot probe operations such as the dual-stack probe.

use thiserror::Error;

use crate::model::{NetId, RequestId, SupplierId};

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Parameter errors ─────────────────────────────────────────────
    #[error("Invalid bearer type: {bearer}")]
    InvalidBearer { bearer: u32 },

    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    // ── Not-found errors ─────────────────────────────────────────────
    #[error("Supplier not found: {supplier_id}")]
    SupplierNotFound { supplier_id: SupplierId },

    #[error("Network not found: {net_id}")]
    NetworkNotFound { net_id: NetId },

    #[error("No supplier registered for {bearer} ident '{ident}'")]
    SupplierNotRegistered { bearer: String, ident: String },

    #[error("Callback not registered")]
    CallbackNotFound,

    #[error("Request not found: {request_id}")]
    RequestNotFound { request_id: RequestId },

    // ── Conflict and quota errors ────────────────────────────────────
    #[error("Callback already registered as request {request_id}")]
    DuplicateCallback { request_id: RequestId },

    #[error("Too many outstanding requests (limit {limit})")]
    TooManyRequests { limit: usize },

    #[error("UID {uid} exceeded its request quota (limit {limit})")]
    UidRequestQuotaExceeded { uid: u32, limit: usize },

    #[error("Requests for {capability} are disabled by policy")]
    PolicyDisabled { capability: String },

    #[error("No free network id in the {range} range")]
    NetIdExhausted { range: &'static str },

    // ── Detection errors ─────────────────────────────────────────────
    #[error("A dual-stack probe is already running on network {net_id}")]
    ProbeInProgress { net_id: NetId },

    #[error("Probe failed: {0}")]
    Probe(#[from] netconn_probe::Error),

    // ── Link programming errors ──────────────────────────────────────
    #[error("Failed to apply {operation}: {reason}")]
    LinkApply { operation: String, reason: String },

    // ── Service state errors ─────────────────────────────────────────
    #[error("Service not ready: {component} is not initialized")]
    ServiceNotReady { component: &'static str },

    #[error("Arbiter is not running")]
    ArbiterStopped,

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether this is a not-found class error.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SupplierNotFound { .. }
                | Self::NetworkNotFound { .. }
                | Self::SupplierNotRegistered { .. }
                | Self::CallbackNotFound
                | Self::RequestNotFound { .. }
        )
    }
}
