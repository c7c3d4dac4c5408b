// ── Registry snapshots ──
//
// Read-only views of registry state handed out by queries. Copies, so
// holding one never blocks the worker.

use serde::Serialize;
use strum::Display;

use super::capability::{NetBearType, NetCaps};
use super::detection::NetDetectionStatus;
use super::event::RegisterType;
use super::ids::{NetId, RequestId, SupplierId};

/// Lifecycle of the arbiter worker, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArbiterState {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// One registered supplier as the arbiter currently sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupplierSnapshot {
    pub supplier_id: SupplierId,
    pub net_id: NetId,
    pub bearer: NetBearType,
    pub ident: String,
    pub available: bool,
    /// Connection state name, e.g. `connected`.
    pub state: String,
    pub caps: NetCaps,
    pub score: u8,
    pub score_reason: &'static str,
    pub detection: NetDetectionStatus,
    pub is_default: bool,
    pub iface: String,
    pub requests: usize,
    pub serving: usize,
}

/// One registered request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestSnapshot {
    pub request_id: RequestId,
    pub uid: u32,
    pub register_type: RegisterType,
    pub ident: String,
    pub caps: NetCaps,
    pub served_by: Option<SupplierId>,
    pub frozen: bool,
}
