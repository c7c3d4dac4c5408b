// ── Events and callback kinds ──

use std::sync::Arc;

use netconn_probe::HttpProxy;
use serde::Serialize;
use strum::Display;

use super::capability::NetBearType;
use super::detection::DetectionReport;
use super::ids::{NetId, SupplierId};

/// How a request was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    /// Persistent listener; survives its availability timeout.
    Register,
    /// On-demand request; removed when its timeout fires unsatisfied.
    Request,
}

/// The last consumer-visible transition delivered to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CallbackType {
    Available,
    Lost,
    UpdateCap,
    UpdateLink,
    BlockStatus,
    Unavailable,
}

/// Service-wide notifications, broadcast to every subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArbiterEvent {
    DefaultNetworkChanged {
        previous: Option<NetId>,
        current: Option<NetId>,
    },
    AirplaneModeChanged {
        enabled: bool,
    },
    GlobalHttpProxyChanged {
        proxy: Option<HttpProxy>,
    },
    Detection(Arc<DetectionReport>),
    LinkApplyFailed {
        net_id: NetId,
        operation: String,
        reason: String,
    },
    SupplierRegistered {
        supplier_id: SupplierId,
        bearer: NetBearType,
        ident: String,
    },
    SupplierUnregistered {
        supplier_id: SupplierId,
    },
}
