// netconn-core: Connectivity arbitration between network suppliers and consumers.

pub mod callback;
pub mod command;
pub mod config;
pub mod detection;
pub mod error;
pub mod model;
pub mod netsys;

mod activate;
mod arbiter;
mod network;
mod registry;
mod supplier;

// ── Primary re-exports ──────────────────────────────────────────────
pub use arbiter::Arbiter;
pub use callback::{
    NetConnCallback, NetDetectionCallback, NetFactoryResetCallback, NetSupplierCallback,
    SupplierCallbackError, TracingConnCallback,
};
pub use command::{Command, CommandResult};
pub use config::{ArbiterConfig, DetectionConfig, DualStackConfig, LinkLimits, RequestLimits};
pub use detection::DualStackOutcome;
pub use error::CoreError;
pub use netconn_probe::HttpProxy;
pub use netsys::{NetsysController, NetsysError, NetsysResult, TracingNetsys};
pub use supplier::{MAX_SCORE, NetConnState, POOR_QUALITY_PENALTY, VALIDATION_PENALTY};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    // Capabilities
    NetAllCapabilities, NetBearType, NetCap, NetCaps, NetSpecifier,
    // Identifiers
    DEFAULT_REQUEST_ID, NetHandle, NetId, RequestId, SupplierId,
    // Link and supplier state
    InetAddr, NetLinkInfo, NetSupplierInfo, Route,
    // Detection
    DetectionReport, DualStackProbeResult, NetDetectionStatus, ProbeRecord,
    // Events and snapshots
    ArbiterEvent, ArbiterState, CallbackType, RegisterType, RequestSnapshot, SupplierSnapshot,
};
