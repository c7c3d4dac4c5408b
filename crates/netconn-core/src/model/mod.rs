// ── Domain model ──
//
// Plain data shared by the registry, the detection machinery and
// consumers. Nothing here talks to the network or the OS.

pub mod capability;
pub mod detection;
pub mod event;
pub mod ids;
pub mod link;
pub mod snapshot;
pub mod specifier;
pub mod supplier_info;

pub use capability::{FIRST_INVALID_CAP, NetBearType, NetCap, NetCaps};
pub use detection::{DetectionReport, DualStackProbeResult, NetDetectionStatus, ProbeRecord};
pub use event::{ArbiterEvent, CallbackType, RegisterType};
pub use ids::{DEFAULT_REQUEST_ID, LOCAL_NET_ID, NetHandle, NetId, RequestId, SupplierId};
pub use link::{InetAddr, NetLinkInfo, Route};
pub use snapshot::{ArbiterState, RequestSnapshot, SupplierSnapshot};
pub use specifier::{NetAllCapabilities, NetSpecifier};
pub use supplier_info::NetSupplierInfo;
