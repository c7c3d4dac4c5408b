// ── Identifiers ──
//
// Supplier, network and request ids are plain integers on the wire.
// Newtypes keep them from being mixed up inside the registry.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub const fn get(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }
    };
}

id_newtype!(
    /// Registry-assigned id of a network supplier.
    SupplierId
);
id_newtype!(
    /// Id of a network inside the routing layer.
    NetId
);
id_newtype!(
    /// Id of a registered callback / network request.
    RequestId
);

/// The handle consumers hold for a network is its net id.
pub type NetHandle = NetId;

/// The always-present request standing for "give me the internet".
pub const DEFAULT_REQUEST_ID: RequestId = RequestId(0);

/// Net id reserved for directly-connected routes shared across networks.
pub const LOCAL_NET_ID: NetId = NetId(99);

pub(crate) const SUPPLIER_ID_BASE: u32 = 0x03EB;
pub(crate) const MIN_NET_ID: u32 = 100;
pub(crate) const MAX_NET_ID: u32 = 0xFFFF;
pub(crate) const MIN_INTERNAL_NET_ID: u32 = 1;
pub(crate) const MAX_INTERNAL_NET_ID: u32 = 50;
pub(crate) const MIN_REQUEST_ID: u32 = 1;
pub(crate) const MAX_REQUEST_ID: u32 = 0x7FFF_FFFF;

// ── Wrapping allocator ──────────────────────────────────────────────

/// Hands out ids from `[min, max]`, wrapping around and skipping ids that
/// are still in use.
#[derive(Debug, Clone)]
pub(crate) struct IdAllocator {
    min: u32,
    max: u32,
    last: Option<u32>,
}

impl IdAllocator {
    pub(crate) const fn new(min: u32, max: u32) -> Self {
        Self {
            min,
            max,
            last: None,
        }
    }

    /// Next free id, or `None` when every id in range is taken.
    pub(crate) fn next(&mut self, in_use: impl Fn(u32) -> bool) -> Option<u32> {
        let span = u64::from(self.max - self.min) + 1;
        let mut candidate = match self.last {
            Some(last) if last < self.max => last + 1,
            _ => self.min,
        };
        let mut tried = 0_u64;
        while tried < span {
            if !in_use(candidate) {
                self.last = Some(candidate);
                return Some(candidate);
            }
            candidate = if candidate >= self.max {
                self.min
            } else {
                candidate + 1
            };
            tried += 1;
        }
        None
    }
}
