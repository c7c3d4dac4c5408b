// ── Network specifiers ──

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::capability::{NetBearType, NetCap, NetCaps};

/// Everything a network offers, or everything a request asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAllCapabilities {
    #[serde(default)]
    pub link_up_bandwidth_kbps: u32,
    #[serde(default)]
    pub link_down_bandwidth_kbps: u32,
    #[serde(default)]
    pub caps: NetCaps,
    #[serde(default)]
    pub bearer_types: BTreeSet<NetBearType>,
}

impl NetAllCapabilities {
    pub fn has_cap(&self, cap: NetCap) -> bool {
        self.caps.has(cap)
    }

    pub fn has_bearer(&self, bearer: NetBearType) -> bool {
        self.bearer_types.contains(&bearer)
    }
}

/// What a request wants: an optional identity plus capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetSpecifier {
    #[serde(default)]
    pub ident: String,
    #[serde(default)]
    pub capabilities: NetAllCapabilities,
}

impl NetSpecifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The specifier of the default request.
    pub fn internet() -> Self {
        Self::new().with_cap(NetCap::Internet).with_cap(NetCap::NotVpn)
    }

    pub fn with_cap(mut self, cap: NetCap) -> Self {
        self.capabilities.caps.insert(cap);
        self
    }

    pub fn with_bearer(mut self, bearer: NetBearType) -> Self {
        self.capabilities.bearer_types.insert(bearer);
        self
    }

    pub fn with_ident(mut self, ident: impl Into<String>) -> Self {
        self.ident = ident.into();
        self
    }

    pub fn caps(&self) -> NetCaps {
        self.capabilities.caps
    }
}
