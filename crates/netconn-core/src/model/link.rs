// ── Link configuration ──
//
// What a supplier pushes when its interface comes up or changes: the
// interface, its addresses and routes, resolvers, MTU and an optional
// per-network proxy.

use std::fmt;
use std::net::IpAddr;

use netconn_probe::HttpProxy;
use serde::{Deserialize, Serialize};

/// An address with prefix length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InetAddr {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl InetAddr {
    pub fn new(address: IpAddr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// A route on the network's interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub iface: String,
    pub destination: InetAddr,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
}

impl Route {
    /// Whether the route needs no next hop (directly connected subnet).
    pub fn is_direct(&self) -> bool {
        self.gateway.is_none_or(|gw| gw.is_unspecified())
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix_len == 0 && self.destination.address.is_unspecified()
    }

    /// Next hop as a string; empty for direct routes.
    pub fn next_hop(&self) -> String {
        match self.gateway {
            Some(gw) if !gw.is_unspecified() => gw.to_string(),
            _ => String::new(),
        }
    }
}

/// Full link description for one network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetLinkInfo {
    pub iface_name: String,
    #[serde(default)]
    pub ident: String,
    #[serde(default)]
    pub addresses: Vec<InetAddr>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub mtu: u16,
    /// Comma-separated rmem/wmem triples, applied verbatim.
    #[serde(default)]
    pub tcp_buffer_sizes: String,
    #[serde(default)]
    pub http_proxy: Option<HttpProxy>,
}

impl NetLinkInfo {
    pub fn new(iface_name: impl Into<String>) -> Self {
        Self {
            iface_name: iface_name.into(),
            ..Self::default()
        }
    }

    /// A usable per-network proxy, if one was pushed.
    pub fn proxy(&self) -> Option<&HttpProxy> {
        self.http_proxy.as_ref().filter(|p| !p.is_empty())
    }

    /// Whether both link infos carry the same address set, ignoring order.
    pub fn same_addresses(&self, other: &Self) -> bool {
        let mut a: Vec<_> = self.addresses.iter().collect();
        let mut b: Vec<_> = other.addresses.iter().collect();
        a.sort();
        b.sort();
        a == b
    }
}
