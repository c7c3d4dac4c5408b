// ── OS network programming seam ──
//
// The arbiter never touches the kernel directly. Everything it would
// program (networks, interfaces, addresses, routes, resolvers, MTU,
// default network) goes through `NetsysController`.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::info;

use crate::model::{InetAddr, NetId, Route};

/// A failed OS-level configuration call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed: {reason}")]
pub struct NetsysError {
    pub operation: String,
    pub reason: String,
}

impl NetsysError {
    pub fn new(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

pub type NetsysResult = Result<(), NetsysError>;

/// Programs network state into the operating system.
pub trait NetsysController: Send + Sync {
    fn create_physical_network(&self, net_id: NetId, internal: bool) -> NetsysResult;
    fn destroy_network(&self, net_id: NetId) -> NetsysResult;
    fn add_interface(&self, net_id: NetId, iface: &str) -> NetsysResult;
    fn remove_interface(&self, net_id: NetId, iface: &str) -> NetsysResult;
    fn add_address(&self, net_id: NetId, iface: &str, addr: &InetAddr) -> NetsysResult;
    fn remove_address(&self, net_id: NetId, iface: &str, addr: &InetAddr) -> NetsysResult;
    fn add_route(&self, net_id: NetId, route: &Route) -> NetsysResult;
    fn remove_route(&self, net_id: NetId, route: &Route) -> NetsysResult;
    fn set_resolver_config(&self, net_id: NetId, servers: &[IpAddr], domains: &[String])
    -> NetsysResult;
    fn set_mtu(&self, iface: &str, mtu: u16) -> NetsysResult;
    fn set_tcp_buffer_sizes(&self, sizes: &str) -> NetsysResult;
    fn set_default_network(&self, net_id: NetId) -> NetsysResult;
    fn clear_default_network(&self) -> NetsysResult;
    fn flush_dns_cache(&self, net_id: NetId) -> NetsysResult;
    fn update_iface_stats_ident(&self, iface: &str, ident: &str) -> NetsysResult;
}

// ── TracingNetsys ───────────────────────────────────────────────────

/// Logs every call and succeeds. Used when running without OS access.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNetsys;

impl NetsysController for TracingNetsys {
    fn create_physical_network(&self, net_id: NetId, internal: bool) -> NetsysResult {
        info!(%net_id, internal, "netsys: create physical network");
        Ok(())
    }

    fn destroy_network(&self, net_id: NetId) -> NetsysResult {
        info!(%net_id, "netsys: destroy network");
        Ok(())
    }

    fn add_interface(&self, net_id: NetId, iface: &str) -> NetsysResult {
        info!(%net_id, iface, "netsys: add interface");
        Ok(())
    }

    fn remove_interface(&self, net_id: NetId, iface: &str) -> NetsysResult {
        info!(%net_id, iface, "netsys: remove interface");
        Ok(())
    }

    fn add_address(&self, net_id: NetId, iface: &str, addr: &InetAddr) -> NetsysResult {
        info!(%net_id, iface, %addr, "netsys: add address");
        Ok(())
    }

    fn remove_address(&self, net_id: NetId, iface: &str, addr: &InetAddr) -> NetsysResult {
        info!(%net_id, iface, %addr, "netsys: remove address");
        Ok(())
    }

    fn add_route(&self, net_id: NetId, route: &Route) -> NetsysResult {
        info!(%net_id, iface = %route.iface, dest = %route.destination, via = %route.next_hop(), "netsys: add route");
        Ok(())
    }

    fn remove_route(&self, net_id: NetId, route: &Route) -> NetsysResult {
        info!(%net_id, iface = %route.iface, dest = %route.destination, "netsys: remove route");
        Ok(())
    }

    fn set_resolver_config(
        &self,
        net_id: NetId,
        servers: &[IpAddr],
        domains: &[String],
    ) -> NetsysResult {
        info!(%net_id, servers = ?servers, domains = ?domains, "netsys: set resolver config");
        Ok(())
    }

    fn set_mtu(&self, iface: &str, mtu: u16) -> NetsysResult {
        info!(iface, mtu, "netsys: set mtu");
        Ok(())
    }

    fn set_tcp_buffer_sizes(&self, sizes: &str) -> NetsysResult {
        info!(sizes, "netsys: set tcp buffer sizes");
        Ok(())
    }

    fn set_default_network(&self, net_id: NetId) -> NetsysResult {
        info!(%net_id, "netsys: set default network");
        Ok(())
    }

    fn clear_default_network(&self) -> NetsysResult {
        info!("netsys: clear default network");
        Ok(())
    }

    fn flush_dns_cache(&self, net_id: NetId) -> NetsysResult {
        info!(%net_id, "netsys: flush dns cache");
        Ok(())
    }

    fn update_iface_stats_ident(&self, iface: &str, ident: &str) -> NetsysResult {
        info!(iface, ident, "netsys: update stats ident");
        Ok(())
    }
}

// ── RecordingNetsys ─────────────────────────────────────────────────

/// Records each call as a one-line string and fails the operations it
/// was told to fail.
#[derive(Debug, Default)]
pub struct RecordingNetsys {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl RecordingNetsys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to `operation` (e.g. `"add_route"`) fail.
    pub fn fail(&self, operation: &'static str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls whose operation name equals `operation`.
    pub fn calls_to(&self, operation: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split(' ').next() == Some(operation))
            .collect()
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn record(&self, operation: &'static str, detail: String) -> NetsysResult {
        let line = if detail.is_empty() {
            operation.to_owned()
        } else {
            format!("{operation} {detail}")
        };
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(operation);
        if failing {
            Err(NetsysError::new(operation, "injected failure"))
        } else {
            Ok(())
        }
    }
}

impl NetsysController for RecordingNetsys {
    fn create_physical_network(&self, net_id: NetId, internal: bool) -> NetsysResult {
        self.record("create_physical_network", format!("{net_id} internal={internal}"))
    }

    fn destroy_network(&self, net_id: NetId) -> NetsysResult {
        self.record("destroy_network", net_id.to_string())
    }

    fn add_interface(&self, net_id: NetId, iface: &str) -> NetsysResult {
        self.record("add_interface", format!("{net_id} {iface}"))
    }

    fn remove_interface(&self, net_id: NetId, iface: &str) -> NetsysResult {
        self.record("remove_interface", format!("{net_id} {iface}"))
    }

    fn add_address(&self, net_id: NetId, iface: &str, addr: &InetAddr) -> NetsysResult {
        self.record("add_address", format!("{net_id} {iface} {addr}"))
    }

    fn remove_address(&self, net_id: NetId, iface: &str, addr: &InetAddr) -> NetsysResult {
        self.record("remove_address", format!("{net_id} {iface} {addr}"))
    }

    fn add_route(&self, net_id: NetId, route: &Route) -> NetsysResult {
        self.record(
            "add_route",
            format!(
                "{net_id} {} {} {}",
                route.iface,
                route.destination,
                route.next_hop()
            )
            .trim_end()
            .to_owned(),
        )
    }

    fn remove_route(&self, net_id: NetId, route: &Route) -> NetsysResult {
        self.record(
            "remove_route",
            format!(
                "{net_id} {} {} {}",
                route.iface,
                route.destination,
                route.next_hop()
            )
            .trim_end()
            .to_owned(),
        )
    }

    fn set_resolver_config(
        &self,
        net_id: NetId,
        servers: &[IpAddr],
        _domains: &[String],
    ) -> NetsysResult {
        let servers: Vec<String> = servers.iter().map(ToString::to_string).collect();
        self.record("set_resolver_config", format!("{net_id} {}", servers.join(",")))
    }

    fn set_mtu(&self, iface: &str, mtu: u16) -> NetsysResult {
        self.record("set_mtu", format!("{iface} {mtu}"))
    }

    fn set_tcp_buffer_sizes(&self, sizes: &str) -> NetsysResult {
        self.record("set_tcp_buffer_sizes", sizes.to_owned())
    }

    fn set_default_network(&self, net_id: NetId) -> NetsysResult {
        self.record("set_default_network", net_id.to_string())
    }

    fn clear_default_network(&self) -> NetsysResult {
        self.record("clear_default_network", String::new())
    }

    fn flush_dns_cache(&self, net_id: NetId) -> NetsysResult {
        self.record("flush_dns_cache", net_id.to_string())
    }

    fn update_iface_stats_ident(&self, iface: &str, ident: &str) -> NetsysResult {
        self.record("update_iface_stats_ident", format!("{iface} {ident}"))
    }
}
