// ── Name resolution seam ──
//
// Probes pin their connection to explicitly resolved addresses when no
// proxy is in use. Resolution goes through `DnsResolver` so callers can
// substitute a per-network resolver (or a fixed table in tests).

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::error::Error;

/// Asynchronous host-name resolution.
pub trait DnsResolver: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, Error>>;
}

/// Resolver backed by the operating system (`getaddrinfo` via tokio).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl DnsResolver for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, Error>> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, 0))
                .await
                .map_err(|e| Error::Resolve {
                    domain: host.to_owned(),
                    reason: e.to_string(),
                })?;
            let mut ips: Vec<IpAddr> = Vec::new();
            for addr in addrs {
                if !ips.contains(&addr.ip()) {
                    ips.push(addr.ip());
                }
            }
            debug!(host, count = ips.len(), "resolved probe host");
            Ok(ips)
        })
    }
}

/// Fixed host table. Unknown hosts fail to resolve.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    table: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>, addrs: Vec<IpAddr>) -> Self {
        self.table.insert(host.into(), addrs);
        self
    }
}

impl DnsResolver for StaticResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, Error>> {
        let result = self
            .table
            .get(host)
            .cloned()
            .ok_or_else(|| Error::Resolve {
                domain: host.to_owned(),
                reason: "host not in static table".into(),
            });
        Box::pin(async move { result })
    }
}

// ── Family-split resolution ─────────────────────────────────────────

/// Addresses for one domain, split by family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAddrs {
    pub v4: Vec<IpAddr>,
    pub v6: Vec<IpAddr>,
}

impl ResolvedAddrs {
    pub fn from_addrs(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        let mut out = Self::default();
        out.extend(addrs);
        out
    }

    /// Append addresses, skipping ones already present.
    pub fn extend(&mut self, addrs: impl IntoIterator<Item = IpAddr>) {
        for addr in addrs {
            let list = if addr.is_ipv4() {
                &mut self.v4
            } else {
                &mut self.v6
            };
            if !list.contains(&addr) {
                list.push(addr);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Comma-joined address list for one family, as used in diagnostics.
    pub fn joined(list: &[IpAddr]) -> String {
        list.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Resolve `host` with an upper time bound.
pub async fn resolve_with_timeout(
    resolver: &dyn DnsResolver,
    host: &str,
    timeout: Duration,
) -> Result<Vec<IpAddr>, Error> {
    tokio::time::timeout(timeout, resolver.resolve(host))
        .await
        .map_err(|_| Error::ResolveTimeout {
            domain: host.to_owned(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })?
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn resolved_addrs_split_and_dedupe() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let mut addrs = ResolvedAddrs::from_addrs([v4, v6, v4]);
        addrs.extend([v6]);
        assert_eq!(addrs.v4, vec![v4]);
        assert_eq!(addrs.v6, vec![v6]);
        assert_eq!(ResolvedAddrs::joined(&[v4, v4]), "192.0.2.1,192.0.2.1");
    }

    #[tokio::test]
    async fn static_resolver_rejects_unknown_host() {
        let resolver = StaticResolver::new()
            .with_host("probe.test", vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert_eq!(resolver.resolve("probe.test").await.unwrap().len(), 1);
        let err = resolver.resolve("other.test").await.unwrap_err();
        assert!(err.is_resolve());
    }

    #[tokio::test]
    async fn resolve_with_timeout_passes_through() {
        let resolver = StaticResolver::new()
            .with_host("probe.test", vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        let addrs = resolve_with_timeout(&resolver, "probe.test", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
    }
}
