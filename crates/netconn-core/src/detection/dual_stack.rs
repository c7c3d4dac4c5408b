// ── Dual-stack probe ──
//
// Tests the IPv4 and IPv6 stacks of one network independently by pinning
// HTTP and HTTPS probes to each family's resolved addresses.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use netconn_probe::resolve::resolve_with_timeout;
use netconn_probe::{DnsResolver, NetHttpProbe, ProbeTarget, ProbeType, ResolvedAddrs};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::latch::CountDownLatch;
use super::probe_thread::{ProbeLatches, ProbeThread};
use crate::config::DualStackConfig;
use crate::error::CoreError;
use crate::model::{DualStackProbeResult, NetId};

/// What one dual-stack run found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DualStackOutcome {
    pub result: DualStackProbeResult,
    pub v4: Vec<IpAddr>,
    pub v6: Vec<IpAddr>,
    /// Fastest successful answer per family.
    #[serde(skip)]
    pub v4_elapsed: Option<Duration>,
    #[serde(skip)]
    pub v6_elapsed: Option<Duration>,
}

impl DualStackOutcome {
    fn failed(addrs: ResolvedAddrs) -> Self {
        Self {
            result: DualStackProbeResult::Fail,
            v4: addrs.v4,
            v6: addrs.v6,
            v4_elapsed: None,
            v6_elapsed: None,
        }
    }
}

/// Per-network dual-stack prober. At most one run is in flight.
pub struct DualStackProbe {
    net_id: NetId,
    probe: NetHttpProbe,
    resolver: Arc<dyn DnsResolver>,
    target: ProbeTarget,
    config: DualStackConfig,
    in_flight: AtomicBool,
}

impl std::fmt::Debug for DualStackProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualStackProbe")
            .field("net_id", &self.net_id)
            .field("target", &self.target)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Clears the in-flight flag however the run ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DualStackProbe {
    pub fn new(
        net_id: NetId,
        probe: NetHttpProbe,
        resolver: Arc<dyn DnsResolver>,
        target: ProbeTarget,
        config: DualStackConfig,
    ) -> Self {
        Self {
            net_id,
            probe,
            resolver,
            target,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one probe, waiting at most `timeout` for the four fetches.
    ///
    /// Fails fast with [`CoreError::ProbeInProgress`] when a run is
    /// already in flight.
    pub async fn run(&self, timeout: Duration) -> Result<DualStackOutcome, CoreError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CoreError::ProbeInProgress {
                net_id: self.net_id,
            });
        }
        let _guard = InFlight(&self.in_flight);

        let addrs = self.resolve().await;
        if addrs.v4.is_empty() || addrs.v6.is_empty() {
            info!(
                net_id = %self.net_id,
                v4 = %ResolvedAddrs::joined(&addrs.v4),
                v6 = %ResolvedAddrs::joined(&addrs.v6),
                "dual-stack probe missing an address family"
            );
            return Ok(DualStackOutcome::failed(addrs));
        }

        let batch = CountDownLatch::new(4);
        let spawn = |probe_type, pinned: &[IpAddr], pair: &CountDownLatch| {
            ProbeThread::spawn(
                self.probe.clone(),
                probe_type,
                self.target.clone(),
                None,
                Some(pinned.to_vec()),
                ProbeLatches {
                    pair: pair.clone(),
                    batch: batch.clone(),
                    release_on_conclusive: false,
                },
            )
        };
        let v4_pair = CountDownLatch::new(2);
        let v6_pair = CountDownLatch::new(2);
        let v4 = [
            spawn(ProbeType::Http, addrs.v4.as_slice(), &v4_pair),
            spawn(ProbeType::Https, addrs.v4.as_slice(), &v4_pair),
        ];
        let v6 = [
            spawn(ProbeType::Http, addrs.v6.as_slice(), &v6_pair),
            spawn(ProbeType::Https, addrs.v6.as_slice(), &v6_pair),
        ];

        if !batch.wait(timeout).await {
            debug!(net_id = %self.net_id, "dual-stack probe timed out, using partial results");
        }
        for thread in v4.iter().chain(v6.iter()) {
            thread.abort();
        }

        let v4_elapsed = fastest_success(&v4);
        let v6_elapsed = fastest_success(&v6);
        let portal = v4[0].is_need_portal() || v6[0].is_need_portal();
        let result = classify(
            v4_elapsed,
            v6_elapsed,
            portal,
            self.config.success_threshold,
        );
        info!(net_id = %self.net_id, %result, "dual-stack probe finished");

        Ok(DualStackOutcome {
            result,
            v4: addrs.v4,
            v6: addrs.v6,
            v4_elapsed,
            v6_elapsed,
        })
    }

    async fn resolve(&self) -> ResolvedAddrs {
        let mut addrs = ResolvedAddrs::default();
        let domain = self.target.http_url.host_str().unwrap_or_default().to_owned();
        for host in [domain.as_str(), self.config.backup_domain.as_str()] {
            if host.is_empty() {
                continue;
            }
            match resolve_with_timeout(self.resolver.as_ref(), host, self.config.dns_timeout).await
            {
                Ok(found) => addrs.extend(found),
                Err(e) => warn!(net_id = %self.net_id, host, error = %e, "dual-stack resolve failed"),
            }
        }
        addrs
    }
}

fn fastest_success(threads: &[ProbeThread]) -> Option<Duration> {
    threads
        .iter()
        .filter(|t| t.is_successful())
        .filter_map(|t| t.result().map(|r| r.elapsed))
        .min()
}

/// Both families beat a portal; a portal beats a lone fast family.
fn classify(
    v4: Option<Duration>,
    v6: Option<Duration>,
    portal: bool,
    threshold: Duration,
) -> DualStackProbeResult {
    match (v4, v6) {
        (Some(_), Some(_)) => DualStackProbeResult::Success,
        _ if portal => DualStackProbeResult::Portal,
        (Some(d), None) if d < threshold => DualStackProbeResult::Ipv4Only,
        (None, Some(d)) if d < threshold => DualStackProbeResult::Ipv6Only,
        _ => DualStackProbeResult::Fail,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use netconn_probe::StaticResolver;

    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn classify_prefers_both_families() {
        let t = ms(2000);
        assert_eq!(
            classify(Some(ms(10)), Some(ms(5000)), true, t),
            DualStackProbeResult::Success
        );
        assert_eq!(classify(None, None, true, t), DualStackProbeResult::Portal);
        assert_eq!(
            classify(Some(ms(100)), None, false, t),
            DualStackProbeResult::Ipv4Only
        );
        assert_eq!(
            classify(None, Some(ms(100)), false, t),
            DualStackProbeResult::Ipv6Only
        );
        assert_eq!(
            classify(Some(ms(2500)), None, false, t),
            DualStackProbeResult::Fail
        );
    }

    #[tokio::test]
    async fn missing_family_fails_without_probing() {
        let resolver = StaticResolver::new()
            .with_host("probe.test", vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);
        let probe = DualStackProbe::new(
            NetId(100),
            NetHttpProbe::with_defaults(100),
            Arc::new(resolver),
            ProbeTarget::parse("http://probe.test/generate_204", "https://probe.test/generate_204")
                .unwrap(),
            DualStackConfig {
                backup_domain: String::new(),
                ..DualStackConfig::default()
            },
        );
        let outcome = probe.run(ms(100)).await.unwrap();
        assert_eq!(outcome.result, DualStackProbeResult::Fail);
        assert_eq!(outcome.v4.len(), 1);
        assert!(outcome.v6.is_empty());
        assert!(!probe.is_running());
    }

    #[test]
    fn resolved_lists_merge_both_domains() {
        let mut addrs = ResolvedAddrs::from_addrs([IpAddr::V6(Ipv6Addr::LOCALHOST)]);
        addrs.extend([IpAddr::V6(Ipv6Addr::LOCALHOST), IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert_eq!(addrs.v4.len(), 1);
        assert_eq!(addrs.v6.len(), 1);
    }
}
