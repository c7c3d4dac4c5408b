// One probe fetch on its own task, published through two latches.

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use netconn_probe::{
    HttpProxy, NetHttpProbe, ProbeOptions, ProbeOutcome, ProbeResult, ProbeScheme, ProbeTarget,
    ProbeType,
};
use tokio::task::JoinHandle;
use tracing::warn;

use super::latch::CountDownLatch;
use crate::model::ProbeRecord;

/// The latches a probe thread counts down when it finishes.
#[derive(Debug, Clone)]
pub struct ProbeLatches {
    /// Scoped to one primary/fallback pairing.
    pub pair: CountDownLatch,
    /// Scoped to the whole batch.
    pub batch: CountDownLatch,
    /// Drain both latches on a conclusive answer.
    pub release_on_conclusive: bool,
}

/// A detached probe and the slot its outcome lands in.
#[derive(Debug)]
pub struct ProbeThread {
    probe_type: ProbeType,
    target: ProbeTarget,
    proxied: bool,
    outcome: Arc<OnceLock<ProbeOutcome>>,
    handle: JoinHandle<()>,
}

impl ProbeThread {
    pub fn spawn(
        probe: NetHttpProbe,
        probe_type: ProbeType,
        target: ProbeTarget,
        proxy: Option<HttpProxy>,
        pinned: Option<Vec<IpAddr>>,
        latches: ProbeLatches,
    ) -> Self {
        let outcome = Arc::new(OnceLock::new());
        let proxied = proxy.is_some();
        let handle = tokio::spawn(run(
            probe,
            probe_type,
            target.clone(),
            proxy,
            pinned,
            latches,
            Arc::clone(&outcome),
        ));
        Self {
            probe_type,
            target,
            proxied,
            outcome,
            handle,
        }
    }

    pub fn probe_type(&self) -> ProbeType {
        self.probe_type
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Result for this thread's own scheme, once it has finished.
    pub fn result(&self) -> Option<&ProbeResult> {
        let outcome = self.outcome.get()?;
        if self.probe_type.has_http() {
            outcome.http.as_ref()
        } else {
            outcome.https.as_ref()
        }
    }

    pub fn is_successful(&self) -> bool {
        self.result().is_some_and(ProbeResult::is_successful)
    }

    pub fn is_need_portal(&self) -> bool {
        self.result().is_some_and(ProbeResult::is_need_portal)
    }

    pub fn record(&self) -> Option<ProbeRecord> {
        let result = self.result()?;
        let url = match result.scheme {
            ProbeScheme::Http => &self.target.http_url,
            ProbeScheme::Https => &self.target.https_url,
        };
        Some(ProbeRecord {
            probe_type: self.probe_type,
            scheme: result.scheme,
            url: url.to_string(),
            code: result.code,
            elapsed: result.elapsed,
            proxied: self.proxied,
        })
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn run(
    probe: NetHttpProbe,
    probe_type: ProbeType,
    target: ProbeTarget,
    proxy: Option<HttpProxy>,
    pinned: Option<Vec<IpAddr>>,
    latches: ProbeLatches,
    slot: Arc<OnceLock<ProbeOutcome>>,
) {
    let opts = ProbeOptions {
        proxy: proxy.as_ref(),
        pinned: pinned.as_deref(),
    };
    let outcome = match probe.send_probe(probe_type, &target, opts).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // Could not even send: counts as failed, logged apart.
            warn!(net_id = probe.net_id(), %probe_type, error = %e, "probe not sent");
            let _ = slot.set(unsent(probe_type));
            latches.pair.count_down();
            latches.batch.count_down();
            return;
        }
    };

    let conclusive = is_conclusive(probe_type, &outcome);
    let _ = slot.set(outcome);
    if conclusive && latches.release_on_conclusive {
        latches.pair.release();
        latches.batch.release();
    }
    latches.pair.count_down();
    latches.batch.count_down();
}

/// HTTP portal answers and HTTPS successes settle a batch early. A plain
/// HTTP success does not: it is the easiest answer to spoof.
fn is_conclusive(probe_type: ProbeType, outcome: &ProbeOutcome) -> bool {
    match probe_type {
        ProbeType::Http | ProbeType::HttpFallback => outcome
            .http
            .as_ref()
            .is_some_and(ProbeResult::is_need_portal),
        ProbeType::Https | ProbeType::HttpsFallback => outcome
            .https
            .as_ref()
            .is_some_and(ProbeResult::is_successful),
        ProbeType::HttpAndHttps => false,
    }
}

fn unsent(probe_type: ProbeType) -> ProbeOutcome {
    let no_response = |scheme| ProbeResult::no_response(scheme, std::time::Duration::ZERO);
    ProbeOutcome {
        http: probe_type
            .has_http()
            .then(|| no_response(ProbeScheme::Http)),
        https: probe_type
            .has_https()
            .then(|| no_response(ProbeScheme::Https)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn outcome(http: Option<u16>, https: Option<u16>) -> ProbeOutcome {
        ProbeOutcome {
            http: http.map(|c| ProbeResult::with_code(ProbeScheme::Http, c)),
            https: https.map(|c| ProbeResult::with_code(ProbeScheme::Https, c)),
        }
    }

    #[test]
    fn http_portal_is_conclusive() {
        assert!(is_conclusive(ProbeType::Http, &outcome(Some(302), None)));
        assert!(is_conclusive(ProbeType::HttpFallback, &outcome(Some(302), None)));
    }

    #[test]
    fn http_success_is_not_conclusive() {
        assert!(!is_conclusive(ProbeType::Http, &outcome(Some(204), None)));
    }

    #[test]
    fn https_success_is_conclusive() {
        assert!(is_conclusive(ProbeType::Https, &outcome(None, Some(204))));
        assert!(!is_conclusive(ProbeType::Https, &outcome(None, Some(302))));
    }

    #[test]
    fn unsent_probe_reads_as_failed() {
        let out = unsent(ProbeType::Https);
        assert!(out.http.is_none());
        assert!(out.https.unwrap().is_failed());
    }
}
