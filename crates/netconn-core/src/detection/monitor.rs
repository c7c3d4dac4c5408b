// ── Network monitor ──
//
// Per-network detection loop. `start()` spawns the loop (or cuts the
// current backoff wait short); `stop()` cancels it and any verdict that
// arrives afterwards is dropped. Each cycle fires a primary batch of
// four probes, optionally retries without proxy, and feeds the verdict
// into the delay policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::Utc;
use netconn_probe::{HttpProxy, NetHttpProbe, ProbeTarget, ProbeType};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::latch::CountDownLatch;
use super::probe_thread::{ProbeLatches, ProbeThread};
use crate::config::DetectionConfig;
use crate::model::{
    DetectionReport, NetBearType, NetDetectionStatus, NetId, NetLinkInfo, ProbeRecord,
};

const CELLULAR_PORTAL_CODE: u16 = 302;

/// A verdict leaving the monitor.
#[derive(Debug, Clone)]
pub struct MonitorVerdict {
    pub net_id: NetId,
    pub status: NetDetectionStatus,
    pub redirect_url: String,
    /// Status differs from the last reported one, or a report was asked for.
    pub changed: bool,
    pub report: Arc<DetectionReport>,
}

/// Where verdicts go. The arbiter posts them onto its worker queue.
pub type DetectionSink = Arc<dyn Fn(MonitorVerdict) + Send + Sync>;

/// Everything a detection cycle reads. Shared with the owning network.
#[derive(Clone)]
pub struct MonitorContext {
    pub net_id: NetId,
    pub bearer: NetBearType,
    pub config: Arc<DetectionConfig>,
    pub probe: NetHttpProbe,
    pub link: Arc<ArcSwap<NetLinkInfo>>,
    pub global_proxy: Arc<ArcSwapOption<HttpProxy>>,
    pub screen_on: Arc<AtomicBool>,
}

impl std::fmt::Debug for MonitorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorContext")
            .field("net_id", &self.net_id)
            .field("bearer", &self.bearer)
            .finish_non_exhaustive()
    }
}

impl MonitorContext {
    /// Global proxy wins over the per-network one. Only wifi and
    /// ethernet probe through a proxy.
    fn detection_proxy(&self) -> Option<HttpProxy> {
        if !self.bearer.probes_through_proxy() {
            return None;
        }
        if let Some(global) = self.global_proxy.load_full().filter(|g| !g.is_empty()) {
            return Some((*global).clone());
        }
        self.link.load().proxy().cloned()
    }

    fn portal_delay(&self) -> Duration {
        let screen_off = !self.screen_on.load(Ordering::Relaxed);
        if screen_off && self.bearer == NetBearType::Wifi {
            self.config.portal_delay_screen_off
        } else {
            self.config.portal_delay
        }
    }
}

// ── NetMonitor ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LoopState {
    detecting: bool,
    /// A `start()` arrived while the loop was running.
    rerun: bool,
    need_report: bool,
    cancel: CancellationToken,
    steps: u32,
    last_status: Option<NetDetectionStatus>,
    cycle_started: Option<Instant>,
}

struct MonitorInner {
    ctx: MonitorContext,
    sink: DetectionSink,
    state: Mutex<LoopState>,
    wake: Notify,
}

/// Detection loop handle for one network.
#[derive(Clone)]
pub struct NetMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for NetMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetMonitor")
            .field("net_id", &self.inner.ctx.net_id)
            .field("detecting", &self.is_detecting())
            .finish_non_exhaustive()
    }
}

impl NetMonitor {
    pub fn new(ctx: MonitorContext, sink: DetectionSink) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                ctx,
                sink,
                state: Mutex::new(LoopState::default()),
                wake: Notify::new(),
            }),
        }
    }

    pub fn net_id(&self) -> NetId {
        self.inner.ctx.net_id
    }

    /// Begin detecting now.
    pub fn start(&self, need_report: bool) {
        self.start_after(Duration::ZERO, need_report);
    }

    /// Begin detecting after `delay`. A running loop is re-triggered
    /// immediately instead.
    pub fn start_after(&self, delay: Duration, need_report: bool) {
        let mut state = self.lock();
        state.need_report |= need_report;
        if state.detecting {
            debug!(net_id = %self.net_id(), "monitor already detecting, re-triggering");
            state.rerun = true;
            drop(state);
            self.inner.wake.notify_one();
            return;
        }
        info!(net_id = %self.net_id(), delay_ms = delay.as_millis(), "starting network monitor");
        state.detecting = true;
        state.rerun = false;
        state.cancel = CancellationToken::new();
        let token = state.cancel.clone();
        drop(state);
        tokio::spawn(detection_loop(Arc::clone(&self.inner), token, delay));
    }

    pub fn stop(&self) {
        let mut state = self.lock();
        if state.detecting {
            info!(net_id = %self.net_id(), "stopping network monitor");
        }
        state.detecting = false;
        state.rerun = false;
        state.steps = 0;
        state.cancel.cancel();
    }

    pub fn is_detecting(&self) -> bool {
        self.lock().detecting
    }

    pub fn last_status(&self) -> Option<NetDetectionStatus> {
        self.lock().last_status
    }

    /// When the current or most recent cycle began.
    pub fn cycle_started(&self) -> Option<Instant> {
        self.lock().cycle_started
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel
            .cancel();
    }
}

// ── Detection loop ──────────────────────────────────────────────────

async fn detection_loop(inner: Arc<MonitorInner>, token: CancellationToken, delay: Duration) {
    if !delay.is_zero() && !wait_or_rerun(&inner, &token, delay).await {
        return;
    }

    loop {
        {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.rerun = false;
            state.cycle_started = Some(Instant::now());
        }

        let cycle = run_cycle(&inner.ctx).await;

        let (delay, verdict) = {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if token.is_cancelled() {
                debug!(net_id = %inner.ctx.net_id, status = %cycle.status, "discarding verdict after stop");
                return;
            }
            let delay = next_delay(&mut state, cycle.status, &inner.ctx);
            let changed = state.last_status != Some(cycle.status) || state.need_report;
            state.need_report = false;
            state.last_status = Some(cycle.status);
            let verdict = MonitorVerdict {
                net_id: inner.ctx.net_id,
                status: cycle.status,
                redirect_url: cycle.redirect_url.clone().unwrap_or_default(),
                changed,
                report: Arc::new(cycle.report),
            };
            (delay, verdict)
        };

        info!(
            net_id = %inner.ctx.net_id,
            status = %verdict.status,
            changed = verdict.changed,
            next_ms = delay.map(|d| d.as_millis()),
            "detection cycle finished"
        );
        (inner.sink)(verdict);

        let Some(delay) = delay else {
            // Validated: stop looping unless someone asked for another run.
            // A stopped loop no longer owns `detecting`; a newer loop may.
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if token.is_cancelled() {
                return;
            }
            if state.rerun {
                continue;
            }
            state.detecting = false;
            return;
        };

        if !wait_or_rerun(&inner, &token, delay).await {
            return;
        }
    }
}

/// Sleep for `delay` unless a `start()` asks for a rerun first.
/// Wakeups without a pending rerun are stale permits and are ignored.
/// Returns `false` once the loop has been stopped.
async fn wait_or_rerun(inner: &MonitorInner, token: &CancellationToken, delay: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => return false,
            () = inner.wake.notified() => {
                let rerun = inner.state.lock().unwrap_or_else(PoisonError::into_inner).rerun;
                if rerun {
                    return true;
                }
            }
            () = tokio::time::sleep_until(deadline) => return true,
        }
    }
}

/// `None` means stop looping.
fn next_delay(
    state: &mut LoopState,
    status: NetDetectionStatus,
    ctx: &MonitorContext,
) -> Option<Duration> {
    match status {
        NetDetectionStatus::Verification => {
            state.steps = 0;
            None
        }
        NetDetectionStatus::CaptivePortal => Some(ctx.portal_delay()),
        _ => {
            let delay = backoff_delay(&ctx.config, state.steps);
            state.steps = state.steps.saturating_add(1);
            Some(delay)
        }
    }
}

/// `init * 2 * steps`, floored at `init` and capped at the maximum.
pub(crate) fn backoff_delay(config: &DetectionConfig, steps: u32) -> Duration {
    let delay = config.init_delay.saturating_mul(2).saturating_mul(steps);
    if delay.is_zero() {
        config.init_delay
    } else {
        delay.min(config.max_failed_delay)
    }
}

// ── One cycle ───────────────────────────────────────────────────────

struct Cycle {
    status: NetDetectionStatus,
    redirect_url: Option<String>,
    report: DetectionReport,
}

async fn run_cycle(ctx: &MonitorContext) -> Cycle {
    let started_at = Utc::now();
    let started = Instant::now();
    let mut records = Vec::new();

    let (status, redirect_url) = match targets(&ctx.config) {
        Ok((primary, fallback)) => {
            let proxy = ctx.detection_proxy();
            let first = send_batch(ctx, &primary, &fallback, proxy.clone()).await;
            records.extend(first.records());
            let mut verdict = first.evaluate(ctx.bearer);

            if proxy.is_some() && verdict.0 == NetDetectionStatus::Invalid {
                debug!(net_id = %ctx.net_id, "proxied batch inconclusive, retrying without proxy");
                let second = send_batch(ctx, &primary, &fallback, None).await;
                records.extend(second.records());
                verdict = more_favorable(verdict, second.evaluate(ctx.bearer));
            }
            verdict
        }
        Err(reason) => {
            warn!(net_id = %ctx.net_id, %reason, "invalid detection URL");
            (NetDetectionStatus::Invalid, None)
        }
    };

    let report = DetectionReport {
        id: Uuid::new_v4(),
        net_id: ctx.net_id,
        status,
        redirect_url: redirect_url.clone(),
        started_at,
        elapsed: started.elapsed(),
        probes: records,
    };
    Cycle {
        status,
        redirect_url,
        report,
    }
}

fn targets(config: &DetectionConfig) -> Result<(ProbeTarget, ProbeTarget), String> {
    let primary =
        ProbeTarget::parse(&config.http_url, &config.https_url).map_err(|e| e.to_string())?;
    let fallback = ProbeTarget::parse(&config.fallback_http_url, &config.fallback_https_url)
        .map_err(|e| e.to_string())?;
    Ok((primary, fallback))
}

/// Four probe threads: the primary pair and the fallback pair.
struct Batch {
    http: ProbeThread,
    https: ProbeThread,
    http_fallback: ProbeThread,
    https_fallback: ProbeThread,
}

async fn send_batch(
    ctx: &MonitorContext,
    primary: &ProbeTarget,
    fallback: &ProbeTarget,
    proxy: Option<HttpProxy>,
) -> Batch {
    let primary_latch = CountDownLatch::new(2);
    let fallback_latch = CountDownLatch::new(2);
    let batch_latch = CountDownLatch::new(4);
    let latches = |pair: &CountDownLatch| ProbeLatches {
        pair: pair.clone(),
        batch: batch_latch.clone(),
        release_on_conclusive: true,
    };
    let spawn = |probe_type, target: &ProbeTarget, pair: &CountDownLatch| {
        ProbeThread::spawn(
            ctx.probe.clone(),
            probe_type,
            target.clone(),
            proxy.clone(),
            None,
            latches(pair),
        )
    };

    let batch = Batch {
        http: spawn(ProbeType::Http, primary, &primary_latch),
        https: spawn(ProbeType::Https, primary, &primary_latch),
        http_fallback: spawn(ProbeType::HttpFallback, fallback, &fallback_latch),
        https_fallback: spawn(ProbeType::HttpsFallback, fallback, &fallback_latch),
    };

    primary_latch.wait(ctx.config.primary_wait).await;
    if !batch.primary_conclusive() {
        batch_latch.wait(ctx.config.batch_wait).await;
    }
    batch
}

impl Batch {
    fn threads(&self) -> [&ProbeThread; 4] {
        [
            &self.http,
            &self.https,
            &self.http_fallback,
            &self.https_fallback,
        ]
    }

    fn primary_conclusive(&self) -> bool {
        self.http.is_need_portal() || self.https.is_successful()
    }

    fn records(&self) -> Vec<ProbeRecord> {
        self.threads()
            .iter()
            .filter_map(|t| t.record())
            .collect()
    }

    /// Portal answers on plain HTTP come first, then any HTTPS success,
    /// then a plain-HTTP success confirmed by both URLs.
    fn evaluate(&self, bearer: NetBearType) -> (NetDetectionStatus, Option<String>) {
        for http in [&self.http, &self.http_fallback] {
            if http.is_need_portal() {
                let redirect = http.result().and_then(|r| r.redirect_url.clone());
                return (NetDetectionStatus::CaptivePortal, redirect);
            }
        }

        if bearer == NetBearType::Cellular {
            if let Some(r) = self
                .https
                .result()
                .filter(|r| r.code == CELLULAR_PORTAL_CODE)
            {
                return (NetDetectionStatus::CaptivePortal, r.redirect_url.clone());
            }
        }

        if self.https.is_successful() || self.https_fallback.is_successful() {
            return (NetDetectionStatus::Verification, None);
        }
        if self.http.is_successful() && self.http_fallback.is_successful() {
            return (NetDetectionStatus::Verification, None);
        }
        (NetDetectionStatus::Invalid, None)
    }
}

fn rank(status: NetDetectionStatus) -> u8 {
    match status {
        NetDetectionStatus::CaptivePortal => 2,
        NetDetectionStatus::Verification => 1,
        _ => 0,
    }
}

/// Portal beats success beats failure; ties keep the first.
fn more_favorable(
    first: (NetDetectionStatus, Option<String>),
    second: (NetDetectionStatus, Option<String>),
) -> (NetDetectionStatus, Option<String>) {
    if rank(second.0) > rank(first.0) {
        second
    } else {
        first
    }
}
