//! `netconn probe`: one validation cycle against the probe endpoints.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use arc_swap::{ArcSwap, ArcSwapOption};
use tabled::Tabled;
use tokio::sync::mpsc;

use netconn_core::detection::{DetectionSink, MonitorContext, NetMonitor};
use netconn_core::{DetectionReport, NetBearType, NetId, NetLinkInfo, ProbeRecord};
use netconn_probe::{NetHttpProbe, SystemResolver};

use super::{Context, parse_proxy};
use crate::cli::ProbeArgs;
use crate::error::CliError;
use crate::output;

/// Standalone probes are not attached to any real network.
const PROBE_NET_ID: NetId = NetId(0);

#[derive(Tabled)]
struct ProbeRow {
    #[tabled(rename = "Probe")]
    probe: String,
    #[tabled(rename = "Scheme")]
    scheme: String,
    #[tabled(rename = "Code")]
    code: u16,
    #[tabled(rename = "Time")]
    elapsed: String,
    #[tabled(rename = "Proxy")]
    proxied: String,
    #[tabled(rename = "URL")]
    url: String,
}

impl From<&ProbeRecord> for ProbeRow {
    fn from(r: &ProbeRecord) -> Self {
        Self {
            probe: r.probe_type.to_string(),
            scheme: r.scheme.to_string(),
            code: r.code,
            elapsed: format!("{}ms", r.elapsed.as_millis()),
            proxied: if r.proxied { "yes" } else { "-" }.into(),
            url: r.url.clone(),
        }
    }
}

pub async fn handle(args: ProbeArgs, ctx: &Context<'_>) -> Result<(), CliError> {
    let bearer: NetBearType = args.bearer.parse().map_err(|_| CliError::Validation {
        field: "bearer".into(),
        reason: format!("unknown bearer '{}'", args.bearer),
    })?;
    let detection = Arc::new(ctx.detection_with(args.http_url, args.https_url)?);

    let proxy = match args.proxy.as_deref() {
        Some(raw) => Some(parse_proxy(raw)?),
        None => ctx.config.global_proxy().map_err(|e| ctx.config_error(e))?,
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink: DetectionSink = Arc::new(move |verdict| {
        let _ = tx.send(verdict);
    });
    let monitor = NetMonitor::new(
        MonitorContext {
            net_id: PROBE_NET_ID,
            bearer,
            probe: NetHttpProbe::new(
                PROBE_NET_ID.get(),
                detection.transport(),
                Arc::new(SystemResolver),
            ),
            config: Arc::clone(&detection),
            link: Arc::new(ArcSwap::from_pointee(NetLinkInfo::default())),
            global_proxy: Arc::new(ArcSwapOption::new(proxy.map(Arc::new))),
            screen_on: Arc::new(AtomicBool::new(true)),
        },
        sink,
    );

    tracing::info!(%bearer, http = %detection.http_url, https = %detection.https_url, "probing");
    monitor.start(true);
    let verdict = tokio::time::timeout(args.timeout, rx.recv()).await;
    monitor.stop();

    let verdict = match verdict {
        Ok(Some(verdict)) => verdict,
        Ok(None) => {
            return Err(CliError::Probe {
                reason: "monitor stopped without a verdict".into(),
            });
        }
        Err(_) => {
            return Err(CliError::Timeout {
                seconds: args.timeout.as_secs(),
            });
        }
    };

    let color = output::should_color(ctx.global.color);
    let report: &DetectionReport = &verdict.report;
    let text = output::render_single(
        ctx.global.output,
        report,
        |r| {
            let mut detail = vec![
                ("status", output::paint_status(r.status, color)),
                ("elapsed", format!("{}ms", r.elapsed.as_millis())),
            ];
            if let Some(ref url) = r.redirect_url {
                detail.push(("redirect", url.clone()));
            }
            let rows: Vec<ProbeRow> = r.probes.iter().map(ProbeRow::from).collect();
            format!(
                "{}\n\n{}",
                output::render_detail(&detail),
                output::render_table(&rows)
            )
        },
        |r| r.status.to_string(),
    )?;
    output::print_output(&text, ctx.global.quiet);
    Ok(())
}
