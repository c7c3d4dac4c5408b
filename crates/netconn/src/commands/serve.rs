//! `netconn serve`: run the arbiter against the configured suppliers.
//!
//! Suppliers from the config file are registered and brought up, one
//! internet request listens on behalf of the CLI, and every arbiter event
//! is printed until Ctrl-C or `--duration` elapses. A supplier table is
//! printed on the way out.

use std::sync::Arc;

use tabled::Tabled;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use netconn_core::{
    Arbiter, ArbiterEvent, NetSpecifier, SupplierSnapshot, TracingConnCallback, TracingNetsys,
};

use super::Context;
use crate::cli::{OutputFormat, ServeArgs};
use crate::error::CliError;
use crate::output;

/// Uid the CLI registers suppliers and requests under.
const CLI_UID: u32 = 0;

#[derive(Tabled)]
struct SupplierRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Net")]
    net: String,
    #[tabled(rename = "Bearer")]
    bearer: String,
    #[tabled(rename = "Ident")]
    ident: String,
    #[tabled(rename = "Iface")]
    iface: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Detection")]
    detection: String,
    #[tabled(rename = "Default")]
    default: String,
}

fn supplier_row(s: &SupplierSnapshot, color: bool) -> SupplierRow {
    SupplierRow {
        id: s.supplier_id.to_string(),
        net: s.net_id.to_string(),
        bearer: s.bearer.to_string(),
        ident: s.ident.clone(),
        iface: if s.iface.is_empty() {
            "-".into()
        } else {
            s.iface.clone()
        },
        state: s.state.clone(),
        score: format!("{} ({})", s.score, s.score_reason),
        detection: output::paint_status(s.detection, color),
        default: if s.is_default { "*" } else { "" }.into(),
    }
}

pub async fn handle(args: ServeArgs, ctx: &Context<'_>) -> Result<(), CliError> {
    let mut runtime = ctx
        .config
        .to_arbiter_config()
        .map_err(|e| ctx.config_error(e))?;
    if args.no_detection {
        runtime.detection.enabled = false;
    }

    let arbiter = Arbiter::new(runtime, Arc::new(TracingNetsys));
    arbiter.start().await;
    let mut events = BroadcastStream::new(arbiter.events());

    let result = async {
        bring_up(&arbiter, ctx).await?;
        stream_events(&mut events, &args, ctx).await
    }
    .await;

    if result.is_ok() {
        let color = output::should_color(ctx.global.color);
        let suppliers = arbiter.suppliers().await?;
        let text = output::render_list(
            ctx.global.output,
            &suppliers,
            |s| supplier_row(s, color),
            |s| s.supplier_id.to_string(),
        )?;
        output::print_output(&text, ctx.global.quiet);
    }

    arbiter.shutdown().await;
    result
}

async fn bring_up(arbiter: &Arbiter, ctx: &Context<'_>) -> Result<(), CliError> {
    let policy = &ctx.config.policy;
    if policy.airplane_mode {
        arbiter.set_airplane_mode(true).await?;
    }
    if policy.restrict_background {
        arbiter.set_restrict_background(true).await?;
    }
    if let Some(proxy) = ctx.config.global_proxy().map_err(|e| ctx.config_error(e))? {
        arbiter.set_global_http_proxy(Some(proxy)).await?;
    }

    arbiter
        .register_net_conn_callback(
            NetSpecifier::internet(),
            Arc::new(TracingConnCallback::new("cli")),
            0,
            CLI_UID,
        )
        .await?;

    for profile in &ctx.config.suppliers {
        let link = profile.link_info().map_err(|e| ctx.config_error(e))?;
        let id = arbiter
            .register_net_supplier(profile.bearer, profile.ident.clone(), profile.caps, CLI_UID)
            .await?;
        arbiter
            .update_net_supplier_info(id, profile.supplier_info(), CLI_UID)
            .await?;
        arbiter.update_net_link_info(id, link, CLI_UID).await?;
        info!(supplier_id = %id, bearer = %profile.bearer, ident = %profile.ident, "supplier up");
    }
    Ok(())
}

async fn stream_events(
    events: &mut BroadcastStream<ArbiterEvent>,
    args: &ServeArgs,
    ctx: &Context<'_>,
) -> Result<(), CliError> {
    let deadline = async {
        match args.duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let color = output::should_color(ctx.global.color);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            () = &mut deadline => return Ok(()),
            event = events.next() => match event {
                Some(Ok(event)) => {
                    let line = render_event(&event, ctx.global.output, color)?;
                    output::print_output(&line, ctx.global.quiet);
                }
                Some(Err(err)) => warn!(error = %err, "event stream lagged"),
                None => return Ok(()),
            },
        }
    }
}

fn render_event(event: &ArbiterEvent, format: OutputFormat, color: bool) -> Result<String, CliError> {
    let net = |n: Option<netconn_core::NetId>| n.map_or_else(|| "none".to_owned(), |n| n.to_string());
    Ok(match format {
        OutputFormat::Json | OutputFormat::JsonCompact => serde_json::to_string(event)?,
        OutputFormat::Table | OutputFormat::Plain => match event {
            ArbiterEvent::DefaultNetworkChanged { previous, current } => {
                format!("default network: {} -> {}", net(*previous), net(*current))
            }
            ArbiterEvent::AirplaneModeChanged { enabled } => format!("airplane mode: {enabled}"),
            ArbiterEvent::GlobalHttpProxyChanged { proxy } => format!(
                "global proxy: {}",
                proxy.as_ref().map_or_else(|| "none".to_owned(), |p| p.endpoint())
            ),
            ArbiterEvent::Detection(report) => {
                let mut line = format!(
                    "net {}: {} in {}ms",
                    report.net_id,
                    output::paint_status(report.status, color),
                    report.elapsed.as_millis()
                );
                if let Some(ref url) = report.redirect_url {
                    line.push_str(&format!(" (portal {url})"));
                }
                line
            }
            ArbiterEvent::LinkApplyFailed {
                net_id,
                operation,
                reason,
            } => format!("net {net_id}: {operation} failed: {reason}"),
            ArbiterEvent::SupplierRegistered {
                supplier_id,
                bearer,
                ident,
            } => format!("supplier {supplier_id} registered: {bearer}/{ident}"),
            ArbiterEvent::SupplierUnregistered { supplier_id } => {
                format!("supplier {supplier_id} unregistered")
            }
        },
    })
}
