//! `netconn dual-stack`: which address families reach the probe host.

use std::sync::Arc;

use netconn_core::detection::{DualStackOutcome, DualStackProbe};
use netconn_core::NetId;
use netconn_probe::{NetHttpProbe, ProbeTarget, SystemResolver};

use super::Context;
use crate::cli::DualStackArgs;
use crate::error::CliError;
use crate::output;

pub async fn handle(args: DualStackArgs, ctx: &Context<'_>) -> Result<(), CliError> {
    let detection = ctx.detection_with(args.http_url, args.https_url)?;
    let dual_stack = ctx
        .config
        .to_arbiter_config()
        .map_err(|e| ctx.config_error(e))?
        .dual_stack;

    let target = ProbeTarget::parse(&detection.http_url, &detection.https_url).map_err(|e| {
        CliError::Validation {
            field: "probe url".into(),
            reason: e.to_string(),
        }
    })?;
    let resolver = Arc::new(SystemResolver);
    let probe = DualStackProbe::new(
        NetId(0),
        NetHttpProbe::new(0, detection.transport(), resolver.clone()),
        resolver,
        target,
        dual_stack,
    );

    let outcome = probe.run(args.timeout).await?;
    let color = output::should_color(ctx.global.color);
    let text = output::render_single(
        ctx.global.output,
        &outcome,
        |o| detail(o, color),
        |o| o.result.to_string(),
    )?;
    output::print_output(&text, ctx.global.quiet);
    Ok(())
}

fn detail(outcome: &DualStackOutcome, color: bool) -> String {
    let join = |addrs: &[std::net::IpAddr]| {
        if addrs.is_empty() {
            "-".to_owned()
        } else {
            addrs
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }
    };
    let elapsed = |d: Option<std::time::Duration>| {
        d.map_or_else(|| "-".to_owned(), |d| format!("{}ms", d.as_millis()))
    };
    output::render_detail(&[
        ("result", output::paint_dual_stack(outcome.result, color)),
        ("ipv4", join(&outcome.v4)),
        ("ipv4 time", elapsed(outcome.v4_elapsed)),
        ("ipv6", join(&outcome.v6)),
        ("ipv6 time", elapsed(outcome.v6_elapsed)),
    ])
}
