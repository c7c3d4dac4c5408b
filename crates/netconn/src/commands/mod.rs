//! Command dispatch and shared helpers.

pub mod config_cmd;
pub mod dual_stack;
pub mod probe;
pub mod serve;

use std::path::Path;

use netconn_config::{Config, ConfigError};
use netconn_core::DetectionConfig;
use netconn_probe::HttpProxy;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Everything a command needs besides its own arguments.
pub struct Context<'a> {
    pub global: &'a GlobalOpts,
    pub config: &'a Config,
    pub config_path: &'a Path,
}

impl Context<'_> {
    pub fn config_error(&self, err: ConfigError) -> CliError {
        CliError::from_config(err, self.config_path)
    }

    /// Runtime detection settings with optional URL overrides applied.
    pub fn detection_with(
        &self,
        http_url: Option<String>,
        https_url: Option<String>,
    ) -> Result<DetectionConfig, CliError> {
        let mut config = self.config.clone();
        if let Some(url) = http_url {
            config.detection.http_url = url;
        }
        if let Some(url) = https_url {
            config.detection.https_url = url;
        }
        config
            .to_arbiter_config()
            .map(|runtime| runtime.detection)
            .map_err(|err| match err {
                ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
                other => self.config_error(other),
            })
    }
}

pub async fn dispatch(cmd: Command, ctx: &Context<'_>) -> Result<(), CliError> {
    match cmd {
        Command::Serve(args) => serve::handle(args, ctx).await,
        Command::Probe(args) => probe::handle(args, ctx).await,
        Command::DualStack(args) => dual_stack::handle(args, ctx).await,
        Command::Config(_) | Command::Completions(_) => unreachable!("handled before dispatch"),
    }
}

/// Parse a `host:port` proxy argument.
pub fn parse_proxy(raw: &str) -> Result<HttpProxy, CliError> {
    let invalid = || CliError::Validation {
        field: "proxy".into(),
        reason: format!("expected host:port, got '{raw}'"),
    };
    let (host, port) = raw.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if host.trim().is_empty() || port == 0 {
        return Err(invalid());
    }
    Ok(HttpProxy::new(host.trim(), port))
}
