mod cli;
mod commands;
mod error;
mod output;

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use netconn_config::{Config, ConfigError, LogSection};

use crate::cli::{Cli, Command, GlobalOpts, LogFormat};
use crate::commands::Context;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = cli
        .global
        .config
        .clone()
        .unwrap_or_else(netconn_config::config_path);
    let loaded = netconn_config::load_config(Some(&config_path));

    // A broken config still gets reported through the normal error path.
    let log = loaded
        .as_ref()
        .map(|cfg| cfg.log.clone())
        .unwrap_or_default();
    let _log_guard = init_tracing(&cli.global, &log);

    if let Err(err) = run(cli, config_path, loaded).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// Install the subscriber. The returned guard flushes the log file on
/// drop and must live as long as the process.
fn init_tracing(global: &GlobalOpts, log: &LogSection) -> Option<WorkerGuard> {
    let level = match global.verbose {
        0 => log.level.clone(),
        1 => "info".to_owned(),
        2 => "debug".to_owned(),
        _ => "trace".to_owned(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let json = match global.log_format {
        Some(LogFormat::Json) => true,
        Some(LogFormat::Pretty) => false,
        None => log.format == "json",
    };

    let file = global.log_file.clone().or_else(|| log.file.clone());
    let to_file = file.is_some();
    let (writer, guard) = match file {
        Some(path) => {
            let (dir, name) = split_log_path(&path);
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(!to_file)
        .with_target(to_file);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }

    guard
}

fn split_log_path(path: &Path) -> (PathBuf, PathBuf) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map_or_else(|| PathBuf::from("netconn.log"), PathBuf::from);
    (dir.to_path_buf(), name)
}

async fn run(
    cli: Cli,
    config_path: PathBuf,
    loaded: Result<Config, ConfigError>,
) -> Result<(), CliError> {
    match cli.command {
        // Config commands report load problems themselves
        Command::Config(args) => {
            commands::config_cmd::handle(args, &cli.global, &config_path, loaded)
        }

        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "netconn", &mut std::io::stdout());
            Ok(())
        }

        cmd => {
            let config = loaded.map_err(|e| CliError::from_config(e, &config_path))?;
            config
                .validate()
                .map_err(|e| CliError::from_config(e, &config_path))?;
            let ctx = Context {
                global: &cli.global,
                config: &config,
                config_path: &config_path,
            };

            tracing::debug!(command = ?cmd, "dispatching command");
            commands::dispatch(cmd, &ctx).await
        }
    }
}
