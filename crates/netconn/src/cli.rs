//! Clap derive structures for the `netconn` binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

/// Connectivity arbiter: network selection and validation
#[derive(Debug, Parser)]
#[command(
    name = "netconn",
    version,
    about = "Connectivity arbiter: network selection and validation",
    long_about = "Runs the connectivity arbiter against simulated suppliers, \
        probes connectivity endpoints and inspects configuration.\n\n\
        Configuration is read from the platform config directory and can be \
        overridden with NETCONN_* environment variables.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "NETCONN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Log line format (overrides log.format)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Write logs to this file instead of stderr (overrides log.file)
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

// ── Output, Color & Log Enums ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the arbiter with the configured suppliers and stream its events
    Serve(ServeArgs),

    /// Run one validation cycle against the probe endpoints
    Probe(ProbeArgs),

    /// Check which address families reach the probe endpoint
    #[command(name = "dual-stack")]
    DualStack(DualStackArgs),

    /// Inspect and manage the configuration file
    #[command(alias = "cfg")]
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Serve ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Stop after this long (e.g. `30s`, `5m`); runs until Ctrl-C otherwise
    #[arg(long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,

    /// Do not validate networks
    #[arg(long)]
    pub no_detection: bool,
}

// ── Probe ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Bearer the probed network is assumed to use
    #[arg(long, default_value = "wifi")]
    pub bearer: String,

    /// HTTP probe URL (overrides detection.http_url)
    #[arg(long)]
    pub http_url: Option<String>,

    /// HTTPS probe URL (overrides detection.https_url)
    #[arg(long)]
    pub https_url: Option<String>,

    /// Probe through this proxy, as `host:port`
    #[arg(long)]
    pub proxy: Option<String>,

    /// Give up on a verdict after this long
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
}

// ── Dual-stack ───────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct DualStackArgs {
    /// HTTP probe URL (overrides detection.http_url)
    #[arg(long)]
    pub http_url: Option<String>,

    /// HTTPS probe URL (overrides detection.https_url)
    #[arg(long)]
    pub https_url: Option<String>,

    /// Overall probe timeout
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Show the effective configuration (defaults + file + environment)
    Show,

    /// Check the effective configuration without running anything
    Validate,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: Shell,
}
