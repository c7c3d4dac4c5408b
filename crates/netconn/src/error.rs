//! CLI error types with miette diagnostics.
//!
//! Maps core and config errors into user-facing errors with help text.

use miette::Diagnostic;
use thiserror::Error;

use netconn_config::ConfigError;
use netconn_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const PROBE: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid configuration value for {field}: {reason}")]
    #[diagnostic(
        code(netconn::config_invalid),
        help("Fix the value in {path} or the matching NETCONN_* variable.")
    )]
    ConfigInvalid {
        field: String,
        reason: String,
        path: String,
    },

    #[error("Could not load configuration from {path}")]
    #[diagnostic(
        code(netconn::config_load),
        help("Check the TOML syntax, or run: netconn config init --force")
    )]
    ConfigLoad {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("Config file already exists at {path}")]
    #[diagnostic(
        code(netconn::config_exists),
        help("Use --force to overwrite it.")
    )]
    ConfigExists { path: String },

    // ── Arbiter ──────────────────────────────────────────────────────
    #[error("{resource} not found: {identifier}")]
    #[diagnostic(code(netconn::not_found))]
    NotFound {
        resource: String,
        identifier: String,
    },

    #[error("Request rejected: {reason}")]
    #[diagnostic(code(netconn::rejected))]
    Rejected { reason: String },

    #[error("Arbiter error: {0}")]
    #[diagnostic(code(netconn::arbiter))]
    Arbiter(CoreError),

    // ── Probing ──────────────────────────────────────────────────────
    #[error("Probe failed: {reason}")]
    #[diagnostic(
        code(netconn::probe),
        help("Check that the probe URLs are reachable from this host.")
    )]
    Probe { reason: String },

    #[error("No verdict within {seconds}s")]
    #[diagnostic(
        code(netconn::timeout),
        help("Increase the limit with --timeout.")
    )]
    Timeout { seconds: u64 },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(netconn::validation))]
    Validation { field: String, reason: String },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render JSON: {0}")]
    #[diagnostic(code(netconn::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigInvalid { .. } | Self::ConfigLoad { .. } | Self::ConfigExists { .. } => {
                exit_code::CONFIG
            }
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Rejected { .. } => exit_code::CONFLICT,
            Self::Probe { .. } => exit_code::PROBE,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } => exit_code::USAGE,
            Self::Arbiter(_) | Self::Io(_) | Self::Json(_) => exit_code::GENERAL,
        }
    }

    /// Attach the config path to a config error.
    pub fn from_config(err: ConfigError, path: &std::path::Path) -> Self {
        let path = path.display().to_string();
        match err {
            ConfigError::Validation { field, reason } => Self::ConfigInvalid {
                field,
                reason,
                path,
            },
            source => Self::ConfigLoad { path, source },
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::SupplierNotFound { supplier_id } => Self::NotFound {
                resource: "supplier".into(),
                identifier: supplier_id.to_string(),
            },
            CoreError::NetworkNotFound { net_id } => Self::NotFound {
                resource: "network".into(),
                identifier: net_id.to_string(),
            },
            CoreError::SupplierNotRegistered { bearer, ident } => Self::NotFound {
                resource: "supplier".into(),
                identifier: format!("{bearer}/{ident}"),
            },
            CoreError::InvalidBearer { bearer } => Self::Validation {
                field: "bearer".into(),
                reason: format!("unknown bearer type {bearer}"),
            },
            CoreError::InvalidParameter { message } => Self::Validation {
                field: "input".into(),
                reason: message,
            },
            err @ (CoreError::DuplicateCallback { .. }
            | CoreError::TooManyRequests { .. }
            | CoreError::UidRequestQuotaExceeded { .. }
            | CoreError::PolicyDisabled { .. }) => Self::Rejected {
                reason: err.to_string(),
            },
            CoreError::Probe(err) => Self::Probe {
                reason: err.to_string(),
            },
            other => Self::Arbiter(other),
        }
    }
}
