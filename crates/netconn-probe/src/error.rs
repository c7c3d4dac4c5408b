// ── Probe error types ──
//
// Errors here mean the probe could not even be sent. A probe that went
// out and came back with a bad answer is a classified `ProbeResult`,
// not an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Building the HTTP client failed (TLS backend, invalid header, ...).
    #[error("failed to build probe client: {0}")]
    ClientBuild(String),

    /// The proxy definition could not be turned into a usable proxy.
    #[error("invalid proxy configuration: {0}")]
    Proxy(String),

    /// Probe URL did not parse.
    #[error("invalid probe URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Probe URL has no host component to resolve.
    #[error("probe URL has no host: {url}")]
    MissingHost { url: String },

    /// Name resolution failed outright.
    #[error("failed to resolve {domain}: {reason}")]
    Resolve { domain: String, reason: String },

    /// Name resolution succeeded but produced no usable address.
    #[error("no address found for {domain}")]
    NoAddress { domain: String },

    /// Name resolution did not finish in time.
    #[error("resolving {domain} timed out after {timeout_ms}ms")]
    ResolveTimeout { domain: String, timeout_ms: u64 },

    /// Transport error surfaced outside of a probe fetch.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error came from name resolution.
    pub fn is_resolve(&self) -> bool {
        matches!(
            self,
            Self::Resolve { .. } | Self::NoAddress { .. } | Self::ResolveTimeout { .. }
        )
    }
}
