// ── Connectivity probe ──
//
// One classifying fetch per scheme. A probe either reports a classified
// `ProbeResult` per requested scheme or fails before anything was sent
// (client setup, proxy, DNS). Transport failures after that point are
// classified results with code 0.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future;
use serde::Serialize;
use strum::{Display, FromRepr};
use tracing::{debug, info};
use url::Url;

use crate::error::Error;
use crate::proxy::HttpProxy;
use crate::resolve::{DnsResolver, SystemResolver};
use crate::transport::{ProbeTransport, Route};

/// The canonical success answer of a generate-204 endpoint.
pub const NO_CONTENT: u16 = 204;

const OK: u16 = 200;
const PORTAL_CODE_MIN: u16 = 200;
const PORTAL_CODE_MAX: u16 = 399;

/// A 200 with a body shorter than this is treated as ambiguous.
const PORTAL_CONTENT_LENGTH_MIN: u64 = 4;

pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

// ── Probe kinds ─────────────────────────────────────────────────────

/// Which fetches a probe issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, Serialize)]
#[repr(u8)]
pub enum ProbeType {
    Http = 1,
    Https = 2,
    HttpAndHttps = 3,
    HttpFallback = 4,
    HttpsFallback = 5,
}

impl ProbeType {
    pub fn has_http(self) -> bool {
        matches!(self, Self::Http | Self::HttpAndHttps | Self::HttpFallback)
    }

    pub fn has_https(self) -> bool {
        matches!(self, Self::Https | Self::HttpAndHttps | Self::HttpsFallback)
    }

    pub fn is_fallback(self) -> bool {
        matches!(self, Self::HttpFallback | Self::HttpsFallback)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProbeScheme {
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeVerdict {
    Successful,
    NeedsPortal,
    Failed,
}

// ── ProbeResult ─────────────────────────────────────────────────────

/// Outcome of one fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub scheme: ProbeScheme,
    /// HTTP status, or 0 when no response arrived.
    pub code: u16,
    /// `Location` header, falling back to the effective URL.
    pub redirect_url: Option<String>,
    pub content_length: Option<u64>,
    pub connection_close: bool,
    pub elapsed: Duration,
}

impl ProbeResult {
    /// A fetch that produced no HTTP response at all.
    pub fn no_response(scheme: ProbeScheme, elapsed: Duration) -> Self {
        Self {
            scheme,
            code: 0,
            redirect_url: None,
            content_length: None,
            connection_close: false,
            elapsed,
        }
    }

    pub fn with_code(scheme: ProbeScheme, code: u16) -> Self {
        Self {
            code,
            ..Self::no_response(scheme, Duration::ZERO)
        }
    }

    fn from_response(scheme: ProbeScheme, resp: &reqwest::Response, elapsed: Duration) -> Self {
        let headers = resp.headers();
        let location = headers
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let connection_close = headers
            .get(reqwest::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"));
        let content_length = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            scheme,
            code: resp.status().as_u16(),
            redirect_url: location.or_else(|| Some(resp.url().to_string())),
            content_length,
            connection_close,
            elapsed,
        }
    }

    pub fn verdict(&self) -> ProbeVerdict {
        match self.code {
            NO_CONTENT => ProbeVerdict::Successful,
            OK if self.is_ambiguous_ok() => ProbeVerdict::Failed,
            PORTAL_CODE_MIN..=PORTAL_CODE_MAX => ProbeVerdict::NeedsPortal,
            _ => ProbeVerdict::Failed,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.verdict() == ProbeVerdict::Successful
    }

    pub fn is_need_portal(&self) -> bool {
        self.verdict() == ProbeVerdict::NeedsPortal
    }

    pub fn is_failed(&self) -> bool {
        self.verdict() == ProbeVerdict::Failed
    }

    /// Portal appliances that echo a 200 tend to send an empty body or
    /// close the connection on plain HTTP.
    fn is_ambiguous_ok(&self) -> bool {
        let short_body = self
            .content_length
            .is_some_and(|len| len < PORTAL_CONTENT_LENGTH_MIN);
        let closed = self.scheme == ProbeScheme::Http && self.connection_close;
        short_body || closed
    }
}

/// Results of one `send_probe` call, one slot per scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub http: Option<ProbeResult>,
    pub https: Option<ProbeResult>,
}

/// Target URLs for one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub http_url: Url,
    pub https_url: Url,
}

impl ProbeTarget {
    pub fn new(http_url: Url, https_url: Url) -> Self {
        Self {
            http_url,
            https_url,
        }
    }

    pub fn parse(http_url: &str, https_url: &str) -> Result<Self, Error> {
        Ok(Self::new(Url::parse(http_url)?, Url::parse(https_url)?))
    }
}

/// Per-call probe options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeOptions<'a> {
    /// Route through this proxy instead of pinning.
    pub proxy: Option<&'a HttpProxy>,
    /// Use these addresses instead of resolving the host.
    pub pinned: Option<&'a [IpAddr]>,
}

// ── NetHttpProbe ────────────────────────────────────────────────────

/// Issues probes on behalf of one network.
#[derive(Clone)]
pub struct NetHttpProbe {
    net_id: u32,
    transport: ProbeTransport,
    resolver: Arc<dyn DnsResolver>,
}

impl std::fmt::Debug for NetHttpProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetHttpProbe")
            .field("net_id", &self.net_id)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl NetHttpProbe {
    pub fn new(net_id: u32, transport: ProbeTransport, resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            net_id,
            transport,
            resolver,
        }
    }

    /// Probe with the system resolver and default timeouts.
    pub fn with_defaults(net_id: u32) -> Self {
        Self::new(net_id, ProbeTransport::default(), Arc::new(SystemResolver))
    }

    pub fn net_id(&self) -> u32 {
        self.net_id
    }

    /// Send the fetch(es) `probe_type` calls for.
    ///
    /// Both schemes of an `HttpAndHttps` probe run concurrently. Returns
    /// an error only when a requested fetch could not be issued.
    pub async fn send_probe(
        &self,
        probe_type: ProbeType,
        target: &ProbeTarget,
        opts: ProbeOptions<'_>,
    ) -> Result<ProbeOutcome, Error> {
        let http = async {
            if probe_type.has_http() {
                Some(self.fetch(ProbeScheme::Http, &target.http_url, opts).await)
            } else {
                None
            }
        };
        let https = async {
            if probe_type.has_https() {
                Some(self.fetch(ProbeScheme::Https, &target.https_url, opts).await)
            } else {
                None
            }
        };

        let (http, https) = future::join(http, https).await;
        let outcome = ProbeOutcome {
            http: http.transpose()?,
            https: https.transpose()?,
        };

        if let Some(ref r) = outcome.http {
            info!(
                net_id = self.net_id,
                %probe_type,
                code = r.code,
                redirect = r.redirect_url.as_deref().unwrap_or(""),
                "http probe response"
            );
        }
        if let Some(ref r) = outcome.https {
            info!(
                net_id = self.net_id,
                %probe_type,
                code = r.code,
                redirect = r.redirect_url.as_deref().unwrap_or(""),
                "https probe response"
            );
        }
        Ok(outcome)
    }

    async fn fetch(
        &self,
        scheme: ProbeScheme,
        url: &Url,
        opts: ProbeOptions<'_>,
    ) -> Result<ProbeResult, Error> {
        let https = scheme == ProbeScheme::Https;
        let client = match opts.proxy.filter(|p| !p.is_empty()) {
            Some(proxy) => self.transport.build_client(&Route::Proxy(proxy), https)?,
            None => self.direct_client(url, https, opts.pinned).await?,
        };

        let started = Instant::now();
        match client.get(url.clone()).send().await {
            Ok(resp) => Ok(ProbeResult::from_response(scheme, &resp, started.elapsed())),
            Err(e) => {
                debug!(net_id = self.net_id, %scheme, error = %e, "probe fetch failed");
                Ok(ProbeResult::no_response(scheme, started.elapsed()))
            }
        }
    }

    async fn direct_client(
        &self,
        url: &Url,
        https: bool,
        pinned: Option<&[IpAddr]>,
    ) -> Result<reqwest::Client, Error> {
        let Some(host) = url.host_str() else {
            return Err(Error::MissingHost {
                url: url.to_string(),
            });
        };
        let default_port = if https { HTTPS_PORT } else { HTTP_PORT };
        let port = url.port_or_known_default().unwrap_or(default_port);

        // Literal addresses need no pinning unless the caller insists.
        let is_literal = host.trim_matches(['[', ']']).parse::<IpAddr>().is_ok();
        if is_literal && pinned.is_none() {
            return self.transport.build_client(&Route::Direct, https);
        }

        let addrs = match pinned {
            Some(list) => list.to_vec(),
            None => self.resolver.resolve(host).await?,
        };
        if addrs.is_empty() {
            return Err(Error::NoAddress {
                domain: host.to_owned(),
            });
        }

        self.transport.build_client(
            &Route::Pinned {
                host,
                port,
                addrs: &addrs,
            },
            https,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn http(code: u16) -> ProbeResult {
        ProbeResult::with_code(ProbeScheme::Http, code)
    }

    #[test]
    fn no_content_is_success() {
        assert_eq!(http(204).verdict(), ProbeVerdict::Successful);
    }

    #[test]
    fn redirect_range_needs_portal() {
        for code in [200, 301, 302, 307, 399] {
            assert_eq!(http(code).verdict(), ProbeVerdict::NeedsPortal, "code {code}");
        }
    }

    #[test]
    fn everything_else_fails() {
        for code in [0, 199, 400, 404, 500, 503] {
            assert_eq!(http(code).verdict(), ProbeVerdict::Failed, "code {code}");
        }
    }

    #[test]
    fn short_body_ok_is_failed() {
        let mut r = http(200);
        r.content_length = Some(0);
        assert!(r.is_failed());
        r.content_length = Some(3);
        assert!(r.is_failed());
        r.content_length = Some(512);
        assert!(r.is_need_portal());
    }

    #[test]
    fn connection_close_ok_fails_only_on_http() {
        let mut r = http(200);
        r.connection_close = true;
        assert!(r.is_failed());

        let mut s = ProbeResult::with_code(ProbeScheme::Https, 200);
        s.connection_close = true;
        assert!(s.is_need_portal());
    }

    #[test]
    fn probe_type_schemes() {
        assert!(ProbeType::HttpAndHttps.has_http() && ProbeType::HttpAndHttps.has_https());
        assert!(ProbeType::HttpFallback.has_http() && !ProbeType::HttpFallback.has_https());
        assert!(ProbeType::HttpsFallback.is_fallback());
        assert_eq!(ProbeType::from_repr(2), Some(ProbeType::Https));
    }
}
