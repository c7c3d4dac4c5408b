// Shared transport settings for building per-probe reqwest clients.
//
// Each probe gets its own client because proxy selection and address
// pinning differ per fetch; timeouts and the user agent do not.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use reqwest::redirect::Policy;

use crate::error::Error;
use crate::proxy::HttpProxy;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(5000);

/// Timeouts and identity applied to every probe client.
#[derive(Debug, Clone)]
pub struct ProbeTransport {
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ProbeTransport {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            timeout: DEFAULT_TRANSFER_TIMEOUT,
            user_agent: concat!("netconn/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

/// How a single probe client reaches its target.
#[derive(Debug, Clone)]
pub enum Route<'a> {
    /// Through a proxy. No local resolution.
    Proxy(&'a HttpProxy),
    /// Directly, with `host` pinned to the given addresses.
    Pinned {
        host: &'a str,
        port: u16,
        addrs: &'a [IpAddr],
    },
    /// Directly, letting the client resolve (literal IP hosts).
    Direct,
}

impl ProbeTransport {
    /// Build a client for one probe fetch.
    ///
    /// Redirects are never followed: a 3xx is the probe's answer.
    /// HTTPS probes accept any certificate since portals commonly
    /// intercept TLS with their own.
    pub fn build_client(&self, route: &Route<'_>, https: bool) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .redirect(Policy::none());

        if https {
            builder = builder.danger_accept_invalid_certs(true);
        }

        match route {
            Route::Proxy(proxy) => {
                builder = builder.proxy(proxy.to_reqwest()?);
            }
            Route::Pinned { host, port, addrs } => {
                let sockets: Vec<SocketAddr> =
                    addrs.iter().map(|ip| SocketAddr::new(*ip, *port)).collect();
                builder = builder.no_proxy().resolve_to_addrs(host, &sockets);
            }
            Route::Direct => {
                builder = builder.no_proxy();
            }
        }

        builder
            .build()
            .map_err(|e| Error::ClientBuild(e.to_string()))
    }
}
