// ── HTTP proxy definition ──
//
// Shared by per-network link info and the global proxy setting. The
// password never serializes back out.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// An HTTP proxy as pushed by a network provider or set globally.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HttpProxy {
    pub host: String,
    pub port: u16,

    /// Hosts that bypass the proxy (`*.example.com`, `10.0.0.1`, ...).
    #[serde(default)]
    pub exclusions: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,
}

impl HttpProxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// A proxy with no host is the "no proxy" value.
    pub fn is_empty(&self) -> bool {
        self.host.trim().is_empty()
    }

    /// Proxy endpoint as a URL string.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host.trim(), self.port)
    }

    /// Convert into a `reqwest::Proxy` applying to both schemes.
    pub fn to_reqwest(&self) -> Result<reqwest::Proxy, Error> {
        if self.is_empty() {
            return Err(Error::Proxy("proxy host is empty".into()));
        }
        let mut proxy =
            reqwest::Proxy::all(self.endpoint()).map_err(|e| Error::Proxy(e.to_string()))?;

        if let Some(ref user) = self.username {
            let password = self
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_owned())
                .unwrap_or_default();
            proxy = proxy.basic_auth(user, &password);
        }

        if !self.exclusions.is_empty() {
            proxy = proxy.no_proxy(reqwest::NoProxy::from_string(&self.exclusions.join(",")));
        }

        Ok(proxy)
    }
}

impl PartialEq for HttpProxy {
    fn eq(&self, other: &Self) -> bool {
        let password = |p: &Self| p.password.as_ref().map(|s| s.expose_secret().to_owned());
        self.host == other.host
            && self.port == other.port
            && self.exclusions == other.exclusions
            && self.username == other.username
            && password(self) == password(other)
    }
}

impl Eq for HttpProxy {}
