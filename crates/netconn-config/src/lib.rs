//! Configuration for the netconn arbiter.
//!
//! TOML file + `NETCONN_` environment overrides, validated and
//! translated into `netconn_core::ArbiterConfig`. Durations are plain
//! millisecond integers on disk.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use netconn_core::config::{
    DEFAULT_BACKUP_DOMAIN, DEFAULT_FALLBACK_HTTP_PROBE_URL, DEFAULT_FALLBACK_HTTPS_PROBE_URL,
    DEFAULT_HTTP_PROBE_URL, DEFAULT_HTTPS_PROBE_URL,
};
use netconn_core::{
    ArbiterConfig, DetectionConfig, DualStackConfig, InetAddr, LinkLimits, NetBearType, NetCap,
    NetCaps, NetLinkInfo, NetSupplierInfo, RequestLimits,
};
use netconn_probe::HttpProxy;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub detection: DetectionSection,
    pub dual_stack: DualStackSection,
    pub limits: LimitsSection,
    pub link: LinkSection,
    pub policy: PolicySection,
    pub log: LogSection,

    /// Global HTTP proxy applied to every probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySection>,

    /// Simulated suppliers brought up by `netconn serve`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suppliers: Vec<SupplierProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectionSection {
    pub enabled: bool,
    pub http_url: String,
    pub https_url: String,
    pub fallback_http_url: String,
    pub fallback_https_url: String,
    pub connect_timeout_ms: u64,
    pub transfer_timeout_ms: u64,
    pub primary_wait_ms: u64,
    pub batch_wait_ms: u64,
    pub init_delay_ms: u64,
    pub max_failed_delay_ms: u64,
    pub portal_delay_ms: u64,
    pub portal_delay_screen_off_ms: u64,
    pub relink_debounce_ms: u64,
    pub relink_window_ms: u64,
}

impl Default for DetectionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            http_url: DEFAULT_HTTP_PROBE_URL.into(),
            https_url: DEFAULT_HTTPS_PROBE_URL.into(),
            fallback_http_url: DEFAULT_FALLBACK_HTTP_PROBE_URL.into(),
            fallback_https_url: DEFAULT_FALLBACK_HTTPS_PROBE_URL.into(),
            connect_timeout_ms: 5000,
            transfer_timeout_ms: 5000,
            primary_wait_ms: 3000,
            batch_wait_ms: 3000,
            init_delay_ms: 8000,
            max_failed_delay_ms: 300_000,
            portal_delay_ms: 60_000,
            portal_delay_screen_off_ms: 300_000,
            relink_debounce_ms: 3000,
            relink_window_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DualStackSection {
    pub backup_domain: String,
    pub dns_timeout_ms: u64,
    pub success_threshold_ms: u64,
}

impl Default for DualStackSection {
    fn default() -> Self {
        Self {
            backup_domain: DEFAULT_BACKUP_DOMAIN.into(),
            dns_timeout_ms: 5000,
            success_threshold_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsSection {
    pub max_requests: usize,
    pub max_requests_per_uid: usize,
    pub max_internal_requests_per_uid: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        let limits = RequestLimits::default();
        Self {
            max_requests: limits.max_requests,
            max_requests_per_uid: limits.max_requests_per_uid,
            max_internal_requests_per_uid: limits.max_internal_requests_per_uid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkSection {
    pub max_ipv4_dns: usize,
    pub max_ipv6_dns: usize,
}

impl Default for LinkSection {
    fn default() -> Self {
        let link = LinkLimits::default();
        Self {
            max_ipv4_dns: link.max_ipv4_dns,
            max_ipv6_dns: link.max_ipv6_dns,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicySection {
    pub mms_disabled: bool,
    pub airplane_mode: bool,
    pub restrict_background: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogSection {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
    /// Optional log file; stderr when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
            file: None,
        }
    }
}

/// Global proxy as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySection {
    pub host: String,
    pub port: u16,
    pub exclusions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Environment variable holding the proxy password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Plaintext password (prefer `password_env`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// A supplier the `serve` command registers and brings up at start.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SupplierProfile {
    pub bearer: NetBearType,
    pub ident: String,
    pub iface: String,

    #[serde(default = "default_caps")]
    pub caps: NetCaps,

    /// Addresses in `addr/prefix` form; a bare address is a host route.
    #[serde(default)]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub dns: Vec<IpAddr>,

    /// 0 keeps the bearer's default score.
    #[serde(default)]
    pub score: u8,

    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_caps() -> NetCaps {
    NetCaps::empty()
        .with(NetCap::Internet)
        .with(NetCap::NotVpn)
}

const fn default_true() -> bool {
    true
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "netconn", "netconn").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("netconn");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Defaults, then the TOML file at `path` (if present), then `NETCONN_`
/// environment variables with `__` separating nested keys.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("NETCONN_").split("__"))
}

/// Load the config from `path`, or the canonical path when `None`.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let config: Config = figment(&path).extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize the config to TOML.
pub fn render_config(cfg: &Config) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(cfg)?)
}

/// Write the config to `path`, creating parent directories.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render_config(cfg)?)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Validate and convert into the runtime arbiter configuration.
    pub fn to_arbiter_config(&self) -> Result<ArbiterConfig, ConfigError> {
        Ok(ArbiterConfig {
            detection: self.detection.to_runtime()?,
            dual_stack: self.dual_stack.to_runtime()?,
            limits: self.limits.to_runtime()?,
            link: LinkLimits {
                max_ipv4_dns: self.link.max_ipv4_dns,
                max_ipv6_dns: self.link.max_ipv6_dns,
            },
            mms_disabled: self.policy.mms_disabled,
        })
    }

    /// Global proxy with its password resolved, if one is configured.
    pub fn global_proxy(&self) -> Result<Option<HttpProxy>, ConfigError> {
        self.proxy.as_ref().map(ProxySection::resolve).transpose()
    }

    /// Check every section without building anything long-lived.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_arbiter_config()?;
        self.global_proxy()?;
        match self.log.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(invalid(
                    "log.format",
                    format!("expected 'pretty' or 'json', got '{other}'"),
                ));
            }
        }
        for supplier in &self.suppliers {
            supplier.link_info()?;
        }
        Ok(())
    }
}

impl DetectionSection {
    fn to_runtime(&self) -> Result<DetectionConfig, ConfigError> {
        check_url("detection.http_url", &self.http_url, "http")?;
        check_url("detection.https_url", &self.https_url, "https")?;
        check_url("detection.fallback_http_url", &self.fallback_http_url, "http")?;
        check_url("detection.fallback_https_url", &self.fallback_https_url, "https")?;
        if self.init_delay_ms > self.max_failed_delay_ms {
            return Err(invalid(
                "detection.init_delay_ms",
                "must not exceed detection.max_failed_delay_ms",
            ));
        }
        Ok(DetectionConfig {
            enabled: self.enabled,
            http_url: self.http_url.clone(),
            https_url: self.https_url.clone(),
            fallback_http_url: self.fallback_http_url.clone(),
            fallback_https_url: self.fallback_https_url.clone(),
            connect_timeout: positive_ms("detection.connect_timeout_ms", self.connect_timeout_ms)?,
            transfer_timeout: positive_ms(
                "detection.transfer_timeout_ms",
                self.transfer_timeout_ms,
            )?,
            primary_wait: positive_ms("detection.primary_wait_ms", self.primary_wait_ms)?,
            batch_wait: positive_ms("detection.batch_wait_ms", self.batch_wait_ms)?,
            init_delay: positive_ms("detection.init_delay_ms", self.init_delay_ms)?,
            max_failed_delay: positive_ms(
                "detection.max_failed_delay_ms",
                self.max_failed_delay_ms,
            )?,
            portal_delay: positive_ms("detection.portal_delay_ms", self.portal_delay_ms)?,
            portal_delay_screen_off: positive_ms(
                "detection.portal_delay_screen_off_ms",
                self.portal_delay_screen_off_ms,
            )?,
            relink_debounce: Duration::from_millis(self.relink_debounce_ms),
            relink_window: Duration::from_millis(self.relink_window_ms),
        })
    }
}

impl DualStackSection {
    fn to_runtime(&self) -> Result<DualStackConfig, ConfigError> {
        if self.backup_domain.trim().is_empty() {
            return Err(invalid("dual_stack.backup_domain", "must not be empty"));
        }
        Ok(DualStackConfig {
            backup_domain: self.backup_domain.trim().to_owned(),
            dns_timeout: positive_ms("dual_stack.dns_timeout_ms", self.dns_timeout_ms)?,
            success_threshold: positive_ms(
                "dual_stack.success_threshold_ms",
                self.success_threshold_ms,
            )?,
        })
    }
}

impl LimitsSection {
    fn to_runtime(&self) -> Result<RequestLimits, ConfigError> {
        for (field, value) in [
            ("limits.max_requests", self.max_requests),
            ("limits.max_requests_per_uid", self.max_requests_per_uid),
            (
                "limits.max_internal_requests_per_uid",
                self.max_internal_requests_per_uid,
            ),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be at least 1"));
            }
        }
        Ok(RequestLimits {
            max_requests: self.max_requests,
            max_requests_per_uid: self.max_requests_per_uid,
            max_internal_requests_per_uid: self.max_internal_requests_per_uid,
        })
    }
}

impl ProxySection {
    /// Build the proxy, resolving the password from `password_env`
    /// first and the plaintext field second.
    pub fn resolve(&self) -> Result<HttpProxy, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(invalid("proxy.host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("proxy.port", "must be non-zero"));
        }
        let password = self
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .or_else(|| self.password.clone())
            .map(SecretString::from);
        Ok(HttpProxy {
            host: self.host.trim().to_owned(),
            port: self.port,
            exclusions: self.exclusions.clone(),
            username: self.username.clone(),
            password,
        })
    }
}

impl SupplierProfile {
    pub fn supplier_info(&self) -> NetSupplierInfo {
        NetSupplierInfo {
            is_available: self.available,
            ..NetSupplierInfo::default()
        }
        .with_score(self.score)
    }

    /// Link info for the profile's interface, addresses and DNS servers.
    pub fn link_info(&self) -> Result<NetLinkInfo, ConfigError> {
        if self.iface.trim().is_empty() {
            return Err(invalid("suppliers.iface", "must not be empty"));
        }
        let addresses = self
            .addresses
            .iter()
            .map(|raw| parse_inet_addr(raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NetLinkInfo {
            ident: self.ident.clone(),
            addresses,
            dns: self.dns.clone(),
            ..NetLinkInfo::new(self.iface.trim())
        })
    }
}

// ── Validation helpers ──────────────────────────────────────────────

fn check_url(field: &str, raw: &str, scheme: &str) -> Result<(), ConfigError> {
    let url: url::Url = raw
        .parse()
        .map_err(|_| invalid(field, format!("invalid URL: {raw}")))?;
    if url.scheme() != scheme {
        return Err(invalid(
            field,
            format!("expected a {scheme} URL, got '{}'", url.scheme()),
        ));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid(field, format!("URL has no host: {raw}")));
    }
    Ok(())
}

fn positive_ms(field: &str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(Duration::from_millis(ms))
}

fn parse_inet_addr(raw: &str) -> Result<InetAddr, ConfigError> {
    let field = "suppliers.addresses";
    let (addr, prefix) = match raw.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (raw, None),
    };
    let address: IpAddr = addr
        .trim()
        .parse()
        .map_err(|_| invalid(field, format!("invalid address: {raw}")))?;
    let max = if address.is_ipv4() { 32 } else { 128 };
    let prefix_len = match prefix {
        Some(p) => p
            .trim()
            .parse::<u8>()
            .ok()
            .filter(|p| *p <= max)
            .ok_or_else(|| invalid(field, format!("invalid prefix length: {raw}")))?,
        None => max,
    };
    Ok(InetAddr::new(address, prefix_len))
}
