// ── Runtime arbiter configuration ──
//
// Tuning for detection, dual-stack probing, request quotas and link
// programming. The binary builds an `ArbiterConfig` from its config
// file and hands it in; core never reads files.

use std::time::Duration;

use netconn_probe::ProbeTransport;

pub const DEFAULT_HTTP_PROBE_URL: &str = "http://connectivitycheck.platform.hicloud.com/generate_204";
pub const DEFAULT_HTTPS_PROBE_URL: &str =
    "https://connectivitycheck.platform.hicloud.com/generate_204";
pub const DEFAULT_FALLBACK_HTTP_PROBE_URL: &str = "http://www.google.cn/generate_204";
pub const DEFAULT_FALLBACK_HTTPS_PROBE_URL: &str = "https://www.google.cn/generate_204";
pub const DEFAULT_BACKUP_DOMAIN: &str = "connectivitycheck.platform.hicloud.com";

/// Network validation tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionConfig {
    /// When false, link updates never start detection. Explicit
    /// `net_detection` calls still run.
    pub enabled: bool,
    pub http_url: String,
    pub https_url: String,
    pub fallback_http_url: String,
    pub fallback_https_url: String,
    pub connect_timeout: Duration,
    pub transfer_timeout: Duration,
    /// Wait for the primary HTTP/HTTPS pair before looking at fallbacks.
    pub primary_wait: Duration,
    /// Extra wait for the whole batch when the primary pair was inconclusive.
    pub batch_wait: Duration,
    /// Backoff floor after a failed cycle.
    pub init_delay: Duration,
    /// Backoff ceiling.
    pub max_failed_delay: Duration,
    pub portal_delay: Duration,
    /// Portal re-check delay on wifi while the screen is off.
    pub portal_delay_screen_off: Duration,
    /// Delay applied to detection when an identical address set arrives
    /// within `relink_window` of the previous cycle start.
    pub relink_debounce: Duration,
    pub relink_window: Duration,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            http_url: DEFAULT_HTTP_PROBE_URL.into(),
            https_url: DEFAULT_HTTPS_PROBE_URL.into(),
            fallback_http_url: DEFAULT_FALLBACK_HTTP_PROBE_URL.into(),
            fallback_https_url: DEFAULT_FALLBACK_HTTPS_PROBE_URL.into(),
            connect_timeout: Duration::from_millis(5000),
            transfer_timeout: Duration::from_millis(5000),
            primary_wait: Duration::from_millis(3000),
            batch_wait: Duration::from_millis(3000),
            init_delay: Duration::from_millis(8000),
            max_failed_delay: Duration::from_millis(300_000),
            portal_delay: Duration::from_millis(60_000),
            portal_delay_screen_off: Duration::from_millis(300_000),
            relink_debounce: Duration::from_millis(3000),
            relink_window: Duration::from_millis(1000),
        }
    }
}

impl DetectionConfig {
    pub fn transport(&self) -> ProbeTransport {
        ProbeTransport {
            connect_timeout: self.connect_timeout,
            timeout: self.transfer_timeout,
            ..ProbeTransport::default()
        }
    }
}

/// Dual-stack probe tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualStackConfig {
    /// Resolved alongside the probe URL host to widen the address lists.
    pub backup_domain: String,
    pub dns_timeout: Duration,
    /// A single-family success only counts when it answered faster than this.
    pub success_threshold: Duration,
}

impl Default for DualStackConfig {
    fn default() -> Self {
        Self {
            backup_domain: DEFAULT_BACKUP_DOMAIN.into(),
            dns_timeout: Duration::from_millis(5000),
            success_threshold: Duration::from_millis(2000),
        }
    }
}

/// Request registration ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_requests: usize,
    pub max_requests_per_uid: usize,
    /// Separate bucket for internal-default and cellular requests.
    pub max_internal_requests_per_uid: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_requests: 2000,
            max_requests_per_uid: 2000,
            max_internal_requests_per_uid: 2000,
        }
    }
}

/// Bounds applied when programming link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLimits {
    pub max_ipv4_dns: usize,
    pub max_ipv6_dns: usize,
}

impl Default for LinkLimits {
    fn default() -> Self {
        Self {
            max_ipv4_dns: 5,
            max_ipv6_dns: 2,
        }
    }
}

/// Everything the arbiter needs to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArbiterConfig {
    pub detection: DetectionConfig,
    pub dual_stack: DualStackConfig,
    pub limits: RequestLimits,
    pub link: LinkLimits,
    /// Reject requests asking for the MMS capability.
    pub mms_disabled: bool,
}
