// ── Detection results ──

use std::time::Duration;

use chrono::{DateTime, Utc};
use netconn_probe::{ProbeScheme, ProbeType};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use super::ids::NetId;

/// Internet-reachability verdict for one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NetDetectionStatus {
    Verification,
    CaptivePortal,
    Invalid,
    QualityGood,
    QualityPoor,
    AcceptUnvalidated,
    Unknown,
}

/// Outcome of a dual-stack probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DualStackProbeResult {
    Success,
    Portal,
    Ipv4Only,
    Ipv6Only,
    Fail,
}

/// One probe fetch inside a detection cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeRecord {
    pub probe_type: ProbeType,
    pub scheme: ProbeScheme,
    pub url: String,
    pub code: u16,
    #[serde(with = "millis")]
    pub elapsed: Duration,
    pub proxied: bool,
}

/// Diagnostic record of one completed detection cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    pub id: Uuid,
    pub net_id: NetId,
    pub status: NetDetectionStatus,
    pub redirect_url: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(with = "millis")]
    pub elapsed: Duration,
    pub probes: Vec<ProbeRecord>,
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}
