// ── Capabilities and bearer types ──

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{Display, EnumIter, EnumString, FromRepr, IntoEnumIterator};

use crate::error::CoreError;

/// Capability numbers at or above this value are ignored.
pub const FIRST_INVALID_CAP: u32 = 64;

/// A single network capability.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    EnumString,
    FromRepr,
    Serialize,
    Deserialize,
)]
#[repr(u32)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetCap {
    Mms = 0,
    Supl = 1,
    Dun = 2,
    Ia = 3,
    Xcap = 4,
    Bip = 5,
    NotMetered = 11,
    Internet = 12,
    NotVpn = 15,
    Validated = 16,
    Portal = 17,
    InternalDefault = 18,
    CheckingConnectivity = 31,
}

impl NetCap {
    #[allow(clippy::as_conversions)]
    pub const fn bit(self) -> u32 {
        self as u32
    }
}

// ── NetCaps ─────────────────────────────────────────────────────────

/// Bitset of capabilities, indexed by capability number.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NetCaps(u64);

impl NetCaps {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn insert(&mut self, cap: NetCap) {
        self.insert_raw(cap.bit());
    }

    /// Insert by number. Out-of-range numbers are dropped.
    pub fn insert_raw(&mut self, cap: u32) {
        if cap < FIRST_INVALID_CAP {
            self.0 |= 1_u64 << cap;
        }
    }

    pub fn remove(&mut self, cap: NetCap) {
        self.0 &= !(1_u64 << cap.bit());
    }

    pub fn has(self, cap: NetCap) -> bool {
        self.has_raw(cap.bit())
    }

    pub fn has_raw(self, cap: u32) -> bool {
        cap < FIRST_INVALID_CAP && self.0 & (1_u64 << cap) != 0
    }

    /// Whether every capability in `other` is present here.
    pub fn contains_all(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn with(mut self, cap: NetCap) -> Self {
        self.insert(cap);
        self
    }

    pub fn without(mut self, cap: NetCap) -> Self {
        self.remove(cap);
        self
    }

    /// Named capabilities present in the set, in numeric order.
    pub fn iter(self) -> impl Iterator<Item = NetCap> {
        NetCap::iter().filter(move |cap| self.has(*cap))
    }

    pub fn to_set(self) -> BTreeSet<NetCap> {
        self.iter().collect()
    }
}

impl FromIterator<NetCap> for NetCaps {
    fn from_iter<I: IntoIterator<Item = NetCap>>(iter: I) -> Self {
        let mut caps = Self::empty();
        for cap in iter {
            caps.insert(cap);
        }
        caps
    }
}

impl Extend<NetCap> for NetCaps {
    fn extend<I: IntoIterator<Item = NetCap>>(&mut self, iter: I) {
        for cap in iter {
            self.insert(cap);
        }
    }
}

impl fmt::Debug for NetCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for NetCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|c| c.to_string()).collect();
        f.write_str(&names.join(","))
    }
}

impl Serialize for NetCaps {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for NetCaps {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let caps = Vec::<NetCap>::deserialize(deserializer)?;
        Ok(caps.into_iter().collect())
    }
}

// ── Bearer types ────────────────────────────────────────────────────

/// Physical or virtual transport carrying a network.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    EnumString,
    FromRepr,
    Serialize,
    Deserialize,
)]
#[repr(u32)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum NetBearType {
    Cellular = 0,
    Wifi = 1,
    Bluetooth = 2,
    Ethernet = 3,
    Vpn = 4,
    #[strum(serialize = "wifi-aware")]
    #[serde(rename = "wifi-aware")]
    WifiAware = 5,
}

impl NetBearType {
    /// Baseline score before any validation penalty.
    pub const fn base_score(self) -> u8 {
        match self {
            Self::Bluetooth | Self::WifiAware => 50,
            Self::Cellular => 60,
            Self::Wifi => 70,
            Self::Ethernet => 80,
            Self::Vpn => 90,
        }
    }

    /// Bearers whose detection probes honor a configured HTTP proxy.
    pub const fn probes_through_proxy(self) -> bool {
        matches!(self, Self::Wifi | Self::Ethernet)
    }
}

impl TryFrom<u32> for NetBearType {
    type Error = CoreError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::from_repr(raw).ok_or(CoreError::InvalidBearer { bearer: raw })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn out_of_range_caps_are_ignored() {
        let mut caps = NetCaps::empty();
        caps.insert_raw(FIRST_INVALID_CAP);
        caps.insert_raw(200);
        assert!(caps.is_empty());
        assert!(!caps.has_raw(FIRST_INVALID_CAP));

        caps.insert_raw(63);
        assert!(caps.has_raw(63));
    }

    #[test]
    fn contains_all_is_subset_check() {
        let have: NetCaps = [NetCap::Internet, NetCap::NotVpn, NetCap::Validated]
            .into_iter()
            .collect();
        let want: NetCaps = [NetCap::Internet, NetCap::NotVpn].into_iter().collect();
        assert!(have.contains_all(want));
        assert!(!want.contains_all(have));
        assert!(have.contains_all(NetCaps::empty()));
    }

    #[test]
    fn caps_serialize_as_names() {
        let caps = NetCaps::empty()
            .with(NetCap::Validated)
            .with(NetCap::Internet);
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, r#"["INTERNET","VALIDATED"]"#);
        let back: NetCaps = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
        assert_eq!(caps.to_string(), "INTERNET,VALIDATED");
    }

    #[test]
    fn bearer_from_raw() {
        assert_eq!(NetBearType::try_from(1).unwrap(), NetBearType::Wifi);
        assert!(matches!(
            NetBearType::try_from(6),
            Err(CoreError::InvalidBearer { bearer: 6 })
        ));
        assert_eq!("wifi-aware".parse::<NetBearType>().unwrap(), NetBearType::WifiAware);
    }

    #[test]
    fn base_scores_order_bearers() {
        assert!(NetBearType::Ethernet.base_score() > NetBearType::Wifi.base_score());
        assert!(NetBearType::Wifi.base_score() > NetBearType::Cellular.base_score());
        assert_eq!(NetBearType::Vpn.base_score(), 90);
    }
}
