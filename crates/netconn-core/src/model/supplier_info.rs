// ── Supplier-pushed metadata ──

use serde::{Deserialize, Serialize};

/// Availability and radio metadata a supplier pushes about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetSupplierInfo {
    pub is_available: bool,
    #[serde(default)]
    pub is_roaming: bool,
    #[serde(default)]
    pub strength: i8,
    #[serde(default)]
    pub frequency: u16,
    #[serde(default)]
    pub link_up_bandwidth_kbps: u32,
    #[serde(default)]
    pub link_down_bandwidth_kbps: u32,
    #[serde(default)]
    pub uid: u32,
    /// Explicit score override. Zero keeps the bearer default.
    #[serde(default)]
    pub score: u8,
}

impl NetSupplierInfo {
    pub fn available() -> Self {
        Self {
            is_available: true,
            ..Self::default()
        }
    }

    pub fn with_score(mut self, score: u8) -> Self {
        self.score = score;
        self
    }
}
