use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Low,
    Critical,
    Emergency,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Low => write!(f, "low"),
            HealthStatus::Critical => write!(f, "critical"),
            HealthStatus::Emergency => write!(f, "emergency"),
        }
    }
}

/// Capital-health record. Mutated only through `SurvivalAllocator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurvivalState {
    pub reserve_balance: f64,
    pub reserve_value: f64,
    pub total_reserve_purchased: f64,
    pub total_reserve_sold: f64,
    pub survival_sell_count: u32,
    pub status: HealthStatus,
    pub last_checked: Option<DateTime<Utc>>,
    /// Profit earmarked for the reserve but too small to trade yet.
    pub pending_reserve_carry: f64,
}

impl Default for SurvivalState {
    fn default() -> Self {
        Self {
            reserve_balance: 0.0,
            reserve_value: 0.0,
            total_reserve_purchased: 0.0,
            total_reserve_sold: 0.0,
            survival_sell_count: 0,
            status: HealthStatus::Healthy,
            last_checked: None,
            pending_reserve_carry: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SurvivalAction {
    None,
    Monitor,
    /// Sell `quantity` (= `fraction` of the reserve balance) of the reserve asset.
    Liquidate { fraction: f64, quantity: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub action: SurvivalAction,
    pub fraction: f64,
    pub reason: String,
}

/// Reserve-asset buy to execute with earmarked profit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReservePurchase {
    pub amount: f64,
}
