use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account-wide protective state. Mutated only through `RiskGuardrail`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub daily_pnl: f64,
    /// UTC calendar day (`%Y-%m-%d`) that `daily_pnl` belongs to.
    pub day: String,
    pub peak_balance: f64,
    pub last_balance: Option<f64>,
    pub consecutive_losses: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl RiskState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            daily_pnl: 0.0,
            day: utc_day(now),
            peak_balance: 0.0,
            last_balance: None,
            consecutive_losses: 0,
            cooldown_until: None,
            last_trade_at: None,
        }
    }

    /// Percentage decline of `balance` from the peak.
    pub fn drawdown_percent(&self, balance: f64) -> f64 {
        if self.peak_balance <= 0.0 || balance >= self.peak_balance {
            return 0.0;
        }
        (self.peak_balance - balance) / self.peak_balance * 100.0
    }
}

pub fn utc_day(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskSeverity {
    Ok,
    Warning,
    Blocked,
}

/// Outcome of an entry gate check. A block is a decision, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskDecision {
    pub allowed: bool,
    pub reason: String,
    pub severity: RiskSeverity,
}

impl RiskDecision {
    pub fn ok() -> Self {
        Self {
            allowed: true,
            reason: "within risk limits".to_string(),
            severity: RiskSeverity::Ok,
        }
    }

    pub fn warning(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            severity: RiskSeverity::Warning,
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            severity: RiskSeverity::Blocked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskMode {
    Normal,
    Conservative,
    Pause,
    Stop,
}

impl RiskMode {
    pub fn allows_entries(&self) -> bool {
        matches!(self, RiskMode::Normal | RiskMode::Conservative)
    }
}

impl std::fmt::Display for RiskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskMode::Normal => write!(f, "normal"),
            RiskMode::Conservative => write!(f, "conservative"),
            RiskMode::Pause => write!(f, "pause"),
            RiskMode::Stop => write!(f, "stop"),
        }
    }
}
