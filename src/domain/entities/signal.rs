use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitAction {
    Hold,
    PartialExit { fraction: f64 },
    FullExit,
}

/// Decision produced by evaluating one position against a price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub asset: String,
    pub action: ExitAction,
    pub reason: String,
    pub urgency: Urgency,
}

impl ExitSignal {
    pub fn hold(asset: &str, reason: impl Into<String>) -> Self {
        Self {
            asset: asset.to_string(),
            action: ExitAction::Hold,
            reason: reason.into(),
            urgency: Urgency::Low,
        }
    }

    pub fn full_exit(asset: &str, reason: impl Into<String>, urgency: Urgency) -> Self {
        Self {
            asset: asset.to_string(),
            action: ExitAction::FullExit,
            reason: reason.into(),
            urgency,
        }
    }

    pub fn partial_exit(asset: &str, fraction: f64, reason: impl Into<String>) -> Self {
        Self {
            asset: asset.to_string(),
            action: ExitAction::PartialExit { fraction },
            reason: reason.into(),
            urgency: Urgency::Medium,
        }
    }

    pub fn is_hold(&self) -> bool {
        matches!(self.action, ExitAction::Hold)
    }
}

/// Exit raised from the live price path, outside the regular tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrgentExit {
    pub signal: ExitSignal,
    pub trigger_price: f64,
    pub observed_at: DateTime<Utc>,
}
