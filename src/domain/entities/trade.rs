use crate::domain::value_objects::PnL;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A realized sale of some or all of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub asset: String,
    pub quantity: f64,
    pub cost_basis: f64,
    pub proceeds: f64,
    pub pnl: PnL,
    pub reason: String,
    pub partial: bool,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.pnl.is_profit()
    }

    pub fn is_loss(&self) -> bool {
        self.pnl.is_loss()
    }
}
