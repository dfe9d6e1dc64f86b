//! Database Models

use crate::domain::entities::ClosedTrade;
use crate::domain::value_objects::PnL;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stored snapshot document
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StateRecord {
    pub key: String,
    pub payload: String, // JSON
    pub updated_at: DateTime<Utc>,
}

/// Journal row for a realized sale
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClosedTradeRecord {
    pub id: i64,
    pub asset: String,
    pub quantity: f64,
    pub cost_basis: f64,
    pub proceeds: f64,
    pub pnl: f64,
    pub reason: String,
    pub partial: bool,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTradeRecord {
    pub fn into_trade(self) -> ClosedTrade {
        ClosedTrade {
            asset: self.asset,
            quantity: self.quantity,
            cost_basis: self.cost_basis,
            proceeds: self.proceeds,
            pnl: PnL::new(self.pnl).unwrap_or_else(|_| PnL::zero()),
            reason: self.reason,
            partial: self.partial,
            closed_at: self.closed_at,
        }
    }
}
