use crate::domain::errors::ValidationError;
use crate::domain::value_objects::{Price, Quantity};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Active,
    /// A trailing stop has been armed.
    Trailing,
    /// An exit has been claimed and a sell is in flight.
    Exiting,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionStatus::Active => write!(f, "active"),
            PositionStatus::Trailing => write!(f, "trailing"),
            PositionStatus::Exiting => write!(f, "exiting"),
        }
    }
}

fn unit_factor() -> f64 {
    1.0
}

/// One open holding of a traded asset.
///
/// `highest_price >= entry_price >= lowest_price` is not an invariant: the
/// low watermark can dip below entry and the high one only tracks what has
/// been observed since the position was opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub asset: String,
    pub entry_price: f64,
    pub quantity: f64,
    /// Capital spent on the remaining quantity (cost basis).
    pub capital_value: f64,
    pub entry_time: DateTime<Utc>,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub trailing_stop_price: Option<f64>,
    pub partial_exit_done: bool,
    pub status: PositionStatus,
    pub last_evaluated: Option<DateTime<Utc>>,
    pub evaluation_count: u64,
    /// Multiplier applied to the trailing gap; below 1.0 after stops were tightened.
    #[serde(default = "unit_factor")]
    pub stop_tightening: f64,
}

impl Position {
    pub fn new(
        asset: String,
        entry_price: Price,
        quantity: Quantity,
        capital_value: f64,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if asset.trim().is_empty() {
            return Err(ValidationError::InvalidAsset(
                "asset identifier is empty".to_string(),
            ));
        }
        if quantity.is_zero() {
            return Err(ValidationError::InvalidQuantity(
                "cannot open a position with zero quantity".to_string(),
            ));
        }
        if !capital_value.is_finite() || capital_value <= 0.0 {
            return Err(ValidationError::InvalidQuantity(format!(
                "capital value must be positive, got {}",
                capital_value
            )));
        }

        Ok(Position {
            asset,
            entry_price: entry_price.value(),
            quantity: quantity.value(),
            capital_value,
            entry_time: now,
            highest_price: entry_price.value(),
            lowest_price: entry_price.value(),
            trailing_stop_price: None,
            partial_exit_done: false,
            status: PositionStatus::Active,
            last_evaluated: None,
            evaluation_count: 0,
            stop_tightening: 1.0,
        })
    }

    /// Averages another fill into this position: weighted entry price,
    /// summed quantity and capital value.
    pub fn average_in(
        &mut self,
        fill_price: Price,
        quantity: Quantity,
        capital_value: f64,
    ) -> Result<(), ValidationError> {
        if quantity.is_zero() {
            return Err(ValidationError::InvalidQuantity(
                "cannot average in zero quantity".to_string(),
            ));
        }
        if !capital_value.is_finite() || capital_value <= 0.0 {
            return Err(ValidationError::InvalidQuantity(format!(
                "capital value must be positive, got {}",
                capital_value
            )));
        }

        let total_qty = self.quantity + quantity.value();
        self.entry_price =
            (self.entry_price * self.quantity + fill_price.value() * quantity.value()) / total_qty;
        self.quantity = total_qty;
        self.capital_value += capital_value;
        self.highest_price = self.highest_price.max(fill_price.value());
        self.lowest_price = self.lowest_price.min(fill_price.value());
        Ok(())
    }

    /// Records a price observation: updates the watermarks and evaluation bookkeeping.
    pub fn observe(&mut self, price: Price, now: DateTime<Utc>) {
        let p = price.value();
        if p > self.highest_price {
            self.highest_price = p;
        }
        if p < self.lowest_price {
            self.lowest_price = p;
        }
        self.last_evaluated = Some(now);
        self.evaluation_count += 1;
    }

    /// Unrealized change versus entry, in whole percent.
    pub fn gain_percent(&self, price: Price) -> f64 {
        (price.value() - self.entry_price) / self.entry_price * 100.0
    }

    pub fn held_for(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.entry_time)
    }

    pub fn market_value(&self, price: Price) -> f64 {
        self.quantity * price.value()
    }

    /// Raises the trailing stop to `candidate` if that is higher than the
    /// current stop. Returns true when the stop moved.
    pub fn ratchet_stop(&mut self, candidate: f64) -> bool {
        if !candidate.is_finite() || candidate <= 0.0 {
            return false;
        }
        match self.trailing_stop_price {
            Some(current) if candidate <= current => false,
            _ => {
                self.trailing_stop_price = Some(candidate);
                if self.status == PositionStatus::Active {
                    self.status = PositionStatus::Trailing;
                }
                true
            }
        }
    }

    /// Status to return to after an exit claim is released.
    pub fn resting_status(&self) -> PositionStatus {
        if self.trailing_stop_price.is_some() {
            PositionStatus::Trailing
        } else {
            PositionStatus::Active
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.status == PositionStatus::Exiting
    }
}
