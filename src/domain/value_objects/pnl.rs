use crate::domain::errors::ValidationError;
use serde::{Deserialize, Serialize};

/// Realized profit or loss in base currency. Negative values are losses;
/// exactly zero is neither.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct PnL(f64);

impl PnL {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        Ok(PnL(value))
    }

    /// P&L of selling for `proceeds` something that cost `cost_basis`.
    pub fn from_trade(proceeds: f64, cost_basis: f64) -> Result<Self, ValidationError> {
        PnL::new(proceeds - cost_basis)
    }

    pub fn zero() -> Self {
        PnL(0.0)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_profit(&self) -> bool {
        self.0 > 0.0
    }

    pub fn is_loss(&self) -> bool {
        self.0 < 0.0
    }
}

impl std::fmt::Display for PnL {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 >= 0.0 {
            write!(f, "+{:.6}", self.0)
        } else {
            write!(f, "-{:.6}", self.0.abs())
        }
    }
}
