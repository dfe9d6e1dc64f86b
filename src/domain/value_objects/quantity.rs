use crate::domain::errors::ValidationError;
use serde::{Deserialize, Serialize};

/// A non-negative, finite amount of some asset.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Quantity(f64);

impl Quantity {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if value < 0.0 {
            return Err(ValidationError::MustBeNonNegative);
        }
        Ok(Quantity(value))
    }

    /// Like `new` but also rejects zero, for amounts that must hold something.
    pub fn positive(value: f64) -> Result<Self, ValidationError> {
        let qty = Quantity::new(value)?;
        if qty.is_zero() {
            return Err(ValidationError::InvalidQuantity(
                "quantity must be greater than zero".to_string(),
            ));
        }
        Ok(qty)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0.0
    }
}
