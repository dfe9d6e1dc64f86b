//! Trade Executor Trait
//!
//! Venue-specific swap execution sits behind this trait. The agent only needs
//! "spend this much capital on an asset" and "sell this much of an asset".
//! Which venue or route is used (bonding curve or graduated pool) is the
//! implementation's choice; liquidations rely on it picking the most liquid one.

use crate::domain::errors::ExecutionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Result of a buy that filled completely.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BuyFill {
    pub filled_quantity: f64,
    pub fill_price: f64,
}

/// Result of a sell that filled completely.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SellFill {
    pub received_capital: f64,
}

#[async_trait]
pub trait TradeExecutor: Send + Sync {
    /// Spend `capital_amount` of base currency on `asset`.
    ///
    /// A zero or partial fill is an error (`ZeroFill` / `PartialFill`), never
    /// an `Ok` with a zero quantity.
    async fn buy(&self, asset: &str, capital_amount: f64) -> ExecutionResult<BuyFill>;

    /// Sell `quantity` of `asset` for base currency.
    async fn sell(&self, asset: &str, quantity: f64) -> ExecutionResult<SellFill>;

    /// Spendable base-currency balance.
    async fn base_balance(&self) -> ExecutionResult<f64>;

    fn name(&self) -> &str;
}
