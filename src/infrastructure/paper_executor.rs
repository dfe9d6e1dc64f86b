//! Simulated execution against live quotes.
//!
//! Buys fill at `price * (1 + slippage)` and sells at `price * (1 - slippage)`;
//! a fee in basis points is taken from the base-currency leg of both.

use crate::domain::errors::ExecutionError;
use crate::domain::repositories::{BuyFill, ExecutionResult, MarketData, SellFill, TradeExecutor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

const BPS: f64 = 10_000.0;

#[derive(Debug)]
struct PaperBook {
    cash: f64,
    holdings: HashMap<String, f64>,
}

pub struct PaperExecutor {
    market: Arc<dyn MarketData>,
    slippage_bps: f64,
    fee_bps: f64,
    book: Mutex<PaperBook>,
}

impl PaperExecutor {
    pub fn new(
        market: Arc<dyn MarketData>,
        starting_balance: f64,
        slippage_bps: f64,
        fee_bps: f64,
    ) -> Self {
        Self {
            market,
            slippage_bps: slippage_bps.max(0.0),
            fee_bps: fee_bps.max(0.0),
            book: Mutex::new(PaperBook {
                cash: starting_balance.max(0.0),
                holdings: HashMap::new(),
            }),
        }
    }

    /// Seeds a holding, e.g. positions restored from a snapshot.
    pub async fn credit_holding(&self, asset: &str, quantity: f64) {
        let mut book = self.book.lock().await;
        *book.holdings.entry(asset.to_string()).or_insert(0.0) += quantity;
    }

    pub async fn holding(&self, asset: &str) -> f64 {
        self.book.lock().await.holdings.get(asset).copied().unwrap_or(0.0)
    }

    async fn price(&self, asset: &str) -> ExecutionResult<f64> {
        self.market
            .get_quote(asset)
            .await
            .map(|q| q.price)
            .map_err(|e| ExecutionError::Network(format!("no quote for {}: {}", asset, e)))
    }
}

#[async_trait]
impl TradeExecutor for PaperExecutor {
    async fn buy(&self, asset: &str, capital_amount: f64) -> ExecutionResult<BuyFill> {
        if !capital_amount.is_finite() || capital_amount <= 0.0 {
            return Err(ExecutionError::Rejected(format!(
                "invalid buy amount {}",
                capital_amount
            )));
        }
        let price = self.price(asset).await?;

        let mut book = self.book.lock().await;
        if capital_amount > book.cash {
            return Err(ExecutionError::InsufficientFunds {
                required: capital_amount,
                available: book.cash,
            });
        }

        let fill_price = price * (1.0 + self.slippage_bps / BPS);
        let spent = capital_amount * (1.0 - self.fee_bps / BPS);
        let quantity = spent / fill_price;
        if quantity <= 0.0 || !quantity.is_finite() {
            return Err(ExecutionError::ZeroFill(asset.to_string()));
        }

        book.cash -= capital_amount;
        *book.holdings.entry(asset.to_string()).or_insert(0.0) += quantity;
        info!(
            "[paper] bought {:.6} {} @ {:.9} for {:.6}",
            quantity, asset, fill_price, capital_amount
        );
        Ok(BuyFill {
            filled_quantity: quantity,
            fill_price,
        })
    }

    async fn sell(&self, asset: &str, quantity: f64) -> ExecutionResult<SellFill> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(ExecutionError::Rejected(format!(
                "invalid sell quantity {}",
                quantity
            )));
        }
        let price = self.price(asset).await?;

        let mut book = self.book.lock().await;
        let held = book.holdings.get(asset).copied().unwrap_or(0.0);
        // float dust from averaging is tolerated
        if quantity > held * (1.0 + 1e-9) {
            return Err(ExecutionError::Rejected(format!(
                "sell of {} {} exceeds holdings of {}",
                quantity, asset, held
            )));
        }

        let fill_price = price * (1.0 - self.slippage_bps / BPS);
        let received = quantity * fill_price * (1.0 - self.fee_bps / BPS);

        let remaining = (held - quantity).max(0.0);
        if remaining <= held * 1e-9 {
            book.holdings.remove(asset);
        } else {
            book.holdings.insert(asset.to_string(), remaining);
        }
        book.cash += received;
        info!(
            "[paper] sold {:.6} {} @ {:.9} for {:.6}",
            quantity, asset, fill_price, received
        );
        Ok(SellFill {
            received_capital: received,
        })
    }

    async fn base_balance(&self) -> ExecutionResult<f64> {
        Ok(self.book.lock().await.cash)
    }

    fn name(&self) -> &str {
        "paper"
    }
}
