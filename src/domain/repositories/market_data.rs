use crate::domain::errors::MarketDataError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type MarketDataResult<T> = Result<T, MarketDataError>;

/// Point-in-time market view of one asset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Price in base currency per unit.
    pub price: f64,
    pub liquidity: f64,
    pub volume_24h: f64,
}

/// Pull-based price source, used directly and as the fallback when no live
/// observation is available.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn get_quote(&self, asset: &str) -> MarketDataResult<Quote>;
}
