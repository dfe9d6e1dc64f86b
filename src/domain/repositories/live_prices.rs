use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Live,
    Polled,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub price: f64,
    pub source: PriceSource,
    pub observed_at: DateTime<Utc>,
}

/// Cache of the most recent streamed prices.
#[async_trait]
pub trait LivePriceSource: Send + Sync {
    async fn last_price(&self, asset: &str) -> Option<PriceObservation>;

    /// Stores a price obtained by polling so `last_price` reflects it with
    /// `PriceSource::Polled` provenance until a streamed price replaces it.
    async fn record_polled(&self, asset: &str, price: f64, observed_at: DateTime<Utc>);

    /// Registers interest so the stream starts carrying `asset`.
    async fn track(&self, asset: &str);

    async fn untrack(&self, asset: &str);
}
