//! DEX-aggregator quote client.
//!
//! `GET {base_url}/tokens/{asset}` returns every pool that trades the asset.
//! The quote comes from the most liquid pool in which the asset is the base
//! token; `priceNative` is the price in the chain's base currency.

use crate::config::MarketDataConfig;
use crate::domain::errors::MarketDataError;
use crate::domain::repositories::{MarketData, MarketDataResult, Quote};
use crate::rate_limit::{create_rate_limiter, GlobalRateLimiter};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct TokenPairsResponse {
    pairs: Option<Vec<PairData>>,
}

#[derive(Debug, Deserialize)]
struct PairData {
    #[serde(rename = "pairAddress")]
    pair_address: String,
    #[serde(rename = "baseToken")]
    base_token: TokenRef,
    #[serde(rename = "priceNative")]
    price_native: Option<String>,
    liquidity: Option<LiquidityData>,
    volume: Option<VolumeData>,
}

#[derive(Debug, Deserialize)]
struct TokenRef {
    address: String,
}

#[derive(Debug, Deserialize)]
struct LiquidityData {
    usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct VolumeData {
    h24: Option<f64>,
}

pub struct HttpMarketData {
    client: Client,
    base_url: String,
    limiter: GlobalRateLimiter,
}

impl HttpMarketData {
    pub fn new(config: &MarketDataConfig) -> Result<Self, MarketDataError> {
        let client = Client::builder()
            .user_agent(concat!("holdfast/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| MarketDataError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limiter: create_rate_limiter(config.requests_per_minute),
        })
    }
}

#[async_trait]
impl MarketData for HttpMarketData {
    async fn get_quote(&self, asset: &str) -> MarketDataResult<Quote> {
        self.limiter.until_ready().await;

        let url = format!("{}/tokens/{}", self.base_url, asset);
        debug!("Fetching quote for {}", asset);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                MarketDataError::Timeout
            } else {
                MarketDataError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(MarketDataError::NotFound(asset.to_string()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(MarketDataError::Network(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MarketDataError::Malformed(format!("HTTP {}: {}", status, body)));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                MarketDataError::Timeout
            } else {
                MarketDataError::Network(e.to_string())
            }
        })?;
        parse_quote(asset, &body)
    }
}

/// Picks the most liquid pool quoting `asset` as base token and validates
/// its price.
fn parse_quote(asset: &str, body: &str) -> MarketDataResult<Quote> {
    let response: TokenPairsResponse =
        serde_json::from_str(body).map_err(|e| MarketDataError::Malformed(e.to_string()))?;

    let pair = response
        .pairs
        .unwrap_or_default()
        .into_iter()
        .filter(|p| p.base_token.address == asset)
        .max_by(|a, b| {
            let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
            let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
            la.total_cmp(&lb)
        })
        .ok_or_else(|| MarketDataError::NotFound(asset.to_string()))?;

    let raw = pair.price_native.as_deref().ok_or_else(|| {
        MarketDataError::Malformed(format!("pool {} has no priceNative", pair.pair_address))
    })?;
    let price: f64 = raw.trim().parse().map_err(|_| {
        MarketDataError::Malformed(format!("priceNative '{}' is not a number", raw))
    })?;
    if !price.is_finite() || price <= 0.0 {
        return Err(MarketDataError::Malformed(format!(
            "priceNative {} is not a positive price",
            price
        )));
    }

    Ok(Quote {
        price,
        liquidity: pair.liquidity.and_then(|l| l.usd).unwrap_or(0.0),
        volume_24h: pair.volume.and_then(|v| v.h24).unwrap_or(0.0),
    })
}
