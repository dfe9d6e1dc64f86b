//! Application-side position ledger.
//!
//! Wraps the shared `PositionBook` with price resolution (live cache first,
//! polled quote as fallback) and the live-price path that pushes protective
//! exits onto the bounded urgent-exit channel.

use crate::application::actors::PriceTick;
use crate::config::{AgentSettings, MarketDataConfig};
use crate::domain::entities::{ExitSignal, Position, UrgentExit};
use crate::domain::errors::LedgerError;
use crate::domain::repositories::{LivePriceSource, MarketData, PriceObservation, PriceSource};
use crate::domain::services::PositionBook;
use crate::task_runner::{retry_with_backoff, RetryPolicy};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A non-hold signal together with the price it was evaluated at.
#[derive(Debug, Clone, PartialEq)]
pub struct PricedSignal {
    pub signal: ExitSignal,
    pub price: PriceObservation,
}

#[derive(Debug, Default)]
pub struct Evaluation {
    pub signals: Vec<PricedSignal>,
    pub holds: usize,
    /// Assets skipped because no price could be resolved.
    pub unpriced: Vec<(String, LedgerError)>,
}

pub struct PositionLedger {
    book: Arc<Mutex<PositionBook>>,
    market: Arc<dyn MarketData>,
    live: Arc<dyn LivePriceSource>,
    retry: RetryPolicy,
    live_max_age: Duration,
    urgent_tx: mpsc::Sender<UrgentExit>,
}

impl PositionLedger {
    pub fn new(
        book: Arc<Mutex<PositionBook>>,
        market: Arc<dyn MarketData>,
        live: Arc<dyn LivePriceSource>,
        settings: &AgentSettings,
        market_config: &MarketDataConfig,
        urgent_tx: mpsc::Sender<UrgentExit>,
    ) -> Self {
        Self {
            book,
            market,
            live,
            retry: RetryPolicy::new(market_config.max_retries, market_config.retry_base_delay),
            live_max_age: Duration::from_std(settings.live_price_max_age)
                .unwrap_or_else(|_| Duration::seconds(15)),
            urgent_tx,
        }
    }

    /// Registers interest in every held asset, e.g. after a restore.
    pub async fn track_all(&self) {
        let assets = self.book.lock().await.assets();
        for asset in assets {
            self.live.track(&asset).await;
        }
    }

    /// Opens or averages into a position and starts streaming its price.
    pub async fn open(
        &self,
        asset: &str,
        entry_price: f64,
        quantity: f64,
        capital_value: f64,
        now: DateTime<Utc>,
    ) -> Result<Position, LedgerError> {
        let position = self
            .book
            .lock()
            .await
            .open(asset, entry_price, quantity, capital_value, now)?;
        self.live.track(asset).await;
        Ok(position)
    }

    pub async fn close(&self, asset: &str) -> Result<Position, LedgerError> {
        let position = self.book.lock().await.close(asset)?;
        self.live.untrack(asset).await;
        Ok(position)
    }

    pub async fn record_partial_exit(
        &self,
        asset: &str,
        sold_quantity: f64,
        sold_capital: f64,
    ) -> Result<Position, LedgerError> {
        self.book
            .lock()
            .await
            .record_partial_exit(asset, sold_quantity, sold_capital)
    }

    pub async fn mark_exit_failed(&self, asset: &str) -> Result<(), LedgerError> {
        self.book.lock().await.mark_exit_failed(asset)
    }

    pub async fn tighten_stops(&self, factor: f64) -> Result<usize, LedgerError> {
        self.book.lock().await.tighten_stops(factor)
    }

    pub async fn relax_stops(&self) {
        self.book.lock().await.relax_stops()
    }

    pub async fn force_exit_all(&self) -> Vec<ExitSignal> {
        self.book.lock().await.force_exit_all()
    }

    pub async fn get(&self, asset: &str) -> Option<Position> {
        self.book.lock().await.get(asset).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Position> {
        self.book.lock().await.snapshot()
    }

    pub async fn open_exposure(&self) -> f64 {
        self.book.lock().await.open_exposure()
    }

    /// Market value of all positions at the last known price, or at entry
    /// price for assets never priced.
    pub async fn marked_value(&self) -> f64 {
        let positions = self.snapshot().await;
        let mut total = 0.0;
        for pos in positions {
            let price = self
                .live
                .last_price(&pos.asset)
                .await
                .map(|obs| obs.price)
                .unwrap_or(pos.entry_price);
            total += pos.quantity * price;
        }
        total
    }

    /// Fresh streamed price if there is one, otherwise a polled quote.
    pub async fn resolve_price(
        &self,
        asset: &str,
        now: DateTime<Utc>,
    ) -> Result<PriceObservation, LedgerError> {
        if let Some(obs) = self.live.last_price(asset).await {
            if obs.source == PriceSource::Live && now.signed_duration_since(obs.observed_at) <= self.live_max_age {
                return Ok(obs);
            }
        }

        let market = self.market.clone();
        let quote = retry_with_backoff(
            &format!("quote {}", asset),
            &self.retry,
            |e: &crate::domain::errors::MarketDataError| e.is_transient(),
            || {
                let market = market.clone();
                let asset = asset.to_string();
                async move { market.get_quote(&asset).await }
            },
        )
        .await
        .map_err(|e| LedgerError::PriceUnavailable {
            asset: asset.to_string(),
            reason: e.to_string(),
        })?;

        self.live.record_polled(asset, quote.price, now).await;
        Ok(PriceObservation {
            price: quote.price,
            source: PriceSource::Polled,
            observed_at: now,
        })
    }

    /// Prices every position not already exiting, then evaluates them all
    /// under one book lock. No lock is held while prices are fetched.
    pub async fn evaluate_all(&self, now: DateTime<Utc>) -> Evaluation {
        let assets: Vec<String> = {
            let book = self.book.lock().await;
            book.snapshot()
                .into_iter()
                .filter(|p| !p.is_exiting())
                .map(|p| p.asset)
                .collect()
        };

        let mut evaluation = Evaluation::default();
        let mut priced = Vec::with_capacity(assets.len());
        for asset in assets {
            match self.resolve_price(&asset, now).await {
                Ok(obs) => priced.push((asset, obs)),
                Err(e) => {
                    warn!("Skipping evaluation of {}: {}", asset, e);
                    evaluation.unpriced.push((asset, e));
                }
            }
        }

        let mut book = self.book.lock().await;
        for (asset, obs) in priced {
            match book.evaluate(&asset, obs.price, now) {
                Ok(signal) if signal.is_hold() => {
                    debug!("{}: {}", asset, signal.reason);
                    evaluation.holds += 1;
                }
                Ok(signal) => {
                    info!(
                        "Exit signal for {} ({:?}, {:?}): {}",
                        asset, signal.action, signal.urgency, signal.reason
                    );
                    evaluation.signals.push(PricedSignal { signal, price: obs });
                }
                // closed by the urgent path while prices were fetched
                Err(LedgerError::NotFound(_)) => {}
                Err(e) => evaluation.unpriced.push((asset, e)),
            }
        }
        evaluation
    }

    /// Live-path observation. A newly claimed protective exit is sent on the
    /// urgent channel, waiting for capacity if the channel is full.
    pub async fn on_live_price(
        &self,
        asset: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<ExitSignal>, LedgerError> {
        let signal = self.book.lock().await.on_live_price(asset, price, now)?;
        let Some(signal) = signal else {
            return Ok(None);
        };

        warn!("Urgent exit for {} at {:.9}: {}", asset, price, signal.reason);
        let urgent = UrgentExit {
            signal: signal.clone(),
            trigger_price: price,
            observed_at: now,
        };
        if self.urgent_tx.send(urgent).await.is_err() {
            error!("Urgent exit channel closed; releasing claim on {}", asset);
            self.book.lock().await.mark_exit_failed(asset)?;
        }
        Ok(Some(signal))
    }

    /// Consumes live ticks in arrival order until shutdown. The stream is
    /// bounded: while this task waits on the urgent channel the feed waits
    /// on us, and no tick is skipped.
    pub fn spawn_live_watcher(
        self: Arc<Self>,
        mut prices: mpsc::Receiver<PriceTick>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    tick = prices.recv() => match tick {
                        Some(tick) => {
                            match self.on_live_price(&tick.asset, tick.price, tick.observed_at).await {
                                Ok(_) | Err(LedgerError::NotFound(_)) => {}
                                Err(e) => warn!("Live price for {} rejected: {}", tick.asset, e),
                            }
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Live price watcher stopped");
        })
    }
}
