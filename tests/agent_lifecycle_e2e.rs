use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use holdfast::application::actors::PriceFeed;
use holdfast::application::services::{Agent, AgentContext, PositionLedger, StateWriter};
use holdfast::config::AgentConfig;
use holdfast::domain::entities::{
    AgentSnapshot, ClosedTrade, HealthStatus, PositionStatus, RiskMode, SurvivalAction,
    UrgentExit,
};
use holdfast::domain::errors::{EntrySignalError, ExecutionError, MarketDataError};
use holdfast::domain::repositories::{
    BuyFill, EntryCandidate, EntrySignalSource, ExecutionResult, LivePriceSource, MarketData,
    MarketDataResult, Quote, SellFill, StateStore, StoreResult, TradeExecutor,
};
use holdfast::domain::value_objects::PnL;
use holdfast::infrastructure::PaperExecutor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};

#[derive(Default)]
struct ScriptedMarket {
    prices: StdMutex<HashMap<String, f64>>,
}

impl ScriptedMarket {
    fn set(&self, asset: &str, price: f64) {
        self.prices.lock().unwrap().insert(asset.to_string(), price);
    }
}

#[async_trait]
impl MarketData for ScriptedMarket {
    async fn get_quote(&self, asset: &str) -> MarketDataResult<Quote> {
        let price = self.prices.lock().unwrap().get(asset).copied();
        price
            .map(|price| Quote {
                price,
                liquidity: 1_000.0,
                volume_24h: 1_000.0,
            })
            .ok_or_else(|| MarketDataError::NotFound(asset.to_string()))
    }
}

/// Paper execution with a switch that makes every sell fail.
struct FlakyExecutor {
    inner: PaperExecutor,
    fail_sells: AtomicBool,
}

#[async_trait]
impl TradeExecutor for FlakyExecutor {
    async fn buy(&self, asset: &str, capital_amount: f64) -> ExecutionResult<BuyFill> {
        self.inner.buy(asset, capital_amount).await
    }

    async fn sell(&self, asset: &str, quantity: f64) -> ExecutionResult<SellFill> {
        if self.fail_sells.load(Ordering::SeqCst) {
            return Err(ExecutionError::Network("venue unreachable".to_string()));
        }
        self.inner.sell(asset, quantity).await
    }

    async fn base_balance(&self) -> ExecutionResult<f64> {
        self.inner.base_balance().await
    }

    fn name(&self) -> &str {
        "flaky-paper"
    }
}

#[derive(Default)]
struct ScriptedEntries {
    candidates: StdMutex<Vec<EntryCandidate>>,
}

impl ScriptedEntries {
    fn offer(&self, asset: &str, amount: f64) {
        *self.candidates.lock().unwrap() = vec![EntryCandidate {
            asset: asset.to_string(),
            confidence: 100.0,
            suggested_amount: amount,
        }];
    }

    fn clear(&self) {
        self.candidates.lock().unwrap().clear();
    }
}

#[async_trait]
impl EntrySignalSource for ScriptedEntries {
    async fn candidates(&self, _now: DateTime<Utc>) -> Result<Vec<EntryCandidate>, EntrySignalError> {
        Ok(self.candidates.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct MemoryStore {
    snapshot: Mutex<Option<AgentSnapshot>>,
    trades: Mutex<Vec<ClosedTrade>>,
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_snapshot(&self) -> StoreResult<Option<AgentSnapshot>> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save_snapshot(&self, snapshot: &AgentSnapshot) -> StoreResult<()> {
        *self.snapshot.lock().await = Some(snapshot.clone());
        Ok(())
    }

    async fn record_trade(&self, trade: &ClosedTrade) -> StoreResult<()> {
        self.trades.lock().await.push(trade.clone());
        Ok(())
    }
}

struct Harness {
    config: AgentConfig,
    agent: Arc<Agent>,
    ledger: Arc<PositionLedger>,
    market: Arc<ScriptedMarket>,
    executor: Arc<FlakyExecutor>,
    entries: Arc<ScriptedEntries>,
    store: Arc<MemoryStore>,
    writer: Arc<StateWriter>,
    urgent_rx: mpsc::Receiver<UrgentExit>,
}

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.exit.partial_take_percent = 80.0;
    config.exit.take_profit_percent = 200.0;
    config.risk.max_daily_loss = 100.0;
    config.agent.paper_slippage_bps = 0.0;
    config.agent.paper_fee_bps = 0.0;
    config.market_data.max_retries = 0;
    config
}

fn harness_with(config: AgentConfig, starting_balance: f64) -> Harness {
    let ctx = AgentContext::new(&config, t0());
    let market = Arc::new(ScriptedMarket::default());
    let executor = Arc::new(FlakyExecutor {
        inner: PaperExecutor::new(market.clone(), starting_balance, 0.0, 0.0),
        fail_sells: AtomicBool::new(false),
    });
    let entries = Arc::new(ScriptedEntries::default());
    let store = Arc::new(MemoryStore::default());
    let feed = Arc::new(PriceFeed::new(config.feed.clone(), None).unwrap());

    let (urgent_tx, urgent_rx) = mpsc::channel(config.agent.urgent_channel_capacity);
    let ledger = Arc::new(PositionLedger::new(
        ctx.book.clone(),
        market.clone(),
        feed as Arc<dyn LivePriceSource>,
        &config.agent,
        &config.market_data,
        urgent_tx,
    ));
    let writer = Arc::new(StateWriter::new(
        ctx.clone(),
        store.clone(),
        config.agent.persist_debounce,
    ));
    let agent = Arc::new(Agent::new(
        ctx,
        ledger.clone(),
        executor.clone(),
        market.clone(),
        entries.clone(),
        store.clone(),
        writer.clone(),
        config.agent.clone(),
        config.survival.reserve_asset.clone(),
    ));

    Harness {
        config,
        agent,
        ledger,
        market,
        executor,
        entries,
        store,
        writer,
        urgent_rx,
    }
}

fn harness() -> Harness {
    harness_with(test_config(), 10.0)
}

impl Harness {
    /// Opens `asset` at `price` through a normal entry tick.
    async fn open_at(&self, asset: &str, price: f64, now: DateTime<Utc>) {
        self.market.set(asset, price);
        self.entries.offer(asset, 1.0);
        let report = self.agent.tick(now).await;
        self.entries.clear();
        assert_eq!(report.entries.len(), 1, "entry not opened: {:?}", report);
    }
}

#[tokio::test]
async fn test_entry_then_stop_loss_closes_position() {
    let h = harness();
    h.open_at("MINT", 1.0, t0()).await;
    let opened = h.ledger.get("MINT").await.unwrap();
    assert!((opened.capital_value - 1.0).abs() < 1e-9);

    h.market.set("MINT", 0.75);
    let report = h.agent.tick(t0() + Duration::seconds(30)).await;

    assert_eq!(report.exits.len(), 1);
    let trade = &report.exits[0];
    assert!(trade.reason.contains("Stop loss"));
    assert!(trade.is_loss());
    assert!((trade.pnl.value() + 0.25).abs() < 1e-9);
    assert!(h.ledger.get("MINT").await.is_none());
    assert_eq!(h.store.trades.lock().await.len(), 1);
    assert_eq!(h.agent.context().risk.lock().await.state().consecutive_losses, 1);
}

#[tokio::test]
async fn test_trailing_stop_locks_in_profit() {
    let h = harness();
    h.open_at("MINT", 1.0, t0()).await;

    h.market.set("MINT", 1.5);
    let report = h.agent.tick(t0() + Duration::minutes(5)).await;
    assert!(report.exits.is_empty());
    let pos = h.ledger.get("MINT").await.unwrap();
    assert_eq!(pos.status, PositionStatus::Trailing);
    assert!((pos.trailing_stop_price.unwrap() - 1.275).abs() < 1e-9);

    h.market.set("MINT", 1.2);
    let report = h.agent.tick(t0() + Duration::minutes(6)).await;
    assert_eq!(report.exits.len(), 1);
    assert!(report.exits[0].reason.contains("Trailing stop"));
    assert!(report.exits[0].is_win());
    assert_eq!(h.agent.context().risk.lock().await.state().consecutive_losses, 0);
}

#[tokio::test]
async fn test_live_price_claims_exit_once_and_urgent_path_sells() {
    let mut h = harness();
    h.open_at("MINT", 1.0, t0()).await;

    let now = t0() + Duration::seconds(20);
    let signal = h.ledger.on_live_price("MINT", 0.7, now).await.unwrap();
    assert!(signal.is_some());
    // the claim is held; a deeper print does not signal again
    assert!(h.ledger.on_live_price("MINT", 0.6, now).await.unwrap().is_none());
    assert!(h.ledger.get("MINT").await.unwrap().is_exiting());

    // the loop skips positions that are already being sold
    let report = h.agent.tick(now + Duration::seconds(1)).await;
    assert!(report.exits.is_empty());

    let urgent = h.urgent_rx.recv().await.unwrap();
    assert_eq!(urgent.signal.asset, "MINT");
    h.market.set("MINT", 0.7);
    let trade = h.agent.handle_urgent(urgent).await.unwrap();
    assert!(trade.is_loss());
    assert!(h.ledger.get("MINT").await.is_none());
    assert!(h.urgent_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_failed_sell_releases_claim_for_next_tick() {
    let h = harness();
    h.open_at("MINT", 1.0, t0()).await;

    h.executor.fail_sells.store(true, Ordering::SeqCst);
    h.market.set("MINT", 0.75);
    let report = h.agent.tick(t0() + Duration::seconds(30)).await;
    assert!(report.exits.is_empty());
    assert!(report.errors.iter().any(|e| e.contains("venue unreachable")));
    let pos = h.ledger.get("MINT").await.unwrap();
    assert!(!pos.is_exiting());
    assert!(h.store.trades.lock().await.is_empty());

    h.executor.fail_sells.store(false, Ordering::SeqCst);
    let report = h.agent.tick(t0() + Duration::seconds(60)).await;
    assert_eq!(report.exits.len(), 1);
    assert!(h.ledger.get("MINT").await.is_none());
}

#[tokio::test]
async fn test_loss_streak_pauses_entries_until_cooldown_expires() {
    let h = harness();
    let mut now = t0();
    for _ in 0..3 {
        h.open_at("MINT", 1.0, now).await;
        now += Duration::seconds(30);
        h.market.set("MINT", 0.75);
        let report = h.agent.tick(now).await;
        assert_eq!(report.exits.len(), 1);
        now += Duration::seconds(30);
    }

    let last_loss = now - Duration::seconds(30);
    {
        let risk = h.agent.context().risk.lock().await;
        assert_eq!(risk.state().consecutive_losses, 3);
        assert_eq!(
            risk.state().cooldown_until,
            Some(last_loss + Duration::hours(1))
        );
    }

    h.market.set("MINT", 1.0);
    h.entries.offer("MINT", 1.0);
    let report = h.agent.tick(now).await;
    assert_eq!(report.mode, RiskMode::Pause);
    assert!(report.entries.is_empty());

    let report = h.agent.tick(last_loss + Duration::minutes(61)).await;
    assert_eq!(report.mode, RiskMode::Conservative);
    assert_eq!(report.entries.len(), 1);
    // conservative mode halves the suggestion before risk sizing
    assert!(report.entries[0].amount < 0.5 + 1e-9);
}

fn closed(pnl: f64, at: DateTime<Utc>) -> ClosedTrade {
    ClosedTrade {
        asset: "PAST".to_string(),
        quantity: 1.0,
        cost_basis: 1.0,
        proceeds: 1.0 + pnl,
        pnl: PnL::new(pnl).unwrap(),
        reason: "history".to_string(),
        partial: false,
        closed_at: at,
    }
}

#[tokio::test]
async fn test_stop_tightening_resets_in_normal_mode_and_does_not_compound() {
    let h = harness();
    h.open_at("MINT", 1.0, t0()).await;

    let mut now = t0() + Duration::minutes(5);
    h.market.set("MINT", 1.4);
    h.agent.tick(now).await;
    let armed = h.ledger.get("MINT").await.unwrap();
    assert!((armed.trailing_stop_price.unwrap() - 1.19).abs() < 1e-9);

    for _ in 0..2 {
        h.agent.context().risk.lock().await.record_close(&closed(-0.1, now));
    }
    now += Duration::minutes(1);
    let report = h.agent.tick(now).await;
    assert_eq!(report.mode, RiskMode::Conservative);
    let tightened = h.ledger.get("MINT").await.unwrap();
    assert_eq!(tightened.stop_tightening, 0.5);
    let stop = tightened.trailing_stop_price.unwrap();
    assert!((stop - 1.4 * (1.0 - 0.075)).abs() < 1e-9);

    h.agent.context().risk.lock().await.record_close(&closed(0.1, now));
    now += Duration::minutes(1);
    let report = h.agent.tick(now).await;
    assert_eq!(report.mode, RiskMode::Normal);
    let relaxed = h.ledger.get("MINT").await.unwrap();
    assert_eq!(relaxed.stop_tightening, 1.0);
    assert_eq!(relaxed.trailing_stop_price.unwrap(), stop);

    for _ in 0..2 {
        h.agent.context().risk.lock().await.record_close(&closed(-0.1, now));
    }
    now += Duration::minutes(1);
    let report = h.agent.tick(now).await;
    assert_eq!(report.mode, RiskMode::Conservative);
    let again = h.ledger.get("MINT").await.unwrap();
    assert_eq!(again.stop_tightening, 0.5);
    assert_eq!(again.trailing_stop_price.unwrap(), stop);
}

#[tokio::test]
async fn test_falling_capital_monitors_then_sells_reserve_once_confirmed() {
    let mut config = test_config();
    config.survival.reserve_asset = Some("RESERVE".to_string());
    // low watermark 1.0, critical watermark 0.5
    let h = harness_with(config, 1.5);

    h.market.set("RESERVE", 0.01);
    h.executor.inner.credit_holding("RESERVE", 100.0).await;
    h.agent
        .context()
        .survival
        .lock()
        .await
        .record_reserve_purchase(100.0, 1.0);

    let report = h.agent.tick(t0()).await;
    let health = report.health.as_ref().unwrap();
    assert_eq!(health.status, HealthStatus::Low);
    assert_eq!(health.action, SurvivalAction::Monitor);
    assert!(report.survival_proceeds.is_none());
    assert_eq!(
        h.agent.context().survival.lock().await.state().survival_sell_count,
        0
    );

    // spend cash down into the critical band
    h.market.set("OTHER", 1.0);
    h.executor.inner.buy("OTHER", 0.7).await.unwrap();
    assert!((h.executor.base_balance().await.unwrap() - 0.8).abs() < 1e-9);

    h.executor.fail_sells.store(true, Ordering::SeqCst);
    let report = h.agent.tick(t0() + Duration::seconds(30)).await;
    assert_eq!(report.health.as_ref().unwrap().status, HealthStatus::Critical);
    assert!(report.survival_proceeds.is_none());
    {
        let survival = h.agent.context().survival.lock().await;
        assert_eq!(survival.state().survival_sell_count, 0);
        assert_eq!(survival.state().reserve_balance, 100.0);
    }

    h.executor.fail_sells.store(false, Ordering::SeqCst);
    let report = h.agent.tick(t0() + Duration::seconds(60)).await;
    let proceeds = report.survival_proceeds.unwrap();
    assert!((proceeds - 0.1).abs() < 1e-9);
    let survival = h.agent.context().survival.lock().await;
    assert_eq!(survival.state().survival_sell_count, 1);
    assert!((survival.state().reserve_balance - 90.0).abs() < 1e-9);
    assert_eq!(
        survival.state().reserve_balance,
        h.executor.inner.holding("RESERVE").await
    );
}

#[tokio::test]
async fn test_force_exit_all_without_live_feed() {
    let h = harness();
    h.open_at("AAA", 1.0, t0()).await;
    h.open_at("BBB", 2.0, t0() + Duration::minutes(2)).await;
    assert_eq!(h.ledger.snapshot().await.len(), 2);

    let results = h.agent.force_exit_all(t0() + Duration::minutes(3)).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert!(h.ledger.snapshot().await.is_empty());
    assert_eq!(h.store.trades.lock().await.len(), 2);
}

#[tokio::test]
async fn test_restart_restores_positions_and_risk_state() {
    let h = harness();
    h.open_at("MINT", 1.0, t0()).await;
    h.market.set("MINT", 1.5);
    h.agent.tick(t0() + Duration::minutes(5)).await;
    h.writer.flush_now().await.unwrap();

    let saved = h.store.load_snapshot().await.unwrap().unwrap();
    let restored = AgentContext::restore(&h.config, saved.clone());
    let again = restored.snapshot(saved.saved_at).await;
    assert_eq!(again, saved);

    let pos = restored.book.lock().await.get("MINT").cloned().unwrap();
    assert_eq!(pos.status, PositionStatus::Trailing);
    assert!((pos.highest_price - 1.5).abs() < 1e-12);
}
