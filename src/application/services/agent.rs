//! The agent loop.
//!
//! One `tick` runs at a time: balance and mode, exits, entries, survival,
//! persistence. Urgent exits from the live path are drained by a separate
//! task and go through the same `execute_exit`; the book's exit claim keeps
//! the two paths from selling the same position twice.

use crate::application::services::context::AgentContext;
use crate::application::services::ledger::PositionLedger;
use crate::application::services::state_writer::StateWriter;
use crate::config::AgentSettings;
use crate::domain::entities::{
    ClosedTrade, ExitAction, ExitSignal, HealthCheck, ReservePurchase, RiskMode, RiskSeverity,
    SurvivalAction, UrgentExit,
};
use crate::domain::errors::{AgentError, LedgerError};
use crate::domain::repositories::{EntrySignalSource, MarketData, StateStore, TradeExecutor};
use crate::domain::value_objects::PnL;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct EntryOutcome {
    pub asset: String,
    pub amount: f64,
    pub quantity: f64,
    pub price: f64,
}

/// What one tick did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub at: DateTime<Utc>,
    pub cash: Option<f64>,
    pub equity: Option<f64>,
    pub mode: RiskMode,
    pub exits: Vec<ClosedTrade>,
    pub entries: Vec<EntryOutcome>,
    pub skipped_entries: Vec<(String, String)>,
    pub health: Option<HealthCheck>,
    /// Base currency received from a survival liquidation this tick.
    pub survival_proceeds: Option<f64>,
    pub errors: Vec<String>,
}

impl TickReport {
    fn new(at: DateTime<Utc>, mode: RiskMode) -> Self {
        Self {
            at,
            cash: None,
            equity: None,
            mode,
            exits: Vec::new(),
            entries: Vec::new(),
            skipped_entries: Vec::new(),
            health: None,
            survival_proceeds: None,
            errors: Vec::new(),
        }
    }
}

pub struct Agent {
    ctx: AgentContext,
    ledger: Arc<PositionLedger>,
    executor: Arc<dyn TradeExecutor>,
    market: Arc<dyn MarketData>,
    entries: Arc<dyn EntrySignalSource>,
    journal: Arc<dyn StateStore>,
    writer: Arc<StateWriter>,
    settings: AgentSettings,
    reserve_asset: Option<String>,
    last_mode: Mutex<RiskMode>,
    tick_guard: Mutex<()>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: AgentContext,
        ledger: Arc<PositionLedger>,
        executor: Arc<dyn TradeExecutor>,
        market: Arc<dyn MarketData>,
        entries: Arc<dyn EntrySignalSource>,
        journal: Arc<dyn StateStore>,
        writer: Arc<StateWriter>,
        settings: AgentSettings,
        reserve_asset: Option<String>,
    ) -> Self {
        Self {
            ctx,
            ledger,
            executor,
            market,
            entries,
            journal,
            writer,
            settings,
            reserve_asset,
            last_mode: Mutex::new(RiskMode::Normal),
            tick_guard: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    pub async fn current_mode(&self) -> RiskMode {
        *self.last_mode.lock().await
    }

    /// Runs one decision cycle. Concurrent calls are serialized.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let _guard = self.tick_guard.lock().await;
        let mut report = TickReport::new(now, *self.last_mode.lock().await);

        // 1. balance and equity
        let cash = match self.executor.base_balance().await {
            Ok(cash) => Some(cash),
            Err(e) => {
                error!("Could not read balance: {}", e);
                report.errors.push(format!("balance: {}", e));
                None
            }
        };
        let equity = match cash {
            Some(cash) => {
                let equity = cash + self.ledger.marked_value().await;
                self.ctx.risk.lock().await.observe_balance(equity);
                Some(equity)
            }
            None => None,
        };
        report.cash = cash;
        report.equity = equity;

        // 2. mode
        let mode = self.update_mode(now).await;
        report.mode = mode;

        // 3. exits
        let evaluation = self.ledger.evaluate_all(now).await;
        for (asset, e) in evaluation.unpriced {
            report.errors.push(format!("{}: {}", asset, e));
        }
        for priced in evaluation.signals {
            match self.execute_exit(&priced.signal, now).await {
                Ok(trade) => report.exits.push(trade),
                Err(e) => report
                    .errors
                    .push(format!("exit {}: {}", priced.signal.asset, e)),
            }
        }

        // 4. entries
        match (mode.allows_entries(), equity) {
            (true, Some(equity)) => self.open_entries(mode, equity, now, &mut report).await,
            (true, None) => debug!("No balance this tick; entries skipped"),
            (false, _) => debug!("Mode {} blocks entries", mode),
        }

        // 5. survival
        self.run_survival(cash, now, &mut report).await;

        // 6. persistence
        self.writer.mark_dirty();

        info!(
            "Tick: mode {}, {} exit(s), {} entr(ies), {} error(s)",
            report.mode,
            report.exits.len(),
            report.entries.len(),
            report.errors.len()
        );
        report
    }

    async fn update_mode(&self, now: DateTime<Utc>) -> RiskMode {
        let mode = self.ctx.risk.lock().await.suggested_mode(now);
        let previous = {
            let mut last = self.last_mode.lock().await;
            std::mem::replace(&mut *last, mode)
        };
        if mode != previous {
            if mode == RiskMode::Normal {
                info!("Risk mode {} -> {}; trailing gaps back to normal", previous, mode);
                self.ledger.relax_stops().await;
            } else {
                warn!("Risk mode {} -> {}; tightening stops", previous, mode);
                if let Err(e) = self
                    .ledger
                    .tighten_stops(self.settings.conservative_stop_factor)
                    .await
                {
                    error!("Failed to tighten stops: {}", e);
                }
            }
        }
        mode
    }

    async fn open_entries(
        &self,
        mode: RiskMode,
        equity: f64,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        if self.settings.max_entries_per_tick == 0 {
            return;
        }
        let candidates = match self.entries.candidates(now).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Entry signals unavailable: {}", e);
                report.errors.push(format!("entry signals: {}", e));
                return;
            }
        };

        for candidate in candidates {
            if report.entries.len() >= self.settings.max_entries_per_tick {
                break;
            }
            let asset = candidate.asset.trim().to_string();
            if asset.is_empty()
                || !candidate.suggested_amount.is_finite()
                || candidate.suggested_amount <= 0.0
            {
                report
                    .skipped_entries
                    .push((candidate.asset.clone(), "invalid candidate".to_string()));
                continue;
            }
            if self.reserve_asset.as_deref() == Some(asset.as_str()) {
                report
                    .skipped_entries
                    .push((asset, "reserve asset".to_string()));
                continue;
            }
            if let Some(existing) = self.ledger.get(&asset).await {
                if existing.is_exiting() {
                    report
                        .skipped_entries
                        .push((asset, "exit in progress".to_string()));
                    continue;
                }
            }

            let base = if mode == RiskMode::Conservative {
                candidate.suggested_amount * self.settings.conservative_size_factor
            } else {
                candidate.suggested_amount
            };
            let exposure = self.ledger.open_exposure().await;
            let (amount, decision) = {
                let mut risk = self.ctx.risk.lock().await;
                let amount = risk.size_position(base, equity, candidate.confidence);
                let decision = risk.can_open(amount, equity, exposure, now);
                (amount, decision)
            };
            if !decision.allowed {
                report.skipped_entries.push((asset, decision.reason));
                continue;
            }
            if decision.severity == RiskSeverity::Warning {
                info!("Entry {} allowed with warning: {}", asset, decision.reason);
            }

            let fill = match self.executor.buy(&asset, amount).await {
                Ok(fill) => fill,
                Err(e) => {
                    error!("Buy of {} for {:.6} failed: {}", asset, amount, e);
                    report.errors.push(format!("buy {}: {}", asset, e));
                    continue;
                }
            };
            match self
                .ledger
                .open(&asset, fill.fill_price, fill.filled_quantity, amount, now)
                .await
            {
                Ok(_) => {
                    self.ctx.risk.lock().await.record_entry(now);
                    report.entries.push(EntryOutcome {
                        asset,
                        amount,
                        quantity: fill.filled_quantity,
                        price: fill.fill_price,
                    });
                }
                Err(e) => {
                    error!(
                        "Bought {} of {} but could not book it: {}",
                        fill.filled_quantity, asset, e
                    );
                    report.errors.push(format!("open {}: {}", asset, e));
                }
            }
        }
    }

    async fn run_survival(&self, cash: Option<f64>, now: DateTime<Utc>, report: &mut TickReport) {
        let Some(cash_before) = cash else {
            return;
        };

        if let Some(reserve) = self.reserve_asset.as_deref() {
            let held = self.ctx.survival.lock().await.state().reserve_balance;
            if held > 0.0 {
                match self.market.get_quote(reserve).await {
                    Ok(quote) => self
                        .ctx
                        .survival
                        .lock()
                        .await
                        .update_reserve_valuation(quote.price),
                    Err(e) => debug!("Reserve valuation skipped: {}", e),
                }
            }
        }

        // trades this tick moved cash
        let capital = if report.exits.is_empty() && report.entries.is_empty() {
            cash_before
        } else {
            self.executor.base_balance().await.unwrap_or(cash_before)
        };

        let check = self.ctx.survival.lock().await.check_health(capital, now);
        if let SurvivalAction::Liquidate { quantity, .. } = check.action {
            match self.reserve_asset.as_deref() {
                Some(reserve) if quantity > 0.0 => {
                    warn!("Survival liquidation: {}", check.reason);
                    match self.executor.sell(reserve, quantity).await {
                        Ok(fill) => {
                            self.ctx
                                .survival
                                .lock()
                                .await
                                .record_survival_sell(quantity, fill.received_capital);
                            report.survival_proceeds = Some(fill.received_capital);
                        }
                        Err(e) => {
                            error!("Survival sell of {} {} failed: {}", quantity, reserve, e);
                            report.errors.push(format!("survival sell: {}", e));
                        }
                    }
                }
                _ => debug!("Liquidation requested but no reserve asset is configured"),
            }
        }
        report.health = Some(check);
    }

    /// Sells according to `signal` and books the result. On a failed sell
    /// the exit claim is released and the error returned; nothing is retried.
    pub async fn execute_exit(
        &self,
        signal: &ExitSignal,
        now: DateTime<Utc>,
    ) -> Result<ClosedTrade, AgentError> {
        let asset = signal.asset.as_str();
        let (quantity, cost_basis, full) = {
            let book = self.ctx.book.lock().await;
            let pos = book
                .get(asset)
                .ok_or_else(|| LedgerError::NotFound(asset.to_string()))?;
            match signal.action {
                ExitAction::FullExit => (pos.quantity, pos.capital_value, true),
                ExitAction::PartialExit { fraction } => {
                    (pos.quantity * fraction, pos.capital_value * fraction, false)
                }
                ExitAction::Hold => {
                    return Err(LedgerError::Invalid(format!("{} has no exit to execute", asset)).into())
                }
            }
        };

        let fill = match self.executor.sell(asset, quantity).await {
            Ok(fill) => fill,
            Err(e) => {
                error!("Sell of {:.6} {} failed: {}", quantity, asset, e);
                if let Err(release) = self.ledger.mark_exit_failed(asset).await {
                    warn!("Could not release exit claim on {}: {}", asset, release);
                }
                return Err(e.into());
            }
        };

        if full {
            self.ledger.close(asset).await?;
        } else {
            self.ledger
                .record_partial_exit(asset, quantity, cost_basis)
                .await?;
        }

        let trade = ClosedTrade {
            asset: asset.to_string(),
            quantity,
            cost_basis,
            proceeds: fill.received_capital,
            pnl: PnL::from_trade(fill.received_capital, cost_basis).map_err(LedgerError::from)?,
            reason: signal.reason.clone(),
            partial: !full,
            closed_at: now,
        };
        info!(
            "{} exit {}: sold {:.6} for {:.6} (P&L {}) - {}",
            if full { "Full" } else { "Partial" },
            asset,
            quantity,
            trade.proceeds,
            trade.pnl,
            trade.reason
        );

        self.ctx.risk.lock().await.record_close(&trade);
        if let Err(e) = self.journal.record_trade(&trade).await {
            error!("Failed to journal trade on {}: {}", asset, e);
        }

        if trade.pnl.is_profit() {
            let purchase = self
                .ctx
                .survival
                .lock()
                .await
                .on_realized_profit(trade.pnl.value());
            if let Some(purchase) = purchase {
                self.buy_reserve(purchase).await;
            }
        }

        self.writer.mark_dirty();
        Ok(trade)
    }

    async fn buy_reserve(&self, purchase: ReservePurchase) {
        let Some(reserve) = self.reserve_asset.as_deref() else {
            return;
        };
        match self.executor.buy(reserve, purchase.amount).await {
            Ok(fill) => {
                self.ctx
                    .survival
                    .lock()
                    .await
                    .record_reserve_purchase(fill.filled_quantity, purchase.amount);
                info!(
                    "Reserve top-up: {:.6} {} for {:.6}",
                    fill.filled_quantity, reserve, purchase.amount
                );
            }
            Err(e) => {
                warn!("Reserve purchase deferred: {}", e);
                self.ctx
                    .survival
                    .lock()
                    .await
                    .defer_reserve_purchase(purchase);
            }
        }
    }

    /// Sells every position that is not already being sold. Works without
    /// the live feed and without prices.
    pub async fn force_exit_all(
        &self,
        now: DateTime<Utc>,
    ) -> Vec<(String, Result<ClosedTrade, AgentError>)> {
        let signals = self.ledger.force_exit_all().await;
        warn!("Forced exit of {} position(s)", signals.len());
        let mut results = Vec::with_capacity(signals.len());
        for signal in signals {
            let result = self.execute_exit(&signal, now).await;
            results.push((signal.asset, result));
        }
        results
    }

    /// Schedules a snapshot write.
    pub fn mark_dirty(&self) {
        self.writer.mark_dirty();
    }

    pub async fn handle_urgent(&self, urgent: UrgentExit) -> Result<ClosedTrade, AgentError> {
        let lag = Utc::now().signed_duration_since(urgent.observed_at);
        info!(
            "Executing urgent exit for {} (trigger {:.9}, {}ms ago)",
            urgent.signal.asset,
            urgent.trigger_price,
            lag.num_milliseconds()
        );
        self.execute_exit(&urgent.signal, Utc::now()).await
    }

    /// Drains the urgent-exit channel until shutdown or until every sender
    /// is gone.
    pub fn spawn_urgent_exits(
        self: Arc<Self>,
        mut urgent_rx: mpsc::Receiver<UrgentExit>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    urgent = urgent_rx.recv() => match urgent {
                        Some(urgent) => {
                            if let Err(e) = self.handle_urgent(urgent).await {
                                error!("Urgent exit failed: {}", e);
                            }
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            info!("Urgent exit consumer stopped");
        })
    }

    /// Fixed-interval loop. A tick that overruns delays the next one.
    pub fn spawn_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick(Utc::now()).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Agent loop stopped");
        })
    }
}
