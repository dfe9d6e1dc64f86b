use crate::config::RiskLimits;
use crate::domain::entities::risk_state::utc_day;
use crate::domain::entities::{ClosedTrade, RiskDecision, RiskMode, RiskState};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

/// Share of the daily loss ceiling at which entries start carrying a warning.
const DAILY_LOSS_WARNING_RATIO: f64 = 0.7;
const CONSERVATIVE_LOSS_STREAK: u32 = 2;
const CONSERVATIVE_DRAWDOWN_PERCENT: f64 = 15.0;
const DRAWDOWN_SIZING_THRESHOLD_PERCENT: f64 = 10.0;

/// Evaluates entries against account-wide limits and owns the `RiskState`.
///
/// Every public method first rolls the daily P&L over if the UTC date of
/// `now` differs from the stored day.
#[derive(Debug, Clone)]
pub struct RiskGuardrail {
    limits: RiskLimits,
    state: RiskState,
}

impl RiskGuardrail {
    pub fn new(limits: RiskLimits, now: DateTime<Utc>) -> Self {
        Self {
            limits,
            state: RiskState::new(now),
        }
    }

    pub fn restore(limits: RiskLimits, state: RiskState) -> Self {
        Self { limits, state }
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = utc_day(now);
        if today != self.state.day {
            info!(
                "New trading day {} (previous {} closed at {:+.6})",
                today, self.state.day, self.state.daily_pnl
            );
            self.state.day = today;
            self.state.daily_pnl = 0.0;
        }
    }

    /// Records a balance observation; the peak only ever rises.
    pub fn observe_balance(&mut self, balance: f64) {
        if !balance.is_finite() {
            return;
        }
        self.state.last_balance = Some(balance);
        if balance > self.state.peak_balance {
            self.state.peak_balance = balance;
        }
    }

    fn daily_loss_breached(&self) -> bool {
        self.state.daily_pnl <= -self.limits.max_daily_loss
    }

    fn cooldown_active(&mut self, now: DateTime<Utc>) -> bool {
        match self.state.cooldown_until {
            Some(until) if now < until => true,
            Some(until) => {
                info!("Cooldown expired at {}", until);
                self.state.cooldown_until = None;
                false
            }
            None => false,
        }
    }

    /// Gate for opening a position of `amount` given `open_exposure` already
    /// committed. First failing check wins.
    pub fn can_open(
        &mut self,
        amount: f64,
        balance: f64,
        open_exposure: f64,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        self.roll_day(now);
        self.observe_balance(balance);

        let decision = self.gate(amount, balance, open_exposure, now);
        if !decision.allowed {
            warn!("Entry blocked ({:.6}): {}", amount, decision.reason);
        }
        decision
    }

    fn gate(
        &mut self,
        amount: f64,
        balance: f64,
        open_exposure: f64,
        now: DateTime<Utc>,
    ) -> RiskDecision {
        if balance <= 0.0 || !balance.is_finite() {
            return RiskDecision::blocked(format!("No usable balance ({})", balance));
        }

        if self.cooldown_active(now) {
            let until = self.state.cooldown_until.unwrap_or(now);
            return RiskDecision::blocked(format!(
                "Cooldown active until {} after {} consecutive losses",
                until.format("%H:%M:%S UTC"),
                self.state.consecutive_losses
            ));
        }

        if self.daily_loss_breached() {
            return RiskDecision::blocked(format!(
                "Daily loss limit reached: {:.6} <= -{:.6}",
                self.state.daily_pnl, self.limits.max_daily_loss
            ));
        }

        let drawdown = self.state.drawdown_percent(balance);
        if drawdown >= self.limits.max_drawdown_percent {
            return RiskDecision::blocked(format!(
                "Drawdown {:.2}% from peak {:.6} exceeds {:.2}%",
                drawdown, self.state.peak_balance, self.limits.max_drawdown_percent
            ));
        }

        let exposure = (open_exposure + amount) / balance * 100.0;
        if exposure > self.limits.max_exposure_percent {
            return RiskDecision::blocked(format!(
                "Exposure would reach {:.2}% of balance (limit {:.2}%)",
                exposure, self.limits.max_exposure_percent
            ));
        }

        let position_share = amount / balance * 100.0;
        if position_share > self.limits.max_position_percent {
            return RiskDecision::blocked(format!(
                "Position size {:.2}% of balance exceeds {:.2}%",
                position_share, self.limits.max_position_percent
            ));
        }

        if let Some(last) = self.state.last_trade_at {
            let spacing = Duration::from_std(self.limits.min_trade_spacing)
                .unwrap_or_else(|_| Duration::zero());
            let since = now.signed_duration_since(last);
            if since < spacing {
                return RiskDecision::warning(format!(
                    "Last trade {}s ago (minimum spacing {}s)",
                    since.num_seconds(),
                    spacing.num_seconds()
                ));
            }
        }

        if self.state.daily_pnl < 0.0
            && self.state.daily_pnl.abs() >= self.limits.max_daily_loss * DAILY_LOSS_WARNING_RATIO
        {
            return RiskDecision::warning(format!(
                "Daily loss {:.6} is within {:.0}% of the limit {:.6}",
                self.state.daily_pnl,
                DAILY_LOSS_WARNING_RATIO * 100.0,
                self.limits.max_daily_loss
            ));
        }

        RiskDecision::ok()
    }

    /// Marks an entry fill for inter-trade spacing.
    pub fn record_entry(&mut self, now: DateTime<Utc>) {
        self.roll_day(now);
        self.state.last_trade_at = Some(now);
    }

    /// Books a realized close. A win resets the loss streak outright; a
    /// loss extends it and may start a cooldown.
    pub fn record_close(&mut self, trade: &ClosedTrade) {
        let now = trade.closed_at;
        self.roll_day(now);
        self.state.daily_pnl += trade.pnl.value();
        self.state.last_trade_at = Some(now);

        if trade.is_win() {
            if self.state.consecutive_losses > 0 {
                info!(
                    "Winning close on {} resets loss streak of {}",
                    trade.asset, self.state.consecutive_losses
                );
            }
            self.state.consecutive_losses = 0;
        } else if trade.is_loss() {
            self.state.consecutive_losses += 1;
            if self.state.consecutive_losses >= self.limits.max_consecutive_losses {
                let cooldown =
                    Duration::from_std(self.limits.cooldown).unwrap_or_else(|_| Duration::hours(1));
                let until = now + cooldown;
                self.state.cooldown_until = Some(until);
                warn!(
                    "{} consecutive losses: entries paused until {}",
                    self.state.consecutive_losses, until
                );
            }
        }
    }

    /// Risk-adjusted position size, clamped to the floor and the per-position ceiling.
    pub fn size_position(&self, base_amount: f64, balance: f64, confidence: f64) -> f64 {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let confidence_mult = 0.5 + 0.5 * confidence / 100.0;
        let streak_mult = (1.0 - 0.2 * self.state.consecutive_losses as f64).max(0.3);
        let drawdown = self.state.drawdown_percent(balance);
        let drawdown_mult = if drawdown > DRAWDOWN_SIZING_THRESHOLD_PERCENT {
            (1.0 - drawdown / 100.0).max(0.5)
        } else {
            1.0
        };

        let size = base_amount * confidence_mult * streak_mult * drawdown_mult;
        let ceiling = balance.max(0.0) * self.limits.max_position_percent / 100.0;
        size.max(self.limits.floor_position_size).min(ceiling)
    }

    pub fn suggested_mode(&mut self, now: DateTime<Utc>) -> RiskMode {
        self.roll_day(now);
        if self.daily_loss_breached() {
            return RiskMode::Stop;
        }
        if self.cooldown_active(now) {
            return RiskMode::Pause;
        }
        let drawdown = self
            .state
            .last_balance
            .map(|b| self.state.drawdown_percent(b))
            .unwrap_or(0.0);
        if self.state.consecutive_losses >= CONSERVATIVE_LOSS_STREAK
            || drawdown > CONSERVATIVE_DRAWDOWN_PERCENT
        {
            return RiskMode::Conservative;
        }
        RiskMode::Normal
    }

    /// Manual override: lifts an active cooldown. The loss streak is kept.
    pub fn clear_cooldown(&mut self) -> bool {
        let was_active = self.state.cooldown_until.take().is_some();
        if was_active {
            warn!("Cooldown cleared manually");
        }
        was_active
    }
}
