use crate::config::SurvivalConfig;
use crate::domain::entities::{
    HealthCheck, HealthStatus, ReservePurchase, SurvivalAction, SurvivalState,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Ties realized profit and capital level to reserve-asset decisions.
#[derive(Debug, Clone)]
pub struct SurvivalAllocator {
    config: SurvivalConfig,
    state: SurvivalState,
}

impl SurvivalAllocator {
    pub fn new(config: SurvivalConfig) -> Self {
        Self {
            config,
            state: SurvivalState::default(),
        }
    }

    pub fn restore(config: SurvivalConfig, state: SurvivalState) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &SurvivalState {
        &self.state
    }

    pub fn config(&self) -> &SurvivalConfig {
        &self.config
    }

    pub fn classify(&self, capital: f64) -> HealthStatus {
        let low = self.config.low_watermark();
        if capital >= 2.0 * low {
            HealthStatus::Healthy
        } else if capital >= low {
            HealthStatus::Low
        } else if capital >= self.config.critical_watermark() {
            HealthStatus::Critical
        } else {
            HealthStatus::Emergency
        }
    }

    /// Classifies `capital` and derives the reserve action. Calling this
    /// repeatedly with the same capital yields the same result; nothing is
    /// counted until a liquidation is confirmed via `record_survival_sell`.
    pub fn check_health(&mut self, capital: f64, now: DateTime<Utc>) -> HealthCheck {
        let status = self.classify(capital);
        let previous = self.state.status;
        if status != previous {
            if status > previous {
                warn!(
                    "Capital health degraded {} -> {} (capital {:.6})",
                    previous, status, capital
                );
            } else {
                info!(
                    "Capital health improved {} -> {} (capital {:.6})",
                    previous, status, capital
                );
            }
        }
        self.state.status = status;
        self.state.last_checked = Some(now);

        let reserve = self.state.reserve_balance;
        let (action, fraction, reason) = match status {
            HealthStatus::Healthy => (
                SurvivalAction::None,
                0.0,
                format!("Capital {:.6} healthy", capital),
            ),
            HealthStatus::Low => (
                SurvivalAction::Monitor,
                0.0,
                format!(
                    "Capital {:.6} below 2x low watermark {:.6}; monitoring",
                    capital,
                    self.config.low_watermark()
                ),
            ),
            HealthStatus::Critical | HealthStatus::Emergency if reserve <= 0.0 => (
                SurvivalAction::Monitor,
                0.0,
                format!(
                    "Capital {:.6} is {} but the reserve is empty",
                    capital, status
                ),
            ),
            HealthStatus::Critical => {
                let fraction = self.config.critical_sell_fraction;
                (
                    SurvivalAction::Liquidate {
                        fraction,
                        quantity: reserve * fraction,
                    },
                    fraction,
                    format!(
                        "Capital {:.6} below low watermark {:.6}; selling {:.0}% of reserve",
                        capital,
                        self.config.low_watermark(),
                        fraction * 100.0
                    ),
                )
            }
            HealthStatus::Emergency => {
                let fraction = self.config.emergency_sell_fraction;
                (
                    SurvivalAction::Liquidate {
                        fraction,
                        quantity: reserve * fraction,
                    },
                    fraction,
                    format!(
                        "Capital {:.6} below critical watermark {:.6}; selling {:.0}% of reserve",
                        capital,
                        self.config.critical_watermark(),
                        fraction * 100.0
                    ),
                )
            }
        };

        HealthCheck {
            status,
            action,
            fraction,
            reason,
        }
    }

    /// Earmarks a share of `profit` for the reserve. Amounts below the
    /// minimum trade size accumulate until they are worth a transaction.
    pub fn on_realized_profit(&mut self, profit: f64) -> Option<ReservePurchase> {
        if !profit.is_finite() || profit <= 0.0 {
            return None;
        }
        if self.config.reserve_asset.is_none() {
            return None;
        }

        let earmark = profit * self.config.profit_reserve_fraction + self.state.pending_reserve_carry;
        if earmark < self.config.min_reserve_trade {
            debug!(
                "Reserve earmark {:.6} below minimum {:.6}; carrying forward",
                earmark, self.config.min_reserve_trade
            );
            self.state.pending_reserve_carry = earmark;
            return None;
        }

        self.state.pending_reserve_carry = 0.0;
        info!("Reserve purchase of {:.6} from profit {:.6}", earmark, profit);
        Some(ReservePurchase { amount: earmark })
    }

    /// A reserve purchase that could not be executed goes back into the carry.
    pub fn defer_reserve_purchase(&mut self, purchase: ReservePurchase) {
        self.state.pending_reserve_carry += purchase.amount;
    }

    pub fn record_reserve_purchase(&mut self, quantity: f64, cost: f64) {
        self.state.reserve_balance += quantity;
        self.state.total_reserve_purchased += cost;
        if quantity > 0.0 && cost > 0.0 {
            // last fill price is the best valuation we have until the next quote
            self.state.reserve_value = self.state.reserve_balance * (cost / quantity);
        }
    }

    /// Confirms an executed liquidation. This is the only place the
    /// survival-sell count advances.
    pub fn record_survival_sell(&mut self, quantity_sold: f64, received: f64) {
        let sold = quantity_sold.min(self.state.reserve_balance).max(0.0);
        let previous_balance = self.state.reserve_balance;
        self.state.reserve_balance -= sold;
        self.state.total_reserve_sold += received;
        self.state.survival_sell_count += 1;
        if previous_balance > 0.0 {
            self.state.reserve_value *= self.state.reserve_balance / previous_balance;
        }
        warn!(
            "Survival sell #{}: sold {:.6} reserve for {:.6}",
            self.state.survival_sell_count, sold, received
        );
    }

    pub fn update_reserve_valuation(&mut self, price: f64) {
        if price.is_finite() && price > 0.0 {
            self.state.reserve_value = self.state.reserve_balance * price;
        }
    }
}
