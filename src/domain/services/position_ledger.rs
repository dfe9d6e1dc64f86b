//! Position book: open positions and their exit state machine.
//!
//! Every price observation (polled or streamed) goes through the same
//! high/low update and trailing-stop ratchet. Emitting an exit claims the
//! position (status `Exiting`) so that concurrent paths cannot sell it twice;
//! the claim is released by `record_partial_exit`, `close` or
//! `mark_exit_failed`.

use crate::config::ExitPolicy;
use crate::domain::entities::{ExitSignal, Position, PositionStatus, Urgency};
use crate::domain::errors::LedgerError;
use crate::domain::value_objects::{Price, Quantity};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PositionBook {
    policy: ExitPolicy,
    positions: HashMap<String, Position>,
}

impl PositionBook {
    pub fn new(policy: ExitPolicy) -> Self {
        Self {
            policy,
            positions: HashMap::new(),
        }
    }

    /// Rebuilds a book from persisted positions. Exit claims do not survive a
    /// restart: a position saved mid-sell is returned to its resting status.
    pub fn restore(policy: ExitPolicy, positions: Vec<Position>) -> Self {
        let positions = positions
            .into_iter()
            .map(|mut p| {
                if p.is_exiting() {
                    p.status = p.resting_status();
                }
                (p.asset.clone(), p)
            })
            .collect();
        Self { policy, positions }
    }

    pub fn policy(&self) -> &ExitPolicy {
        &self.policy
    }

    /// Creates a position, or averages into the existing one for `asset`.
    pub fn open(
        &mut self,
        asset: &str,
        entry_price: f64,
        quantity: f64,
        capital_value: f64,
        now: DateTime<Utc>,
    ) -> Result<Position, LedgerError> {
        let price = Price::new(entry_price)?;
        let qty = Quantity::positive(quantity)?;

        if let Some(existing) = self.positions.get_mut(asset) {
            if existing.is_exiting() {
                return Err(LedgerError::Invalid(format!(
                    "cannot add to {} while its exit is in progress",
                    asset
                )));
            }
            existing.average_in(price, qty, capital_value)?;
            info!(
                "Averaged into {}: qty {:.6}, avg entry {:.9}",
                asset, existing.quantity, existing.entry_price
            );
            return Ok(existing.clone());
        }

        let position = Position::new(asset.to_string(), price, qty, capital_value, now)?;
        info!(
            "Opened position {}: qty {:.6} @ {:.9} ({:.6} capital)",
            asset, position.quantity, position.entry_price, position.capital_value
        );
        self.positions.insert(asset.to_string(), position.clone());
        Ok(position)
    }

    /// Runs the full exit rule set for `asset` at `price`.
    pub fn evaluate(
        &mut self,
        asset: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<ExitSignal, LedgerError> {
        let policy = &self.policy;
        let pos = self
            .positions
            .get_mut(asset)
            .ok_or_else(|| LedgerError::NotFound(asset.to_string()))?;
        let price = Price::new(price)?;

        observe_and_ratchet(policy, pos, price, now);

        if pos.is_exiting() {
            return Ok(ExitSignal::hold(asset, "exit already in progress"));
        }

        if let Some(signal) = protective_exit(policy, pos, price) {
            pos.status = PositionStatus::Exiting;
            return Ok(signal);
        }

        let gain = pos.gain_percent(price);
        let held = pos.held_for(now);

        if held < Duration::minutes(policy.min_hold_minutes) {
            return Ok(ExitSignal::hold(
                asset,
                format!(
                    "Minimum hold: {}s of {}m elapsed ({:+.2}%)",
                    held.num_seconds(),
                    policy.min_hold_minutes,
                    gain
                ),
            ));
        }

        if gain >= policy.take_profit_percent {
            pos.status = PositionStatus::Exiting;
            return Ok(ExitSignal::full_exit(
                asset,
                format!(
                    "Take profit: {:+.2}% >= {:.2}%",
                    gain, policy.take_profit_percent
                ),
                Urgency::High,
            ));
        }

        if !pos.partial_exit_done && gain >= policy.partial_take_percent {
            pos.partial_exit_done = true;
            pos.status = PositionStatus::Exiting;
            return Ok(ExitSignal::partial_exit(
                asset,
                policy.partial_exit_fraction,
                format!(
                    "Partial take profit: {:+.2}% >= {:.2}%, selling {:.0}%",
                    gain,
                    policy.partial_take_percent,
                    policy.partial_exit_fraction * 100.0
                ),
            ));
        }

        if held >= Duration::hours(policy.max_hold_hours) {
            pos.status = PositionStatus::Exiting;
            return Ok(ExitSignal::full_exit(
                asset,
                format!(
                    "Max hold time reached: {}h >= {}h ({:+.2}%)",
                    held.num_hours(),
                    policy.max_hold_hours,
                    gain
                ),
                Urgency::Medium,
            ));
        }

        Ok(ExitSignal::hold(asset, format!("Holding at {:+.2}%", gain)))
    }

    /// Live-path observation. Only the hard stop and trailing stop are
    /// checked; returns a signal only when this price newly claims the exit.
    pub fn on_live_price(
        &mut self,
        asset: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<ExitSignal>, LedgerError> {
        let policy = &self.policy;
        let pos = self
            .positions
            .get_mut(asset)
            .ok_or_else(|| LedgerError::NotFound(asset.to_string()))?;
        let price = Price::new(price)?;

        observe_and_ratchet(policy, pos, price, now);

        if pos.is_exiting() {
            return Ok(None);
        }
        let signal = protective_exit(policy, pos, price);
        if signal.is_some() {
            pos.status = PositionStatus::Exiting;
        }
        Ok(signal)
    }

    /// Reduces a position after a confirmed partial sale. `sold_capital` is
    /// the cost basis of the sold quantity.
    pub fn record_partial_exit(
        &mut self,
        asset: &str,
        sold_quantity: f64,
        sold_capital: f64,
    ) -> Result<Position, LedgerError> {
        let pos = self
            .positions
            .get_mut(asset)
            .ok_or_else(|| LedgerError::NotFound(asset.to_string()))?;
        let sold = Quantity::positive(sold_quantity)?;

        if sold.value() >= pos.quantity {
            return Err(LedgerError::Invalid(format!(
                "partial exit of {} sells the whole position ({}); close it instead",
                sold.value(),
                pos.quantity
            )));
        }
        if !sold_capital.is_finite() || sold_capital < 0.0 || sold_capital > pos.capital_value {
            return Err(LedgerError::Invalid(format!(
                "sold capital {} outside [0, {}]",
                sold_capital, pos.capital_value
            )));
        }

        pos.quantity -= sold.value();
        pos.capital_value -= sold_capital;
        pos.status = pos.resting_status();
        debug!(
            "Partial exit recorded for {}: {:.6} left, {:.6} capital",
            asset, pos.quantity, pos.capital_value
        );
        Ok(pos.clone())
    }

    pub fn close(&mut self, asset: &str) -> Result<Position, LedgerError> {
        self.positions
            .remove(asset)
            .ok_or_else(|| LedgerError::NotFound(asset.to_string()))
    }

    /// Releases an exit claim after the sell did not go through.
    pub fn mark_exit_failed(&mut self, asset: &str) -> Result<(), LedgerError> {
        let pos = self
            .positions
            .get_mut(asset)
            .ok_or_else(|| LedgerError::NotFound(asset.to_string()))?;
        pos.status = pos.resting_status();
        Ok(())
    }

    /// Brings every position's tightening multiplier down to `factor` and
    /// raises armed stops to `highest * (1 - trailing% * factor)`. Future
    /// ratchets use the same multiplier. The multiplier is absolute: repeating a call, or calling
    /// with a looser factor, changes nothing. Stops only move up. Returns how
    /// many stops moved.
    pub fn tighten_stops(&mut self, factor: f64) -> Result<usize, LedgerError> {
        if !factor.is_finite() || factor <= 0.0 || factor > 1.0 {
            return Err(LedgerError::Invalid(format!(
                "tightening factor must be in (0, 1], got {}",
                factor
            )));
        }

        let mut moved = 0;
        let gap = self.policy.trailing_stop_percent / 100.0;
        for pos in self.positions.values_mut() {
            if factor >= pos.stop_tightening {
                continue;
            }
            pos.stop_tightening = factor;
            if pos.trailing_stop_price.is_some() {
                let candidate = pos.highest_price * (1.0 - gap * factor);
                if pos.ratchet_stop(candidate) {
                    moved += 1;
                }
            }
        }
        info!("Tightened stops by factor {}: {} stop(s) raised", factor, moved);
        Ok(moved)
    }

    /// Restores the normal trailing gap for future ratchets. Stops already
    /// raised stay where they are.
    pub fn relax_stops(&mut self) {
        for pos in self.positions.values_mut() {
            pos.stop_tightening = 1.0;
        }
    }

    /// Claims and returns a critical full exit for every position not
    /// already being sold. Needs no price.
    pub fn force_exit_all(&mut self) -> Vec<ExitSignal> {
        let mut assets: Vec<&String> = self.positions.keys().collect();
        assets.sort();
        let assets: Vec<String> = assets.into_iter().cloned().collect();

        let mut signals = Vec::new();
        for asset in assets {
            if let Some(pos) = self.positions.get_mut(&asset) {
                if pos.is_exiting() {
                    continue;
                }
                pos.status = PositionStatus::Exiting;
                signals.push(ExitSignal::full_exit(&asset, "Forced exit", Urgency::Critical));
            }
        }
        signals
    }

    pub fn get(&self, asset: &str) -> Option<&Position> {
        self.positions.get(asset)
    }

    pub fn contains(&self, asset: &str) -> bool {
        self.positions.contains_key(asset)
    }

    pub fn assets(&self) -> Vec<String> {
        let mut assets: Vec<String> = self.positions.keys().cloned().collect();
        assets.sort();
        assets
    }

    /// Positions ordered by asset.
    pub fn snapshot(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.asset.cmp(&b.asset));
        positions
    }

    /// Capital committed to open positions (cost basis).
    pub fn open_exposure(&self) -> f64 {
        self.positions.values().map(|p| p.capital_value).sum()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

fn observe_and_ratchet(policy: &ExitPolicy, pos: &mut Position, price: Price, now: DateTime<Utc>) {
    pos.observe(price, now);
    if pos.gain_percent(price) >= policy.trailing_activation_percent {
        let candidate =
            pos.highest_price * (1.0 - policy.trailing_stop_percent / 100.0 * pos.stop_tightening);
        if pos.ratchet_stop(candidate) {
            debug!(
                "Trailing stop for {} raised to {:.9} (peak {:.9})",
                pos.asset, candidate, pos.highest_price
            );
        }
    }
}

/// Hard stop-loss first, then the trailing stop.
fn protective_exit(policy: &ExitPolicy, pos: &Position, price: Price) -> Option<ExitSignal> {
    let gain = pos.gain_percent(price);
    if gain <= -policy.stop_loss_percent {
        return Some(ExitSignal::full_exit(
            &pos.asset,
            format!(
                "Stop loss hit: {:+.2}% <= -{:.2}%",
                gain, policy.stop_loss_percent
            ),
            Urgency::Critical,
        ));
    }
    if let Some(stop) = pos.trailing_stop_price {
        if price.value() <= stop {
            return Some(ExitSignal::full_exit(
                &pos.asset,
                format!(
                    "Trailing stop hit: {:.9} <= {:.9} (peak {:.9})",
                    price.value(),
                    stop,
                    pos.highest_price
                ),
                Urgency::Critical,
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::ExitAction;

    fn policy() -> ExitPolicy {
        ExitPolicy {
            stop_loss_percent: 20.0,
            take_profit_percent: 100.0,
            partial_take_percent: 50.0,
            partial_exit_fraction: 0.5,
            trailing_activation_percent: 30.0,
            trailing_stop_percent: 15.0,
            min_hold_minutes: 2,
            max_hold_hours: 24,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn book_with(policy: ExitPolicy) -> PositionBook {
        let mut book = PositionBook::new(policy);
        book.open("MINT", 1.0, 100.0, 100.0, t0()).unwrap();
        book
    }

    #[test]
    fn test_hard_stop_fires_below_limit() {
        let mut book = book_with(policy());
        let signal = book.evaluate("MINT", 0.79, t0() + Duration::seconds(10)).unwrap();
        assert_eq!(signal.action, ExitAction::FullExit);
        assert_eq!(signal.urgency, Urgency::Critical);
        assert!(signal.reason.contains("Stop loss"));
    }

    #[test]
    fn test_hold_just_above_stop() {
        let mut book = book_with(policy());
        let signal = book.evaluate("MINT", 0.81, t0() + Duration::minutes(5)).unwrap();
        assert_eq!(signal.action, ExitAction::Hold);
        assert_eq!(signal.urgency, Urgency::Low);
    }

    #[test]
    fn test_trailing_stop_scenario() {
        let mut p = policy();
        p.partial_take_percent = 500.0;
        p.take_profit_percent = 1000.0;
        let mut book = book_with(p);
        let later = t0() + Duration::minutes(10);

        book.evaluate("MINT", 1.40, later).unwrap();
        let stop = book.get("MINT").unwrap().trailing_stop_price.unwrap();
        assert!((stop - 1.19).abs() < 1e-9);
        assert_eq!(book.get("MINT").unwrap().status, PositionStatus::Trailing);

        book.evaluate("MINT", 1.60, later).unwrap();
        let stop = book.get("MINT").unwrap().trailing_stop_price.unwrap();
        assert!((stop - 1.36).abs() < 1e-9);

        let signal = book.evaluate("MINT", 1.35, later).unwrap();
        assert_eq!(signal.action, ExitAction::FullExit);
        assert_eq!(signal.urgency, Urgency::Critical);
        assert!(signal.reason.contains("Trailing stop"));
    }

    #[test]
    fn test_min_hold_blocks_take_profit_but_not_stops() {
        let mut book = book_with(policy());
        let early = t0() + Duration::seconds(30);
        let signal = book.evaluate("MINT", 2.5, early).unwrap();
        assert_eq!(signal.action, ExitAction::Hold);
        assert!(signal.reason.contains("Minimum hold"));

        let signal = book.evaluate("MINT", 0.5, early).unwrap();
        assert_eq!(signal.action, ExitAction::FullExit);
    }

    #[test]
    fn test_take_profit_after_min_hold() {
        let mut book = book_with(policy());
        let signal = book.evaluate("MINT", 2.1, t0() + Duration::minutes(3)).unwrap();
        assert_eq!(signal.action, ExitAction::FullExit);
        assert_eq!(signal.urgency, Urgency::High);
    }

    #[test]
    fn test_partial_exit_fires_once() {
        let mut book = book_with(policy());
        let later = t0() + Duration::minutes(3);
        let signal = book.evaluate("MINT", 1.55, later).unwrap();
        assert_eq!(signal.action, ExitAction::PartialExit { fraction: 0.5 });
        assert_eq!(signal.urgency, Urgency::Medium);

        book.record_partial_exit("MINT", 50.0, 50.0).unwrap();
        let signal = book.evaluate("MINT", 1.58, later).unwrap();
        assert!(signal.is_hold());
        assert!(book.get("MINT").unwrap().partial_exit_done);
    }

    #[test]
    fn test_max_hold_forces_exit() {
        let mut book = book_with(policy());
        let signal = book.evaluate("MINT", 1.05, t0() + Duration::hours(25)).unwrap();
        assert_eq!(signal.action, ExitAction::FullExit);
        assert_eq!(signal.urgency, Urgency::Medium);
    }

    #[test]
    fn test_exiting_position_is_not_signalled_twice() {
        let mut book = book_with(policy());
        let later = t0() + Duration::minutes(3);
        assert!(!book.evaluate("MINT", 0.7, later).unwrap().is_hold());
        let second = book.evaluate("MINT", 0.6, later).unwrap();
        assert!(second.is_hold());
        assert!(book.on_live_price("MINT", 0.5, later).unwrap().is_none());

        book.mark_exit_failed("MINT").unwrap();
        assert!(!book.evaluate("MINT", 0.6, later).unwrap().is_hold());
    }

    #[test]
    fn test_live_price_only_checks_protective_rules() {
        let mut book = book_with(policy());
        let later = t0() + Duration::minutes(3);
        assert!(book.on_live_price("MINT", 3.0, later).unwrap().is_none());
        let urgent = book.on_live_price("MINT", 2.4, later).unwrap().unwrap();
        assert_eq!(urgent.urgency, Urgency::Critical);
        assert_eq!(book.get("MINT").unwrap().status, PositionStatus::Exiting);
    }

    #[test]
    fn test_open_averages_existing_position() {
        let mut book = book_with(policy());
        let pos = book.open("MINT", 2.0, 100.0, 200.0, t0()).unwrap();
        assert!((pos.entry_price - 1.5).abs() < 1e-12);
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_open_refuses_to_average_into_exiting_position() {
        let mut book = book_with(policy());
        book.evaluate("MINT", 0.5, t0()).unwrap();
        assert!(matches!(
            book.open("MINT", 0.5, 10.0, 5.0, t0()),
            Err(LedgerError::Invalid(_))
        ));
    }

    #[test]
    fn test_record_partial_exit_rejects_full_quantity() {
        let mut book = book_with(policy());
        assert!(matches!(
            book.record_partial_exit("MINT", 100.0, 100.0),
            Err(LedgerError::Invalid(_))
        ));
        assert!(matches!(
            book.record_partial_exit("NOPE", 1.0, 1.0),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_close_unknown_is_not_found() {
        let mut book = book_with(policy());
        assert_eq!(
            book.close("OTHER"),
            Err(LedgerError::NotFound("OTHER".to_string()))
        );
        assert!(book.close("MINT").is_ok());
        assert!(book.is_empty());
    }

    #[test]
    fn test_tighten_stops_raises_armed_stops_only() {
        let mut p = policy();
        p.partial_take_percent = 500.0;
        p.take_profit_percent = 1000.0;
        let mut book = book_with(p);
        book.open("OTHER", 1.0, 10.0, 10.0, t0()).unwrap();
        book.evaluate("MINT", 1.40, t0() + Duration::minutes(5)).unwrap();

        let moved = book.tighten_stops(0.5).unwrap();
        assert_eq!(moved, 1);
        let stop = book.get("MINT").unwrap().trailing_stop_price.unwrap();
        assert!((stop - 1.4 * (1.0 - 0.075)).abs() < 1e-9);
        assert!(book.get("OTHER").unwrap().trailing_stop_price.is_none());

        // a factor of 1 leaves the gap as it is
        assert_eq!(book.tighten_stops(1.0).unwrap(), 0);
        assert!(book.tighten_stops(1.5).is_err());
    }

    #[test]
    fn test_repeated_tightening_does_not_compound() {
        let mut p = policy();
        p.partial_take_percent = 500.0;
        p.take_profit_percent = 1000.0;
        let mut book = book_with(p);
        book.evaluate("MINT", 1.40, t0() + Duration::minutes(5)).unwrap();

        assert_eq!(book.tighten_stops(0.5).unwrap(), 1);
        let once = book.get("MINT").unwrap().trailing_stop_price.unwrap();
        assert_eq!(book.tighten_stops(0.5).unwrap(), 0);
        assert_eq!(book.get("MINT").unwrap().trailing_stop_price.unwrap(), once);

        // back to normal: later ratchets use the full gap, the stop stays put
        book.relax_stops();
        assert_eq!(book.get("MINT").unwrap().stop_tightening, 1.0);
        assert_eq!(book.get("MINT").unwrap().trailing_stop_price.unwrap(), once);

        // re-entering a tightened mode measures from the policy gap again
        assert_eq!(book.tighten_stops(0.5).unwrap(), 0);
        assert_eq!(book.get("MINT").unwrap().trailing_stop_price.unwrap(), once);
        assert_eq!(book.get("MINT").unwrap().stop_tightening, 0.5);
    }

    #[test]
    fn test_force_exit_all_skips_claimed_positions() {
        let mut book = book_with(policy());
        book.open("OTHER", 1.0, 10.0, 10.0, t0()).unwrap();
        book.evaluate("MINT", 0.5, t0()).unwrap();

        let signals = book.force_exit_all();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].asset, "OTHER");
        assert!(book.force_exit_all().is_empty());
    }

    #[test]
    fn test_restore_releases_exit_claims() {
        let mut book = book_with(policy());
        book.evaluate("MINT", 0.5, t0()).unwrap();
        let restored = PositionBook::restore(policy(), book.snapshot());
        assert_eq!(restored.get("MINT").unwrap().status, PositionStatus::Active);
    }
}
