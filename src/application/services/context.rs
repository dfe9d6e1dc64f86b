use crate::config::AgentConfig;
use crate::domain::entities::AgentSnapshot;
use crate::domain::services::{PositionBook, RiskGuardrail, SurvivalAllocator};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Shared mutable state of the agent, passed explicitly to every component
/// that needs it.
///
/// ## Lock Ordering Convention
///
/// When more than one lock is needed, acquire them in this order:
/// 1. book
/// 2. risk
/// 3. survival
///
/// No guard may be held across an executor, market-data or feed call.
#[derive(Clone)]
pub struct AgentContext {
    pub book: Arc<Mutex<PositionBook>>,
    pub risk: Arc<Mutex<RiskGuardrail>>,
    pub survival: Arc<Mutex<SurvivalAllocator>>,
}

impl AgentContext {
    pub fn new(config: &AgentConfig, now: DateTime<Utc>) -> Self {
        Self {
            book: Arc::new(Mutex::new(PositionBook::new(config.exit.clone()))),
            risk: Arc::new(Mutex::new(RiskGuardrail::new(config.risk.clone(), now))),
            survival: Arc::new(Mutex::new(SurvivalAllocator::new(config.survival.clone()))),
        }
    }

    /// Rebuilds the context from a persisted snapshot. Limits and policies
    /// always come from the current configuration.
    pub fn restore(config: &AgentConfig, snapshot: AgentSnapshot) -> Self {
        info!(
            "Restoring {} position(s) from snapshot saved at {}",
            snapshot.positions.len(),
            snapshot.saved_at
        );
        Self {
            book: Arc::new(Mutex::new(PositionBook::restore(
                config.exit.clone(),
                snapshot.positions,
            ))),
            risk: Arc::new(Mutex::new(RiskGuardrail::restore(
                config.risk.clone(),
                snapshot.risk,
            ))),
            survival: Arc::new(Mutex::new(SurvivalAllocator::restore(
                config.survival.clone(),
                snapshot.survival,
            ))),
        }
    }

    /// Consistent copy of all persisted state.
    pub async fn snapshot(&self, now: DateTime<Utc>) -> AgentSnapshot {
        let book = self.book.lock().await;
        let risk = self.risk.lock().await;
        let survival = self.survival.lock().await;
        AgentSnapshot {
            positions: book.snapshot(),
            risk: risk.state().clone(),
            survival: survival.state().clone(),
            saved_at: now,
        }
    }
}
