use super::position::Position;
use super::risk_state::RiskState;
use super::survival_state::SurvivalState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything that must survive a restart, persisted as one opaque document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub positions: Vec<Position>,
    pub risk: RiskState,
    pub survival: SurvivalState,
    pub saved_at: DateTime<Utc>,
}
