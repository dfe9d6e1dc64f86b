use crate::domain::errors::EntrySignalError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Buy candidate proposed by the screening side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryCandidate {
    pub asset: String,
    /// 0-100.
    pub confidence: f64,
    pub suggested_amount: f64,
}

#[async_trait]
pub trait EntrySignalSource: Send + Sync {
    /// Candidates for this tick. Only called when the risk mode permits entries.
    async fn candidates(&self, now: DateTime<Utc>) -> Result<Vec<EntryCandidate>, EntrySignalError>;
}

/// Source that never proposes anything; the agent then only manages exits.
pub struct NoEntrySignals;

#[async_trait]
impl EntrySignalSource for NoEntrySignals {
    async fn candidates(&self, _now: DateTime<Utc>) -> Result<Vec<EntryCandidate>, EntrySignalError> {
        Ok(Vec::new())
    }
}
