use crate::domain::entities::{AgentSnapshot, ClosedTrade};
use async_trait::async_trait;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Snapshot could not be encoded or decoded: {0}")]
    Codec(String),
}

/// Durable state that survives a process restart.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_snapshot(&self) -> StoreResult<Option<AgentSnapshot>>;

    async fn save_snapshot(&self, snapshot: &AgentSnapshot) -> StoreResult<()>;

    /// Appends a realized trade to the journal.
    async fn record_trade(&self, trade: &ClosedTrade) -> StoreResult<()>;
}
