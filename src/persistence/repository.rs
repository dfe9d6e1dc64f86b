//! Database Repository
//!
//! Snapshot and trade-journal access on top of the SQLite pool.

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::{AgentSnapshot, ClosedTrade};
use crate::domain::repositories::{StateStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error};

const SNAPSHOT_KEY: &str = "agent_snapshot";

/// SQLite-backed `StateStore`
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: DbPool,
}

impl SqliteStateStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn load(&self) -> Result<Option<AgentSnapshot>, DatabaseError> {
        let record = sqlx::query_as::<_, StateRecord>(
            "SELECT key, payload, updated_at FROM agent_state WHERE key = ?1",
        )
        .bind(SNAPSHOT_KEY)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load snapshot: {}", e);
            DatabaseError::QueryError(format!("Failed to load snapshot: {}", e))
        })?;

        match record {
            Some(record) => {
                let snapshot = serde_json::from_str(&record.payload).map_err(|e| {
                    error!("Stored snapshot is unreadable: {}", e);
                    DatabaseError::SerializationError(e.to_string())
                })?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    pub async fn save(&self, snapshot: &AgentSnapshot) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(snapshot)
            .map_err(|e| DatabaseError::SerializationError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO agent_state (key, payload, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at
            "#,
        )
        .bind(SNAPSHOT_KEY)
        .bind(&payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save snapshot: {}", e);
            DatabaseError::QueryError(format!("Failed to save snapshot: {}", e))
        })?;

        debug!(
            "Saved snapshot: {} position(s), {} bytes",
            snapshot.positions.len(),
            payload.len()
        );
        Ok(())
    }

    pub async fn insert_trade(&self, trade: &ClosedTrade) -> Result<i64, DatabaseError> {
        let id = sqlx::query(
            r#"
            INSERT INTO closed_trades (
                asset, quantity, cost_basis, proceeds, pnl, reason, partial, closed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&trade.asset)
        .bind(trade.quantity)
        .bind(trade.cost_basis)
        .bind(trade.proceeds)
        .bind(trade.pnl.value())
        .bind(&trade.reason)
        .bind(trade.partial)
        .bind(trade.closed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record trade for {}: {}", trade.asset, e);
            DatabaseError::QueryError(format!("Failed to record trade: {}", e))
        })?
        .last_insert_rowid();

        debug!("Recorded trade {} for {}", id, trade.asset);
        Ok(id)
    }

    /// Most recent trades first
    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<ClosedTrade>, DatabaseError> {
        let records = sqlx::query_as::<_, ClosedTradeRecord>(
            "SELECT * FROM closed_trades ORDER BY closed_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get recent trades: {}", e);
            DatabaseError::QueryError(format!("Failed to get recent trades: {}", e))
        })?;

        Ok(records.into_iter().map(ClosedTradeRecord::into_trade).collect())
    }
}

impl From<DatabaseError> for StoreError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::SerializationError(msg) => StoreError::Codec(msg),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_snapshot(&self) -> StoreResult<Option<AgentSnapshot>> {
        Ok(self.load().await?)
    }

    async fn save_snapshot(&self, snapshot: &AgentSnapshot) -> StoreResult<()> {
        Ok(self.save(snapshot).await?)
    }

    async fn record_trade(&self, trade: &ClosedTrade) -> StoreResult<()> {
        self.insert_trade(trade).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExitPolicy;
    use crate::domain::entities::{RiskState, SurvivalState};
    use crate::domain::services::PositionBook;
    use crate::domain::value_objects::PnL;
    use crate::persistence::init_database;

    async fn store() -> SqliteStateStore {
        let pool = init_database("sqlite::memory:").await.unwrap();
        SqliteStateStore::new(pool)
    }

    fn snapshot() -> AgentSnapshot {
        let now = Utc::now();
        let mut book = PositionBook::new(ExitPolicy::default());
        book.open("MINT", 0.000123456789, 1_000_000.0, 123.456789, now)
            .unwrap();
        book.evaluate("MINT", 0.00017, now).unwrap();
        AgentSnapshot {
            positions: book.snapshot(),
            risk: RiskState::new(now),
            survival: SurvivalState::default(),
            saved_at: now,
        }
    }

    #[tokio::test]
    async fn test_load_empty_store() {
        let store = store().await;
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let store = store().await;
        let original = snapshot();
        store.save(&original).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_snapshot() {
        let store = store().await;
        let mut snap = snapshot();
        store.save(&snap).await.unwrap();
        snap.positions.clear();
        store.save(&snap).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert!(loaded.positions.is_empty());
    }

    #[tokio::test]
    async fn test_trade_journal() {
        let store = store().await;
        let base = Utc::now();
        for (i, pnl) in [-0.1, 0.25].iter().enumerate() {
            let trade = ClosedTrade {
                asset: format!("MINT{}", i),
                quantity: 10.0,
                cost_basis: 1.0,
                proceeds: 1.0 + pnl,
                pnl: PnL::new(*pnl).unwrap(),
                reason: "Stop loss hit".to_string(),
                partial: false,
                closed_at: base + chrono::Duration::seconds(i as i64),
            };
            store.record_trade(&trade).await.unwrap();
        }

        let trades = store.recent_trades(10).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].asset, "MINT1");
        assert!(trades[0].is_win());
        assert!(trades[1].is_loss());
    }
}
