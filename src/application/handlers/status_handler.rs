use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::application::actors::price_feed::{ConnectionState, PriceFeed};
use crate::application::services::Agent;
use crate::domain::entities::{ClosedTrade, Position, RiskMode, RiskState, SurvivalState};
use crate::persistence::SqliteStateStore;
use crate::rate_limit::{rate_limit_middleware, GlobalRateLimiter};

#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<Agent>,
    pub feed: Arc<PriceFeed>,
    pub journal: Arc<SqliteStateStore>,
}

const DEFAULT_TRADE_LIMIT: i64 = 50;
const MAX_TRADE_LIMIT: i64 = 500;

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub mode: RiskMode,
    pub open_positions: usize,
    pub feed: ConnectionState,
    pub executor: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RiskResponse {
    pub mode: RiskMode,
    pub state: RiskState,
    pub max_daily_loss: f64,
    pub max_drawdown_percent: f64,
    pub max_exposure_percent: f64,
    pub max_position_percent: f64,
    pub max_consecutive_losses: u32,
    pub current_drawdown_percent: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SurvivalResponse {
    pub state: SurvivalState,
    pub target_capital: f64,
    pub low_watermark: f64,
    pub critical_watermark: f64,
    pub reserve_asset: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FeedResponse {
    pub configured: bool,
    pub state: ConnectionState,
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearCooldownResponse {
    pub cleared: bool,
    pub consecutive_losses: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExitFailure {
    pub asset: String,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExitAllResponse {
    pub closed: Vec<ClosedTrade>,
    pub failed: Vec<ExitFailure>,
}

pub fn router(state: ApiState, limiter: GlobalRateLimiter) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/positions", get(list_positions))
        .route("/positions/exit-all", post(exit_all))
        .route("/positions/:asset", get(get_position))
        .route("/risk", get(risk))
        .route("/risk/clear-cooldown", post(clear_cooldown))
        .route("/survival", get(survival))
        .route("/feed", get(feed))
        .route("/trades", get(recent_trades))
        .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let open_positions = state.agent.ledger().snapshot().await.len();
    Json(HealthResponse {
        status: "running".to_string(),
        mode: state.agent.current_mode().await,
        open_positions,
        feed: state.feed.state(),
        executor: state.agent.executor_name().to_string(),
        timestamp: Utc::now(),
    })
}

async fn list_positions(State(state): State<ApiState>) -> Json<Vec<Position>> {
    Json(state.agent.ledger().snapshot().await)
}

async fn get_position(
    State(state): State<ApiState>,
    Path(asset): Path<String>,
) -> Result<Json<Position>, ApiError> {
    state.agent.ledger().get(&asset).await.map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "not_found".to_string(),
                details: format!("No open position for {}", asset),
            }),
        )
    })
}

async fn risk(State(state): State<ApiState>) -> Json<RiskResponse> {
    let mode = state.agent.current_mode().await;
    let risk = state.agent.context().risk.lock().await;
    let limits = risk.limits();
    let risk_state = risk.state().clone();
    let current_drawdown_percent = risk_state
        .last_balance
        .map(|b| risk_state.drawdown_percent(b))
        .unwrap_or(0.0);
    Json(RiskResponse {
        mode,
        max_daily_loss: limits.max_daily_loss,
        max_drawdown_percent: limits.max_drawdown_percent,
        max_exposure_percent: limits.max_exposure_percent,
        max_position_percent: limits.max_position_percent,
        max_consecutive_losses: limits.max_consecutive_losses,
        current_drawdown_percent,
        state: risk_state,
    })
}

async fn clear_cooldown(State(state): State<ApiState>) -> Json<ClearCooldownResponse> {
    let (cleared, consecutive_losses) = {
        let mut risk = state.agent.context().risk.lock().await;
        let cleared = risk.clear_cooldown();
        (cleared, risk.state().consecutive_losses)
    };
    if cleared {
        warn!("Cooldown cleared through the API");
        state.agent.mark_dirty();
    }
    Json(ClearCooldownResponse {
        cleared,
        consecutive_losses,
    })
}

async fn survival(State(state): State<ApiState>) -> Json<SurvivalResponse> {
    let survival = state.agent.context().survival.lock().await;
    let config = survival.config();
    Json(SurvivalResponse {
        state: survival.state().clone(),
        target_capital: config.target_capital,
        low_watermark: config.low_watermark(),
        critical_watermark: config.critical_watermark(),
        reserve_asset: config.reserve_asset.clone(),
    })
}

async fn feed(State(state): State<ApiState>) -> Json<FeedResponse> {
    Json(FeedResponse {
        configured: state.feed.is_configured(),
        state: state.feed.state(),
        subscriptions: state.feed.subscribed_assets().await,
    })
}

async fn recent_trades(
    State(state): State<ApiState>,
    Query(query): Query<TradesQuery>,
) -> Result<Json<Vec<ClosedTrade>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TRADE_LIMIT)
        .clamp(1, MAX_TRADE_LIMIT);
    state.journal.recent_trades(limit).await.map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "journal_unavailable".to_string(),
                details: e.to_string(),
            }),
        )
    })
}

async fn exit_all(State(state): State<ApiState>) -> Json<ExitAllResponse> {
    warn!("Forced exit of all positions requested through the API");
    let mut response = ExitAllResponse {
        closed: Vec::new(),
        failed: Vec::new(),
    };
    for (asset, result) in state.agent.force_exit_all(Utc::now()).await {
        match result {
            Ok(trade) => response.closed.push(trade),
            Err(e) => response.failed.push(ExitFailure {
                asset,
                error: e.to_string(),
            }),
        }
    }
    Json(response)
}
