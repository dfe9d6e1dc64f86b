//! Wire format of the live trade stream.
//!
//! Outbound: `{"method":"subscribeTokenTrade","keys":[...]}` and the matching
//! `unsubscribeTokenTrade`. Inbound trade events carry the asset (`mint`),
//! side, both legs of the swap and optionally the bonding-curve reserves.
//! Everything else is either an acknowledgment, a protocol pong or a server
//! error. Validation is exhaustive; a message that fails any check is
//! reported as a typed error and never reaches subscribers.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// One swap observed on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub asset: String,
    pub side: TradeSide,
    pub token_amount: f64,
    pub base_amount: f64,
    pub price: f64,
    pub market_cap: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

/// Price derived from a trade, as delivered to price subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub asset: String,
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

impl From<&TradeTick> for PriceTick {
    fn from(trade: &TradeTick) -> Self {
        PriceTick {
            asset: trade.asset.clone(),
            price: trade.price,
            observed_at: trade.observed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Trade(TradeTick),
    Ack(String),
    Pong,
    ServerError(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeedMessageError {
    #[error("JSON parsing failed at line {line}, column {column}: {message}")]
    InvalidJson {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Expected JSON object")]
    NotAnObject,

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Field '{0}' is null")]
    NullField(&'static str),

    #[error("Field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("Field '{field}' has wrong type: expected {expected}, got {actual}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
        actual: String,
    },

    #[error("Field '{field}' out of range: {value}")]
    OutOfRange { field: &'static str, value: String },

    #[error("Unrecognized message shape")]
    Unrecognized,
}

pub fn subscribe_message(assets: &[String]) -> String {
    serde_json::json!({ "method": "subscribeTokenTrade", "keys": assets }).to_string()
}

pub fn unsubscribe_message(assets: &[String]) -> String {
    serde_json::json!({ "method": "unsubscribeTokenTrade", "keys": assets }).to_string()
}

pub fn parse_message(
    text: &str,
    received_at: DateTime<Utc>,
) -> Result<InboundMessage, FeedMessageError> {
    let value: Value = serde_json::from_str(text).map_err(|e| FeedMessageError::InvalidJson {
        line: e.line(),
        column: e.column(),
        message: e.to_string(),
    })?;
    let obj = value.as_object().ok_or(FeedMessageError::NotAnObject)?;

    if obj.contains_key("mint") {
        return parse_trade(obj, received_at).map(InboundMessage::Trade);
    }
    if let Some(errors) = obj.get("errors") {
        let text = match errors {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(InboundMessage::ServerError(text));
    }
    if obj.get("type").and_then(Value::as_str) == Some("pong") {
        return Ok(InboundMessage::Pong);
    }
    if let Some(message) = obj.get("message") {
        let text = message.as_str().map(str::to_string).unwrap_or_else(|| message.to_string());
        return Ok(InboundMessage::Ack(text));
    }
    Err(FeedMessageError::Unrecognized)
}

fn parse_trade(
    obj: &Map<String, Value>,
    received_at: DateTime<Utc>,
) -> Result<TradeTick, FeedMessageError> {
    let asset = required_str(obj, "mint")?;
    let side = match required_str(obj, "txType")?.to_ascii_lowercase().as_str() {
        "buy" => TradeSide::Buy,
        "sell" => TradeSide::Sell,
        other => {
            return Err(FeedMessageError::OutOfRange {
                field: "txType",
                value: other.to_string(),
            })
        }
    };
    let token_amount = required_positive(obj, "tokenAmount")?;
    let base_amount = required_positive(obj, "solAmount")?;

    let reserves = (
        optional_positive(obj, "vSolInBondingCurve")?,
        optional_positive(obj, "vTokensInBondingCurve")?,
    );
    let price = match reserves {
        (Some(base_reserve), Some(token_reserve)) => base_reserve / token_reserve,
        _ => base_amount / token_amount,
    };
    if !price.is_finite() || price <= 0.0 {
        return Err(FeedMessageError::OutOfRange {
            field: "price",
            value: price.to_string(),
        });
    }

    let market_cap = optional_positive(obj, "marketCapSol")?;
    let observed_at = match optional_positive(obj, "timestamp")? {
        Some(ms) => Utc
            .timestamp_millis_opt(ms as i64)
            .single()
            .ok_or(FeedMessageError::OutOfRange {
                field: "timestamp",
                value: ms.to_string(),
            })?,
        None => received_at,
    };

    Ok(TradeTick {
        asset: asset.to_string(),
        side,
        token_amount,
        base_amount,
        price,
        market_cap,
        observed_at,
    })
}

fn type_name(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

fn required<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, FeedMessageError> {
    match obj.get(field) {
        None => Err(FeedMessageError::MissingField(field)),
        Some(Value::Null) => Err(FeedMessageError::NullField(field)),
        Some(v) => Ok(v),
    }
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, FeedMessageError> {
    let value = required(obj, field)?;
    let s = value.as_str().ok_or_else(|| FeedMessageError::TypeMismatch {
        field,
        expected: "string",
        actual: type_name(value),
    })?;
    if s.trim().is_empty() {
        return Err(FeedMessageError::EmptyField(field));
    }
    Ok(s)
}

fn number(value: &Value, field: &'static str) -> Result<f64, FeedMessageError> {
    let n = value.as_f64().ok_or_else(|| FeedMessageError::TypeMismatch {
        field,
        expected: "number",
        actual: type_name(value),
    })?;
    if !n.is_finite() || n <= 0.0 {
        return Err(FeedMessageError::OutOfRange {
            field,
            value: n.to_string(),
        });
    }
    Ok(n)
}

fn required_positive(obj: &Map<String, Value>, field: &'static str) -> Result<f64, FeedMessageError> {
    number(required(obj, field)?, field)
}

fn optional_positive(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<f64>, FeedMessageError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => number(v, field).map(Some),
    }
}
