//! Holdfast trading agent library
//!
//! Position management, risk guardrails and capital survival for an
//! autonomous spot trading agent, plus the live price feed and the
//! SQLite state store it runs on.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod secrets;
pub mod task_runner;
