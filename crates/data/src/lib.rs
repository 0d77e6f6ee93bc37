//! Tick, candle, and analysis-snapshot storage for the options trading engine.
//!
//! This crate provides:
//! - Database client for `PostgreSQL`
//! - Idempotent tick/candle inserts keyed the same way the engine derives
//!   its signals, so replays never duplicate rows

pub mod database;

pub use database::{AnalysisSnapshotRecord, DatabaseClient, OiRow, PricePoint};
