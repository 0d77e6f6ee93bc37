//! Brokerage gateway seam.
//!
//! Everything the engine needs from the broker goes through
//! [`BrokerGateway`], so the live REST client and the paper broker used in
//! tests are interchangeable. Errors are split into the two classes the
//! decision loop treats differently: transient connectivity (retry next
//! cadence) and rejected actions (log, leave state unchanged).

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::market::Candle;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker or network unreachable; the same call may succeed next cycle.
    #[error("broker unreachable: {0}")]
    Transient(String),

    /// The broker understood the request and refused it.
    #[error("order rejected: {0}")]
    Rejected(String),
}

impl BrokerError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order pricing variants the engine actually places.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    /// Stop order resting at `trigger`, submitted as a limit at `limit`
    /// (one tick through the trigger) once touched.
    StopLimit { trigger: Decimal, limit: Decimal },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    pub kind: OrderKind,
}

/// Replacement trigger and limit for a resting stop order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderModify {
    pub trigger: Decimal,
    pub limit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Complete,
    Open,
    TriggerPending,
    Cancelled,
    Rejected,
    Other(String),
}

impl From<&str> for OrderStatus {
    fn from(raw: &str) -> Self {
        match raw {
            "COMPLETE" => Self::Complete,
            "OPEN" => Self::Open,
            "TRIGGER PENDING" => Self::TriggerPending,
            "CANCELLED" => Self::Cancelled,
            "REJECTED" => Self::Rejected,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderKind {
    Market,
    Limit,
    StopLimit,
}

/// One row of the broker's order book for the day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order_id: String,
    pub token: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub kind: BrokerOrderKind,
    pub quantity: u32,
    pub average_price: Decimal,
    pub price: Decimal,
    pub trigger_price: Decimal,
    pub placed_at: DateTime<Utc>,
}

impl BrokerOrder {
    /// A protective stop still resting at the broker.
    #[must_use]
    pub fn is_pending_stop(&self) -> bool {
        self.kind == BrokerOrderKind::StopLimit && self.status == OrderStatus::TriggerPending
    }
}

/// Net day position as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub token: i64,
    pub symbol: String,
    /// Signed: positive long, negative short, zero flat.
    pub quantity: i64,
    pub average_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginSummary {
    pub available_cash: Decimal,
}

/// One row of the exchange instrument dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRow {
    pub token: i64,
    pub symbol: String,
    pub name: String,
    pub expiry: Option<NaiveDate>,
    pub strike: Decimal,
    pub instrument_type: String,
    pub exchange: String,
}

#[async_trait::async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Places an order, returning the broker's order id.
    async fn place_order(&self, request: &OrderRequest) -> Result<String, BrokerError>;

    async fn modify_order(&self, order_id: &str, change: &OrderModify)
        -> Result<(), BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    /// All of today's orders, any status.
    async fn orders(&self) -> Result<Vec<BrokerOrder>, BrokerError>;

    /// Net day positions.
    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn margins(&self) -> Result<MarginSummary, BrokerError>;

    /// 5-minute OHLC bars for `token` between the exchange-local bounds.
    async fn historical_candles(
        &self,
        token: i64,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Candle>, BrokerError>;

    /// The tradable instrument dump for one exchange segment.
    async fn instruments(&self, exchange: &str) -> Result<Vec<InstrumentRow>, BrokerError>;
}
