use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bucket::TimeBucket;

/// Quotes older than this many seconds are stale and must not drive any
/// order action.
pub const FRESHNESS_WINDOW_SECS: i64 = 120;

/// One update from the push feed for a single instrument token.
///
/// Immutable once received; a later tick for the same token supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub token: i64,
    pub timestamp: DateTime<Utc>,
    pub last_price: Decimal,
    pub open_interest: i64,
    pub volume_traded: i64,
    pub bid_volume: i64,
    pub offer_volume: i64,
}

/// Most recent tick for a token plus the instant it arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestQuote {
    pub tick: Tick,
    pub received_at: DateTime<Utc>,
}

impl LatestQuote {
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (now - self.received_at).num_seconds() < FRESHNESS_WINDOW_SECS
    }
}

/// A 5-minute OHLC bar for one instrument token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub token: i64,
    pub bucket: TimeBucket,
    pub ts: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl Candle {
    /// Close minus open; positive for a green bar, negative for a red one.
    #[must_use]
    pub fn body(&self) -> Decimal {
        self.close - self.open
    }

    #[must_use]
    pub fn is_green(&self) -> bool {
        self.close > self.open
    }

    #[must_use]
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }
}

/// Where the push-feed handler deposits ticks.
///
/// Implementations must tolerate being called from the feed task while the
/// decision loop drains concurrently.
pub trait TickSink: Send + Sync {
    fn absorb(&self, ticks: Vec<Tick>);
}

/// Option leg side, displayed with the exchange's CE/PE suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionSide {
    Call,
    Put,
}

impl OptionSide {
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Call => "CE",
            Self::Put => "PE",
        }
    }

    /// Reads the leg side off a trading symbol's CE/PE suffix.
    #[must_use]
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        if symbol.ends_with(Self::Call.suffix()) {
            Some(Self::Call)
        } else if symbol.ends_with(Self::Put.suffix()) {
            Some(Self::Put)
        } else {
            None
        }
    }
}

impl std::fmt::Display for OptionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.suffix())
    }
}
