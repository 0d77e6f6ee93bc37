//! Signal vocabulary shared by the strategy and order-management crates.
//!
//! A [`Signal`] is derived at most once per 5-minute bucket per underlying;
//! the bucket inside it is the idempotency key that enforces this.

use serde::{Deserialize, Serialize};

use crate::bucket::TimeBucket;

/// Action decided for one underlying in one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalAction {
    /// Buy the call leg at the nearest strike.
    BuyCall,
    /// Buy the put leg at the next strike.
    BuyPut,
    /// Write the call leg at the max-OI wall (selling policy only).
    SellCall,
    /// Write the put leg at the max-OI wall (selling policy only).
    SellPut,
    /// Evaluated, nothing to do this bucket.
    None,
}

impl SignalAction {
    #[must_use]
    pub const fn is_entry(self) -> bool {
        !matches!(self, Self::None)
    }

    #[must_use]
    pub const fn is_short(self) -> bool {
        matches!(self, Self::SellCall | Self::SellPut)
    }
}

/// Swing trend direction of an underlying's candle series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendDirection {
    Up,
    Down,
    /// Not yet established (too few candles or no qualifying reversal).
    None,
}

impl TrendDirection {
    #[must_use]
    pub const fn is_established(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Classification of a smoothed open-interest series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OiTrend {
    Increasing,
    Decreasing,
    Stable,
}

/// Outcome of one bucket's signal derivation for one underlying.
///
/// Recorded even when `action` is `None`, so the same bucket is never
/// evaluated twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub bucket: TimeBucket,
    pub action: SignalAction,
    /// Resolved call token for the bucket (nearest strike), when known.
    pub chosen_ce_token: Option<i64>,
    /// Resolved put token for the bucket (next strike), when known.
    pub chosen_pe_token: Option<i64>,
}

impl Signal {
    /// A no-action signal that still claims the bucket.
    #[must_use]
    pub const fn none(bucket: TimeBucket) -> Self {
        Self {
            bucket,
            action: SignalAction::None,
            chosen_ce_token: None,
            chosen_pe_token: None,
        }
    }
}
