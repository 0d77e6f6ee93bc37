//! Position vocabulary for the order coordinator.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use opt_trade_core::{session, Candle, OptionSide};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Minutes a position may run before the time-budget rules apply, measured
/// from the start of the 5-minute bar the entry order fell into.
pub const TIME_BUDGET_MINUTES: i64 = 30;

/// Where a tracked position sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    /// Open; entry metadata may still be missing. Written positions never
    /// leave this state until they close.
    Entered,
    /// Stop price known, no stop order resting at the broker.
    ProtectiveStopPending,
    /// A protective stop-limit order rests at the broker.
    ProtectiveStopActive,
    /// The stop has been moved up to the entry bar's high. Happens once.
    Trailing,
    /// Flat; reclaimed on the next reconcile.
    Closed,
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entered => write!(f, "entered"),
            Self::ProtectiveStopPending => write!(f, "stop_pending"),
            Self::ProtectiveStopActive => write!(f, "stop_active"),
            Self::Trailing => write!(f, "trailing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// One tracked option position, keyed by its leg token.
///
/// Owned exclusively by the coordinator. Broker day positions fold in
/// during reconciliation; the struct is dropped once the quantity is zero
/// with no stop order left behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub token: i64,
    pub symbol: String,
    pub side: OptionSide,
    pub underlying_token: i64,
    /// Signed contracts: positive long premium, negative written premium.
    pub quantity: i64,
    pub entry_order_id: Option<String>,
    pub entry_time: Option<DateTime<Utc>>,
    pub entry_price: Option<Decimal>,
    /// Last completed 5-minute bar of the leg when the entry was placed.
    pub entry_candle: Option<Candle>,
    pub target_price: Option<Decimal>,
    /// Tracks the resting order's limit price once a stop is placed.
    pub stop_price: Option<Decimal>,
    pub stop_order_id: Option<String>,
    /// Set once the stop has trailed up to the entry bar's high.
    pub trailed: bool,
    /// The premise is gone; market-close as soon as no stop is resting.
    pub close_requested: bool,
    pub state: PositionState,
    /// Leg bar timestamp consumed by the last post-budget review.
    pub reviewed_at: Option<NaiveDateTime>,
}

impl Position {
    /// A bare open position, as synthesized from a broker report.
    #[must_use]
    pub fn open(
        token: i64,
        symbol: &str,
        side: OptionSide,
        underlying_token: i64,
        quantity: i64,
    ) -> Self {
        Self {
            token,
            symbol: symbol.to_string(),
            side,
            underlying_token,
            quantity,
            entry_order_id: None,
            entry_time: None,
            entry_price: None,
            entry_candle: None,
            target_price: None,
            stop_price: None,
            stop_order_id: None,
            trailed: false,
            close_requested: false,
            state: PositionState::Entered,
            reviewed_at: None,
        }
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.quantity != 0
    }

    #[must_use]
    pub const fn is_long(&self) -> bool {
        self.quantity > 0
    }

    #[must_use]
    pub const fn is_short(&self) -> bool {
        self.quantity < 0
    }

    #[must_use]
    pub const fn has_stop_order(&self) -> bool {
        self.stop_order_id.is_some()
    }

    /// Entry timestamp on the exchange's wall clock.
    #[must_use]
    pub fn entry_time_local(&self) -> Option<NaiveDateTime> {
        self.entry_time
            .map(|ts| ts.with_timezone(&session::EXCHANGE_TZ).naive_local())
    }

    /// True once `now` is past the entry bar's start plus the time budget.
    /// Unknown entry time means the budget never starts.
    #[must_use]
    pub fn past_time_budget(&self, now_local: NaiveDateTime) -> bool {
        self.entry_time_local().is_some_and(|entry| {
            now_local > session::bucket_start(entry) + Duration::minutes(TIME_BUDGET_MINUTES)
        })
    }

    /// Re-derives the lifecycle state from the concrete fields. A flat
    /// position keeps its state while a stop still rests, so the stop's
    /// fate is resolved before the position reads as closed.
    pub fn sync_state(&mut self) {
        self.state = if !self.is_open() {
            if self.has_stop_order() {
                self.state
            } else {
                PositionState::Closed
            }
        } else if self.has_stop_order() {
            if self.trailed {
                PositionState::Trailing
            } else {
                PositionState::ProtectiveStopActive
            }
        } else if self.is_long() && self.stop_price.is_some() {
            PositionState::ProtectiveStopPending
        } else {
            PositionState::Entered
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ist(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 17)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn time_budget_runs_from_the_entry_bar_start() {
        let mut position =
            Position::open(11_926_274, "NIFTY2531722400CE", OptionSide::Call, 256_265, 75);
        // Entered at 10:03, so the bar starts at 10:00 and the budget ends
        // at 10:30.
        position.entry_time = Some(session::to_utc(ist(10, 3, 12)));

        assert!(!position.past_time_budget(ist(10, 29, 59)));
        assert!(!position.past_time_budget(ist(10, 30, 0)));
        assert!(position.past_time_budget(ist(10, 30, 1)));
    }

    #[test]
    fn unknown_entry_time_never_exceeds_the_budget() {
        let position =
            Position::open(11_926_274, "NIFTY2531722400CE", OptionSide::Call, 256_265, 75);
        assert!(!position.past_time_budget(ist(15, 0, 0)));
    }

    #[test]
    fn quantity_sign_classifies_the_position() {
        let long = Position::open(1, "NIFTY2531722400CE", OptionSide::Call, 256_265, 75);
        assert!(long.is_open() && long.is_long() && !long.is_short());

        let written = Position::open(2, "NIFTY2531722500CE", OptionSide::Call, 256_265, -75);
        assert!(written.is_open() && written.is_short());

        let flat = Position::open(3, "NIFTY2531722400PE", OptionSide::Put, 256_265, 0);
        assert!(!flat.is_open());
    }

    #[test]
    fn state_labels() {
        assert_eq!(PositionState::Entered.to_string(), "entered");
        assert_eq!(PositionState::ProtectiveStopPending.to_string(), "stop_pending");
        assert_eq!(PositionState::ProtectiveStopActive.to_string(), "stop_active");
        assert_eq!(PositionState::Trailing.to_string(), "trailing");
        assert_eq!(PositionState::Closed.to_string(), "closed");
    }

    #[test]
    fn state_follows_the_stop_fields() {
        use rust_decimal_macros::dec;

        let mut position =
            Position::open(11_926_274, "NIFTY2531722400CE", OptionSide::Call, 256_265, 75);
        position.sync_state();
        assert_eq!(position.state, PositionState::Entered);

        position.stop_price = Some(dec!(110));
        position.sync_state();
        assert_eq!(position.state, PositionState::ProtectiveStopPending);

        position.stop_order_id = Some("SL-1".into());
        position.sync_state();
        assert_eq!(position.state, PositionState::ProtectiveStopActive);

        position.trailed = true;
        position.sync_state();
        assert_eq!(position.state, PositionState::Trailing);

        // Flat with the stop still resting keeps the state until the stop
        // is resolved, then reads closed.
        position.quantity = 0;
        position.sync_state();
        assert_eq!(position.state, PositionState::Trailing);

        position.stop_order_id = None;
        position.sync_state();
        assert_eq!(position.state, PositionState::Closed);
    }
}
