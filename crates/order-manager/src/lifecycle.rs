//! Pure lifecycle rules for open positions.
//!
//! Every rule is a function of the position, the freshest quote and the
//! clock; the coordinator executes whatever action comes back. Price rules
//! stand down when no fresh quote exists, so a stale feed never moves an
//! order. The post-budget review needs the leg's latest bars, which the
//! coordinator fetches only when [`evaluate`] asks for them.

use chrono::{Duration, NaiveDateTime};
use opt_trade_core::{Candle, OptionSide};
use opt_trade_strategy::{AnalysisView, PCR_CALL_ENTRY, PCR_PUT_ENTRY};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::warn;

use crate::types::Position;

/// Ticks between a stop's trigger and its limit price.
pub const STOP_LIMIT_OFFSET: Decimal = dec!(1);
/// How far the last leg bar's low must clear the entry bar's high before
/// the stop trails up.
const TRAIL_CLEARANCE: Decimal = dec!(5);
/// Minimum gap between the entry bar's high and the current stop for a
/// trail to be worth a modify.
const TRAIL_GAP: Decimal = dec!(5);
/// Minutes after a reviewed leg bar before the leg is re-read.
const REVIEW_INTERVAL_MINUTES: i64 = 5;

/// What the coordinator should do with a position this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Market-close the open quantity now.
    MarketClose(CloseReason),
    /// Place the protective stop-limit order.
    PlaceStop { trigger: Decimal, limit: Decimal },
    /// Cancel the resting stop order.
    CancelStop(CancelReason),
    /// Fetch the leg's recent bars and run the post-budget review.
    ReviewLeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Price sits under the stop with no stop order left to fire; the stop
    /// either executed or was never placed.
    StopBreached,
    /// Past the time budget with no stop resting.
    TimeBudget,
    /// A discontinuation review asked for the close.
    Requested,
    /// Session square-off cutoff.
    SquareOff,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopBreached => write!(f, "stop_breached"),
            Self::TimeBudget => write!(f, "time_budget"),
            Self::Requested => write!(f, "close_requested"),
            Self::SquareOff => write!(f, "square_off"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Quantity reached zero while the stop still rests.
    FlatPosition,
    /// Price fell to or under the trigger; the resting limit would chase
    /// the market down.
    StopUnderwater,
    /// The position premise is discontinued.
    Discontinued,
    /// Session square-off cutoff.
    SquareOff,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FlatPosition => write!(f, "flat_position"),
            Self::StopUnderwater => write!(f, "stop_underwater"),
            Self::Discontinued => write!(f, "discontinued"),
            Self::SquareOff => write!(f, "square_off"),
        }
    }
}

/// Outcome of a post-budget review of the leg's latest bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// The premise is gone: cancel the stop and close next cycle.
    Discontinue,
    /// Move the stop up under the entry bar's high. Fires once.
    Trail { trigger: Decimal, limit: Decimal },
}

/// Picks at most one action for the position, in priority order: reclaim
/// leftovers, close, place the stop, cancel an underwater stop, review.
#[must_use]
pub fn evaluate(
    position: &Position,
    last_price: Option<Decimal>,
    now_local: NaiveDateTime,
) -> Option<LifecycleAction> {
    if !position.is_open() {
        return position
            .has_stop_order()
            .then_some(LifecycleAction::CancelStop(CancelReason::FlatPosition));
    }

    if let Some(reason) = close_reason(position, last_price, now_local) {
        warn!(
            token = position.token,
            symbol = %position.symbol,
            reason = %reason,
            "position close triggered"
        );
        return Some(LifecycleAction::MarketClose(reason));
    }

    if wants_stop(position, last_price, now_local) {
        let trigger = position.stop_price?;
        return Some(LifecycleAction::PlaceStop {
            trigger,
            limit: trigger - STOP_LIMIT_OFFSET,
        });
    }

    if stop_underwater(position, last_price) {
        warn!(
            token = position.token,
            symbol = %position.symbol,
            stop = ?position.stop_price,
            "resting stop underwater, cancelling"
        );
        return Some(LifecycleAction::CancelStop(CancelReason::StopUnderwater));
    }

    wants_review(position, now_local).then_some(LifecycleAction::ReviewLeg)
}

/// Close checks in priority order. A requested close goes through without a
/// quote; the price and budget rules sit behind the quote guard.
fn close_reason(
    position: &Position,
    last_price: Option<Decimal>,
    now_local: NaiveDateTime,
) -> Option<CloseReason> {
    if position.close_requested && !position.has_stop_order() {
        return Some(CloseReason::Requested);
    }

    let last = last_price?;
    if !position.has_stop_order() {
        if position.stop_price.is_some_and(|stop| last < stop) {
            return Some(CloseReason::StopBreached);
        }
        if position.past_time_budget(now_local) {
            return Some(CloseReason::TimeBudget);
        }
    }
    None
}

/// The stop goes in once price has moved favorably past it, and only while
/// the position is inside its time budget.
fn wants_stop(position: &Position, last_price: Option<Decimal>, now_local: NaiveDateTime) -> bool {
    if position.has_stop_order() {
        return false;
    }
    let (Some(stop), Some(last)) = (position.stop_price, last_price) else {
        return false;
    };
    last > stop && !position.past_time_budget(now_local)
}

fn stop_underwater(position: &Position, last_price: Option<Decimal>) -> bool {
    position.has_stop_order()
        && position
            .stop_price
            .zip(last_price)
            .is_some_and(|(stop, last)| last <= stop)
}

/// Longs with a resting stop get their premise re-checked once past the
/// time budget, at most once per leg bar.
fn wants_review(position: &Position, now_local: NaiveDateTime) -> bool {
    position.is_long()
        && position.has_stop_order()
        && position.stop_price.is_some()
        && position.past_time_budget(now_local)
        && position
            .reviewed_at
            .is_none_or(|at| now_local > at + Duration::minutes(REVIEW_INTERVAL_MINUTES))
}

/// Judges a long position against the leg's freshest bars and the
/// underlying's current analysis. Discontinuation outranks trailing; the
/// trail itself fires at most once.
#[must_use]
pub fn review(
    position: &Position,
    analysis: Option<&AnalysisView>,
    leg_candles: &[Candle],
) -> Option<ReviewOutcome> {
    let last = leg_candles.last()?;

    if is_trend_discontinued(position, analysis, leg_candles) {
        warn!(
            token = position.token,
            symbol = %position.symbol,
            "position premise discontinued"
        );
        return Some(ReviewOutcome::Discontinue);
    }

    if position.trailed {
        return None;
    }
    let entry_high = position.entry_candle.as_ref()?.high;
    let stop = position.stop_price?;
    (last.low > entry_high + TRAIL_CLEARANCE && entry_high > stop + TRAIL_GAP).then(|| {
        let limit = (entry_high - STOP_LIMIT_OFFSET).max(Decimal::ZERO);
        ReviewOutcome::Trail {
            trigger: entry_high,
            limit,
        }
    })
}

/// The premise is gone when the opposing pattern has emerged on the
/// underlying, the relevant PCR crossed back through its entry threshold,
/// or the leg closed below the prior bar's low.
fn is_trend_discontinued(
    position: &Position,
    analysis: Option<&AnalysisView>,
    leg_candles: &[Candle],
) -> bool {
    if let Some(view) = analysis {
        let premise_gone = match position.side {
            OptionSide::Call => view.is_bearish || view.pcr_nearest < PCR_CALL_ENTRY,
            OptionSide::Put => view.is_bullish || view.pcr_next > PCR_PUT_ENTRY,
        };
        if premise_gone {
            return true;
        }
    }

    let n = leg_candles.len();
    n >= 2 && leg_candles[n - 2].low > leg_candles[n - 1].close
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use opt_trade_core::{session, TimeBucket, TrendDirection};
    use rust_decimal_macros::dec;

    use crate::types::PositionState;

    fn ist(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 17)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn bar(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            token: 11_926_274,
            bucket: TimeBucket::from_raw(2_025_03_17_10_30),
            ts: session::to_utc(ist(10, 30, 0)),
            open,
            high,
            low,
            close,
        }
    }

    /// A long call entered at 10:03 with its stop already known.
    fn make_position() -> Position {
        let mut position =
            Position::open(11_926_274, "NIFTY2531722400CE", OptionSide::Call, 256_265, 75);
        position.entry_time = Some(session::to_utc(ist(10, 3, 12)));
        position.entry_price = Some(dec!(131.5));
        position.entry_candle = Some(bar(dec!(118), dec!(120), dec!(115), dec!(119.5)));
        position.stop_price = Some(dec!(110));
        position.state = PositionState::ProtectiveStopPending;
        position
    }

    fn view(is_bullish: bool, is_bearish: bool, pcr_nearest: f64, pcr_next: f64) -> AnalysisView {
        AnalysisView {
            bucket: TimeBucket::from_raw(2_025_03_17_10_35),
            trend: TrendDirection::None,
            is_bullish,
            is_bearish,
            pcr_nearest,
            pcr_next,
        }
    }

    #[test]
    fn flat_position_reclaims_or_cancels_its_stop() {
        let mut position = make_position();
        position.quantity = 0;
        assert_eq!(evaluate(&position, Some(dec!(120)), ist(10, 10, 0)), None);

        position.stop_order_id = Some("1001".into());
        assert_eq!(
            evaluate(&position, None, ist(10, 10, 0)),
            Some(LifecycleAction::CancelStop(CancelReason::FlatPosition))
        );
    }

    #[test]
    fn requested_close_goes_through_without_a_quote() {
        let mut position = make_position();
        position.close_requested = true;
        assert_eq!(
            evaluate(&position, None, ist(10, 10, 0)),
            Some(LifecycleAction::MarketClose(CloseReason::Requested))
        );

        // Not while a stop still rests.
        position.stop_order_id = Some("1001".into());
        assert_eq!(evaluate(&position, Some(dec!(130)), ist(10, 10, 0)), None);
    }

    #[test]
    fn below_stop_with_no_stop_order_closes_and_never_trails() {
        let mut position = make_position();
        position.trailed = false;
        // Seven bars past entry, under the stop, stop order gone: the stop
        // must have executed or never gone in. Close wins over any review.
        assert_eq!(
            evaluate(&position, Some(dec!(105)), ist(10, 38, 0)),
            Some(LifecycleAction::MarketClose(CloseReason::StopBreached))
        );
    }

    #[test]
    fn time_budget_close_sits_behind_the_quote_guard() {
        let position = make_position();
        assert_eq!(evaluate(&position, None, ist(10, 38, 0)), None);
        assert_eq!(
            evaluate(&position, Some(dec!(112)), ist(10, 38, 0)),
            Some(LifecycleAction::MarketClose(CloseReason::TimeBudget))
        );
    }

    #[test]
    fn written_position_closes_on_the_time_budget() {
        let mut position =
            Position::open(11_926_333, "NIFTY2531722500CE", OptionSide::Call, 256_265, -75);
        position.entry_time = Some(session::to_utc(ist(10, 3, 12)));

        assert_eq!(evaluate(&position, Some(dec!(95)), ist(10, 20, 0)), None);
        assert_eq!(
            evaluate(&position, Some(dec!(95)), ist(10, 38, 0)),
            Some(LifecycleAction::MarketClose(CloseReason::TimeBudget))
        );
    }

    #[test]
    fn stop_goes_in_above_the_trigger_inside_the_budget() {
        let position = make_position();
        assert_eq!(
            evaluate(&position, Some(dec!(131.5)), ist(10, 10, 0)),
            Some(LifecycleAction::PlaceStop {
                trigger: dec!(110),
                limit: dec!(109),
            })
        );

        // At the stop exactly, nothing fires yet.
        assert_eq!(evaluate(&position, Some(dec!(110)), ist(10, 10, 0)), None);
    }

    #[test]
    fn underwater_resting_stop_is_cancelled() {
        let mut position = make_position();
        position.stop_order_id = Some("1001".into());
        position.state = PositionState::ProtectiveStopActive;

        assert_eq!(
            evaluate(&position, Some(dec!(110)), ist(10, 10, 0)),
            Some(LifecycleAction::CancelStop(CancelReason::StopUnderwater))
        );
        assert_eq!(evaluate(&position, Some(dec!(110.5)), ist(10, 10, 0)), None);
    }

    #[test]
    fn review_waits_for_the_budget_and_throttles_per_bar() {
        let mut position = make_position();
        position.stop_order_id = Some("1001".into());
        position.state = PositionState::ProtectiveStopActive;

        // Inside the budget: nothing to review.
        assert_eq!(evaluate(&position, Some(dec!(131.5)), ist(10, 25, 0)), None);

        assert_eq!(
            evaluate(&position, Some(dec!(131.5)), ist(10, 38, 0)),
            Some(LifecycleAction::ReviewLeg)
        );

        position.reviewed_at = Some(ist(10, 35, 0));
        assert_eq!(evaluate(&position, Some(dec!(131.5)), ist(10, 38, 0)), None);
        assert_eq!(
            evaluate(&position, Some(dec!(131.5)), ist(10, 41, 0)),
            Some(LifecycleAction::ReviewLeg)
        );
    }

    #[test]
    fn trail_moves_the_stop_under_the_entry_bar_high() {
        let mut position = make_position();
        position.stop_order_id = Some("1001".into());

        // Entry bar high 120, stop 110: gap 10 clears the minimum, and the
        // last bar's low 126 clears the high by more than 5.
        let candles = [bar(dec!(124), dec!(130), dec!(126), dec!(129))];
        assert_eq!(
            review(&position, None, &candles),
            Some(ReviewOutcome::Trail {
                trigger: dec!(120),
                limit: dec!(119),
            })
        );
    }

    #[test]
    fn trail_needs_clearance_and_a_worthwhile_gap() {
        let mut position = make_position();
        position.stop_order_id = Some("1001".into());

        // Low at exactly high + 5 is not clearance.
        let shallow = [bar(dec!(123), dec!(128), dec!(125), dec!(127))];
        assert_eq!(review(&position, None, &shallow), None);

        // Stop already near the entry high: not worth a modify.
        position.stop_price = Some(dec!(115));
        let drifted = [bar(dec!(124), dec!(130), dec!(126), dec!(129))];
        assert_eq!(review(&position, None, &drifted), None);
    }

    #[test]
    fn trail_fires_only_once() {
        let mut position = make_position();
        position.stop_order_id = Some("1001".into());
        position.trailed = true;
        position.stop_price = Some(dec!(119));

        let candles = [bar(dec!(128), dec!(134), dec!(130), dec!(133))];
        assert_eq!(review(&position, None, &candles), None);
    }

    #[test]
    fn discontinuation_mirrors_the_leg_side() {
        let call = make_position();
        let candles = [bar(dec!(124), dec!(130), dec!(126), dec!(129))];

        let bearish = view(false, true, 1.8, 0.6);
        assert_eq!(
            review(&call, Some(&bearish), &candles),
            Some(ReviewOutcome::Discontinue)
        );

        let pcr_back = view(false, false, 1.4, 0.6);
        assert_eq!(
            review(&call, Some(&pcr_back), &candles),
            Some(ReviewOutcome::Discontinue)
        );

        let mut put = make_position();
        put.side = OptionSide::Put;
        let bullish = view(true, false, 1.8, 0.6);
        assert_eq!(
            review(&put, Some(&bullish), &candles),
            Some(ReviewOutcome::Discontinue)
        );
        let put_pcr_back = view(false, false, 1.8, 0.8);
        assert_eq!(
            review(&put, Some(&put_pcr_back), &candles),
            Some(ReviewOutcome::Discontinue)
        );

        // Premise intact for the call: trend support holds, trail instead.
        let intact = view(false, false, 1.8, 0.6);
        assert_eq!(
            review(&call, Some(&intact), &candles),
            Some(ReviewOutcome::Trail {
                trigger: dec!(120),
                limit: dec!(119),
            })
        );
    }

    #[test]
    fn leg_break_discontinues_without_analysis() {
        let position = make_position();
        // Prior bar's low 126 above the last close 124.
        let candles = [
            bar(dec!(127), dec!(131), dec!(126), dec!(130)),
            bar(dec!(129), dec!(129.5), dec!(123), dec!(124)),
        ];
        assert_eq!(
            review(&position, None, &candles),
            Some(ReviewOutcome::Discontinue)
        );
    }

    #[test]
    fn review_of_an_empty_leg_series_is_a_no_op() {
        let position = make_position();
        assert_eq!(review(&position, None, &[]), None);
    }
}
