//! Entry mechanics: turns a bucket's signal into an order plan.
//!
//! Long entries price their protective stop and target off the leg's last
//! completed bar; written entries carry neither. The coordinator owns the
//! actual brokerage calls, so everything here stays checkable without one.

use chrono::{Duration, NaiveDateTime};
use opt_trade_core::{session, Candle, OptionSide, OrderSide, Signal, SignalAction};
use opt_trade_strike_selector::OptionLeg;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

/// Points under the entry bar's low where the protective stop sits.
pub const STOP_OFFSET: Decimal = dec!(5);
/// Maximum premium at risk between the entry price and the stop.
const MAX_ENTRY_RISK: Decimal = dec!(20);
/// Cash slack granted on top of available margin.
const MARGIN_SLACK: Decimal = dec!(1000);

/// Everything needed to place one entry order.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub token: i64,
    pub symbol: String,
    pub side: OptionSide,
    pub order_side: OrderSide,
    pub quantity: u32,
    pub last_price: Decimal,
    pub entry_candle: Option<Candle>,
    pub stop_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
}

/// The leg token a signal trades, out of its resolved CE/PE pair.
#[must_use]
pub fn signal_token(signal: &Signal) -> Option<i64> {
    match signal.action {
        SignalAction::BuyCall | SignalAction::SellCall => signal.chosen_ce_token,
        SignalAction::BuyPut | SignalAction::SellPut => signal.chosen_pe_token,
        SignalAction::None => None,
    }
}

#[must_use]
pub const fn signal_side(action: SignalAction) -> Option<OptionSide> {
    match action {
        SignalAction::BuyCall | SignalAction::SellCall => Some(OptionSide::Call),
        SignalAction::BuyPut | SignalAction::SellPut => Some(OptionSide::Put),
        SignalAction::None => None,
    }
}

/// The 15-minute span of completed leg bars behind `now`, anchored to the
/// 09:15 open. The entry bar is the last bar of this span.
#[must_use]
pub fn entry_bar_window(now_local: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
    let to = session::market_open(now_local.date())
        + Duration::minutes(session::elapsed_buckets(now_local) * 5);
    (to - Duration::minutes(15), to)
}

/// Shapes the order plan for a signal's leg.
///
/// Longs need the leg's last completed bar and the underlying's ATR: the
/// stop sits [`STOP_OFFSET`] under the bar's low and the target an ATR
/// above it, and the entry is dropped when the bar's low is not under the
/// price or when more than [`MAX_ENTRY_RISK`] points sit between price and
/// stop. Written entries skip all of that.
#[must_use]
pub fn plan_entry(
    action: SignalAction,
    side: OptionSide,
    leg: &OptionLeg,
    quantity: u32,
    last_price: Decimal,
    leg_candles: &[Candle],
    atr: Option<Decimal>,
) -> Option<EntryPlan> {
    if action.is_short() {
        return Some(EntryPlan {
            token: leg.token,
            symbol: leg.symbol.clone(),
            side,
            order_side: OrderSide::Sell,
            quantity,
            last_price,
            entry_candle: leg_candles.last().cloned(),
            stop_price: None,
            target_price: None,
        });
    }

    let Some(candle) = leg_candles.last() else {
        debug!(token = leg.token, "no completed leg bar yet, skipping entry");
        return None;
    };
    let low = candle.low;
    let stop = low - STOP_OFFSET;
    if low >= last_price {
        debug!(
            token = leg.token,
            %low,
            price = %last_price,
            "entry bar low not under the price, skipping entry"
        );
        return None;
    }
    if last_price - stop > MAX_ENTRY_RISK {
        debug!(
            token = leg.token,
            %stop,
            price = %last_price,
            "premium at risk over the cap, skipping entry"
        );
        return None;
    }
    let Some(atr) = atr else {
        debug!(token = leg.token, "underlying ATR unavailable, skipping entry");
        return None;
    };

    Some(EntryPlan {
        token: leg.token,
        symbol: leg.symbol.clone(),
        side,
        order_side: OrderSide::Buy,
        quantity,
        last_price,
        entry_candle: Some(candle.clone()),
        stop_price: Some(stop),
        target_price: Some((low + atr).round_dp(2)),
    })
}

/// The margin guard: available cash plus a little slack must cover the
/// order's premium.
#[must_use]
pub fn margin_covers(available: Decimal, quantity: u32, last_price: Decimal) -> bool {
    available + MARGIN_SLACK > Decimal::from(quantity) * last_price
}
