//! Candlestick shape predicates over the tail of a 5-minute candle series.
//!
//! Every predicate judges the most recent bar, with up to two bars of
//! context behind it, and returns `false` when the series is too short.
//! Thresholds are in index points and belong to the trading policy; they
//! are deliberately not configurable.

use opt_trade_core::Candle;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Minimum high-low span for the single-candle rejection shapes.
const MIN_REVERSAL_RANGE: Decimal = dec!(10);
/// The rejection wick must be at least this multiple of the body.
const REJECTION_WICK_RATIO: Decimal = dec!(1.5);

/// Allowed gap between an engulfing open and the previous close.
const ENGULF_GAP_TOLERANCE: Decimal = dec!(5);
/// Minimum body of the engulfing bar.
const MIN_ENGULF_BODY: Decimal = dec!(7);

const MARUBOZU_MIN_BODY: Decimal = dec!(10);
const MARUBOZU_MAX_BODY: Decimal = dec!(25);
/// The wick on the momentum side must stay under 2% of the body.
const MARUBOZU_FLAT_WICK: Decimal = dec!(0.02);
/// The opposite wick may reach half the body.
const MARUBOZU_LOOSE_WICK: Decimal = dec!(0.5);
/// Context bars before a marubozu must be quiet: small body, tight range.
const MARUBOZU_CONTEXT_BODY: Decimal = dec!(5);
const MARUBOZU_CONTEXT_RANGE: Decimal = dec!(20);

/// An entry-quality bar closes near its extreme: the body carries at least
/// this share of the range.
const DOMINANT_BODY_SHARE: Decimal = dec!(0.6);
/// And the wick against the move stays under this share of the range.
const MAX_ADVERSE_WICK_SHARE: Decimal = dec!(0.25);

fn upper_wick(candle: &Candle) -> Decimal {
    candle.high - candle.open.max(candle.close)
}

fn lower_wick(candle: &Candle) -> Decimal {
    candle.open.min(candle.close) - candle.low
}

/// Red bar with a long upper rejection wick and almost no lower wick.
#[must_use]
pub fn is_shooting_star(candles: &[Candle]) -> bool {
    let Some(candle) = candles.last() else {
        return false;
    };
    let body = candle.body().abs();
    candle.close < candle.open
        && candle.range() > MIN_REVERSAL_RANGE
        && upper_wick(candle) >= body * REJECTION_WICK_RATIO
        && lower_wick(candle) <= body
}

/// Green bar with a long lower rejection wick and almost no upper wick.
#[must_use]
pub fn is_hammer(candles: &[Candle]) -> bool {
    let Some(candle) = candles.last() else {
        return false;
    };
    let body = candle.body().abs();
    candle.is_green()
        && candle.range() > MIN_REVERSAL_RANGE
        && lower_wick(candle) >= body * REJECTION_WICK_RATIO
        && upper_wick(candle) <= body
}

/// Red bar whose body swallows the previous green bar, after a green bar
/// with a rising open two bars back.
#[must_use]
pub fn is_bearish_engulfing(candles: &[Candle]) -> bool {
    let n = candles.len();
    if n < 3 {
        return false;
    }
    let (second_back, prev, candle) = (&candles[n - 3], &candles[n - 2], &candles[n - 1]);

    candle.open >= prev.close - ENGULF_GAP_TOLERANCE
        && prev.close > prev.open
        && candle.open > candle.close
        && candle.open - candle.close >= MIN_ENGULF_BODY
        && prev.open > candle.close
        && second_back.close > second_back.open
        && candle.open - candle.close > prev.close - prev.open
        && prev.open > second_back.open
}

/// Green bar whose body swallows the previous red bar, after a red bar
/// with a falling open two bars back.
#[must_use]
pub fn is_bullish_engulfing(candles: &[Candle]) -> bool {
    let n = candles.len();
    if n < 3 {
        return false;
    }
    let (second_back, prev, candle) = (&candles[n - 3], &candles[n - 2], &candles[n - 1]);

    candle.open < prev.close + ENGULF_GAP_TOLERANCE
        && prev.open > prev.close
        && candle.close > candle.open
        && candle.close - candle.open >= MIN_ENGULF_BODY
        && candle.close > prev.open
        && second_back.open > second_back.close
        && candle.close - candle.open > prev.open - prev.close
        && prev.open < second_back.open
}

/// Small red body held entirely inside the previous green body.
#[must_use]
pub fn is_bearish_harami(candles: &[Candle]) -> bool {
    let n = candles.len();
    if n < 2 {
        return false;
    }
    let (prev, candle) = (&candles[n - 2], &candles[n - 1]);

    prev.close > prev.open
        && prev.open <= candle.close
        && candle.close < candle.open
        && candle.open <= prev.close
        && candle.open - candle.close < prev.close - prev.open
}

/// Small green body held entirely inside the previous red body.
#[must_use]
pub fn is_bullish_harami(candles: &[Candle]) -> bool {
    let n = candles.len();
    if n < 2 {
        return false;
    }
    let (prev, candle) = (&candles[n - 2], &candles[n - 1]);

    prev.open > prev.close
        && prev.close <= candle.open
        && candle.open < candle.close
        && candle.close <= prev.open
        && candle.close - candle.open < prev.open - prev.close
}

/// Green full-body bar breaking out of two quiet bars, closing on its high.
#[must_use]
pub fn is_bullish_marubozu(candles: &[Candle]) -> bool {
    let n = candles.len();
    if n < 3 {
        return false;
    }
    let (second_back, prev, candle) = (&candles[n - 3], &candles[n - 2], &candles[n - 1]);
    let body = candle.body().abs();

    lower_wick(candle) <= body * MARUBOZU_LOOSE_WICK
        && upper_wick(candle) <= body * MARUBOZU_FLAT_WICK
        && candle.is_green()
        && body > MARUBOZU_MIN_BODY
        && body < MARUBOZU_MAX_BODY
        && is_quiet_context(prev)
        && is_quiet_context(second_back)
}

/// Red full-body bar breaking out of two quiet bars, closing on its low.
#[must_use]
pub fn is_bearish_marubozu(candles: &[Candle]) -> bool {
    let n = candles.len();
    if n < 3 {
        return false;
    }
    let (second_back, prev, candle) = (&candles[n - 3], &candles[n - 2], &candles[n - 1]);
    let body = candle.body().abs();

    lower_wick(candle) <= body * MARUBOZU_FLAT_WICK
        && upper_wick(candle) <= body * MARUBOZU_LOOSE_WICK
        && candle.close < candle.open
        && body > MARUBOZU_MIN_BODY
        && body < MARUBOZU_MAX_BODY
        && is_quiet_context(prev)
        && is_quiet_context(second_back)
}

fn is_quiet_context(candle: &Candle) -> bool {
    candle.body().abs() < MARUBOZU_CONTEXT_BODY && candle.range() < MARUBOZU_CONTEXT_RANGE
}

/// Any of the bullish reversal shapes. Haramis signal indecision rather
/// than reversal, so they stay out of the composite.
#[must_use]
pub fn is_bullish_pattern(candles: &[Candle]) -> bool {
    is_hammer(candles) || is_bullish_engulfing(candles) || is_bullish_marubozu(candles)
}

/// Any of the bearish reversal shapes.
#[must_use]
pub fn is_bearish_pattern(candles: &[Candle]) -> bool {
    is_shooting_star(candles) || is_bearish_engulfing(candles) || is_bearish_marubozu(candles)
}

/// Green bar clean enough to buy into: dominant body, small upper wick.
#[must_use]
pub fn is_buyable_candle(candles: &[Candle]) -> bool {
    let Some(candle) = candles.last() else {
        return false;
    };
    let range = candle.range();
    candle.is_green()
        && candle.body() >= range * DOMINANT_BODY_SHARE
        && candle.high - candle.close <= range * MAX_ADVERSE_WICK_SHARE
}

/// Red bar clean enough to sell into: dominant body, small lower wick.
#[must_use]
pub fn is_sellable_candle(candles: &[Candle]) -> bool {
    let Some(candle) = candles.last() else {
        return false;
    };
    let range = candle.range();
    candle.close < candle.open
        && candle.body().abs() >= range * DOMINANT_BODY_SHARE
        && candle.close - candle.low <= range * MAX_ADVERSE_WICK_SHARE
}
