//! Rolling indicators recomputed over the full 5-minute candle series after
//! every refresh.
//!
//! Values are rounded to two decimal places as they are produced, and the
//! smoothed ATR feeds the rounded value back into the next step. Rounding at
//! each step, not once at the end, keeps the series identical to what an
//! analyst sees in the persisted snapshots.

use opt_trade_core::Candle;
use rust_decimal::Decimal;

/// Simple-moving-average window over closes, fast.
const SMA_FAST: usize = 20;
/// Simple-moving-average window over closes, slow.
const SMA_SLOW: usize = 200;
/// Window for the high/low edge averages.
const SMA_EDGE: usize = 9;
/// Wilder smoothing period for the average true range.
const ATR_PERIOD: usize = 14;

/// Per-bar indicator values, index-aligned with the candle series that
/// produced them. Entries are `None` until the window fills.
#[derive(Debug, Clone, Default)]
pub struct IndicatorSeries {
    pub sma_20: Vec<Option<Decimal>>,
    pub sma_200: Vec<Option<Decimal>>,
    pub sma_9_high: Vec<Option<Decimal>>,
    pub sma_9_low: Vec<Option<Decimal>>,
    pub atr: Vec<Option<Decimal>>,
}

impl IndicatorSeries {
    /// Recomputes every indicator over the whole series.
    #[must_use]
    pub fn compute(candles: &[Candle]) -> Self {
        Self {
            sma_20: sma(candles, SMA_FAST, |c| c.close),
            sma_200: sma(candles, SMA_SLOW, |c| c.close),
            sma_9_high: sma(candles, SMA_EDGE, |c| c.high),
            sma_9_low: sma(candles, SMA_EDGE, |c| c.low),
            atr: atr(candles, ATR_PERIOD),
        }
    }

    #[must_use]
    pub fn latest_sma_20(&self) -> Option<Decimal> {
        self.sma_20.last().copied().flatten()
    }

    #[must_use]
    pub fn latest_sma_200(&self) -> Option<Decimal> {
        self.sma_200.last().copied().flatten()
    }

    #[must_use]
    pub fn latest_atr(&self) -> Option<Decimal> {
        self.atr.last().copied().flatten()
    }
}

/// Full-window rolling mean of one candle field, rounded to 2 decimal
/// places. The first `window - 1` entries stay `None`.
fn sma<F>(candles: &[Candle], window: usize, field: F) -> Vec<Option<Decimal>>
where
    F: Fn(&Candle) -> Decimal,
{
    let mut out = vec![None; candles.len()];
    if window == 0 || candles.len() < window {
        return out;
    }

    let divisor = Decimal::from(window);
    let mut sum = Decimal::ZERO;
    for (i, candle) in candles.iter().enumerate() {
        sum += field(candle);
        if i >= window {
            sum -= field(&candles[i - window]);
        }
        if i + 1 >= window {
            out[i] = Some((sum / divisor).round_dp(2));
        }
    }
    out
}

/// Average true range with Wilder smoothing.
///
/// The true range of the first bar is its high-low span; later bars take the
/// widest of span, high-to-previous-close and low-to-previous-close. The
/// smoothed series seeds with the plain mean of the first `period` ranges
/// and is rounded to 2 decimal places at every step.
fn atr(candles: &[Candle], period: usize) -> Vec<Option<Decimal>> {
    let mut out = vec![None; candles.len()];
    if period == 0 || candles.len() < period {
        return out;
    }

    let mut ranges = Vec::with_capacity(candles.len());
    for (i, candle) in candles.iter().enumerate() {
        let span = candle.high - candle.low;
        let value = if i == 0 {
            span
        } else {
            let prev_close = candles[i - 1].close;
            span.max((candle.high - prev_close).abs())
                .max((candle.low - prev_close).abs())
        };
        ranges.push(value);
    }

    let divisor = Decimal::from(period);
    let seed: Decimal = ranges.iter().take(period).copied().sum();
    let mut current = (seed / divisor).round_dp(2);
    out[period - 1] = Some(current);
    for (i, &range) in ranges.iter().enumerate().skip(period) {
        current = ((current * (divisor - Decimal::ONE)) + range) / divisor;
        current = current.round_dp(2);
        out[i] = Some(current);
    }
    out
}
