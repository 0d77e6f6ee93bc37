//! Swing trend direction of an underlying's candle series.
//!
//! Direction is established by the most recent adjacent pair of
//! opposite-colored bars whose newer bar carries a full reversal body. Once
//! established it advances incrementally: in-trend bars extend the tracked
//! swing extreme, an opposite-colored bar with a reversal body flips the
//! direction.

use opt_trade_core::{Candle, TimeBucket, TrendDirection};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// A bar must carry at least this much body to establish or flip the trend.
const MIN_REVERSAL_BODY: Decimal = dec!(10);

#[derive(Debug, Clone)]
pub struct TrendState {
    direction: TrendDirection,
    swing_low: Option<Decimal>,
    swing_high: Option<Decimal>,
    last_bucket: Option<TimeBucket>,
    changed: bool,
}

impl TrendState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            direction: TrendDirection::None,
            swing_low: None,
            swing_high: None,
            last_bucket: None,
            changed: false,
        }
    }

    #[must_use]
    pub const fn direction(&self) -> TrendDirection {
        self.direction
    }

    #[must_use]
    pub const fn swing_low(&self) -> Option<Decimal> {
        self.swing_low
    }

    #[must_use]
    pub const fn swing_high(&self) -> Option<Decimal> {
        self.swing_high
    }

    /// Whether the last `update` established or flipped the direction.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.changed
    }

    /// Folds any bars newer than the last seen bucket into the trend.
    /// Re-running on an unchanged series is a no-op.
    pub fn update(&mut self, candles: &[Candle]) {
        self.changed = false;
        let Some(last) = candles.last() else {
            return;
        };
        if self.last_bucket == Some(last.bucket) {
            return;
        }

        if self.direction.is_established() {
            let seen = self.last_bucket;
            for candle in candles {
                if seen.is_some_and(|bucket| candle.bucket <= bucket) {
                    continue;
                }
                self.advance(candle);
            }
        } else {
            self.establish(candles);
        }
        self.last_bucket = Some(last.bucket);
    }

    /// Backward scan for the most recent qualifying reversal pair, then a
    /// forward replay of whatever follows it.
    fn establish(&mut self, candles: &[Candle]) {
        let mut resume = None;
        for (i, pair) in candles.windows(2).enumerate().rev() {
            let (prev, cur) = (&pair[0], &pair[1]);
            if cur.is_green() == prev.is_green() || cur.body().abs() <= MIN_REVERSAL_BODY {
                continue;
            }
            self.direction = if cur.is_green() {
                TrendDirection::Up
            } else {
                TrendDirection::Down
            };
            self.swing_low = Some(prev.low.min(cur.low));
            self.swing_high = Some(prev.high.max(cur.high));
            self.changed = true;
            resume = Some(i + 2);
            break;
        }
        if let Some(resume) = resume {
            for candle in &candles[resume..] {
                self.advance(candle);
            }
        }
    }

    fn advance(&mut self, candle: &Candle) {
        match self.direction {
            TrendDirection::Up => {
                self.swing_high = Some(match self.swing_high {
                    Some(high) => high.max(candle.high),
                    None => candle.high,
                });
                if !candle.is_green() && candle.body().abs() > MIN_REVERSAL_BODY {
                    self.direction = TrendDirection::Down;
                    self.swing_low = Some(candle.low);
                    self.changed = true;
                }
            }
            TrendDirection::Down => {
                self.swing_low = Some(match self.swing_low {
                    Some(low) => low.min(candle.low),
                    None => candle.low,
                });
                if candle.is_green() && candle.body() > MIN_REVERSAL_BODY {
                    self.direction = TrendDirection::Up;
                    self.swing_high = Some(candle.high);
                    self.changed = true;
                }
            }
            TrendDirection::None => {}
        }
    }
}

impl Default for TrendState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(raw_bucket: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            token: 256_265,
            bucket: TimeBucket::from_raw(raw_bucket),
            ts: Utc::now(),
            open,
            high,
            low,
            close,
        }
    }

    #[test]
    fn starts_unestablished() {
        let mut trend = TrendState::new();
        trend.update(&[]);
        assert_eq!(trend.direction(), TrendDirection::None);
        assert!(!trend.changed());
    }

    #[test]
    fn establishes_up_from_a_reversal_pair() {
        let candles = vec![
            bar(202_503_170_915, dec!(120), dec!(121), dec!(104), dec!(105)),
            bar(202_503_170_920, dec!(105), dec!(118), dec!(103), dec!(117)),
        ];
        let mut trend = TrendState::new();
        trend.update(&candles);

        assert_eq!(trend.direction(), TrendDirection::Up);
        assert_eq!(trend.swing_low(), Some(dec!(103)));
        assert_eq!(trend.swing_high(), Some(dec!(121)));
        assert!(trend.changed());
    }

    #[test]
    fn small_bodies_never_establish() {
        let candles = vec![
            bar(202_503_170_915, dec!(110), dec!(112), dec!(104), dec!(105)),
            bar(202_503_170_920, dec!(105), dec!(110), dec!(104), dec!(109)),
        ];
        let mut trend = TrendState::new();
        trend.update(&candles);
        assert_eq!(trend.direction(), TrendDirection::None);
    }

    #[test]
    fn in_trend_bars_extend_the_swing_without_flagging() {
        let mut candles = vec![
            bar(202_503_170_915, dec!(120), dec!(121), dec!(104), dec!(105)),
            bar(202_503_170_920, dec!(105), dec!(118), dec!(103), dec!(117)),
        ];
        let mut trend = TrendState::new();
        trend.update(&candles);

        candles.push(bar(
            202_503_170_925,
            dec!(117),
            dec!(125),
            dec!(116),
            dec!(122),
        ));
        trend.update(&candles);

        assert_eq!(trend.direction(), TrendDirection::Up);
        assert_eq!(trend.swing_high(), Some(dec!(125)));
        assert!(!trend.changed());
    }

    #[test]
    fn opposite_reversal_body_flips_the_direction() {
        let mut candles = vec![
            bar(202_503_170_915, dec!(120), dec!(121), dec!(104), dec!(105)),
            bar(202_503_170_920, dec!(105), dec!(118), dec!(103), dec!(117)),
        ];
        let mut trend = TrendState::new();
        trend.update(&candles);

        candles.push(bar(
            202_503_170_925,
            dec!(122),
            dec!(126),
            dec!(108),
            dec!(109),
        ));
        trend.update(&candles);

        assert_eq!(trend.direction(), TrendDirection::Down);
        assert_eq!(trend.swing_low(), Some(dec!(108)));
        // The flip bar's high still extended the prior swing.
        assert_eq!(trend.swing_high(), Some(dec!(126)));
        assert!(trend.changed());
    }

    #[test]
    fn establishment_replays_the_tail() {
        // Reversal pair sits two bars back; the tail then flips it again.
        let candles = vec![
            bar(202_503_170_915, dec!(120), dec!(121), dec!(104), dec!(105)),
            bar(202_503_170_920, dec!(105), dec!(118), dec!(103), dec!(117)),
            bar(202_503_170_925, dec!(117), dec!(119), dec!(114), dec!(115)),
            bar(202_503_170_930, dec!(115), dec!(116), dec!(102), dec!(103)),
        ];
        let mut trend = TrendState::new();
        trend.update(&candles);

        assert_eq!(trend.direction(), TrendDirection::Down);
        assert_eq!(trend.swing_low(), Some(dec!(102)));
    }

    #[test]
    fn unchanged_series_is_a_no_op() {
        let candles = vec![
            bar(202_503_170_915, dec!(120), dec!(121), dec!(104), dec!(105)),
            bar(202_503_170_920, dec!(105), dec!(118), dec!(103), dec!(117)),
        ];
        let mut trend = TrendState::new();
        trend.update(&candles);
        assert!(trend.changed());

        trend.update(&candles);
        assert_eq!(trend.direction(), TrendDirection::Up);
        assert!(!trend.changed());
    }
}
