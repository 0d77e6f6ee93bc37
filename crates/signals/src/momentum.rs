//! Open-interest momentum metrics computed from persisted tick history.
//!
//! The analyser reads the session's tick rows back out of Postgres rather
//! than keeping its own in-memory series, so a process restart mid-session
//! loses nothing.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use opt_trade_core::{session, OiTrend, OptionSide};
use opt_trade_data::{DatabaseClient, OiRow, PricePoint};
use opt_trade_strike_selector::StrikeWindow;
use rust_decimal::prelude::ToPrimitive;
use tracing::debug;

/// Below this many raw session rows the sample is too thin to classify.
const MIN_HISTORY_ROWS: usize = 200;
/// Smoothing window applied to each leg's OI series before classification.
const ROLLING_WINDOW: usize = 7;
/// Percent change separating Increasing/Decreasing from Stable.
const TREND_CUTOFF_PCT: f64 = 0.4;
/// Joined rows needed before the leg-vs-underlying regression runs.
const MIN_BETA_ROWS: usize = 50;

/// Latest open interest of one leg plus its smoothed-trend classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegOiReading {
    pub open_interest: i64,
    pub trend: OiTrend,
    /// Percent change between the last two smoothed points.
    pub change_pct: f64,
}

impl LegOiReading {
    /// Whether the leg's OI is building beyond the cutoff.
    #[must_use]
    pub fn is_building(&self) -> bool {
        self.trend == OiTrend::Increasing && self.change_pct > TREND_CUTOFF_PCT
    }
}

/// Per-leg OI trend, per-strike PCR, and the max-OI wall on each side for
/// one strike window.
#[derive(Debug, Clone, Default)]
pub struct OiMomentumSnapshot {
    readings: HashMap<(i64, OptionSide), LegOiReading>,
    pcr: HashMap<i64, f64>,
    max_ce_strike: Option<i64>,
    max_pe_strike: Option<i64>,
}

impl OiMomentumSnapshot {
    /// Assembles a snapshot from per-leg readings, deriving the per-strike
    /// PCR and the max-OI wall on each side.
    #[must_use]
    pub fn from_readings(
        readings: HashMap<(i64, OptionSide), LegOiReading>,
        strikes: &[i64],
    ) -> Self {
        let mut snapshot = Self {
            readings,
            ..Self::default()
        };
        for &strike in strikes {
            let call_oi = snapshot.oi(strike, OptionSide::Call);
            let put_oi = snapshot.oi(strike, OptionSide::Put);
            let pcr = if call_oi == 0 {
                0.0
            } else {
                put_oi as f64 / call_oi as f64
            };
            snapshot.pcr.insert(strike, pcr);
        }
        snapshot.max_ce_strike = max_oi_strike(&snapshot, strikes, OptionSide::Call);
        snapshot.max_pe_strike = max_oi_strike(&snapshot, strikes, OptionSide::Put);
        snapshot
    }

    #[must_use]
    pub fn reading(&self, strike: i64, side: OptionSide) -> Option<&LegOiReading> {
        self.readings.get(&(strike, side))
    }

    /// Latest open interest for a leg, 0 when the leg never ticked.
    #[must_use]
    pub fn oi(&self, strike: i64, side: OptionSide) -> i64 {
        self.readings
            .get(&(strike, side))
            .map_or(0, |reading| reading.open_interest)
    }

    /// Put OI / call OI at `strike`, 0 when the call side carries none.
    #[must_use]
    pub fn pcr(&self, strike: i64) -> f64 {
        self.pcr.get(&strike).copied().unwrap_or(0.0)
    }

    /// Whether the leg's OI trend is Increasing beyond the cutoff.
    #[must_use]
    pub fn oi_building(&self, strike: i64, side: OptionSide) -> bool {
        self.readings
            .get(&(strike, side))
            .is_some_and(LegOiReading::is_building)
    }

    /// Strike carrying the largest open interest on `side`, if any leg of
    /// that side has ticked this session.
    #[must_use]
    pub fn max_oi_strike(&self, side: OptionSide) -> Option<i64> {
        match side {
            OptionSide::Call => self.max_ce_strike,
            OptionSide::Put => self.max_pe_strike,
        }
    }
}

/// Regression slopes of each leg's tick returns against the underlying's.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BetaPair {
    pub ce_beta: f64,
    pub pe_beta: f64,
}

/// Computes PCR, OI trend, and beta from the tick history store.
pub struct OiMomentumAnalyser {
    db: Arc<DatabaseClient>,
}

impl OiMomentumAnalyser {
    #[must_use]
    pub fn new(db: Arc<DatabaseClient>) -> Self {
        Self { db }
    }

    /// Classifies OI momentum for every leg of `window` using rows from
    /// session open to `as_of`. Returns `None` while the session has fewer
    /// than 200 raw rows for the window.
    ///
    /// # Errors
    /// Returns an error if the history query fails.
    pub async fn trend(
        &self,
        window: &StrikeWindow,
        as_of: DateTime<Utc>,
    ) -> Result<Option<OiMomentumSnapshot>> {
        let tokens = window.tokens();
        if tokens.is_empty() {
            return Ok(None);
        }
        let session_date = as_of.with_timezone(&session::EXCHANGE_TZ).date_naive();
        let from = session::market_open_utc(session_date);
        let rows = self.db.oi_history(&tokens, from, as_of).await?;

        if rows.len() < MIN_HISTORY_ROWS {
            debug!(
                underlying = %window.underlying,
                rows = rows.len(),
                "open-interest history too thin to classify"
            );
            return Ok(None);
        }
        Ok(Some(snapshot_from_rows(window, &rows)))
    }

    /// Regresses each leg's tick-to-tick returns against the underlying's.
    /// Returns `None` below 50 joined rows or when the underlying's return
    /// variance is degenerate.
    ///
    /// # Errors
    /// Returns an error if any price-series query fails.
    pub async fn beta(
        &self,
        underlying_token: i64,
        ce_token: i64,
        pe_token: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Option<BetaPair>> {
        let session_date = as_of.with_timezone(&session::EXCHANGE_TZ).date_naive();
        let from = session::market_open_utc(session_date);

        let underlying = self.db.price_series(underlying_token, from, as_of).await?;
        let ce = self.db.price_series(ce_token, from, as_of).await?;
        let pe = self.db.price_series(pe_token, from, as_of).await?;

        Ok(compute_beta(&underlying, &ce, &pe))
    }
}

fn snapshot_from_rows(window: &StrikeWindow, rows: &[OiRow]) -> OiMomentumSnapshot {
    // Rows arrive timestamp-ordered, so each per-token series is already
    // in session order.
    let mut series: HashMap<i64, Vec<i64>> = HashMap::new();
    for row in rows {
        series.entry(row.token).or_default().push(row.open_interest);
    }

    let mut readings = HashMap::new();
    for side in [OptionSide::Call, OptionSide::Put] {
        for (strike, leg) in window.legs_of(side) {
            let Some(oi_series) = series.get(&leg.token) else {
                continue;
            };
            let Some(&open_interest) = oi_series.last() else {
                continue;
            };
            let (trend, change_pct) = classify(oi_series);
            readings.insert(
                (strike, side),
                LegOiReading {
                    open_interest,
                    trend,
                    change_pct,
                },
            );
        }
    }

    OiMomentumSnapshot::from_readings(readings, &window.strikes)
}

fn max_oi_strike(
    snapshot: &OiMomentumSnapshot,
    strikes: &[i64],
    side: OptionSide,
) -> Option<i64> {
    let mut best: Option<(i64, i64)> = None;
    for &strike in strikes {
        let Some(reading) = snapshot.reading(strike, side) else {
            continue;
        };
        // Strictly greater, so the lowest strike wins an exact tie.
        if best.is_none_or(|(_, oi)| reading.open_interest > oi) {
            best = Some((strike, reading.open_interest));
        }
    }
    best.map(|(strike, _)| strike)
}

/// Trend of one leg's session OI series.
///
/// Consecutive duplicates are collapsed first; an unchanged series cannot
/// have a trend. The survivors are smoothed with a short rolling mean and
/// the last two smoothed points decide the label.
fn classify(raw: &[i64]) -> (OiTrend, f64) {
    let distinct = dedup_consecutive(raw);
    if distinct.len() < 2 {
        return (OiTrend::Stable, 0.0);
    }

    let smoothed = rolling_mean(&distinct, ROLLING_WINDOW);
    let last = smoothed[smoothed.len() - 1];
    let previous = smoothed[smoothed.len() - 2];
    let change_pct = (last - previous) / previous * 100.0;

    let trend = if change_pct > TREND_CUTOFF_PCT {
        OiTrend::Increasing
    } else if change_pct < -TREND_CUTOFF_PCT {
        OiTrend::Decreasing
    } else {
        // NaN from a zero baseline lands here as well.
        OiTrend::Stable
    };
    (trend, change_pct)
}

fn dedup_consecutive(values: &[i64]) -> Vec<i64> {
    let mut out: Vec<i64> = Vec::with_capacity(values.len());
    for &value in values {
        if out.last() != Some(&value) {
            out.push(value);
        }
    }
    out
}

/// Rolling mean over a trailing window, emitting a point from the first
/// element onward (partial windows use what exists so far).
fn rolling_mean(values: &[i64], window: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    for end in 0..values.len() {
        let start = end.saturating_sub(window - 1);
        let slice = &values[start..=end];
        let sum: i64 = slice.iter().sum();
        out.push(sum as f64 / slice.len() as f64);
    }
    out
}

fn compute_beta(
    underlying: &[PricePoint],
    ce: &[PricePoint],
    pe: &[PricePoint],
) -> Option<BetaPair> {
    let ce_by_ts = price_by_ts(ce);
    let pe_by_ts = price_by_ts(pe);

    // Inner join on the exchange timestamp; `(token, ts)` uniqueness in the
    // store means each joined row is already distinct.
    let mut joined: Vec<(f64, f64, f64)> = Vec::new();
    for point in underlying {
        let (Some(&ce_price), Some(&pe_price)) = (ce_by_ts.get(&point.ts), pe_by_ts.get(&point.ts))
        else {
            continue;
        };
        let Some(underlying_price) = point.last_price.to_f64() else {
            continue;
        };
        joined.push((underlying_price, ce_price, pe_price));
    }

    if joined.len() < MIN_BETA_ROWS {
        return None;
    }

    let underlying_returns = pct_returns(joined.iter().map(|row| row.0));
    let ce_returns = pct_returns(joined.iter().map(|row| row.1));
    let pe_returns = pct_returns(joined.iter().map(|row| row.2));

    let var = variance(&underlying_returns);
    if !var.is_finite() || var == 0.0 {
        return None;
    }

    let ce_beta = covariance(&ce_returns, &underlying_returns) / var;
    let pe_beta = covariance(&pe_returns, &underlying_returns) / var;
    if !ce_beta.is_finite() || !pe_beta.is_finite() {
        return None;
    }
    Some(BetaPair { ce_beta, pe_beta })
}

fn price_by_ts(points: &[PricePoint]) -> HashMap<DateTime<Utc>, f64> {
    points
        .iter()
        .filter_map(|point| point.last_price.to_f64().map(|price| (point.ts, price)))
        .collect()
}

fn pct_returns(prices: impl Iterator<Item = f64>) -> Vec<f64> {
    let prices: Vec<f64> = prices.collect();
    prices
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) / pair[0])
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn covariance(xs: &[f64], ys: &[f64]) -> f64 {
    let x_mean = mean(xs);
    let y_mean = mean(ys);
    let sum: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (x - x_mean) * (y - y_mean))
        .sum();
    sum / (xs.len() as f64 - 1.0)
}

fn variance(values: &[f64]) -> f64 {
    covariance(values, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use opt_trade_strike_selector::OptionLeg;
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;

    #[test]
    fn dedup_collapses_runs_only() {
        assert_eq!(
            dedup_consecutive(&[5, 5, 7, 7, 7, 5]),
            vec![5, 7, 5],
            "non-adjacent repeats must survive"
        );
        assert!(dedup_consecutive(&[]).is_empty());
    }

    #[test]
    fn rolling_mean_uses_partial_windows() {
        assert_eq!(rolling_mean(&[2, 4, 6], 7), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn constant_series_is_stable() {
        let (trend, change) = classify(&[1_000, 1_000, 1_000]);
        assert_eq!(trend, OiTrend::Stable);
        assert!((change - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn steep_build_classifies_increasing() {
        // Each reading 5% above the last keeps the smoothed change well
        // past the 0.4% cutoff.
        let series: Vec<i64> = (0..12).map(|i| (1_000.0 * 1.05_f64.powi(i)) as i64).collect();
        let (trend, change) = classify(&series);
        assert_eq!(trend, OiTrend::Increasing);
        assert!(change > TREND_CUTOFF_PCT);
    }

    #[test]
    fn steep_unwind_classifies_decreasing() {
        let series: Vec<i64> = (0..12)
            .map(|i| (1_000_000.0 * 0.95_f64.powi(i)) as i64)
            .collect();
        let (trend, change) = classify(&series);
        assert_eq!(trend, OiTrend::Decreasing);
        assert!(change < -TREND_CUTOFF_PCT);
    }

    #[test]
    fn small_drift_stays_stable() {
        // 0.01% per reading smooths to far under the cutoff.
        let series: Vec<i64> = (0..12).map(|i| 1_000_000 + i * 100).collect();
        let (trend, _) = classify(&series);
        assert_eq!(trend, OiTrend::Stable);
    }

    #[test]
    fn single_distinct_reading_cannot_trend() {
        let (trend, change) = classify(&[42; 50]);
        assert_eq!(trend, OiTrend::Stable);
        assert!((change - 0.0).abs() < f64::EPSILON);
    }

    fn window_fixture() -> StrikeWindow {
        let mut legs = HashMap::new();
        let mut token = 100;
        for strike in [22_300_i64, 22_350, 22_400, 22_450] {
            for side in [OptionSide::Call, OptionSide::Put] {
                legs.insert(
                    (strike, side),
                    OptionLeg {
                        token,
                        symbol: format!("NIFTY2532{strike}{}", side.suffix()),
                    },
                );
                token += 1;
            }
        }
        StrikeWindow::from_legs("NIFTY", 22_400, 50, legs)
    }

    fn oi_rows(window: &StrikeWindow, oi_of: impl Fn(i64, OptionSide) -> i64) -> Vec<OiRow> {
        let base = Utc.with_ymd_and_hms(2025, 3, 17, 4, 0, 0).unwrap();
        let mut rows = Vec::new();
        for second in 0..30_i64 {
            for side in [OptionSide::Call, OptionSide::Put] {
                for (strike, leg) in window.legs_of(side) {
                    rows.push(OiRow {
                        token: leg.token,
                        ts: base + Duration::seconds(second),
                        open_interest: oi_of(strike, side) + second,
                    });
                }
            }
        }
        rows.sort_by_key(|row| row.ts);
        rows
    }

    #[test]
    fn snapshot_reports_pcr_and_walls() {
        let window = window_fixture();
        let rows = oi_rows(&window, |strike, side| match (strike, side) {
            (22_400, OptionSide::Put) => 8_100_000,
            (22_400, OptionSide::Call) => 4_500_000,
            (22_450, OptionSide::Call) => 6_000_000,
            (_, OptionSide::Call) => 2_000_000,
            (_, OptionSide::Put) => 3_000_000,
        });

        let snapshot = snapshot_from_rows(&window, &rows);
        let pcr = snapshot.pcr(22_400);
        assert!((pcr - 8_100_029.0 / 4_500_029.0).abs() < 1e-9);
        assert_eq!(snapshot.max_oi_strike(OptionSide::Put), Some(22_400));
        assert_eq!(snapshot.max_oi_strike(OptionSide::Call), Some(22_450));
        assert_eq!(snapshot.oi(22_450, OptionSide::Call), 6_000_029);
    }

    #[test]
    fn pcr_is_zero_when_call_side_is_empty() {
        let window = window_fixture();
        let rows = oi_rows(&window, |strike, side| match (strike, side) {
            (22_300, OptionSide::Call) => 0,
            _ => 1_000_000,
        });
        // Drop the CE rows entirely so the call side never ticked.
        let ce_token = window.token(22_300, OptionSide::Call).unwrap();
        let rows: Vec<OiRow> = rows.into_iter().filter(|row| row.token != ce_token).collect();

        let snapshot = snapshot_from_rows(&window, &rows);
        assert!((snapshot.pcr(22_300) - 0.0).abs() < f64::EPSILON);
        assert!(snapshot.reading(22_300, OptionSide::Call).is_none());
    }

    #[test]
    fn building_requires_increasing_past_cutoff() {
        let reading = LegOiReading {
            open_interest: 8_000_000,
            trend: OiTrend::Increasing,
            change_pct: 0.6,
        };
        assert!(reading.is_building());

        let flat = LegOiReading {
            open_interest: 8_000_000,
            trend: OiTrend::Stable,
            change_pct: 0.1,
        };
        assert!(!flat.is_building());
    }

    fn points(prices: &[f64]) -> Vec<PricePoint> {
        let base = Utc.with_ymd_and_hms(2025, 3, 17, 4, 0, 0).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, &price)| PricePoint {
                ts: base + Duration::seconds(i as i64),
                last_price: Decimal::from_f64(price).unwrap(),
            })
            .collect()
    }

    #[test]
    fn beta_recovers_a_doubled_return_series() {
        // The call leg moves at twice the underlying's return every tick,
        // the put at half, so the slopes are exactly 2 and 0.5.
        let mut underlying = vec![100.0_f64];
        let mut ce = vec![200.0_f64];
        let mut pe = vec![150.0_f64];
        for i in 0..60 {
            let step = if i % 2 == 0 { 0.01 } else { -0.004 };
            let last_u = *underlying.last().unwrap();
            let last_c = *ce.last().unwrap();
            let last_p = *pe.last().unwrap();
            underlying.push(last_u * (1.0 + step));
            ce.push(last_c * (1.0 + 2.0 * step));
            pe.push(last_p * (1.0 + 0.5 * step));
        }

        let pair = compute_beta(&points(&underlying), &points(&ce), &points(&pe)).unwrap();
        assert!((pair.ce_beta - 2.0).abs() < 1e-6, "ce_beta={}", pair.ce_beta);
        assert!((pair.pe_beta - 0.5).abs() < 1e-6, "pe_beta={}", pair.pe_beta);
    }

    #[test]
    fn beta_needs_fifty_joined_rows() {
        let prices: Vec<f64> = (0..40).map(|i| 100.0 + f64::from(i)).collect();
        assert!(compute_beta(&points(&prices), &points(&prices), &points(&prices)).is_none());
    }

    #[test]
    fn beta_rejects_flat_underlying() {
        let flat = vec![100.0_f64; 60];
        let moving: Vec<f64> = (0..60).map(|i| 200.0 + f64::from(i)).collect();
        assert!(compute_beta(&points(&flat), &points(&moving), &points(&moving)).is_none());
    }
}
