//! Per-underlying aggregate: candle series, indicators, trend and the
//! once-per-bucket signal derivation.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use opt_trade_core::{
    session, BrokerGateway, Candle, EngineConfig, InstrumentRow, LatestQuote, SecurityConfig,
    Signal, TimeBucket, TrendDirection,
};
use opt_trade_data::{AnalysisSnapshotRecord, DatabaseClient};
use opt_trade_signals::{OiMomentumAnalyser, OiMomentumSnapshot};
use opt_trade_strike_selector::{StrikeSelector, StrikeWindow};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::indicators::IndicatorSeries;
use crate::patterns;
use crate::policy::{self, PolicyInputs};
use crate::trend::TrendState;

/// Bars pulled from storage on startup; enough to seed the 200-bar average.
const HISTORY_BARS: i64 = 500;
/// Candles the pattern predicates look at.
const PATTERN_TAIL: usize = 4;

/// What the last completed derivation saw. The order manager re-reads these
/// numbers when it checks whether an open position's premise still holds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisView {
    pub bucket: TimeBucket,
    pub trend: TrendDirection,
    pub is_bullish: bool,
    pub is_bearish: bool,
    pub pcr_nearest: f64,
    pub pcr_next: f64,
}

/// One tracked underlying and everything derived from its market data.
pub struct InstrumentState {
    security: SecurityConfig,
    db: Arc<DatabaseClient>,
    analyser: OiMomentumAnalyser,
    selector: StrikeSelector,
    window: Option<StrikeWindow>,
    candles: Vec<Candle>,
    indicators: IndicatorSeries,
    trend: TrendState,
    refreshed_till: Option<NaiveDateTime>,
    last_signal: Option<Signal>,
    analysis: Option<AnalysisView>,
}

impl InstrumentState {
    #[must_use]
    pub fn new(
        security: SecurityConfig,
        db: Arc<DatabaseClient>,
        instruments: &[InstrumentRow],
    ) -> Self {
        let analyser = OiMomentumAnalyser::new(Arc::clone(&db));
        let selector = StrikeSelector::new(security.clone(), instruments);
        Self {
            security,
            db,
            analyser,
            selector,
            window: None,
            candles: Vec::new(),
            indicators: IndicatorSeries::default(),
            trend: TrendState::new(),
            refreshed_till: None,
            last_signal: None,
            analysis: None,
        }
    }

    #[must_use]
    pub fn token(&self) -> i64 {
        self.security.token
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.security.symbol
    }

    #[must_use]
    pub const fn security(&self) -> &SecurityConfig {
        &self.security
    }

    /// The most recently resolved strike window, if any.
    #[must_use]
    pub const fn window(&self) -> Option<&StrikeWindow> {
        self.window.as_ref()
    }

    #[must_use]
    pub const fn analysis(&self) -> Option<&AnalysisView> {
        self.analysis.as_ref()
    }

    /// Latest smoothed range of the underlying, used to size leg targets.
    #[must_use]
    pub fn latest_atr(&self) -> Option<Decimal> {
        self.indicators.latest_atr()
    }

    /// Seeds the candle series from storage. Called once on startup.
    ///
    /// # Errors
    /// Returns an error if the history query fails.
    pub async fn load_history(&mut self) -> Result<()> {
        self.candles = self.db.recent_candles(self.security.token, HISTORY_BARS).await?;
        self.indicators = IndicatorSeries::compute(&self.candles);
        self.trend.update(&self.candles);
        info!(
            underlying = %self.security.symbol,
            bars = self.candles.len(),
            "candle history loaded"
        );
        Ok(())
    }

    /// Brings the day's bars up to the last completed 5-minute boundary.
    ///
    /// The whole day is re-read each time: stored rows satisfy the fetch
    /// when complete, otherwise the brokerage API is asked for the full
    /// session so far and the stored rows are replaced. A fetch that comes
    /// back with the wrong bar count is dropped and retried next cycle.
    ///
    /// # Errors
    /// Returns an error if storage or the brokerage API fails.
    pub async fn refresh(
        &mut self,
        broker: &dyn BrokerGateway,
        now_local: NaiveDateTime,
    ) -> Result<()> {
        let today = now_local.date();
        let open = session::market_open(today);
        let now = now_local.min(session::market_close(today));

        let refreshed_till = *self.refreshed_till.get_or_insert(open);
        if now <= refreshed_till || now - refreshed_till <= Duration::minutes(5) {
            return Ok(());
        }

        let Some((candle_count, to)) = day_span(open, now) else {
            return Ok(());
        };

        let Some(bars) = self.day_bars(broker, open, to, candle_count).await? else {
            return Ok(());
        };

        let threshold = TimeBucket::from_local(open);
        self.candles.retain(|candle| candle.bucket < threshold);
        self.candles.extend(bars);
        self.indicators = IndicatorSeries::compute(&self.candles);
        self.refreshed_till = Some(to);
        debug!(
            underlying = %self.security.symbol,
            bars = candle_count,
            till = %to,
            "candles refreshed"
        );
        Ok(())
    }

    /// The day's completed bars in `[open, to)`, from storage when complete,
    /// otherwise from the brokerage API. `None` means the fetch was short
    /// and the caller should retry next cycle.
    async fn day_bars(
        &self,
        broker: &dyn BrokerGateway,
        open: NaiveDateTime,
        to: NaiveDateTime,
        candle_count: i64,
    ) -> Result<Option<Vec<Candle>>> {
        let first = TimeBucket::from_local(open);
        let last = TimeBucket::from_local(to - Duration::minutes(5));
        let stored = self
            .db
            .query_candles(self.security.token, first, last)
            .await?;
        if stored.len() as i64 == candle_count {
            return Ok(Some(stored));
        }

        let mut fetched = broker
            .historical_candles(self.security.token, open, to)
            .await?;
        // The API may tack on the in-progress bar; only completed bars count.
        let cutoff = TimeBucket::from_local(to);
        fetched.retain(|candle| candle.bucket < cutoff);
        if fetched.len() as i64 != candle_count {
            debug!(
                underlying = %self.security.symbol,
                got = fetched.len(),
                expected = candle_count,
                "short day fetch, skipping this refresh"
            );
            return Ok(None);
        }

        self.db.delete_candles_from(self.security.token, first).await?;
        self.db.insert_candles(&fetched).await?;
        Ok(Some(fetched))
    }

    /// Folds the refreshed series into the swing trend.
    pub fn update_trend(&mut self) {
        self.trend.update(&self.candles);
    }

    /// Resolves the strike window for the current price and remembers it,
    /// so the feed can subscribe leg tokens before any signal exists.
    ///
    /// # Errors
    /// Returns an error when a bracketing strike has no tradable leg.
    pub fn resolve_window(
        &mut self,
        last_price: Decimal,
        now: DateTime<Utc>,
        extra_strikes: u32,
    ) -> Result<StrikeWindow> {
        let today = now.with_timezone(&session::EXCHANGE_TZ).date_naive();
        let window = self.selector.resolve(last_price, today, extra_strikes)?;
        self.window = Some(window.clone());
        Ok(window)
    }

    /// Derives at most one signal for the last completed bar's bucket.
    ///
    /// Returns `Some` only when this call claimed the bucket; `None` when
    /// the bucket was already claimed or an input is missing. Missing
    /// inputs (no fresh quote, no momentum snapshot yet) leave the bucket
    /// unclaimed so the next cycle retries it.
    ///
    /// # Errors
    /// Returns an error if strike resolution, history queries or snapshot
    /// persistence fail.
    pub async fn derive_signal(
        &mut self,
        engine: &EngineConfig,
        quote: Option<&LatestQuote>,
        now: DateTime<Utc>,
    ) -> Result<Option<Signal>> {
        let Some(last) = self.candles.last() else {
            return Ok(None);
        };
        let bucket = last.bucket;
        if self
            .last_signal
            .as_ref()
            .is_some_and(|signal| signal.bucket == bucket)
        {
            return Ok(None);
        }

        let Some(quote) = quote.filter(|quote| quote.is_fresh(now)) else {
            debug!(underlying = %self.security.symbol, "no fresh quote, holding derivation");
            return Ok(None);
        };
        let last_price = quote.tick.last_price;
        let close = last.close;

        let window = self.resolve_window(last_price, now, engine.extra_strikes)?;
        let Some(snapshot) = self.analyser.trend(&window, now).await? else {
            return Ok(None);
        };

        let tail = &self.candles[self.candles.len().saturating_sub(PATTERN_TAIL)..];
        let is_bullish = patterns::is_bullish_pattern(tail);
        let is_bearish = patterns::is_bearish_pattern(tail);
        let inputs = PolicyInputs {
            window: &window,
            snapshot: &snapshot,
            last_price,
            trend: self.trend.direction(),
            is_bullish,
            is_bearish,
            is_buyable: patterns::is_buyable_candle(tail),
            is_sellable: patterns::is_sellable_candle(tail),
            selling_enabled: engine.selling_enabled,
        };
        let action = policy::decide(&inputs);
        let (ce_token, pe_token) = policy::chosen_tokens(action, &window, &snapshot);

        self.persist_snapshot(&window, &snapshot, close, is_bullish, is_bearish, bucket, ce_token, pe_token, now)
            .await?;

        let signal = Signal {
            bucket,
            action,
            chosen_ce_token: ce_token,
            chosen_pe_token: pe_token,
        };
        if action.is_entry() {
            info!(
                underlying = %self.security.symbol,
                bucket = %bucket,
                action = ?action,
                pcr_nearest = inputs.snapshot.pcr(window.nearest),
                "entry signal"
            );
        } else {
            debug!(underlying = %self.security.symbol, bucket = %bucket, "no trade this bucket");
        }

        self.analysis = Some(AnalysisView {
            bucket,
            trend: self.trend.direction(),
            is_bullish,
            is_bearish,
            pcr_nearest: snapshot.pcr(window.nearest),
            pcr_next: snapshot.pcr(window.next),
        });
        self.last_signal = Some(signal.clone());
        Ok(Some(signal))
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_snapshot(
        &self,
        window: &StrikeWindow,
        snapshot: &OiMomentumSnapshot,
        close: Decimal,
        is_bullish: bool,
        is_bearish: bool,
        bucket: TimeBucket,
        ce_token: Option<i64>,
        pe_token: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self
            .db
            .has_analysis_snapshot(self.security.token, bucket)
            .await?
        {
            return Ok(());
        }

        let beta = match (ce_token, pe_token) {
            (Some(ce), Some(pe)) => {
                self.analyser
                    .beta(self.security.token, ce, pe, now)
                    .await?
            }
            _ => None,
        };

        let record = AnalysisSnapshotRecord {
            token: self.security.token,
            bucket: bucket.as_i64(),
            ts: now,
            close,
            sma_20: self.indicators.latest_sma_20(),
            is_bullish,
            is_bearish,
            ce_token,
            pe_token,
            ce_pcr: Some(snapshot.pcr(window.nearest)),
            pe_pcr: Some(snapshot.pcr(window.next)),
            ce_beta: beta.map(|pair| pair.ce_beta),
            pe_beta: beta.map(|pair| pair.pe_beta),
            quantity: self.security.quantity as i32,
        };
        self.db.insert_analysis_snapshot(&record).await
    }
}

/// Completed-bar count since `open` and the boundary they run up to.
/// `None` while the first bar of the day is still forming.
fn day_span(open: NaiveDateTime, now: NaiveDateTime) -> Option<(i64, NaiveDateTime)> {
    let count = (now - open).num_minutes() / 5;
    if count < 1 {
        return None;
    }
    Some((count, open + Duration::minutes(count * 5)))
}
