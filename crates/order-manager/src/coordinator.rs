//! One owner for every tracked position.
//!
//! Each decision cycle runs the same sequence: fold the broker's day
//! positions into local state, backfill order metadata from the day's
//! order book, drive the lifecycle rules per position, place entries for
//! underlyings with nothing open, square off past the session cutoff and
//! sweep protective stops nothing owns any more.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use opt_trade_core::{
    session, BrokerGateway, BrokerOrder, EngineConfig, InstrumentRow, OptionSide, OrderKind,
    OrderModify, OrderRequest, OrderSide, OrderStatus, SecurityConfig, Signal, TimeBucket,
};
use opt_trade_signals::TickIngestor;
use opt_trade_strategy::AnalysisView;
use opt_trade_strike_selector::StrikeWindow;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::entry;
use crate::lifecycle::{self, CancelReason, CloseReason, LifecycleAction, ReviewOutcome};
use crate::types::Position;

/// Per-underlying view the engine assembles for the coordinator each
/// cycle. `signal` is present only on the cycle that claimed its bucket.
#[derive(Debug, Clone)]
pub struct UnderlyingView {
    pub security: SecurityConfig,
    pub analysis: Option<AnalysisView>,
    pub window: Option<StrikeWindow>,
    pub atr: Option<Decimal>,
    pub signal: Option<Signal>,
}

pub struct OrderCoordinator {
    broker: Arc<dyn BrokerGateway>,
    ingestor: Arc<TickIngestor>,
    engine: EngineConfig,
    /// Maps any option token of a tracked underlying to that underlying.
    underlying_by_token: HashMap<i64, i64>,
    /// Tracked positions keyed by leg token.
    positions: HashMap<i64, Position>,
    /// Last signal bucket an entry was attempted for, per underlying.
    entered_bucket: HashMap<i64, TimeBucket>,
    /// Underlyings sitting out after a failed margin check.
    low_margin_at: HashMap<i64, DateTime<Utc>>,
    reconciled_at: Option<DateTime<Utc>>,
}

impl OrderCoordinator {
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        ingestor: Arc<TickIngestor>,
        engine: EngineConfig,
        securities: &[SecurityConfig],
        instruments: &[InstrumentRow],
    ) -> Self {
        let mut underlying_by_token = HashMap::new();
        for row in instruments {
            if let Some(security) = securities.iter().find(|s| s.symbol == row.name) {
                underlying_by_token.insert(row.token, security.token);
            }
        }
        Self {
            broker,
            ingestor,
            engine,
            underlying_by_token,
            positions: HashMap::new(),
            entered_bucket: HashMap::new(),
            low_margin_at: HashMap::new(),
            reconciled_at: None,
        }
    }

    #[must_use]
    pub fn position(&self, token: i64) -> Option<&Position> {
        self.positions.get(&token)
    }

    /// Tokens of tracked positions for an underlying, open or not. These
    /// stay subscribed so their quotes keep flowing while anything is
    /// still tracked.
    #[must_use]
    pub fn position_tokens(&self, underlying_token: i64) -> Vec<i64> {
        self.positions
            .values()
            .filter(|p| p.underlying_token == underlying_token)
            .map(|p| p.token)
            .collect()
    }

    /// True while the underlying has an open quantity or a resting stop,
    /// which blocks fresh entries.
    #[must_use]
    pub fn has_open_position(&self, underlying_token: i64) -> bool {
        self.positions
            .values()
            .any(|p| p.underlying_token == underlying_token && (p.is_open() || p.has_stop_order()))
    }

    /// One coordinator pass. `order_updated` is the feed's postback flag
    /// for this cycle; `now` anchors every time comparison in the pass.
    pub async fn run_cycle(
        &mut self,
        views: &HashMap<i64, UnderlyingView>,
        order_updated: bool,
        now: DateTime<Utc>,
    ) {
        let now_local = now.with_timezone(&session::EXCHANGE_TZ).naive_local();

        match self.reconcile(now).await {
            Ok(()) => {
                match self.backfill().await {
                    Ok(()) => self.manage(views, now_local).await,
                    Err(error) => warn!(error = %error, "order backfill failed"),
                }
                self.place_entries(views, now, now_local).await;
                self.square_off(now_local).await;
            }
            Err(error) => {
                warn!(error = %error, "position reconcile failed, skipping decisions");
            }
        }

        if order_updated {
            self.sweep_orphan_stops().await;
        }
    }

    /// Folds the broker's day positions into local state. Foreign
    /// positions on tracked option legs are adopted; tracked positions
    /// the broker reports flat are reclaimed once no stop rests.
    async fn reconcile(&mut self, now: DateTime<Utc>) -> Result<()> {
        let throttle = Duration::seconds(self.engine.reconcile_interval_secs as i64);
        if self
            .reconciled_at
            .is_some_and(|at| now.signed_duration_since(at) <= throttle)
        {
            return Ok(());
        }
        let reported = self
            .broker
            .positions()
            .await
            .context("fetching day positions")?;
        self.reconciled_at = Some(now);

        for report in reported {
            let Some(&underlying_token) = self.underlying_by_token.get(&report.token) else {
                continue;
            };
            if let Some(position) = self.positions.get_mut(&report.token) {
                position.quantity = report.quantity;
                if report.quantity == 0 && !position.has_stop_order() {
                    info!(
                        token = report.token,
                        symbol = %report.symbol,
                        "position flat, reclaimed"
                    );
                    self.positions.remove(&report.token);
                } else {
                    position.sync_state();
                }
            } else if report.quantity != 0 {
                let Some(side) = OptionSide::from_symbol(&report.symbol) else {
                    continue;
                };
                info!(
                    token = report.token,
                    symbol = %report.symbol,
                    quantity = report.quantity,
                    "adopted broker position"
                );
                self.positions.insert(
                    report.token,
                    Position::open(
                        report.token,
                        &report.symbol,
                        side,
                        underlying_token,
                        report.quantity,
                    ),
                );
            }
        }
        Ok(())
    }

    /// Fills missing entry metadata and adopts resting stops from the
    /// day's order book. One book fetch serves every position that needs
    /// it; none needing it means no fetch at all.
    async fn backfill(&mut self) -> Result<()> {
        let broker = Arc::clone(&self.broker);
        let needy: Vec<i64> = self
            .positions
            .values()
            .filter(|p| needs_backfill(p))
            .map(|p| p.token)
            .collect();
        if needy.is_empty() {
            return Ok(());
        }
        let book = broker.orders().await.context("fetching day orders")?;

        for token in needy {
            let entry_window = {
                let Some(position) = self.positions.get_mut(&token) else {
                    continue;
                };
                apply_order_history(position, &book);
                (position.is_long() && position.entry_candle.is_none())
                    .then(|| position.entry_time_local())
                    .flatten()
                    .map(|entry_local| {
                        let to = session::bucket_start(entry_local);
                        (to - Duration::minutes(15), to)
                    })
            };

            if let Some((from, to)) = entry_window {
                let candles = broker
                    .historical_candles(token, from, to)
                    .await
                    .context("fetching the entry bar")?;
                if let Some(position) = self.positions.get_mut(&token) {
                    if let Some(bar) = candles.last() {
                        if position.stop_price.is_none() {
                            position.stop_price = Some(bar.low - entry::STOP_OFFSET);
                        }
                        position.entry_candle = Some(bar.clone());
                    }
                }
            }
            if let Some(position) = self.positions.get_mut(&token) {
                position.sync_state();
            }
        }
        Ok(())
    }

    /// Runs the lifecycle rules over every tracked position, acting on
    /// whatever each one asks for. A failed action is logged and retried
    /// naturally on the next cycle.
    async fn manage(&mut self, views: &HashMap<i64, UnderlyingView>, now_local: NaiveDateTime) {
        let tokens: Vec<i64> = self.positions.keys().copied().collect();
        for token in tokens {
            let Some(position) = self.positions.get(&token) else {
                continue;
            };
            let last_price = self.ingestor.latest(token).map(|quote| quote.tick.last_price);
            debug!(
                token,
                symbol = %position.symbol,
                state = %position.state,
                stop = ?position.stop_price,
                price = ?last_price,
                "position check"
            );
            let Some(action) = lifecycle::evaluate(position, last_price, now_local) else {
                continue;
            };
            if let Err(error) = self.execute(token, action, views, now_local).await {
                warn!(token, error = %error, "lifecycle action failed");
            }
        }
    }

    async fn execute(
        &mut self,
        token: i64,
        action: LifecycleAction,
        views: &HashMap<i64, UnderlyingView>,
        now_local: NaiveDateTime,
    ) -> Result<()> {
        match action {
            LifecycleAction::MarketClose(reason) => self.market_close(token, reason).await,
            LifecycleAction::PlaceStop { trigger, limit } => {
                self.place_stop(token, trigger, limit).await
            }
            LifecycleAction::CancelStop(reason) => self.cancel_stop(token, reason).await,
            LifecycleAction::ReviewLeg => self.review_leg(token, views, now_local).await,
        }
    }

    /// Flattens the position at market and zeroes the local quantity.
    async fn market_close(&mut self, token: i64, reason: CloseReason) -> Result<()> {
        let broker = Arc::clone(&self.broker);
        let Some(position) = self.positions.get_mut(&token) else {
            return Ok(());
        };
        if position.quantity == 0 {
            return Ok(());
        }
        let request = OrderRequest {
            symbol: position.symbol.clone(),
            side: if position.quantity > 0 {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            },
            quantity: position.quantity.unsigned_abs() as u32,
            kind: OrderKind::Market,
        };
        let order_id = broker.place_order(&request).await?;
        info!(
            token,
            symbol = %position.symbol,
            order_id = %order_id,
            reason = %reason,
            "position closed at market"
        );
        position.quantity = 0;
        position.sync_state();
        Ok(())
    }

    /// Rests the protective stop-limit one tick under its trigger. The
    /// tracked stop becomes the resting limit from here on.
    async fn place_stop(&mut self, token: i64, trigger: Decimal, limit: Decimal) -> Result<()> {
        let broker = Arc::clone(&self.broker);
        let Some(position) = self.positions.get_mut(&token) else {
            return Ok(());
        };
        let request = OrderRequest {
            symbol: position.symbol.clone(),
            side: OrderSide::Sell,
            quantity: position.quantity.unsigned_abs() as u32,
            kind: OrderKind::StopLimit { trigger, limit },
        };
        let order_id = broker.place_order(&request).await?;
        info!(
            token,
            symbol = %position.symbol,
            order_id = %order_id,
            trigger = %trigger,
            limit = %limit,
            "protective stop placed"
        );
        position.stop_order_id = Some(order_id);
        position.stop_price = Some(limit);
        position.sync_state();
        Ok(())
    }

    async fn cancel_stop(&mut self, token: i64, reason: CancelReason) -> Result<()> {
        let broker = Arc::clone(&self.broker);
        let Some(order_id) = self
            .positions
            .get(&token)
            .and_then(|p| p.stop_order_id.clone())
        else {
            return Ok(());
        };
        broker.cancel_order(&order_id).await?;
        if let Some(position) = self.positions.get_mut(&token) {
            info!(
                token,
                symbol = %position.symbol,
                order_id = %order_id,
                reason = %reason,
                "stop order cancelled"
            );
            position.stop_order_id = None;
            if reason == CancelReason::Discontinued {
                position.close_requested = true;
            }
            position.sync_state();
        }
        Ok(())
    }

    /// Pulls the leg's recent bars and reviews the position: discontinue
    /// the premise or trail the stop under the entry bar high.
    async fn review_leg(
        &mut self,
        token: i64,
        views: &HashMap<i64, UnderlyingView>,
        now_local: NaiveDateTime,
    ) -> Result<()> {
        let broker = Arc::clone(&self.broker);
        let (from, to) = entry::entry_bar_window(now_local);
        let candles = broker
            .historical_candles(token, from, to)
            .await
            .context("fetching leg bars for review")?;
        let reviewed_at = candles
            .last()
            .map_or(now_local, |bar| {
                bar.ts.with_timezone(&session::EXCHANGE_TZ).naive_local()
            });

        let outcome = {
            let Some(position) = self.positions.get_mut(&token) else {
                return Ok(());
            };
            position.reviewed_at = Some(reviewed_at);
            let analysis = views
                .get(&position.underlying_token)
                .and_then(|view| view.analysis.as_ref());
            lifecycle::review(position, analysis, &candles)
        };

        match outcome {
            Some(ReviewOutcome::Discontinue) => {
                self.cancel_stop(token, CancelReason::Discontinued).await
            }
            Some(ReviewOutcome::Trail { trigger, limit }) => {
                self.trail_stop(token, trigger, limit).await
            }
            None => Ok(()),
        }
    }

    async fn trail_stop(&mut self, token: i64, trigger: Decimal, limit: Decimal) -> Result<()> {
        let broker = Arc::clone(&self.broker);
        let Some(order_id) = self
            .positions
            .get(&token)
            .and_then(|p| p.stop_order_id.clone())
        else {
            return Ok(());
        };
        broker
            .modify_order(&order_id, &OrderModify { trigger, limit })
            .await?;
        if let Some(position) = self.positions.get_mut(&token) {
            position.stop_price = Some(limit);
            position.trailed = true;
            position.sync_state();
            info!(
                token,
                symbol = %position.symbol,
                trigger = %trigger,
                "stop trailed to the entry bar high"
            );
        }
        Ok(())
    }

    /// Places entries for underlyings whose cycle produced an actionable
    /// signal and which have nothing open or resting.
    async fn place_entries(
        &mut self,
        views: &HashMap<i64, UnderlyingView>,
        now: DateTime<Utc>,
        now_local: NaiveDateTime,
    ) {
        for (&underlying_token, view) in views {
            if self.has_open_position(underlying_token) {
                continue;
            }
            let Some(signal) = view.signal.as_ref() else {
                continue;
            };
            if !signal.action.is_entry() {
                continue;
            }
            if let Err(error) = self
                .try_enter(underlying_token, view, signal, now, now_local)
                .await
            {
                warn!(underlying = underlying_token, error = %error, "entry failed");
            }
        }
    }

    async fn try_enter(
        &mut self,
        underlying_token: i64,
        view: &UnderlyingView,
        signal: &Signal,
        now: DateTime<Utc>,
        now_local: NaiveDateTime,
    ) -> Result<()> {
        if self.entered_bucket.get(&underlying_token) == Some(&signal.bucket) {
            return Ok(());
        }
        if session::past_entry_cutoff(now_local) {
            debug!(underlying = underlying_token, "past the entry cutoff");
            return Ok(());
        }
        let backoff = Duration::seconds(self.engine.low_margin_backoff_secs as i64);
        if self
            .low_margin_at
            .get(&underlying_token)
            .is_some_and(|at| now.signed_duration_since(*at) <= backoff)
        {
            debug!(
                underlying = underlying_token,
                "sitting out after a low margin check"
            );
            return Ok(());
        }

        let Some(token) = entry::signal_token(signal) else {
            return Ok(());
        };
        let Some(side) = entry::signal_side(signal.action) else {
            return Ok(());
        };
        let Some(window) = view.window.as_ref() else {
            return Ok(());
        };
        let Some(leg) = window.leg_by_token(token) else {
            debug!(token, "signal token missing from the strike window");
            return Ok(());
        };
        let Some(quote) = self.ingestor.latest(token) else {
            debug!(token, "no fresh leg quote, skipping entry");
            return Ok(());
        };
        let last_price = quote.tick.last_price;

        // One attempt per signal bucket, whatever comes of it.
        self.entered_bucket.insert(underlying_token, signal.bucket);

        let broker = Arc::clone(&self.broker);
        let (from, to) = entry::entry_bar_window(now_local);
        let leg_candles = broker
            .historical_candles(token, from, to)
            .await
            .context("fetching the entry bar")?;
        let Some(plan) = entry::plan_entry(
            signal.action,
            side,
            leg,
            view.security.quantity,
            last_price,
            &leg_candles,
            view.atr,
        ) else {
            return Ok(());
        };

        let margins = broker.margins().await.context("fetching margins")?;
        if !entry::margin_covers(margins.available_cash, plan.quantity, plan.last_price) {
            warn!(
                underlying = underlying_token,
                available = %margins.available_cash,
                "margin short, backing off"
            );
            self.low_margin_at.insert(underlying_token, now);
            return Ok(());
        }

        let order_id = broker
            .place_order(&OrderRequest {
                symbol: plan.symbol.clone(),
                side: plan.order_side,
                quantity: plan.quantity,
                kind: OrderKind::Market,
            })
            .await?;
        info!(
            token,
            symbol = %plan.symbol,
            action = ?signal.action,
            quantity = plan.quantity,
            price = %plan.last_price,
            stop = ?plan.stop_price,
            target = ?plan.target_price,
            order_id = %order_id,
            "entry order placed"
        );

        let quantity = match plan.order_side {
            OrderSide::Buy => i64::from(plan.quantity),
            OrderSide::Sell => -i64::from(plan.quantity),
        };
        let mut position =
            Position::open(token, &plan.symbol, plan.side, underlying_token, quantity);
        position.entry_order_id = Some(order_id);
        position.entry_time = Some(now);
        position.entry_price = Some(plan.last_price);
        position.entry_candle = plan.entry_candle;
        position.stop_price = plan.stop_price;
        position.target_price = plan.target_price;
        position.sync_state();
        self.positions.insert(token, position);
        Ok(())
    }

    /// Past the square-off cutoff nothing survives: resting stops come
    /// off first, then the open quantity goes at market.
    async fn square_off(&mut self, now_local: NaiveDateTime) {
        if !session::past_square_off(now_local) {
            return;
        }
        let tokens: Vec<i64> = self.positions.keys().copied().collect();
        for token in tokens {
            if self
                .positions
                .get(&token)
                .is_some_and(Position::has_stop_order)
            {
                if let Err(error) = self.cancel_stop(token, CancelReason::SquareOff).await {
                    warn!(token, error = %error, "square-off stop cancel failed");
                    continue;
                }
            }
            if self.positions.get(&token).is_some_and(Position::is_open) {
                if let Err(error) = self.market_close(token, CloseReason::SquareOff).await {
                    warn!(token, error = %error, "square-off close failed");
                }
            }
        }
    }

    /// Cancels trigger-pending stops at the broker that no tracked
    /// position owns. Runs only on cycles that saw an order postback.
    async fn sweep_orphan_stops(&mut self) {
        let broker = Arc::clone(&self.broker);
        let book = match broker.orders().await {
            Ok(book) => book,
            Err(error) => {
                warn!(error = %error, "orphan stop sweep failed");
                return;
            }
        };
        for order in book.iter().filter(|order| order.is_pending_stop()) {
            if self.positions.contains_key(&order.token) {
                continue;
            }
            match broker.cancel_order(&order.order_id).await {
                Ok(()) => info!(
                    order_id = %order.order_id,
                    token = order.token,
                    "orphaned stop cancelled"
                ),
                Err(error) => warn!(
                    order_id = %order.order_id,
                    error = %error,
                    "orphaned stop cancel failed"
                ),
            }
        }
    }
}

fn needs_backfill(position: &Position) -> bool {
    if position.has_stop_order() && !position.is_open() {
        // The stop may have executed; the order book settles it.
        return true;
    }
    if !position.is_open() {
        return false;
    }
    position.entry_time.is_none()
        || (position.is_long()
            && (position.entry_candle.is_none() || !position.has_stop_order()))
}

/// Folds matching day orders into the position: the completed entry fill,
/// any resting protective stop, and the fate of a stop we thought was
/// resting.
fn apply_order_history(position: &mut Position, book: &[BrokerOrder]) {
    let adopt_entry = position.entry_time.is_none();
    let entry_side = if position.is_short() {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    };
    for order in book.iter().filter(|order| order.token == position.token) {
        if adopt_entry && order.side == entry_side && order.status == OrderStatus::Complete {
            position.entry_order_id = Some(order.order_id.clone());
            position.entry_time = Some(order.placed_at);
            position.entry_price = Some(order.average_price);
        } else if order.is_pending_stop() {
            position.stop_order_id = Some(order.order_id.clone());
            position.stop_price = Some(order.price);
        } else if position.stop_order_id.as_deref() == Some(order.order_id.as_str()) {
            // Executed or cancelled out from under us.
            position.stop_order_id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use opt_trade_core::{
        BrokerOrderKind, BrokerPosition, Candle, SignalAction, Tick, TickSink, TrendDirection,
    };
    use opt_trade_kite::PaperBroker;
    use opt_trade_strike_selector::OptionLeg;
    use rust_decimal_macros::dec;

    use crate::types::PositionState;

    const UNDERLYING: i64 = 256_265;
    const LEG_CE: i64 = 224_000;
    const LEG_CE_SYMBOL: &str = "NIFTY2532022400CE";

    fn ist(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 17)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        session::to_utc(ist(h, m, s))
    }

    fn security() -> SecurityConfig {
        SecurityConfig {
            symbol: "NIFTY".into(),
            token: UNDERLYING,
            strike_step: 50,
            quantity: 75,
        }
    }

    fn engine() -> EngineConfig {
        EngineConfig {
            loop_interval_secs: 5,
            reconcile_interval_secs: 10,
            low_margin_backoff_secs: 300,
            selling_enabled: false,
            extra_strikes: 0,
            exchange: "NFO".into(),
        }
    }

    fn leg_symbol(strike: i64, side: OptionSide) -> String {
        format!("NIFTY25320{strike}{}", side.suffix())
    }

    fn leg_token(strike: i64, side: OptionSide) -> i64 {
        match side {
            OptionSide::Call => strike * 10,
            OptionSide::Put => strike * 10 + 5,
        }
    }

    fn leg_rows() -> Vec<InstrumentRow> {
        let mut rows = Vec::new();
        for strike in (22_300_i64..=22_500).step_by(50) {
            for side in [OptionSide::Call, OptionSide::Put] {
                rows.push(InstrumentRow {
                    token: leg_token(strike, side),
                    symbol: leg_symbol(strike, side),
                    name: "NIFTY".into(),
                    expiry: NaiveDate::from_ymd_opt(2025, 3, 20),
                    strike: Decimal::from(strike),
                    instrument_type: side.suffix().to_string(),
                    exchange: "NFO".into(),
                });
            }
        }
        rows
    }

    fn window() -> StrikeWindow {
        let mut legs = HashMap::new();
        for strike in (22_300_i64..=22_500).step_by(50) {
            for side in [OptionSide::Call, OptionSide::Put] {
                legs.insert(
                    (strike, side),
                    OptionLeg {
                        token: leg_token(strike, side),
                        symbol: leg_symbol(strike, side),
                    },
                );
            }
        }
        StrikeWindow::from_legs("NIFTY", 22_400, 50, legs)
    }

    fn bar(h: u32, m: u32, low: Decimal, high: Decimal, close: Decimal) -> Candle {
        Candle {
            token: LEG_CE,
            bucket: TimeBucket::from_local(ist(h, m, 0)),
            ts: at(h, m, 0),
            open: low + dec!(2),
            high,
            low,
            close,
        }
    }

    fn buy_call_signal(h: u32, m: u32) -> Signal {
        Signal {
            bucket: TimeBucket::from_local(ist(h, m, 0)),
            action: SignalAction::BuyCall,
            chosen_ce_token: Some(LEG_CE),
            chosen_pe_token: Some(leg_token(22_450, OptionSide::Put)),
        }
    }

    fn views(
        signal: Option<Signal>,
        analysis: Option<AnalysisView>,
    ) -> HashMap<i64, UnderlyingView> {
        let mut map = HashMap::new();
        map.insert(
            UNDERLYING,
            UnderlyingView {
                security: security(),
                analysis,
                window: Some(window()),
                atr: Some(dec!(14.5)),
                signal,
            },
        );
        map
    }

    fn analysis_view(is_bullish: bool, is_bearish: bool, pcr_nearest: f64) -> AnalysisView {
        AnalysisView {
            bucket: TimeBucket::from_local(ist(10, 35, 0)),
            trend: TrendDirection::None,
            is_bullish,
            is_bearish,
            pcr_nearest,
            pcr_next: 1.0,
        }
    }

    fn feed_quote(ingestor: &TickIngestor, token: i64, price: Decimal) {
        ingestor.absorb(vec![Tick {
            token,
            timestamp: Utc::now(),
            last_price: price,
            open_interest: 1_000_000,
            volume_traded: 10_000,
            bid_volume: 500,
            offer_volume: 400,
        }]);
    }

    async fn setup() -> (Arc<PaperBroker>, Arc<TickIngestor>, OrderCoordinator) {
        let broker = Arc::new(PaperBroker::new());
        broker.register_symbol(LEG_CE_SYMBOL, LEG_CE).await;
        broker.set_price(LEG_CE, dec!(128)).await;
        let ingestor = Arc::new(TickIngestor::new());
        let gateway: Arc<dyn BrokerGateway> = broker.clone();
        let coordinator = OrderCoordinator::new(
            gateway,
            Arc::clone(&ingestor),
            engine(),
            &[security()],
            &leg_rows(),
        );
        (broker, ingestor, coordinator)
    }

    /// Drives a long call entry at 10:07 and the stop placement a cycle
    /// later, leaving the position protected at trigger 110 / limit 109.
    async fn enter_protected_long(
        broker: &Arc<PaperBroker>,
        ingestor: &Arc<TickIngestor>,
        coordinator: &mut OrderCoordinator,
    ) {
        broker
            .load_candles(LEG_CE, vec![bar(10, 0, dec!(115), dec!(124), dec!(122))])
            .await;
        feed_quote(ingestor, LEG_CE, dec!(128));
        let v = views(Some(buy_call_signal(10, 5)), None);
        coordinator.run_cycle(&v, false, at(10, 7, 0)).await;
        coordinator.run_cycle(&v, false, at(10, 7, 15)).await;
    }

    #[tokio::test]
    async fn adopts_foreign_positions_and_reclaims_flat_ones() {
        let (broker, _ingestor, mut coordinator) = setup().await;
        broker
            .seed_position(BrokerPosition {
                token: LEG_CE,
                symbol: LEG_CE_SYMBOL.into(),
                quantity: 75,
                average_price: dec!(120),
            })
            .await;

        coordinator.run_cycle(&views(None, None), false, at(10, 0, 0)).await;
        let position = coordinator.position(LEG_CE).unwrap();
        assert_eq!(position.quantity, 75);
        assert_eq!(position.side, OptionSide::Call);
        assert_eq!(position.underlying_token, UNDERLYING);
        assert!(coordinator.has_open_position(UNDERLYING));

        // Broker reports it flat with nothing resting: reclaimed on the
        // next reconcile.
        broker
            .seed_position(BrokerPosition {
                token: LEG_CE,
                symbol: LEG_CE_SYMBOL.into(),
                quantity: 0,
                average_price: dec!(120),
            })
            .await;
        coordinator.run_cycle(&views(None, None), false, at(10, 0, 11)).await;
        assert!(coordinator.position(LEG_CE).is_none());
        assert!(!coordinator.has_open_position(UNDERLYING));
    }

    #[tokio::test]
    async fn entry_places_the_market_order_and_tracks_the_position() {
        let (broker, ingestor, mut coordinator) = setup().await;
        broker
            .load_candles(LEG_CE, vec![bar(10, 0, dec!(115), dec!(124), dec!(122))])
            .await;
        feed_quote(&ingestor, LEG_CE, dec!(128));

        let v = views(Some(buy_call_signal(10, 5)), None);
        coordinator.run_cycle(&v, false, at(10, 7, 0)).await;

        let position = coordinator.position(LEG_CE).unwrap();
        assert_eq!(position.quantity, 75);
        assert_eq!(position.stop_price, Some(dec!(110)));
        assert_eq!(position.target_price, Some(dec!(129.5)));
        assert_eq!(position.state, PositionState::ProtectiveStopPending);
        assert!(position.entry_candle.is_some());

        let book = broker.orders().await.unwrap();
        assert_eq!(book.len(), 1);
        assert_eq!(book[0].kind, BrokerOrderKind::Market);
        assert_eq!(book[0].side, OrderSide::Buy);
        assert_eq!(book[0].status, OrderStatus::Complete);

        // Same bucket again: no second entry, only the protective stop.
        coordinator.run_cycle(&v, false, at(10, 7, 5)).await;
        assert_eq!(broker.orders().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stop_goes_in_once_price_holds_above_it() {
        let (broker, ingestor, mut coordinator) = setup().await;
        enter_protected_long(&broker, &ingestor, &mut coordinator).await;

        let position = coordinator.position(LEG_CE).unwrap();
        assert!(position.has_stop_order());
        assert_eq!(position.stop_price, Some(dec!(109)));
        assert_eq!(position.state, PositionState::ProtectiveStopActive);

        let book = broker.orders().await.unwrap();
        let stop = book
            .iter()
            .find(|order| order.kind == BrokerOrderKind::StopLimit)
            .unwrap();
        assert_eq!(stop.trigger_price, dec!(110));
        assert_eq!(stop.price, dec!(109));
        assert_eq!(stop.status, OrderStatus::TriggerPending);
    }

    #[tokio::test]
    async fn trigger_pending_stop_is_adopted_from_the_order_book() {
        let (broker, _ingestor, mut coordinator) = setup().await;
        broker
            .seed_position(BrokerPosition {
                token: LEG_CE,
                symbol: LEG_CE_SYMBOL.into(),
                quantity: 75,
                average_price: dec!(120),
            })
            .await;
        broker
            .place_order(&OrderRequest {
                symbol: LEG_CE_SYMBOL.into(),
                side: OrderSide::Sell,
                quantity: 75,
                kind: OrderKind::StopLimit {
                    trigger: dec!(112),
                    limit: dec!(111),
                },
            })
            .await
            .unwrap();

        coordinator.run_cycle(&views(None, None), false, at(10, 0, 0)).await;

        let position = coordinator.position(LEG_CE).unwrap();
        assert!(position.has_stop_order());
        assert_eq!(position.stop_price, Some(dec!(111)));
        assert_eq!(position.state, PositionState::ProtectiveStopActive);
    }

    #[tokio::test]
    async fn stop_fill_settles_then_the_position_is_reclaimed() {
        let (broker, ingestor, mut coordinator) = setup().await;
        enter_protected_long(&broker, &ingestor, &mut coordinator).await;
        let stop_id = coordinator
            .position(LEG_CE)
            .unwrap()
            .stop_order_id
            .clone()
            .unwrap();

        broker.trigger_stop(&stop_id).await.unwrap();

        // First pass settles the stop off the order book and reads flat.
        coordinator.run_cycle(&views(None, None), false, at(10, 7, 30)).await;
        let position = coordinator.position(LEG_CE).unwrap();
        assert_eq!(position.quantity, 0);
        assert!(!position.has_stop_order());
        assert_eq!(position.state, PositionState::Closed);

        // Next reconcile reclaims it.
        coordinator.run_cycle(&views(None, None), false, at(10, 7, 45)).await;
        assert!(coordinator.position(LEG_CE).is_none());
    }

    #[tokio::test]
    async fn discontinued_position_cancels_its_stop_then_closes() {
        let (broker, ingestor, mut coordinator) = setup().await;
        enter_protected_long(&broker, &ingestor, &mut coordinator).await;
        broker
            .load_candles(
                LEG_CE,
                vec![
                    bar(10, 0, dec!(115), dec!(124), dec!(122)),
                    bar(10, 30, dec!(131), dec!(140), dec!(138)),
                    bar(10, 35, dec!(130), dec!(139), dec!(137)),
                ],
            )
            .await;

        // Past the time budget with the underlying turned bearish.
        let v = views(None, Some(analysis_view(false, true, 1.2)));
        coordinator.run_cycle(&v, false, at(10, 40, 0)).await;

        let position = coordinator.position(LEG_CE).unwrap();
        assert!(position.close_requested);
        assert!(!position.has_stop_order());
        let book = broker.orders().await.unwrap();
        let stop = book
            .iter()
            .find(|order| order.kind == BrokerOrderKind::StopLimit)
            .unwrap();
        assert_eq!(stop.status, OrderStatus::Cancelled);

        // Forced close on the next cycle.
        coordinator.run_cycle(&v, false, at(10, 40, 5)).await;
        let position = coordinator.position(LEG_CE).unwrap();
        assert_eq!(position.quantity, 0);
        assert_eq!(position.state, PositionState::Closed);
        let sells = broker
            .orders()
            .await
            .unwrap()
            .into_iter()
            .filter(|order| order.kind == BrokerOrderKind::Market && order.side == OrderSide::Sell)
            .count();
        assert_eq!(sells, 1);
    }

    #[tokio::test]
    async fn trailing_fires_once_and_modifies_the_stop() {
        let (broker, ingestor, mut coordinator) = setup().await;
        enter_protected_long(&broker, &ingestor, &mut coordinator).await;
        broker
            .load_candles(
                LEG_CE,
                vec![
                    bar(10, 0, dec!(115), dec!(124), dec!(122)),
                    bar(10, 30, dec!(131), dec!(140), dec!(138)),
                    bar(10, 35, dec!(130), dec!(139), dec!(137)),
                ],
            )
            .await;

        // Premise intact, leg holding well above the entry bar high.
        let v = views(None, Some(analysis_view(false, false, 1.8)));
        coordinator.run_cycle(&v, false, at(10, 40, 0)).await;

        let position = coordinator.position(LEG_CE).unwrap();
        assert!(position.trailed);
        assert_eq!(position.stop_price, Some(dec!(123)));
        assert_eq!(position.state, PositionState::Trailing);
        let book = broker.orders().await.unwrap();
        let stop = book
            .iter()
            .find(|order| order.kind == BrokerOrderKind::StopLimit)
            .unwrap();
        assert_eq!(stop.trigger_price, dec!(124));
        assert_eq!(stop.price, dec!(123));

        // A later review never trails again.
        coordinator.run_cycle(&v, false, at(10, 46, 0)).await;
        let book = broker.orders().await.unwrap();
        let stop = book
            .iter()
            .find(|order| order.kind == BrokerOrderKind::StopLimit)
            .unwrap();
        assert_eq!(stop.trigger_price, dec!(124));
        assert_eq!(
            coordinator.position(LEG_CE).unwrap().state,
            PositionState::Trailing
        );
    }

    #[tokio::test]
    async fn square_off_flattens_everything() {
        let (broker, ingestor, mut coordinator) = setup().await;
        enter_protected_long(&broker, &ingestor, &mut coordinator).await;

        coordinator.run_cycle(&views(None, None), false, at(15, 6, 0)).await;

        let position = coordinator.position(LEG_CE).unwrap();
        assert_eq!(position.quantity, 0);
        assert_eq!(position.state, PositionState::Closed);
        let book = broker.orders().await.unwrap();
        let stop = book
            .iter()
            .find(|order| order.kind == BrokerOrderKind::StopLimit)
            .unwrap();
        assert_eq!(stop.status, OrderStatus::Cancelled);
        assert_eq!(
            broker
                .positions()
                .await
                .unwrap()
                .iter()
                .find(|p| p.token == LEG_CE)
                .unwrap()
                .quantity,
            0
        );
    }

    #[tokio::test]
    async fn orphan_stops_are_swept_on_postbacks() {
        let (broker, _ingestor, mut coordinator) = setup().await;
        let orphan_id = broker
            .place_order(&OrderRequest {
                symbol: LEG_CE_SYMBOL.into(),
                side: OrderSide::Sell,
                quantity: 75,
                kind: OrderKind::StopLimit {
                    trigger: dec!(112),
                    limit: dec!(111),
                },
            })
            .await
            .unwrap();

        // No postback: the stop stays put.
        coordinator.run_cycle(&views(None, None), false, at(10, 0, 0)).await;
        let book = broker.orders().await.unwrap();
        assert_eq!(book[0].status, OrderStatus::TriggerPending);

        coordinator.run_cycle(&views(None, None), true, at(10, 0, 11)).await;
        let book = broker.orders().await.unwrap();
        let order = book
            .iter()
            .find(|order| order.order_id == orphan_id)
            .unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn entry_honours_the_margin_backoff() {
        let (broker, ingestor, mut coordinator) = setup().await;
        broker
            .load_candles(LEG_CE, vec![bar(10, 0, dec!(115), dec!(124), dec!(122))])
            .await;
        broker.set_cash(dec!(8000)).await;
        feed_quote(&ingestor, LEG_CE, dec!(128));

        coordinator
            .run_cycle(&views(Some(buy_call_signal(10, 5)), None), false, at(10, 7, 0))
            .await;
        assert!(coordinator.position(LEG_CE).is_none());
        assert!(broker.orders().await.unwrap().is_empty());

        // Cash restored, but the backoff still holds for a fresh bucket.
        broker.set_cash(dec!(1_000_000)).await;
        coordinator
            .run_cycle(&views(Some(buy_call_signal(10, 10)), None), false, at(10, 11, 0))
            .await;
        assert!(broker.orders().await.unwrap().is_empty());

        // Past the backoff the next bucket goes through.
        coordinator
            .run_cycle(&views(Some(buy_call_signal(10, 10)), None), false, at(10, 12, 30))
            .await;
        assert_eq!(broker.orders().await.unwrap().len(), 1);
        assert!(coordinator.position(LEG_CE).is_some());
    }

    #[tokio::test]
    async fn entries_stop_at_the_cutoff() {
        let (broker, ingestor, mut coordinator) = setup().await;
        broker
            .load_candles(LEG_CE, vec![bar(14, 50, dec!(115), dec!(124), dec!(122))])
            .await;
        feed_quote(&ingestor, LEG_CE, dec!(128));

        coordinator
            .run_cycle(&views(Some(buy_call_signal(14, 55)), None), false, at(14, 56, 0))
            .await;
        assert!(coordinator.position(LEG_CE).is_none());
        assert!(broker.orders().await.unwrap().is_empty());
    }
}
