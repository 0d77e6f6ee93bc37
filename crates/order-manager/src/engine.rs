//! Live engine loop: ticks in, signals out, orders coordinated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use opt_trade_core::{session, AppConfig, BrokerGateway};
use opt_trade_data::DatabaseClient;
use opt_trade_kite::FeedHandle;
use opt_trade_signals::TickIngestor;
use opt_trade_strategy::InstrumentState;
use tracing::{error, info, warn};

use crate::coordinator::{OrderCoordinator, UnderlyingView};

/// Runs the decision loop until the trading window closes.
///
/// Every `engine.loop_interval_secs` seconds:
/// 1. Flush buffered ticks to storage
/// 2. Refresh per-underlying history, trend and strike window
/// 3. Derive at most one signal per underlying per bucket
/// 4. Keep feed subscriptions on the tokens that matter
/// 5. Hand the cycle to the order coordinator
pub async fn run(
    config: AppConfig,
    db: Arc<DatabaseClient>,
    broker: Arc<dyn BrokerGateway>,
    ingestor: Arc<TickIngestor>,
    feed: FeedHandle,
) -> Result<()> {
    let engine = config.engine.clone();
    let instruments = broker
        .instruments(&engine.exchange)
        .await
        .context("downloading the instrument dump")?;
    info!(
        rows = instruments.len(),
        exchange = %engine.exchange,
        "instrument dump loaded"
    );

    let mut states: HashMap<i64, InstrumentState> = HashMap::new();
    for security in &config.securities {
        let mut state = InstrumentState::new(security.clone(), Arc::clone(&db), &instruments);
        state
            .load_history()
            .await
            .with_context(|| format!("loading history for {}", security.symbol))?;
        states.insert(security.token, state);
    }

    let mut coordinator = OrderCoordinator::new(
        Arc::clone(&broker),
        Arc::clone(&ingestor),
        engine.clone(),
        &config.securities,
        &instruments,
    );

    let underlying_tokens: Vec<i64> = config.securities.iter().map(|s| s.token).collect();
    let mut subscribed: HashSet<i64> = HashSet::new();
    let mut interval = tokio::time::interval(Duration::from_secs(engine.loop_interval_secs));

    info!(
        securities = config.securities.len(),
        loop_secs = engine.loop_interval_secs,
        selling = engine.selling_enabled,
        "engine started"
    );

    loop {
        interval.tick().await;
        let now = Utc::now();
        let now_local = session::now_local();

        if !session::in_trading_window(now_local) {
            info!("outside the trading window, stopping");
            return Ok(());
        }

        // 1. Flush buffered ticks off the decision path.
        let batch = ingestor.drain();
        if !batch.is_empty() {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                if let Err(error) = db.insert_tick_batch(&batch).await {
                    error!(error = %error, "tick batch insert failed");
                }
            });
        }

        if !feed.is_connected() {
            warn!("tick feed disconnected, skipping decisions");
            continue;
        }

        // 2-3. Per underlying: history, trend, window, then the signal.
        let mut views: HashMap<i64, UnderlyingView> = HashMap::new();
        let mut wanted: HashSet<i64> = underlying_tokens.iter().copied().collect();
        for state in states.values_mut() {
            let token = state.token();
            if let Err(error) = state.refresh(broker.as_ref(), now_local).await {
                warn!(token, symbol = state.symbol(), error = %error, "history refresh failed");
                continue;
            }
            state.update_trend();

            let quote = ingestor.latest(token);
            if let Some(quote) = quote.as_ref() {
                if let Err(error) =
                    state.resolve_window(quote.tick.last_price, now, engine.extra_strikes)
                {
                    warn!(token, symbol = state.symbol(), error = %error, "strike window resolve failed");
                }
            }

            // Positions keep their legs subscribed; otherwise the
            // resolved window decides.
            let position_tokens = coordinator.position_tokens(token);
            if position_tokens.is_empty() {
                if let Some(window) = state.window() {
                    wanted.extend(window.tokens());
                }
            } else {
                wanted.extend(position_tokens);
            }

            let signal = match state.derive_signal(&engine, quote.as_ref(), now).await {
                Ok(signal) => signal,
                Err(error) => {
                    warn!(token, symbol = state.symbol(), error = %error, "signal derivation failed");
                    None
                }
            };

            views.insert(
                token,
                UnderlyingView {
                    security: state.security().clone(),
                    analysis: state.analysis().copied(),
                    window: state.window().cloned(),
                    atr: state.latest_atr(),
                    signal,
                },
            );
        }

        // 4. Subscriptions follow the wanted set.
        let to_subscribe: Vec<i64> = wanted.difference(&subscribed).copied().collect();
        if !to_subscribe.is_empty() {
            feed.subscribe(to_subscribe.clone());
            subscribed.extend(to_subscribe);
        }
        let to_drop: Vec<i64> = subscribed.difference(&wanted).copied().collect();
        if !to_drop.is_empty() {
            feed.unsubscribe(to_drop.clone());
            for token in &to_drop {
                subscribed.remove(token);
            }
        }

        // 5. The coordinator owns every order decision.
        coordinator
            .run_cycle(&views, feed.take_order_update(), now)
            .await;
    }
}
