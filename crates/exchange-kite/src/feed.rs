//! Background task owning the ticker websocket.
//!
//! The decision loop never touches the socket directly: it observes
//! connectivity through [`FeedHandle::is_connected`], adjusts the wanted
//! token set with subscribe/unsubscribe commands, and consumes the
//! order-postback flag. The task redials on every disconnect and replays
//! the full subscription set after each successful connect.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opt_trade_core::{KiteConfig, TickSink};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::websocket::{KiteTicker, TickerEvent};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum FeedCommand {
    Subscribe(Vec<i64>),
    Unsubscribe(Vec<i64>),
}

/// Decision-loop side of the feed task.
#[derive(Clone)]
pub struct FeedHandle {
    connected: Arc<AtomicBool>,
    order_updated: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<FeedCommand>,
}

impl FeedHandle {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns true once per burst of order postbacks, clearing the flag.
    #[must_use]
    pub fn take_order_update(&self) -> bool {
        self.order_updated.swap(false, Ordering::SeqCst)
    }

    pub fn subscribe(&self, tokens: Vec<i64>) {
        if tokens.is_empty() {
            return;
        }
        let _ = self.commands.send(FeedCommand::Subscribe(tokens));
    }

    pub fn unsubscribe(&self, tokens: Vec<i64>) {
        if tokens.is_empty() {
            return;
        }
        let _ = self.commands.send(FeedCommand::Unsubscribe(tokens));
    }
}

/// Spawns the feed task. Ticks land in `sink` from the task's context,
/// concurrent with the decision loop draining them.
#[must_use]
pub fn spawn_feed(config: KiteConfig, sink: Arc<dyn TickSink>) -> FeedHandle {
    let connected = Arc::new(AtomicBool::new(false));
    let order_updated = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = FeedHandle {
        connected: Arc::clone(&connected),
        order_updated: Arc::clone(&order_updated),
        commands: tx,
    };

    tokio::spawn(run_feed(config, sink, connected, order_updated, rx));

    handle
}

async fn run_feed(
    config: KiteConfig,
    sink: Arc<dyn TickSink>,
    connected: Arc<AtomicBool>,
    order_updated: Arc<AtomicBool>,
    mut commands: mpsc::UnboundedReceiver<FeedCommand>,
) {
    let mut ticker = KiteTicker::new(&config.ws_url, &config.api_key, &config.access_token);
    let mut subscribed: HashSet<i64> = HashSet::new();

    loop {
        if !ticker.is_connected() {
            match ticker.connect().await {
                Ok(()) => {
                    connected.store(true, Ordering::SeqCst);
                    let tokens: Vec<i64> = subscribed.iter().copied().collect();
                    if let Err(e) = ticker.subscribe(&tokens).await {
                        warn!(error = %e, "resubscribe after reconnect failed");
                        connected.store(false, Ordering::SeqCst);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                    info!(tokens = tokens.len(), "feed connected and subscribed");
                }
                Err(e) => {
                    warn!(error = %e, "feed connect failed, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            }
        }

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    // Engine dropped the handle; nothing left to feed.
                    info!("feed command channel closed, stopping feed task");
                    return;
                };
                if let Err(e) = apply_command(&mut ticker, &mut subscribed, command).await {
                    warn!(error = %e, "subscription change failed, reconnecting");
                    ticker.disconnect();
                    connected.store(false, Ordering::SeqCst);
                }
            }
            event = ticker.next_event() => {
                match event {
                    Ok(Some(TickerEvent::Ticks(ticks))) => sink.absorb(ticks),
                    Ok(Some(TickerEvent::OrderUpdate)) => {
                        order_updated.store(true, Ordering::SeqCst);
                    }
                    Ok(Some(TickerEvent::Closed)) | Ok(None) => {
                        warn!("feed disconnected, redialing");
                        ticker.disconnect();
                        connected.store(false, Ordering::SeqCst);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "feed read error, redialing");
                        ticker.disconnect();
                        connected.store(false, Ordering::SeqCst);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }
    }
}

async fn apply_command(
    ticker: &mut KiteTicker,
    subscribed: &mut HashSet<i64>,
    command: FeedCommand,
) -> anyhow::Result<()> {
    match command {
        FeedCommand::Subscribe(tokens) => {
            let fresh: Vec<i64> = tokens
                .into_iter()
                .filter(|token| subscribed.insert(*token))
                .collect();
            ticker.subscribe(&fresh).await
        }
        FeedCommand::Unsubscribe(tokens) => {
            let removed: Vec<i64> = tokens
                .into_iter()
                .filter(|token| subscribed.remove(token))
                .collect();
            ticker.unsubscribe(&removed).await
        }
    }
}
