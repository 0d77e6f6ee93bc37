use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use opt_trade_core::{LatestQuote, Tick, TickSink};

#[derive(Default)]
struct IngestorState {
    buffer: Vec<Tick>,
    latest: HashMap<i64, LatestQuote>,
}

/// Shared landing zone between the feed task and the decision loop.
///
/// The feed task calls `absorb`; the decision loop calls `drain` and
/// `latest`. Both sides go through one mutex, so a drain never observes a
/// half-written batch.
#[derive(Default)]
pub struct TickIngestor {
    state: Mutex<IngestorState>,
}

impl TickIngestor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything absorbed since the last drain.
    pub fn drain(&self) -> Vec<Tick> {
        let mut state = self.lock();
        std::mem::take(&mut state.buffer)
    }

    /// Most recent quote for `token`, or `None` if absent or stale.
    #[must_use]
    pub fn latest(&self, token: i64) -> Option<LatestQuote> {
        self.latest_at(token, Utc::now())
    }

    fn latest_at(&self, token: i64, now: DateTime<Utc>) -> Option<LatestQuote> {
        let state = self.lock();
        state
            .latest
            .get(&token)
            .filter(|quote| quote.is_fresh(now))
            .cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IngestorState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TickSink for TickIngestor {
    fn absorb(&self, ticks: Vec<Tick>) {
        if ticks.is_empty() {
            return;
        }
        let received_at = Utc::now();
        let mut state = self.lock();
        for tick in &ticks {
            state.latest.insert(
                tick.token,
                LatestQuote {
                    tick: tick.clone(),
                    received_at,
                },
            );
        }
        state.buffer.extend(ticks);
    }
}
