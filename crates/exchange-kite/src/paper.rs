//! Paper trading gateway.
//!
//! Simulates the broker in memory: market orders fill instantly at a
//! scripted price, stop orders rest as TRIGGER PENDING until a test fires
//! them. Lets the whole order-management pipeline run without credentials.

use std::collections::HashMap;

use chrono::{NaiveDateTime, Utc};
use opt_trade_core::{
    BrokerError, BrokerGateway, BrokerOrder, BrokerOrderKind, BrokerPosition, Candle,
    InstrumentRow, MarginSummary, OrderKind, OrderModify, OrderRequest, OrderSide, OrderStatus,
};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Default)]
struct PaperState {
    next_id: u64,
    orders: Vec<BrokerOrder>,
    positions: HashMap<i64, BrokerPosition>,
    prices: HashMap<i64, Decimal>,
    candles: HashMap<i64, Vec<Candle>>,
    instruments: Vec<InstrumentRow>,
    tokens_by_symbol: HashMap<String, i64>,
    available_cash: Decimal,
}

pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState {
                available_cash: Decimal::from(1_000_000),
                ..PaperState::default()
            }),
        }
    }

    /// Maps a trading symbol to its token so fills can move positions.
    pub async fn register_symbol(&self, symbol: &str, token: i64) {
        let mut state = self.state.lock().await;
        state.tokens_by_symbol.insert(symbol.to_string(), token);
    }

    pub async fn set_price(&self, token: i64, price: Decimal) {
        let mut state = self.state.lock().await;
        state.prices.insert(token, price);
    }

    pub async fn set_cash(&self, cash: Decimal) {
        let mut state = self.state.lock().await;
        state.available_cash = cash;
    }

    pub async fn load_candles(&self, token: i64, candles: Vec<Candle>) {
        let mut state = self.state.lock().await;
        state.candles.insert(token, candles);
    }

    pub async fn load_instruments(&self, rows: Vec<InstrumentRow>) {
        let mut state = self.state.lock().await;
        state.instruments = rows;
    }

    /// Fires a resting stop order: completes it at its limit price and
    /// books the fill against the position.
    ///
    /// # Errors
    /// Returns `Rejected` if the order is unknown or not a pending stop.
    pub async fn trigger_stop(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let Some(order) = state
            .orders
            .iter_mut()
            .find(|order| order.order_id == order_id)
        else {
            return Err(BrokerError::Rejected(format!("unknown order {order_id}")));
        };
        if !order.is_pending_stop() {
            return Err(BrokerError::Rejected(format!(
                "order {order_id} is not a pending stop"
            )));
        }
        order.status = OrderStatus::Complete;
        order.average_price = order.price;

        let (token, side, quantity, price, symbol) = (
            order.token,
            order.side,
            i64::from(order.quantity),
            order.price,
            order.symbol.clone(),
        );
        apply_fill(&mut state, token, &symbol, side, quantity, price);
        Ok(())
    }

    /// Seeds an existing position, as if carried in from outside.
    pub async fn seed_position(&self, position: BrokerPosition) {
        let mut state = self.state.lock().await;
        state.positions.insert(position.token, position);
    }
}

fn apply_fill(
    state: &mut PaperState,
    token: i64,
    symbol: &str,
    side: OrderSide,
    quantity: i64,
    price: Decimal,
) {
    let signed = match side {
        OrderSide::Buy => quantity,
        OrderSide::Sell => -quantity,
    };
    let entry = state
        .positions
        .entry(token)
        .or_insert_with(|| BrokerPosition {
            token,
            symbol: symbol.to_string(),
            quantity: 0,
            average_price: Decimal::ZERO,
        });
    entry.quantity += signed;
    if entry.quantity != 0 && signed > 0 {
        entry.average_price = price;
    }
}

#[async_trait::async_trait]
impl BrokerGateway for PaperBroker {
    async fn place_order(&self, request: &OrderRequest) -> Result<String, BrokerError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let order_id = format!("PAPER-{}", state.next_id);
        let token = state
            .tokens_by_symbol
            .get(&request.symbol)
            .copied()
            .unwrap_or_default();

        let order = match request.kind {
            OrderKind::Market => {
                let price = state.prices.get(&token).copied().unwrap_or_default();
                apply_fill(
                    &mut state,
                    token,
                    &request.symbol,
                    request.side,
                    i64::from(request.quantity),
                    price,
                );
                BrokerOrder {
                    order_id: order_id.clone(),
                    token,
                    symbol: request.symbol.clone(),
                    side: request.side,
                    status: OrderStatus::Complete,
                    kind: BrokerOrderKind::Market,
                    quantity: request.quantity,
                    average_price: price,
                    price: Decimal::ZERO,
                    trigger_price: Decimal::ZERO,
                    placed_at: Utc::now(),
                }
            }
            OrderKind::StopLimit { trigger, limit } => BrokerOrder {
                order_id: order_id.clone(),
                token,
                symbol: request.symbol.clone(),
                side: request.side,
                status: OrderStatus::TriggerPending,
                kind: BrokerOrderKind::StopLimit,
                quantity: request.quantity,
                average_price: Decimal::ZERO,
                price: limit,
                trigger_price: trigger,
                placed_at: Utc::now(),
            },
        };

        info!(
            order_id = %order.order_id,
            symbol = %order.symbol,
            side = %order.side,
            "paper order placed"
        );
        state.orders.push(order);
        Ok(order_id)
    }

    async fn modify_order(
        &self,
        order_id: &str,
        change: &OrderModify,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let Some(order) = state
            .orders
            .iter_mut()
            .find(|order| order.order_id == order_id)
        else {
            return Err(BrokerError::Rejected(format!("unknown order {order_id}")));
        };
        if order.status != OrderStatus::TriggerPending {
            return Err(BrokerError::Rejected(format!(
                "order {order_id} cannot be modified in state {:?}",
                order.status
            )));
        }
        order.trigger_price = change.trigger;
        order.price = change.limit;
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let Some(order) = state
            .orders
            .iter_mut()
            .find(|order| order.order_id == order_id)
        else {
            return Err(BrokerError::Rejected(format!("unknown order {order_id}")));
        };
        if matches!(order.status, OrderStatus::Complete | OrderStatus::Cancelled) {
            return Err(BrokerError::Rejected(format!(
                "order {order_id} already final"
            )));
        }
        order.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        Ok(self.state.lock().await.orders.clone())
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self.state.lock().await.positions.values().cloned().collect())
    }

    async fn margins(&self) -> Result<MarginSummary, BrokerError> {
        Ok(MarginSummary {
            available_cash: self.state.lock().await.available_cash,
        })
    }

    async fn historical_candles(
        &self,
        token: i64,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Candle>, BrokerError> {
        use opt_trade_core::session::EXCHANGE_TZ;
        let state = self.state.lock().await;
        let Some(candles) = state.candles.get(&token) else {
            return Ok(Vec::new());
        };
        Ok(candles
            .iter()
            .filter(|candle| {
                let local = candle.ts.with_timezone(&EXCHANGE_TZ).naive_local();
                local >= from && local <= to
            })
            .cloned()
            .collect())
    }

    async fn instruments(&self, exchange: &str) -> Result<Vec<InstrumentRow>, BrokerError> {
        Ok(self
            .state
            .lock()
            .await
            .instruments
            .iter()
            .filter(|row| row.exchange == exchange)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn market_buy_fills_and_opens_position() {
        let broker = PaperBroker::new();
        broker.register_symbol("NIFTY2531722400CE", 11_926_274).await;
        broker.set_price(11_926_274, dec!(131.5)).await;

        let order_id = broker
            .place_order(&OrderRequest {
                symbol: "NIFTY2531722400CE".into(),
                side: OrderSide::Buy,
                quantity: 75,
                kind: OrderKind::Market,
            })
            .await
            .unwrap();

        let orders = broker.orders().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, order_id);
        assert_eq!(orders[0].status, OrderStatus::Complete);
        assert_eq!(orders[0].average_price, dec!(131.5));

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 75);
    }

    #[tokio::test]
    async fn stop_order_rests_until_triggered() {
        let broker = PaperBroker::new();
        broker.register_symbol("NIFTY2531722400CE", 11_926_274).await;
        broker.set_price(11_926_274, dec!(131.5)).await;
        broker
            .place_order(&OrderRequest {
                symbol: "NIFTY2531722400CE".into(),
                side: OrderSide::Buy,
                quantity: 75,
                kind: OrderKind::Market,
            })
            .await
            .unwrap();

        let stop_id = broker
            .place_order(&OrderRequest {
                symbol: "NIFTY2531722400CE".into(),
                side: OrderSide::Sell,
                quantity: 75,
                kind: OrderKind::StopLimit {
                    trigger: dec!(118.0),
                    limit: dec!(117.0),
                },
            })
            .await
            .unwrap();

        let orders = broker.orders().await.unwrap();
        assert!(orders[1].is_pending_stop());

        broker
            .modify_order(
                &stop_id,
                &OrderModify {
                    trigger: dec!(121.0),
                    limit: dec!(120.0),
                },
            )
            .await
            .unwrap();

        broker.trigger_stop(&stop_id).await.unwrap();
        let positions = broker.positions().await.unwrap();
        assert_eq!(positions[0].quantity, 0);

        let orders = broker.orders().await.unwrap();
        assert_eq!(orders[1].status, OrderStatus::Complete);
        assert_eq!(orders[1].average_price, dec!(120.0));
    }

    #[tokio::test]
    async fn cancel_rejects_final_orders() {
        let broker = PaperBroker::new();
        broker.register_symbol("X", 1).await;
        broker.set_price(1, dec!(10)).await;
        let order_id = broker
            .place_order(&OrderRequest {
                symbol: "X".into(),
                side: OrderSide::Buy,
                quantity: 1,
                kind: OrderKind::Market,
            })
            .await
            .unwrap();

        let error = broker.cancel_order(&order_id).await.unwrap_err();
        assert!(!error.is_transient());
    }
}
