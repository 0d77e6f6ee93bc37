use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use governor::{clock::DefaultClock, state::InMemoryState, Quota, RateLimiter};
use opt_trade_core::session::EXCHANGE_TZ;
use opt_trade_core::{
    BrokerError, BrokerGateway, BrokerOrder, BrokerOrderKind, BrokerPosition, Candle,
    InstrumentRow, KiteConfig, MarginSummary, OrderKind, OrderModify, OrderRequest, OrderSide,
    OrderStatus, TimeBucket,
};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

type DirectRateLimiter =
    RateLimiter<governor::state::direct::NotKeyed, InMemoryState, DefaultClock>;

/// REST gateway for a Kite-style brokerage API.
///
/// All methods rate-limit before dispatch and map failures onto the
/// engine's two error classes: transport problems and 5xx responses become
/// [`BrokerError::Transient`], everything the broker explicitly refused
/// becomes [`BrokerError::Rejected`].
pub struct KiteClient {
    http_client: Client,
    base_url: String,
    api_key: String,
    access_token: String,
    exchange: String,
    rate_limiter: Arc<DirectRateLimiter>,
}

impl KiteClient {
    #[must_use]
    pub fn new(config: &KiteConfig, exchange: String) -> Self {
        // Kite allows 10 requests per second; stay conservative at 3
        let quota = Quota::per_second(NonZeroU32::new(3).unwrap());
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        Self {
            http_client: Client::new(),
            base_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
            exchange,
            rate_limiter,
        }
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token)
    }

    async fn get_data(&self, endpoint: &str) -> Result<Value, BrokerError> {
        self.rate_limiter.until_ready().await;
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .http_client
            .get(&url)
            .header("X-Kite-Version", "3")
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(transport_error)?;
        parse_envelope(response).await
    }

    async fn send_form(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<Value, BrokerError> {
        self.rate_limiter.until_ready().await;
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .http_client
            .request(method, &url)
            .header("X-Kite-Version", "3")
            .header("Authorization", self.auth_header())
            .form(form)
            .send()
            .await
            .map_err(transport_error)?;
        parse_envelope(response).await
    }
}

fn transport_error(error: reqwest::Error) -> BrokerError {
    BrokerError::Transient(error.to_string())
}

/// Unwraps the `{status, data}` envelope every JSON endpoint returns.
async fn parse_envelope(response: reqwest::Response) -> Result<Value, BrokerError> {
    let status = response.status();
    let body: Value = response.json().await.map_err(transport_error)?;

    if status.is_success() {
        return Ok(body.get("data").cloned().unwrap_or(Value::Null));
    }

    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("no error message")
        .to_string();
    if status.is_server_error() {
        Err(BrokerError::Transient(message))
    } else {
        Err(BrokerError::Rejected(message))
    }
}

fn decimal_from(raw: f64) -> Decimal {
    Decimal::try_from(raw).unwrap_or_default()
}

/// Broker timestamps arrive as exchange-local wall-clock strings.
fn parse_local_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()?;
    naive
        .and_local_timezone(EXCHANGE_TZ)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    order_id: String,
    #[serde(default)]
    instrument_token: i64,
    tradingsymbol: String,
    transaction_type: String,
    status: String,
    order_type: String,
    quantity: u32,
    #[serde(default)]
    average_price: f64,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    trigger_price: f64,
    #[serde(default)]
    order_timestamp: Option<String>,
}

impl RawOrder {
    fn into_order(self) -> BrokerOrder {
        let side = if self.transaction_type == "SELL" {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let kind = match self.order_type.as_str() {
            "SL" | "SL-M" => BrokerOrderKind::StopLimit,
            "LIMIT" => BrokerOrderKind::Limit,
            _ => BrokerOrderKind::Market,
        };
        let placed_at = self
            .order_timestamp
            .as_deref()
            .and_then(parse_local_timestamp)
            .unwrap_or_else(Utc::now);

        BrokerOrder {
            order_id: self.order_id,
            token: self.instrument_token,
            symbol: self.tradingsymbol,
            side,
            status: OrderStatus::from(self.status.as_str()),
            kind,
            quantity: self.quantity,
            average_price: decimal_from(self.average_price),
            price: decimal_from(self.price),
            trigger_price: decimal_from(self.trigger_price),
            placed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    instrument_token: i64,
    tradingsymbol: String,
    quantity: i64,
    #[serde(default)]
    average_price: f64,
}

#[derive(Debug, Deserialize)]
struct RawInstrument {
    instrument_token: i64,
    tradingsymbol: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    expiry: String,
    #[serde(default)]
    strike: f64,
    #[serde(default)]
    instrument_type: String,
    #[serde(default)]
    exchange: String,
}

#[async_trait::async_trait]
impl BrokerGateway for KiteClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<String, BrokerError> {
        let mut form = vec![
            ("exchange", self.exchange.clone()),
            ("tradingsymbol", request.symbol.clone()),
            ("transaction_type", request.side.to_string()),
            ("quantity", request.quantity.to_string()),
            ("product", "MIS".to_string()),
            ("validity", "DAY".to_string()),
        ];
        match request.kind {
            OrderKind::Market => form.push(("order_type", "MARKET".to_string())),
            OrderKind::StopLimit { trigger, limit } => {
                form.push(("order_type", "SL".to_string()));
                form.push(("trigger_price", trigger.to_string()));
                form.push(("price", limit.to_string()));
            }
        }

        let data = self
            .send_form(reqwest::Method::POST, "/orders/regular", &form)
            .await?;
        data.get("order_id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| BrokerError::Transient("order response missing order_id".to_string()))
    }

    async fn modify_order(
        &self,
        order_id: &str,
        change: &OrderModify,
    ) -> Result<(), BrokerError> {
        let form = vec![
            ("order_type", "SL".to_string()),
            ("trigger_price", change.trigger.to_string()),
            ("price", change.limit.to_string()),
        ];
        self.send_form(
            reqwest::Method::PUT,
            &format!("/orders/regular/{order_id}"),
            &form,
        )
        .await?;
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.send_form(
            reqwest::Method::DELETE,
            &format!("/orders/regular/{order_id}"),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        let data = self.get_data("/orders").await?;
        let raw: Vec<RawOrder> = serde_json::from_value(data)
            .map_err(|e| BrokerError::Transient(format!("malformed orders response: {e}")))?;
        Ok(raw.into_iter().map(RawOrder::into_order).collect())
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let data = self.get_data("/portfolio/positions").await?;
        let day = data.get("day").cloned().unwrap_or(Value::Null);
        let raw: Vec<RawPosition> = serde_json::from_value(day)
            .map_err(|e| BrokerError::Transient(format!("malformed positions response: {e}")))?;
        Ok(raw
            .into_iter()
            .map(|p| BrokerPosition {
                token: p.instrument_token,
                symbol: p.tradingsymbol,
                quantity: p.quantity,
                average_price: decimal_from(p.average_price),
            })
            .collect())
    }

    async fn margins(&self) -> Result<MarginSummary, BrokerError> {
        let data = self.get_data("/user/margins").await?;
        let net = data
            .get("equity")
            .and_then(|equity| equity.get("net"))
            .and_then(Value::as_f64)
            .ok_or_else(|| BrokerError::Transient("malformed margins response".to_string()))?;
        Ok(MarginSummary {
            available_cash: decimal_from(net),
        })
    }

    async fn historical_candles(
        &self,
        token: i64,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Candle>, BrokerError> {
        let endpoint = format!(
            "/instruments/historical/{token}/5minute?from={}&to={}",
            from.format("%Y-%m-%d %H:%M:%S"),
            to.format("%Y-%m-%d %H:%M:%S"),
        );
        let data = self.get_data(&endpoint).await?;
        let rows = data
            .get("candles")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_candle_row(token, &row) {
                Some(candle) => candles.push(candle),
                None => warn!(token, ?row, "skipping malformed candle row"),
            }
        }
        Ok(candles)
    }

    async fn instruments(&self, exchange: &str) -> Result<Vec<InstrumentRow>, BrokerError> {
        self.rate_limiter.until_ready().await;
        let url = format!("{}/instruments/{exchange}", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .header("X-Kite-Version", "3")
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(BrokerError::Transient(format!(
                "instrument dump returned {}",
                response.status()
            )));
        }
        let body = response.text().await.map_err(transport_error)?;

        let mut reader = csv::Reader::from_reader(body.as_bytes());
        let mut rows = Vec::new();
        for record in reader.deserialize::<RawInstrument>() {
            let raw = record
                .map_err(|e| BrokerError::Transient(format!("malformed instrument dump: {e}")))?;
            rows.push(InstrumentRow {
                token: raw.instrument_token,
                symbol: raw.tradingsymbol,
                name: raw.name,
                expiry: chrono::NaiveDate::parse_from_str(&raw.expiry, "%Y-%m-%d").ok(),
                strike: decimal_from(raw.strike),
                instrument_type: raw.instrument_type,
                exchange: raw.exchange,
            });
        }
        Ok(rows)
    }
}

/// Candle rows arrive as `[ts, open, high, low, close, volume]` arrays with
/// an RFC 3339 timestamp carrying the exchange offset.
fn parse_candle_row(token: i64, row: &Value) -> Option<Candle> {
    let fields = row.as_array()?;
    let ts_raw = fields.first()?.as_str()?;
    let ts = DateTime::parse_from_str(ts_raw, "%Y-%m-%dT%H:%M:%S%z")
        .ok()?
        .with_timezone(&Utc);

    let number = |index: usize| -> Option<Decimal> {
        let value = fields.get(index)?;
        if let Some(raw) = value.as_f64() {
            Decimal::try_from(raw).ok()
        } else {
            Decimal::from_str(value.as_str()?).ok()
        }
    };

    Some(Candle {
        token,
        bucket: TimeBucket::of(ts),
        ts,
        open: number(1)?,
        high: number(2)?,
        low: number(3)?,
        close: number(4)?,
    })
}
