use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use opt_trade_core::Tick;
use rust_decimal::Decimal;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// Exchange segment carried in the low byte of an instrument token.
/// Indices stream a shorter packet without volume or open interest.
const SEGMENT_INDICES: i64 = 9;
const SEGMENT_CDS: i64 = 3;
const SEGMENT_BCD: i64 = 6;

/// One decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TickerEvent {
    Ticks(Vec<Tick>),
    /// An order postback arrived on the text channel.
    OrderUpdate,
    /// Server closed the connection; caller decides when to redial.
    Closed,
}

pub struct KiteTicker {
    ws_url: String,
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl KiteTicker {
    /// Creates a ticker client for the given websocket endpoint and
    /// credentials.
    #[must_use]
    pub fn new(ws_url: &str, api_key: &str, access_token: &str) -> Self {
        Self {
            ws_url: format!("{ws_url}?api_key={api_key}&access_token={access_token}"),
            stream: None,
        }
    }

    /// Connects to the ticker endpoint.
    ///
    /// # Errors
    /// Returns error if connection fails or server is unreachable
    pub async fn connect(&mut self) -> Result<()> {
        tracing::debug!("Attempting ticker connection");

        let (ws_stream, response) = connect_async(&self.ws_url).await.map_err(|e| {
            tracing::error!("Ticker connection error: {}", e);
            anyhow::anyhow!("Failed to connect ticker websocket: {e}")
        })?;

        self.stream = Some(ws_stream);
        tracing::info!("Ticker connected (HTTP status: {})", response.status());
        Ok(())
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Drops the current connection; the next `connect` redials.
    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    /// Subscribes tokens and switches them to full mode so packets carry
    /// open interest.
    ///
    /// # Errors
    /// Returns error if the websocket is not connected or send fails
    pub async fn subscribe(&mut self, tokens: &[i64]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        self.send_json(serde_json::json!({"a": "subscribe", "v": tokens}))
            .await?;
        self.send_json(serde_json::json!({"a": "mode", "v": ["full", tokens]}))
            .await
    }

    /// Unsubscribes tokens.
    ///
    /// # Errors
    /// Returns error if the websocket is not connected or send fails
    pub async fn unsubscribe(&mut self, tokens: &[i64]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        self.send_json(serde_json::json!({"a": "unsubscribe", "v": tokens}))
            .await
    }

    async fn send_json(&mut self, value: serde_json::Value) -> Result<()> {
        if let Some(stream) = &mut self.stream {
            stream.send(Message::Text(value.to_string())).await?;
            Ok(())
        } else {
            anyhow::bail!("ticker not connected")
        }
    }

    /// Receives the next meaningful event, skipping heartbeats.
    ///
    /// # Errors
    /// Returns error if the websocket is not connected or receive fails
    pub async fn next_event(&mut self) -> Result<Option<TickerEvent>> {
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("ticker not connected"))?;

            let Some(msg) = stream.next().await else {
                self.stream = None;
                return Ok(Some(TickerEvent::Closed));
            };

            match msg? {
                Message::Binary(payload) => {
                    // Single-byte frames are server heartbeats
                    if payload.len() <= 1 {
                        continue;
                    }
                    let ticks = parse_binary(&payload, Utc::now());
                    if !ticks.is_empty() {
                        return Ok(Some(TickerEvent::Ticks(ticks)));
                    }
                }
                Message::Text(text) => {
                    if let Some(event) = parse_text(&text) {
                        return Ok(Some(event));
                    }
                }
                Message::Ping(payload) => {
                    if let Some(stream) = &mut self.stream {
                        stream.send(Message::Pong(payload)).await?;
                    }
                }
                Message::Pong(_) => {
                    tracing::trace!("Received pong from server");
                }
                Message::Close(_) => {
                    tracing::warn!("Ticker websocket closed by server");
                    self.stream = None;
                    return Ok(Some(TickerEvent::Closed));
                }
                Message::Frame(_) => {}
            }
        }
    }
}

fn parse_text(text: &str) -> Option<TickerEvent> {
    let json: serde_json::Value = serde_json::from_str(text).ok()?;
    match json.get("type").and_then(serde_json::Value::as_str) {
        Some("order") => Some(TickerEvent::OrderUpdate),
        Some("error") => {
            tracing::warn!(payload = %text, "ticker error frame");
            None
        }
        _ => None,
    }
}

/// Decodes a binary market-data frame.
///
/// Layout: a 2-byte big-endian packet count, then for each packet a 2-byte
/// length followed by that many bytes. Packets are big-endian 4-byte fields
/// starting with the instrument token; prices are scaled integers.
fn parse_binary(payload: &[u8], received_at: DateTime<Utc>) -> Vec<Tick> {
    let Some(count) = read_u16(payload, 0) else {
        return Vec::new();
    };

    let mut ticks = Vec::with_capacity(count as usize);
    let mut offset = 2;
    for _ in 0..count {
        let Some(length) = read_u16(payload, offset) else {
            break;
        };
        offset += 2;
        let end = offset + length as usize;
        if end > payload.len() {
            break;
        }
        if let Some(tick) = parse_packet(&payload[offset..end], received_at) {
            ticks.push(tick);
        }
        offset = end;
    }
    ticks
}

fn parse_packet(packet: &[u8], received_at: DateTime<Utc>) -> Option<Tick> {
    let token = read_i32(packet, 0)?;
    let last_price = price_field(token, read_i32(packet, 4)?);

    let segment = token & 0xFF;
    if segment == SEGMENT_INDICES {
        // Index packets: ltp, high, low, open, close [, change, exchange ts]
        let timestamp = if packet.len() >= 32 {
            epoch_or(read_i32(packet, 28), received_at)
        } else {
            received_at
        };
        return Some(Tick {
            token,
            timestamp,
            last_price,
            open_interest: 0,
            volume_traded: 0,
            bid_volume: 0,
            offer_volume: 0,
        });
    }

    let mut tick = Tick {
        token,
        timestamp: received_at,
        last_price,
        open_interest: 0,
        volume_traded: 0,
        bid_volume: 0,
        offer_volume: 0,
    };
    if packet.len() >= 44 {
        tick.volume_traded = read_i32(packet, 16)?;
        tick.bid_volume = read_i32(packet, 20)?;
        tick.offer_volume = read_i32(packet, 24)?;
    }
    if packet.len() >= 64 {
        tick.open_interest = read_i32(packet, 48)?;
        tick.timestamp = epoch_or(read_i32(packet, 60), received_at);
    }
    Some(tick)
}

fn price_field(token: i64, raw: i64) -> Decimal {
    match token & 0xFF {
        SEGMENT_CDS => Decimal::new(raw, 7),
        SEGMENT_BCD => Decimal::new(raw, 4),
        _ => Decimal::new(raw, 2),
    }
}

fn epoch_or(secs: Option<i64>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    match secs {
        Some(s) if s > 0 => DateTime::from_timestamp(s, 0).unwrap_or(fallback),
        _ => fallback,
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let slice = bytes.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([slice[0], slice[1]]))
}

fn read_i32(bytes: &[u8], offset: usize) -> Option<i64> {
    let slice = bytes.get(offset..offset + 4)?;
    Some(i64::from(u32::from_be_bytes([
        slice[0], slice[1], slice[2], slice[3],
    ])))
}
