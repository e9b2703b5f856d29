// ─────────────────────────────────────────────────────────────────────────────
// user_data_stream.rs — listen-key-keyed user-data WebSocket consumer
//
// Ground truth: spec §4.3 for dispatch/keep-alive cadence;
// analyst/bot/bot.py Runner.keep_alive_user_data_stream and
// on_user_data_stream_restart for the reconnect/listen-key-refresh
// discipline. Reconnect architecture adapted from the teacher's
// ingestor.rs reconnect loop.
// ─────────────────────────────────────────────────────────────────────────────
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::EngineError;
use crate::exchange::ExchangeClient;
use crate::model::{
    AccountBalance, Order, OrderSource, OrderStatus, OrderType, OutboundAccountPosition, Side, UserDataEvent,
};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_SLEEP: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn order_status_from_str(s: &str) -> OrderStatus {
    match s {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "CANCELLED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" => OrderStatus::Expired,
        _ => OrderStatus::New,
    }
}

fn order_type_from_str(s: &str) -> OrderType {
    match s {
        "MARKET" => OrderType::Market,
        "LIMIT_MAKER" => OrderType::LimitMaker,
        _ => OrderType::Limit,
    }
}

fn decimal_field(v: &Value, key: &str) -> Decimal {
    v.get(key).and_then(Value::as_str).and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO)
}

/// Decodes an `executionReport` payload into an Order tagged FromUserStream.
/// Field map per spec §6: i orderId, s symbol, X status, o type, S side,
/// p price, P stop price, f time-in-force, q requested qty, l executed qty
/// this event (accumulated separately — `z` carries cumulative filled qty
/// on the real exchange; we read `z` when present, falling back to `l`).
pub fn parse_execution_report(data: &Value) -> Option<Order> {
    let ts_ms = data.get("E").and_then(Value::as_i64)?;
    let now = DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now);
    let executed = if data.get("z").is_some() { decimal_field(data, "z") } else { decimal_field(data, "l") };

    Some(Order {
        exchange_id: data.get("i").and_then(Value::as_i64)?,
        internal_id: uuid::Uuid::new_v4(),
        strategy_id: None,
        symbol: data.get("s")?.as_str()?.to_string(),
        side: if data.get("S").and_then(Value::as_str) == Some("SELL") { Side::Sell } else { Side::Buy },
        order_type: order_type_from_str(data.get("o").and_then(Value::as_str).unwrap_or("LIMIT")),
        status: order_status_from_str(data.get("X").and_then(Value::as_str).unwrap_or("NEW")),
        price: decimal_field(data, "p"),
        stop_price: decimal_field(data, "P"),
        requested_quantity: decimal_field(data, "q"),
        executed_quantity: executed,
        time_in_force: data.get("f").and_then(Value::as_str).unwrap_or("GTC").to_string(),
        created_at: now,
        updated_at: now,
        source: OrderSource::FromUserStream,
    })
}

fn parse_account_position(data: &Value) -> Option<OutboundAccountPosition> {
    let ts_ms = data.get("u").and_then(Value::as_i64)?;
    let balances = data
        .get("B")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|b| {
                    Some(AccountBalance {
                        coin: b.get("a")?.as_str()?.to_string(),
                        free: decimal_field(b, "f"),
                        locked: decimal_field(b, "l"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(OutboundAccountPosition {
        update_time: DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now),
        balances,
    })
}

pub fn parse_user_data_event(data: &Value) -> UserDataEvent {
    match data.get("e").and_then(Value::as_str) {
        Some("executionReport") => parse_execution_report(data).map(UserDataEvent::Order).unwrap_or(UserDataEvent::Unhandled),
        Some("outboundAccountPosition") => {
            parse_account_position(data).map(UserDataEvent::AccountPosition).unwrap_or(UserDataEvent::Unhandled)
        }
        _ => UserDataEvent::Unhandled,
    }
}

pub struct UserDataStream {
    stream_base_url: String,
    exchange: Arc<dyn ExchangeClient>,
    listen_key: Mutex<Option<String>>,
    socket: Mutex<Option<WsStream>>,
}

impl UserDataStream {
    pub fn new(stream_base_url: String, exchange: Arc<dyn ExchangeClient>) -> Self {
        UserDataStream { stream_base_url, exchange, listen_key: Mutex::new(None), socket: Mutex::new(None) }
    }

    async fn open_fresh(&self) -> Result<(), EngineError> {
        let key = self.exchange.request_listen_key().await?;
        let url = format!("{}/{}", self.stream_base_url, key);
        let (ws, _) = connect_async(&url).await.map_err(|e| EngineError::TransientNetwork(e.to_string()))?;
        *self.socket.lock().await = Some(ws);
        *self.listen_key.lock().await = Some(key);
        Ok(())
    }

    /// Fires every 30 minutes on its own schedule, independent of message
    /// flow — matches Runner.keep_alive_user_data_stream.
    pub async fn run_keep_alive(&self) -> Result<(), EngineError> {
        loop {
            tokio::time::sleep(KEEP_ALIVE_INTERVAL).await;
            if let Some(key) = self.listen_key.lock().await.clone() {
                self.exchange.keep_alive_listen_key(&key).await?;
            }
        }
    }

    async fn receive_raw(&self) -> Result<Option<Value>, EngineError> {
        let mut guard = self.socket.lock().await;
        let ws = guard.as_mut().ok_or_else(|| EngineError::TransientNetwork("not connected".to_string()))?;

        match tokio::time::timeout(RECEIVE_TIMEOUT, ws.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(EngineError::TransientNetwork("stream closed".to_string())),
            Ok(Some(Err(e))) => Err(EngineError::TransientNetwork(e.to_string())),
            Ok(Some(Ok(Message::Text(text)))) => {
                let parsed: Value = serde_json::from_str(&text).map_err(|_| EngineError::TransientNetwork("bad json".to_string()))?;
                Ok(parsed.get("data").cloned().or(Some(parsed)))
            }
            Ok(Some(Ok(Message::Close(_)))) => Err(EngineError::TransientNetwork("connection closed".to_string())),
            Ok(Some(Ok(_))) => Ok(None),
        }
    }

    /// Runs the receive loop. `on_restart` is invoked once per reconnect
    /// (including the very first connect) so the caller can reconcile
    /// cached orders before new events are dispatched.
    pub async fn run<F, Fut, R, RFut>(self: Arc<Self>, mut on_event: F, mut on_restart: R) -> Result<(), EngineError>
    where
        F: FnMut(UserDataEvent) -> Fut,
        Fut: std::future::Future<Output = ()>,
        R: FnMut() -> RFut,
        RFut: std::future::Future<Output = ()>,
    {
        self.open_fresh().await?;
        on_restart().await;

        loop {
            match self.receive_raw().await {
                Ok(Some(data)) => on_event(parse_user_data_event(&data)).await,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("user data stream error, reconnecting: {e}");
                    tokio::time::sleep(RECONNECT_SLEEP).await;
                    self.open_fresh().await?;
                    on_restart().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_execution_report_into_order() {
        let data = serde_json::json!({
            "e": "executionReport", "E": 1_700_000_000_000i64, "i": 42, "s": "BTCUSDT",
            "S": "BUY", "o": "LIMIT_MAKER", "X": "FILLED", "p": "15000", "P": "0",
            "f": "GTC", "q": "0.001", "z": "0.001"
        });
        let event = parse_user_data_event(&data);
        match event {
            UserDataEvent::Order(order) => {
                assert_eq!(order.exchange_id, 42);
                assert!(order.is_filled());
            }
            _ => panic!("expected Order variant"),
        }
    }

    #[test]
    fn parses_account_position_balances() {
        let data = serde_json::json!({
            "e": "outboundAccountPosition", "u": 1_700_000_000_000i64,
            "B": [{"a": "BTC", "f": "1.5", "l": "0.0"}]
        });
        let event = parse_user_data_event(&data);
        match event {
            UserDataEvent::AccountPosition(pos) => {
                assert_eq!(pos.balances.len(), 1);
                assert_eq!(pos.balances[0].coin, "BTC");
            }
            _ => panic!("expected AccountPosition variant"),
        }
    }

    #[test]
    fn unknown_event_type_is_unhandled() {
        let data = serde_json::json!({"e": "balanceUpdate"});
        assert!(matches!(parse_user_data_event(&data), UserDataEvent::Unhandled));
    }
}
