// ─────────────────────────────────────────────────────────────────────────────
// exchange.rs — signed/unsigned REST client
//
// Trait + concrete impl split kept from the teacher (ExchangeClient trait,
// LiveExchange impl). Operations, weights, and signing replaced wholesale:
// ground truth is analyst/adapters/binance.py BinanceAdapter, not the
// Hyperliquid /info and /exchange endpoints this file used to hit.
// ─────────────────────────────────────────────────────────────────────────────
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{classify_order_create_error, EngineError};
use crate::model::{Kline, Order, OrderSource, OrderStatus, OrderType, Pair, Side};
use crate::rate_governor::{RateGovernor, WeightSource, DEFAULT_WEIGHT_THRESHOLD};
use crate::signing::{sign_params, urlencode};

pub const POSSIBLE_INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

fn shift_delta(interval: &str) -> Result<ChronoDuration, EngineError> {
    match interval {
        "1M" => Ok(ChronoDuration::days(30)),
        "1w" => Ok(ChronoDuration::weeks(1)),
        _ => {
            if interval.len() < 2 {
                return Err(EngineError::InvalidInterval(interval.to_string()));
            }
            let (value, unit) = interval.split_at(interval.len() - 1);
            let n: i64 = value.parse().map_err(|_| EngineError::InvalidInterval(interval.to_string()))?;
            match unit {
                "d" => Ok(ChronoDuration::days(n)),
                "h" => Ok(ChronoDuration::hours(n)),
                "m" => Ok(ChronoDuration::minutes(n)),
                _ => Err(EngineError::InvalidInterval(interval.to_string())),
            }
        }
    }
}

/// Operations an ExchangeClient exposes; each takes a weight per the
/// protocol and passes through RateGovernor before issuing the request.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_server_time_and_weights(&self) -> Result<(DateTime<Utc>, i64), EngineError>;
    async fn get_account(&self) -> Result<Vec<(String, Decimal, Decimal)>, EngineError>;
    async fn get_exchange_info(&self) -> Result<Vec<Pair>, EngineError>;
    async fn get_book_ticker(&self) -> Result<Vec<Pair>, EngineError>;
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>, EngineError>;
    async fn create_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<Order, EngineError>;
    async fn get_order(&self, symbol: &str, exchange_id: i64) -> Result<Order, EngineError>;
    async fn list_orders(&self, symbol: &str) -> Result<Vec<Order>, EngineError>;
    async fn cancel_order(&self, symbol: &str, exchange_id: i64) -> Result<Order, EngineError>;
    async fn request_listen_key(&self) -> Result<String, EngineError>;
    async fn keep_alive_listen_key(&self, listen_key: &str) -> Result<(), EngineError>;
    async fn close_listen_key(&self, listen_key: &str) -> Result<(), EngineError>;
}

// ─── LiveExchange ───────────────────────────────────────────────────────────

struct TimeWeightSource {
    http: reqwest::Client,
    api_url: String,
}

#[async_trait]
impl WeightSource for TimeWeightSource {
    async fn fetch(&self) -> Result<(DateTime<Utc>, i64), EngineError> {
        let resp = self.http.get(format!("{}/api/v3/time", self.api_url)).send().await?;
        let weight = resp
            .headers()
            .get("x-mbx-used-weight-1m")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let body: Value = resp.json().await?;
        let server_time_ms = body.get("serverTime").and_then(Value::as_i64).unwrap_or(0);
        let server_time = DateTime::<Utc>::from_timestamp_millis(server_time_ms).unwrap_or_else(Utc::now);
        Ok((server_time, weight))
    }
}

pub struct LiveExchange {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    secret_key: String,
    governor: Arc<RateGovernor<TimeWeightSource>>,
}

impl LiveExchange {
    pub async fn new(api_url: String, api_key: String, secret_key: String) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        let source = TimeWeightSource { http: http.clone(), api_url: api_url.clone() };
        let (_, initial_weight) = source.fetch().await?;
        let governor = Arc::new(RateGovernor::new(source, DEFAULT_WEIGHT_THRESHOLD, initial_weight));

        Ok(LiveExchange { http, api_url, api_key, secret_key, governor })
    }

    fn timestamp_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn signed_query(&self, mut params: Vec<(&str, String)>) -> String {
        let ts = Self::timestamp_ms().to_string();
        params.push(("timestamp", ts));
        let encoded = urlencode(&params);
        let signature = sign_params(&self.secret_key, &encoded);
        format!("{encoded}&signature={signature}")
    }

    async fn get_signed(&self, path: &str, weight: i64, params: Vec<(&str, String)>) -> Result<Value, EngineError> {
        self.governor.reserve(weight).await?;
        let query = self.signed_query(params);
        let resp = self
            .http
            .get(format!("{}{}?{}", self.api_url, path, query))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        parse_response(resp).await
    }

    async fn post_signed(&self, path: &str, weight: i64, params: Vec<(&str, String)>) -> Result<Value, EngineError> {
        self.governor.reserve(weight).await?;
        let query = self.signed_query(params);
        let resp = self
            .http
            .post(format!("{}{}?{}", self.api_url, path, query))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        parse_response(resp).await
    }

    async fn delete_signed(&self, path: &str, weight: i64, params: Vec<(&str, String)>) -> Result<Value, EngineError> {
        self.governor.reserve(weight).await?;
        let query = self.signed_query(params);
        let resp = self
            .http
            .delete(format!("{}{}?{}", self.api_url, path, query))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        parse_response(resp).await
    }

    async fn get_unsigned(&self, path: &str, weight: i64) -> Result<Value, EngineError> {
        self.governor.reserve(weight).await?;
        let resp = self.http.get(format!("{}{}", self.api_url, path)).send().await?;
        parse_response(resp).await
    }
}

async fn parse_response(resp: reqwest::Response) -> Result<Value, EngineError> {
    let status = resp.status();
    let body: Value = resp.json().await?;
    if !status.is_success() {
        let code = body.get("code").and_then(Value::as_i64);
        let msg = body.get("msg").and_then(Value::as_str).unwrap_or("unknown exchange error");
        return Err(classify_order_create_error(code, msg));
    }
    Ok(body)
}

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

fn order_from_rest_json(body: &Value) -> Order {
    let now = Utc::now();
    Order {
        exchange_id: body.get("orderId").and_then(Value::as_i64).unwrap_or(0),
        internal_id: uuid::Uuid::new_v4(),
        strategy_id: None,
        symbol: body.get("symbol").and_then(Value::as_str).unwrap_or_default().to_string(),
        side: if body.get("side").and_then(Value::as_str) == Some("SELL") { Side::Sell } else { Side::Buy },
        order_type: order_type_from_str(body.get("type").and_then(Value::as_str).unwrap_or("LIMIT")),
        status: order_status_from_str(body.get("status").and_then(Value::as_str).unwrap_or("NEW")),
        price: decimal_field(body, "price"),
        stop_price: decimal_field(body, "stopPrice"),
        requested_quantity: decimal_field(body, "origQty"),
        executed_quantity: decimal_field(body, "executedQty"),
        time_in_force: body.get("timeInForce").and_then(Value::as_str).unwrap_or("GTC").to_string(),
        created_at: now,
        updated_at: now,
        source: OrderSource::FromRest,
    }
}

fn decimal_field(body: &Value, key: &str) -> Decimal {
    body.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::ZERO)
}

#[async_trait]
impl ExchangeClient for LiveExchange {
    async fn get_server_time_and_weights(&self) -> Result<(DateTime<Utc>, i64), EngineError> {
        let body = self.get_unsigned("/api/v3/time", 0).await?;
        let ms = body.get("serverTime").and_then(Value::as_i64).unwrap_or(0);
        let time = DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now);
        Ok((time, self.governor.current_weight().await))
    }

    async fn get_account(&self) -> Result<Vec<(String, Decimal, Decimal)>, EngineError> {
        let body = self.get_signed("/api/v3/account", 10, vec![]).await?;
        let balances = body.get("balances").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(balances
            .into_iter()
            .map(|b| {
                let coin = b.get("asset").and_then(Value::as_str).unwrap_or_default().to_string();
                (coin, decimal_field(&b, "free"), decimal_field(&b, "locked"))
            })
            .collect())
    }

    async fn get_exchange_info(&self) -> Result<Vec<Pair>, EngineError> {
        let body = self.get_unsigned("/api/v3/exchangeInfo", 10).await?;
        let symbols = body.get("symbols").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(symbols
            .into_iter()
            .filter_map(|s| {
                let base = s.get("baseAsset")?.as_str()?.to_string();
                let quote = s.get("quoteAsset")?.as_str()?.to_string();
                let filters = s.get("filters").and_then(Value::as_array).cloned().unwrap_or_default();
                let mut step_size = Decimal::ZERO;
                let mut min_qty = Decimal::ZERO;
                let mut max_qty = Decimal::ZERO;
                let mut min_notional = Decimal::ZERO;
                for f in filters {
                    match f.get("filterType").and_then(Value::as_str) {
                        Some("LOT_SIZE") => {
                            step_size = decimal_field(&f, "stepSize");
                            min_qty = decimal_field(&f, "minQty");
                            max_qty = decimal_field(&f, "maxQty");
                        }
                        Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                            min_notional = decimal_field(&f, "minNotional");
                        }
                        _ => {}
                    }
                }
                Some(Pair {
                    base,
                    quote,
                    min_quantity: min_qty,
                    max_quantity: max_qty,
                    step_size,
                    min_notional,
                    base_precision: s.get("baseAssetPrecision").and_then(Value::as_u64).unwrap_or(8) as u32,
                    quote_precision: s.get("quoteAssetPrecision").and_then(Value::as_u64).unwrap_or(8) as u32,
                    ask_price: Decimal::ZERO,
                    bid_price: Decimal::ZERO,
                    ask_quantity: Decimal::ZERO,
                    bid_quantity: Decimal::ZERO,
                })
            })
            .collect())
    }

    async fn get_book_ticker(&self) -> Result<Vec<Pair>, EngineError> {
        let body = self.get_unsigned("/api/v3/ticker/bookTicker", 2).await?;
        let entries = body.as_array().cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter_map(|e| {
                let symbol = e.get("symbol")?.as_str()?.to_string();
                Some(Pair {
                    base: symbol.clone(),
                    quote: String::new(),
                    min_quantity: Decimal::ZERO,
                    max_quantity: Decimal::ZERO,
                    step_size: Decimal::ZERO,
                    min_notional: Decimal::ZERO,
                    base_precision: 8,
                    quote_precision: 8,
                    ask_price: decimal_field(&e, "askPrice"),
                    bid_price: decimal_field(&e, "bidPrice"),
                    ask_quantity: decimal_field(&e, "askQty"),
                    bid_quantity: decimal_field(&e, "bidQty"),
                })
            })
            .collect())
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>, EngineError> {
        let epoch_2000: DateTime<Utc> = "2000-01-01T00:00:00Z".parse().unwrap();
        if start < epoch_2000 {
            return Err(EngineError::WrongDatetimeRange(start.to_rfc3339()));
        }
        if end < epoch_2000 {
            return Err(EngineError::WrongDatetimeRange(end.to_rfc3339()));
        }
        if !POSSIBLE_INTERVALS.contains(&interval) {
            return Err(EngineError::InvalidInterval(interval.to_string()));
        }

        let delta = shift_delta(interval)?;
        let shifted_start = start - delta;
        let shifted_end = end - delta;

        let mut klines = Vec::new();
        let mut start_time_ms = shifted_start.timestamp_millis();
        let end_time_ms = shifted_end.timestamp_millis();

        loop {
            self.governor.reserve(1).await?;
            let path = format!(
                "/api/v3/klines?symbol={symbol}&interval={interval}&startTime={start_time_ms}&endTime={end_time_ms}&limit=1000"
            );
            let resp = self.http.get(format!("{}{}", self.api_url, path)).send().await?;
            let body: Value = resp.json().await?;
            let rows = match body.as_array() {
                Some(rows) => rows.clone(),
                None => return Err(EngineError::ExchangeError(body.to_string())),
            };

            if rows.is_empty() {
                break;
            }

            let last_open_time = rows.last().and_then(|r| r.get(0)).and_then(Value::as_i64).unwrap_or(0);

            for row in &rows {
                klines.push(Kline {
                    open_time: DateTime::<Utc>::from_timestamp_millis(
                        row.get(0).and_then(Value::as_i64).unwrap_or(0),
                    )
                    .unwrap_or_else(Utc::now),
                    open: row.get(1).and_then(Value::as_str).and_then(|v| v.parse().ok()).unwrap_or(0.0),
                    high: row.get(2).and_then(Value::as_str).and_then(|v| v.parse().ok()).unwrap_or(0.0),
                    low: row.get(3).and_then(Value::as_str).and_then(|v| v.parse().ok()).unwrap_or(0.0),
                    close: row.get(4).and_then(Value::as_str).and_then(|v| v.parse().ok()).unwrap_or(0.0),
                    volume: row.get(5).and_then(Value::as_str).and_then(|v| v.parse().ok()).unwrap_or(0.0),
                    trades: row.get(8).and_then(Value::as_i64).unwrap_or(0),
                });
            }

            if last_open_time >= end_time_ms {
                break;
            }

            start_time_ms = last_open_time + 1000;
        }

        Ok(klines)
    }

    async fn create_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<Order, EngineError> {
        let side_str = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let type_str = match order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::LimitMaker => "LIMIT_MAKER",
        };

        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side_str.to_string()),
            ("type", type_str.to_string()),
            ("quantity", quantity.normalize().to_string()),
        ];
        if let Some(price) = price {
            if matches!(order_type, OrderType::LimitMaker | OrderType::Limit) {
                params.push(("price", price.normalize().to_string()));
            }
        }

        let body = self.post_signed("/api/v3/order", 1, params).await?;
        Ok(order_from_rest_json(&body))
    }

    async fn get_order(&self, symbol: &str, exchange_id: i64) -> Result<Order, EngineError> {
        let params = vec![("symbol", symbol.to_string()), ("orderId", exchange_id.to_string())];
        let body = self.get_signed("/api/v3/order", 2, params).await?;
        Ok(order_from_rest_json(&body))
    }

    async fn list_orders(&self, symbol: &str) -> Result<Vec<Order>, EngineError> {
        let params = vec![("symbol", symbol.to_string())];
        let body = self.get_signed("/api/v3/allOrders", 10, params).await?;
        let rows = body.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().map(order_from_rest_json).collect())
    }

    async fn cancel_order(&self, symbol: &str, exchange_id: i64) -> Result<Order, EngineError> {
        let params = vec![("symbol", symbol.to_string()), ("orderId", exchange_id.to_string())];
        let body = self.delete_signed("/api/v3/order", 1, params).await?;
        Ok(order_from_rest_json(&body))
    }

    async fn request_listen_key(&self) -> Result<String, EngineError> {
        self.governor.reserve(1).await?;
        let resp = self
            .http
            .post(format!("{}/api/v3/userDataStream", self.api_url))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let body: Value = resp.json().await?;
        Ok(body.get("listenKey").and_then(Value::as_str).unwrap_or_default().to_string())
    }

    async fn keep_alive_listen_key(&self, listen_key: &str) -> Result<(), EngineError> {
        self.governor.reserve(1).await?;
        self.http
            .put(format!("{}/api/v3/userDataStream?listenKey={}", self.api_url, listen_key))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Ok(())
    }

    async fn close_listen_key(&self, listen_key: &str) -> Result<(), EngineError> {
        self.governor.reserve(1).await?;
        self.http
            .delete(format!("{}/api/v3/userDataStream?listenKey={}", self.api_url, listen_key))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_delta_resolves_all_possible_intervals() {
        for interval in POSSIBLE_INTERVALS {
            assert!(shift_delta(interval).is_ok(), "interval {interval} should resolve");
        }
    }

    #[test]
    fn shift_delta_rejects_unknown_interval() {
        assert!(matches!(shift_delta("7x"), Err(EngineError::InvalidInterval(_))));
    }

    #[test]
    fn order_status_from_str_maps_known_values() {
        assert_eq!(order_status_from_str("FILLED"), OrderStatus::Filled);
        assert_eq!(order_status_from_str("CANCELED"), OrderStatus::Cancelled);
    }
}
