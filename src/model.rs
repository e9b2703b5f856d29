// ─────────────────────────────────────────────────────────────────────────────
// model.rs — shared data model
//
// All monetary quantities are rust_decimal::Decimal; floats are forbidden
// here (they remain acceptable only in the out-of-scope kline/analysis
// path — see Kline below).
// ─────────────────────────────────────────────────────────────────────────────
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Pair ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pair {
    pub base: String,
    pub quote: String,
    pub min_quantity: Decimal,
    pub max_quantity: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
    pub base_precision: u32,
    pub quote_precision: u32,
    pub ask_price: Decimal,
    pub bid_price: Decimal,
    pub ask_quantity: Decimal,
    pub bid_quantity: Decimal,
}

impl Pair {
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

// ─── CoinAmount ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinAmount {
    pub coin: String,
    pub quantity: Decimal,
}

// ─── Side ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Swaps the side when `state` is true; otherwise a no-op. Ground truth:
    /// order_manager.py Side.reverse.
    pub fn reverse(self, state: bool) -> Side {
        if state {
            match self {
                Side::Buy => Side::Sell,
                Side::Sell => Side::Buy,
            }
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    LimitMaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

/// Redesign (spec §9): a tagged sum instead of two inheriting types. Orders
/// constructed from a REST response and orders constructed from a
/// user-data execution report expose the same shape uniformly afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSource {
    FromRest,
    FromUserStream,
}

// ─── Order ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub exchange_id: i64,
    pub internal_id: Uuid,
    pub strategy_id: Option<Uuid>,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: Decimal,
    pub stop_price: Decimal,
    pub requested_quantity: Decimal,
    pub executed_quantity: Decimal,
    pub time_in_force: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source: OrderSource,
}

impl Order {
    pub fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    pub fn is_filled(&self) -> bool {
        matches!(self.status, OrderStatus::Filled)
    }

    /// Builds a brand-new Order from the account-order-creation flow, prior
    /// to the exchange assigning an id — filled in by the REST response.
    pub fn new_pending(symbol: String, side: Side, order_type: OrderType, quantity: Decimal, price: Decimal) -> Order {
        let now = Utc::now();
        Order {
            exchange_id: 0,
            internal_id: Uuid::new_v4(),
            strategy_id: None,
            symbol,
            side,
            order_type,
            status: OrderStatus::New,
            price,
            stop_price: Decimal::ZERO,
            requested_quantity: quantity,
            executed_quantity: Decimal::ZERO,
            time_in_force: "GTC".to_string(),
            created_at: now,
            updated_at: now,
            source: OrderSource::FromRest,
        }
    }
}

// ─── TickerSnapshot ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub last_price: Decimal,
    pub ask_price: Decimal,
    pub ask_quantity: Decimal,
    pub bid_price: Decimal,
    pub bid_quantity: Decimal,
    pub trades: i64,
}

// ─── AccountBalance / OutboundAccountPosition ──────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub coin: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundAccountPosition {
    pub update_time: DateTime<Utc>,
    pub balances: Vec<AccountBalance>,
}

/// Replaces the Python `isinstance` dispatch in bot.py's
/// `on_user_data_message_received` with an explicit enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UserDataEvent {
    Order(Order),
    AccountPosition(OutboundAccountPosition),
    Unhandled,
}

// ─── Kline (out-of-scope analysis path; floats acceptable here only) ──────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trades: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_symbol_concatenates_base_and_quote() {
        let pair = Pair {
            base: "BTC".to_string(),
            quote: "USDT".to_string(),
            min_quantity: Decimal::ZERO,
            max_quantity: Decimal::ZERO,
            step_size: Decimal::new(1, 5),
            min_notional: Decimal::ZERO,
            base_precision: 8,
            quote_precision: 8,
            ask_price: Decimal::ZERO,
            bid_price: Decimal::ZERO,
            ask_quantity: Decimal::ZERO,
            bid_quantity: Decimal::ZERO,
        };
        assert_eq!(pair.symbol(), "BTCUSDT");
    }

    #[test]
    fn side_reverse_swaps_only_when_requested() {
        assert_eq!(Side::Buy.reverse(false), Side::Buy);
        assert_eq!(Side::Buy.reverse(true), Side::Sell);
        assert_eq!(Side::Sell.reverse(true), Side::Buy);
    }

    #[test]
    fn order_is_open_and_is_filled_match_status() {
        let mut order = Order::new_pending(
            "BTCUSDT".to_string(),
            Side::Buy,
            OrderType::LimitMaker,
            Decimal::new(1, 2),
            Decimal::new(15000, 0),
        );
        assert!(order.is_open());
        assert!(!order.is_filled());

        order.status = OrderStatus::Filled;
        assert!(!order.is_open());
        assert!(order.is_filled());
    }
}
