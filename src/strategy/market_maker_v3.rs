// ─────────────────────────────────────────────────────────────────────────────
// strategy/market_maker_v3.rs — the ladder market maker
//
// Ground truth: analyst/bot/strategies/market_maker/v3.py, read in full.
// Every numeric bound here (25-iteration buy-ladder scan, 20-iteration
// sell-back scan, 1s settle sleep on buy fill) comes directly from that
// file; spec §4.6 restates the same algorithm and is the reference used
// while writing this module.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mongodb::bson::{doc, Document};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{Order, Side, TickerSnapshot};
use crate::order_manager::{OrderManager, PairSide};
use crate::strategy::{HandlerOutcome, Strategy, StrategyState};

const BUY_LADDER_SCAN_BOUND: i64 = 25;
const SELL_BACK_SCAN_BOUND: i64 = 20;
const BUY_FILL_SETTLE: Duration = Duration::from_secs(1);

/// Concrete parameter struct (spec §9 redesign: replaces the variadic
/// strategy constructor). Deserialized from the persisted `args` document.
#[derive(Debug, Clone)]
pub struct MarketMakerV3Params {
    pub symbol: String,
    pub quote_quantity: Decimal,
    pub interval: Decimal,
    pub reverse: bool,
    pub cleanup_interval: ChronoDuration,
    pub max_buy_orders: usize,
    pub max_increase_step: usize,
    pub max_increase_retain_delta: ChronoDuration,
}

pub struct MarketMakerV3 {
    id: Uuid,
    created_at: DateTime<Utc>,
    state: StrategyState,
    params: MarketMakerV3Params,
    internal_buy_order_ids: HashSet<Uuid>,
    internal_sell_order_ids: HashSet<Uuid>,
    last_cleanup_at: DateTime<Utc>,
    last_price_timestamps: HashMap<Decimal, DateTime<Utc>>,
}

impl MarketMakerV3 {
    pub fn new(params: MarketMakerV3Params) -> Self {
        let now = Utc::now();
        MarketMakerV3 {
            id: Uuid::new_v4(),
            created_at: now,
            state: StrategyState::Running,
            params,
            internal_buy_order_ids: HashSet::new(),
            internal_sell_order_ids: HashSet::new(),
            last_cleanup_at: now,
            last_price_timestamps: HashMap::new(),
        }
    }

    fn buy_side(&self) -> Side {
        Side::Buy.reverse(self.params.reverse)
    }

    fn sell_side(&self) -> Side {
        Side::Sell.reverse(self.params.reverse)
    }

    fn floor_to_interval(&self, price: Decimal) -> Decimal {
        (price / self.params.interval).floor() * self.params.interval
    }

    async fn resting_orders_by_side(&self, order_manager: &OrderManager, ids: &HashSet<Uuid>) -> HashMap<Decimal, Order> {
        let mut by_price = HashMap::new();
        for id in ids {
            if let Some(order) = order_manager.get_order(*id).await {
                if order.is_open() {
                    by_price.insert(order.price, order);
                }
            }
        }
        by_price
    }

    /// `sell_back(qty, base_price, step)`: walks the sell-side grid upward
    /// from `base_price`, posting LIMIT_MAKER orders on the strategy's
    /// effective sell side until `qty` is placed or the scan bound is hit.
    async fn sell_back(
        &mut self,
        qty: Decimal,
        base_price: Decimal,
        step: Decimal,
        order_manager: &OrderManager,
    ) -> Result<HandlerOutcome, EngineError> {
        if qty <= Decimal::ZERO {
            return Ok(HandlerOutcome::Continue);
        }

        let mut would_match_failures = 0i64;

        for k in 0..SELL_BACK_SCAN_BOUND {
            let price = base_price + Decimal::from(k) * step;

            match order_manager
                .create_order(&self.params.symbol, self.sell_side(), qty, Some(price), true, false, Some(self.id))
                .await
            {
                Ok(order) => {
                    self.internal_sell_order_ids.insert(order.internal_id);
                    return Ok(HandlerOutcome::Continue);
                }
                Err(EngineError::OrderWouldMatch) => {
                    would_match_failures += 1;
                    if would_match_failures >= SELL_BACK_SCAN_BOUND {
                        return Ok(HandlerOutcome::Halt);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(HandlerOutcome::Halt)
    }

    /// `update_buy_side(bid_price)`: maintains the resting BUY ladder.
    async fn update_buy_side(&mut self, bid_price: Decimal, order_manager: &OrderManager) -> Result<HandlerOutcome, EngineError> {
        let floor_bid = self.floor_to_interval(bid_price);
        let pair = match order_manager.get_pair(&self.params.symbol).await {
            Some(pair) => pair,
            None => return Err(EngineError::NotFound),
        };

        let mut buys_by_price = self.resting_orders_by_side(order_manager, &self.internal_buy_order_ids).await;
        let sells_by_price = self.resting_orders_by_side(order_manager, &self.internal_sell_order_ids).await;

        let mut pending_resell = Decimal::ZERO;
        let mut set_buy_orders = 0usize;
        let mut would_match_failures = 0i64;

        for k in 0..BUY_LADDER_SCAN_BOUND {
            let price = floor_bid - Decimal::from(k) * self.params.interval;
            if price <= Decimal::ZERO {
                break;
            }

            // Self-cross suppression: the top rung is skipped when a sell
            // already sits one interval above it. Checked before any cancel
            // so a crossing top rung is left untouched rather than cancelled
            // and then abandoned.
            if k == 0 && sells_by_price.contains_key(&(price + self.params.interval)) {
                continue;
            }

            let raw_quantity = order_manager.convert_quantity(self.params.quote_quantity, price, PairSide::Base);
            let desired_quantity = order_manager.truncate_base_quantity(&pair, raw_quantity, true);

            if let Some(existing) = buys_by_price.get(&price) {
                if existing.requested_quantity == desired_quantity {
                    set_buy_orders += 1;
                    if set_buy_orders >= self.params.max_buy_orders {
                        break;
                    }
                    continue;
                }

                let cancelled = order_manager.cancel_order(existing, Some(self.id)).await?;
                pending_resell += cancelled.executed_quantity;
                self.internal_buy_order_ids.remove(&cancelled.internal_id);
                buys_by_price.remove(&price);
            }

            if !order_manager.has_sufficient_quantity(&pair, self.params.quote_quantity, PairSide::Quote).await {
                return Ok(HandlerOutcome::Halt);
            }

            match order_manager
                .create_order(&self.params.symbol, self.buy_side(), raw_quantity, Some(price), true, false, Some(self.id))
                .await
            {
                Ok(order) => {
                    self.internal_buy_order_ids.insert(order.internal_id);
                    set_buy_orders += 1;
                    if set_buy_orders >= self.params.max_buy_orders {
                        break;
                    }
                }
                Err(EngineError::OrderWouldMatch) => {
                    would_match_failures += 1;
                    if would_match_failures >= BUY_LADDER_SCAN_BOUND {
                        return Ok(HandlerOutcome::Halt);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        // Cancel every BUY whose price has been left behind above the
        // current floor (the ladder has shifted down).
        for (price, order) in buys_by_price.iter() {
            if *price > floor_bid {
                let cancelled = order_manager.cancel_order(order, Some(self.id)).await?;
                pending_resell += cancelled.executed_quantity;
                self.internal_buy_order_ids.remove(&cancelled.internal_id);
            }
        }

        if pending_resell > Decimal::ZERO {
            return self.sell_back(pending_resell, floor_bid + self.params.interval, self.params.interval, order_manager).await;
        }

        Ok(HandlerOutcome::Continue)
    }

    /// Circuit breaker against sustained rallies (or, under `reverse`,
    /// sustained selloffs on the mirrored side).
    fn safe_stop_check(&mut self, bid_price: Decimal) -> HandlerOutcome {
        if self.params.max_increase_step == 0 {
            return HandlerOutcome::Continue;
        }

        let now = Utc::now();
        let cutoff = now - self.params.max_increase_retain_delta;
        self.last_price_timestamps.retain(|_, seen_at| *seen_at >= cutoff);

        let bucket = self.floor_to_interval(bid_price);

        if self.last_price_timestamps.len() >= self.params.max_increase_step {
            if let Some(&max_bucket) = self.last_price_timestamps.keys().max() {
                if bid_price > max_bucket {
                    return HandlerOutcome::Halt;
                }
            }
        }

        self.last_price_timestamps.insert(bucket, now);
        HandlerOutcome::Continue
    }

    async fn cleanup_buy_side(&mut self, order_manager: &OrderManager) -> Result<HandlerOutcome, EngineError> {
        let now = Utc::now();
        if now < self.last_cleanup_at + self.params.cleanup_interval {
            return Ok(HandlerOutcome::Continue);
        }
        self.last_cleanup_at = now;

        let mut buys = self.resting_orders_by_side(order_manager, &self.internal_buy_order_ids).await;
        if buys.len() <= self.params.max_buy_orders {
            return Ok(HandlerOutcome::Continue);
        }

        let mut by_price_desc: Vec<(Decimal, Order)> = buys.drain().collect();
        by_price_desc.sort_by(|a, b| b.0.cmp(&a.0));
        // The highest-priced rung is always kept (it's closest to the
        // market), so it's a stand-in for the current floor without
        // depending on a fresh ticker read.
        let top_price = by_price_desc[0].0;

        let mut pending_resell = Decimal::ZERO;
        for (_, order) in by_price_desc.into_iter().skip(self.params.max_buy_orders) {
            let cancelled = order_manager.cancel_order(&order, Some(self.id)).await?;
            pending_resell += cancelled.executed_quantity;
            self.internal_buy_order_ids.remove(&cancelled.internal_id);
        }

        if pending_resell > Decimal::ZERO {
            return self.sell_back(pending_resell, top_price + self.params.interval, self.params.interval, order_manager).await;
        }

        Ok(HandlerOutcome::Continue)
    }
}

#[async_trait]
impl Strategy for MarketMakerV3 {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &'static str {
        "market_maker"
    }

    fn version(&self) -> &'static str {
        "v3"
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn state(&self) -> StrategyState {
        self.state
    }

    fn set_state(&mut self, state: StrategyState) {
        self.state = state;
    }

    fn get_stream_names(&self) -> Vec<String> {
        vec![format!("{}@ticker", self.params.symbol.to_lowercase())]
    }

    async fn gatekeeping(&self, order_manager: &OrderManager) -> Result<(), EngineError> {
        let pair = order_manager.get_pair(&self.params.symbol).await.ok_or(EngineError::InvalidPairCoins(self.params.symbol.clone()))?;

        if self.params.quote_quantity <= Decimal::ZERO {
            return Err(EngineError::ExchangeError("quote_quantity must be positive".to_string()));
        }
        if self.params.interval <= Decimal::ZERO {
            return Err(EngineError::ExchangeError("interval must be positive".to_string()));
        }
        if self.params.max_buy_orders == 0 {
            return Err(EngineError::ExchangeError("max_buy_orders must be >= 1".to_string()));
        }

        let total_quote = self.params.quote_quantity * Decimal::from(self.params.max_buy_orders);
        if !order_manager.has_sufficient_quantity(&pair, total_quote, PairSide::Quote).await {
            return Err(EngineError::InsufficientFunds);
        }

        Ok(())
    }

    async fn setup(&mut self, _order_manager: &OrderManager) -> Result<(), EngineError> {
        Ok(())
    }

    async fn process_ticker_data(&mut self, ticker: &TickerSnapshot, order_manager: &OrderManager) -> Result<HandlerOutcome, EngineError> {
        if self.state != StrategyState::Running {
            return Ok(HandlerOutcome::Continue);
        }

        let outcome = self.update_buy_side(ticker.bid_price, order_manager).await?;
        if outcome != HandlerOutcome::Continue {
            return Ok(outcome);
        }

        let outcome = self.safe_stop_check(ticker.bid_price);
        if outcome != HandlerOutcome::Continue {
            return Ok(outcome);
        }

        self.cleanup_buy_side(order_manager).await
    }

    async fn process_order(&mut self, order: &Order, order_manager: &OrderManager) -> Result<HandlerOutcome, EngineError> {
        if !order.is_filled() {
            return Ok(HandlerOutcome::Continue);
        }

        if order.side == self.buy_side() {
            tokio::time::sleep(BUY_FILL_SETTLE).await;
            let qty = order_manager.get_fee_optimized_quantity_available(order).await?;
            order_manager.clear_order(order.internal_id).await;
            self.internal_buy_order_ids.remove(&order.internal_id);
            let outcome = self.sell_back(qty, order.price + self.params.interval, self.params.interval, order_manager).await?;
            Ok(outcome)
        } else if order.side == self.sell_side() {
            order_manager.clear_order(order.internal_id).await;
            self.internal_sell_order_ids.remove(&order.internal_id);
            Ok(HandlerOutcome::Continue)
        } else {
            Ok(HandlerOutcome::Continue)
        }
    }

    async fn stop(&mut self, order_manager: &OrderManager) -> Result<(), EngineError> {
        let buys = self.resting_orders_by_side(order_manager, &self.internal_buy_order_ids).await;
        for order in buys.values() {
            order_manager.cancel_order(order, Some(self.id)).await?;
        }
        self.internal_buy_order_ids.clear();
        self.state = StrategyState::Stopped;
        Ok(())
    }

    /// Cancels every open BUY, accumulates fills, and flattens any
    /// remaining inventory with a MARKET SELL.
    async fn terminate(&mut self, order_manager: &OrderManager) -> Result<(), EngineError> {
        let buys = self.resting_orders_by_side(order_manager, &self.internal_buy_order_ids).await;
        let mut pending_resell = Decimal::ZERO;

        for order in buys.values() {
            let cancelled = order_manager.cancel_order(order, Some(self.id)).await?;
            pending_resell += cancelled.executed_quantity;
        }
        self.internal_buy_order_ids.clear();

        if pending_resell > Decimal::ZERO {
            order_manager
                .create_order(&self.params.symbol, self.sell_side(), pending_resell, None, false, false, Some(self.id))
                .await?;
        }

        self.state = StrategyState::Stopped;
        Ok(())
    }

    fn to_document(&self) -> Document {
        doc! {
            "id": self.id.to_string(),
            "name": self.name(),
            "version": self.version(),
            "created_at": self.created_at.to_rfc3339(),
            "state": format!("{:?}", self.state),
            "args": {
                "symbol": self.params.symbol.clone(),
                "quote_quantity": self.params.quote_quantity.to_string(),
                "interval": self.params.interval.to_string(),
                "reverse": self.params.reverse,
                "cleanup_interval_secs": self.params.cleanup_interval.num_seconds(),
                "max_buy_orders": self.params.max_buy_orders as i64,
                "max_increase_step": self.params.max_increase_step as i64,
                "max_increase_retain_delta_secs": self.params.max_increase_retain_delta.num_seconds(),
            },
            "internal_buy_order_ids": self.internal_buy_order_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
            "internal_sell_order_ids": self.internal_sell_order_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
        }
    }
}

/// Registry constructor (spec §9 redesign): validates and rebuilds a
/// concrete `MarketMakerV3` from a persisted `args` document.
pub fn construct(args: &Document) -> Result<Box<dyn Strategy>, EngineError> {
    let get_str = |key: &str| args.get_str(key).map(|s| s.to_string()).map_err(|_| EngineError::ExchangeError(format!("missing {key}")));
    let get_decimal = |key: &str| -> Result<Decimal, EngineError> {
        get_str(key)?.parse().map_err(|_| EngineError::ExchangeError(format!("invalid decimal {key}")))
    };
    let get_i64 = |key: &str| args.get_i64(key).map_err(|_| EngineError::ExchangeError(format!("missing {key}")));

    let params = MarketMakerV3Params {
        symbol: get_str("symbol")?,
        quote_quantity: get_decimal("quote_quantity")?,
        interval: get_decimal("interval")?,
        reverse: args.get_bool("reverse").unwrap_or(false),
        cleanup_interval: ChronoDuration::seconds(get_i64("cleanup_interval_secs")?),
        max_buy_orders: get_i64("max_buy_orders")? as usize,
        max_increase_step: get_i64("max_increase_step")? as usize,
        max_increase_retain_delta: ChronoDuration::seconds(get_i64("max_increase_retain_delta_secs")?),
    };

    if params.interval <= Decimal::ZERO || params.quote_quantity <= Decimal::ZERO || params.max_buy_orders == 0 {
        return Err(EngineError::ExchangeError("invalid MarketMakerV3 parameters".to_string()));
    }

    Ok(Box::new(MarketMakerV3::new(params)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> MarketMakerV3Params {
        MarketMakerV3Params {
            symbol: "BTCUSDT".to_string(),
            quote_quantity: Decimal::new(10, 0),
            interval: Decimal::new(500, 0),
            reverse: false,
            cleanup_interval: ChronoDuration::minutes(5),
            max_buy_orders: 3,
            max_increase_step: 10,
            max_increase_retain_delta: ChronoDuration::hours(1),
        }
    }

    #[test]
    fn floor_to_interval_rounds_down_to_nearest_rung() {
        let mm = MarketMakerV3::new(params());
        assert_eq!(mm.floor_to_interval(Decimal::new(15237, 0)), Decimal::new(15000, 0));
    }

    #[test]
    fn safe_stop_trips_after_enough_distinct_buckets_above_max() {
        let mut mm = MarketMakerV3::new(params());
        // params() has interval=500; space bids a full interval apart so
        // each one falls in its own bucket and all 10 accumulate distinctly.
        let bids: Vec<i64> = (0..10).map(|i| 15_000 + i * 500).collect();
        for bid in &bids {
            let outcome = mm.safe_stop_check(Decimal::new(*bid, 0));
            assert_eq!(outcome, HandlerOutcome::Continue);
        }
        let outcome = mm.safe_stop_check(Decimal::new(20_000, 0));
        assert_eq!(outcome, HandlerOutcome::Halt);
    }

    #[test]
    fn safe_stop_disabled_when_max_increase_step_zero() {
        let mut p = params();
        p.max_increase_step = 0;
        let mut mm = MarketMakerV3::new(p);
        assert_eq!(mm.safe_stop_check(Decimal::new(999_999, 0)), HandlerOutcome::Continue);
    }

    #[test]
    fn buy_side_and_sell_side_swap_under_reverse() {
        let mut p = params();
        p.reverse = true;
        let mm = MarketMakerV3::new(p);
        assert_eq!(mm.buy_side(), Side::Sell);
        assert_eq!(mm.sell_side(), Side::Buy);
    }
}
