// ─────────────────────────────────────────────────────────────────────────────
// order_manager.rs — single source of truth for live orders and balances
//
// Ground truth: analyst/bot/order_manager.py, read in full. Every formula
// below (fee-optimized quantity, truncate_base_quantity, convert_quantity,
// has_sufficient_quantity) is taken directly from that file.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;
use crate::exchange::ExchangeClient;
use crate::model::{CoinAmount, Order, OrderType, OutboundAccountPosition, Pair, Side};
use crate::repository::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSide {
    Base,
    Quote,
}

pub struct OrderManager {
    exchange: Arc<dyn ExchangeClient>,
    repository: Arc<Repository>,
    orders: RwLock<HashMap<Uuid, Order>>,
    account: RwLock<HashMap<String, CoinAmount>>,
    pairs: RwLock<HashMap<String, Pair>>,
}

impl OrderManager {
    pub fn new(exchange: Arc<dyn ExchangeClient>, repository: Arc<Repository>) -> Self {
        OrderManager {
            exchange,
            repository,
            orders: RwLock::new(HashMap::new()),
            account: RwLock::new(HashMap::new()),
            pairs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn setup(&self) -> Result<(), EngineError> {
        log::debug!("order manager setup");
        self.load_account().await?;
        self.load_pairs().await?;
        Ok(())
    }

    pub async fn load_account(&self) -> Result<(), EngineError> {
        let balances = self.exchange.get_account().await?;
        let mut account = self.account.write().await;
        account.clear();
        for (coin, free, _locked) in balances {
            account.insert(coin.clone(), CoinAmount { coin, quantity: free });
        }
        Ok(())
    }

    pub async fn load_pairs(&self) -> Result<(), EngineError> {
        let pairs = self.exchange.get_exchange_info().await?;
        let mut cache = self.pairs.write().await;
        cache.clear();
        for pair in pairs {
            cache.insert(pair.symbol(), pair);
        }
        Ok(())
    }

    pub async fn get_pair(&self, symbol: &str) -> Option<Pair> {
        self.pairs.read().await.get(symbol).cloned()
    }

    pub async fn get_order(&self, internal_id: Uuid) -> Option<Order> {
        self.orders.read().await.get(&internal_id).cloned()
    }

    /// Resolves an order by its exchange-assigned `(exchange_id, symbol)`
    /// key — the only identity an incoming execution report carries. Checks
    /// the live cache first, then falls back to Repository for orders that
    /// aren't held open in memory (e.g. already evicted on a prior fill).
    pub async fn resolve_by_exchange_id(&self, exchange_id: i64, symbol: &str) -> Result<Option<Order>, EngineError> {
        if let Some(order) = self.orders.read().await.values().find(|o| o.exchange_id == exchange_id && o.symbol == symbol).cloned() {
            return Ok(Some(order));
        }
        self.repository.get_order(exchange_id, symbol).await
    }

    pub async fn clear_order(&self, internal_id: Uuid) {
        log::info!("clear order {internal_id}");
        self.orders.write().await.remove(&internal_id);
    }

    pub async fn update_order(&self, mut order: Order, strategy_id: Option<Uuid>) -> Result<Order, EngineError> {
        log::info!("update order {} strategy_id={:?}", order.internal_id, strategy_id);
        if let Some(id) = strategy_id {
            order.strategy_id = Some(id);
        }
        let stored = self.repository.store_order(order).await?;
        self.orders.write().await.insert(stored.internal_id, stored.clone());
        Ok(stored)
    }

    pub async fn cancel_order(&self, order: &Order, strategy_id: Option<Uuid>) -> Result<Order, EngineError> {
        log::info!("cancel order {} strategy_id={:?}", order.internal_id, strategy_id);
        let cancelled = self.exchange.cancel_order(&order.symbol, order.exchange_id).await?;
        let mut cancelled = cancelled;
        cancelled.internal_id = order.internal_id;
        cancelled.strategy_id = order.strategy_id;
        let stored = self.update_order(cancelled, strategy_id).await?;
        self.orders.write().await.remove(&stored.internal_id);
        Ok(stored)
    }

    pub async fn update_account_with_live_data(&self, position: &OutboundAccountPosition) {
        log::info!("update account with live data");
        let mut acct = self.account.write().await;
        for balance in &position.balances {
            log::info!("update account coin {} = {}", balance.coin, balance.free);
            acct.insert(balance.coin.clone(), CoinAmount { coin: balance.coin.clone(), quantity: balance.free });
        }
    }

    pub async fn get_account_quantity(&self, pair: &Pair, side: PairSide) -> Decimal {
        let coin_name = if side == PairSide::Base { &pair.base } else { &pair.quote };
        let quantity = self.account.read().await.get(coin_name).map(|c| c.quantity).unwrap_or(Decimal::ZERO);
        log::info!("get account quantity {coin_name} => {quantity}");
        quantity
    }

    pub async fn has_sufficient_quantity(&self, pair: &Pair, quantity: Decimal, side: PairSide) -> bool {
        let account_quantity = self.get_account_quantity(pair, side).await;
        let sufficient = quantity <= account_quantity;
        log::info!("has sufficient quantity: {sufficient} => {} on {side:?}", pair.symbol());
        sufficient
    }

    /// `quotient = q // step; floored = quotient * step; if ceil and
    /// remainder > 0 then floored += step`.
    pub fn truncate_base_quantity(&self, pair: &Pair, quantity: Decimal, ceil: bool) -> Decimal {
        let floored = Self::truncate_base_quantity_raw(pair, quantity, ceil);
        log::debug!("floored quantity: {quantity} on {} => {floored}", pair.symbol());
        floored
    }

    fn truncate_base_quantity_raw(pair: &Pair, quantity: Decimal, ceil: bool) -> Decimal {
        let quotient = (quantity / pair.step_size).floor();
        let remainder = quantity - quotient * pair.step_size;
        let mut floored = quotient * pair.step_size;
        if ceil && remainder > Decimal::ZERO {
            floored += pair.step_size;
        }
        floored
    }

    /// `to=base => q / price; to=quote => q * price`.
    pub fn convert_quantity(&self, quantity: Decimal, price: Decimal, to: PairSide) -> Decimal {
        let converted = if to == PairSide::Base { quantity / price } else { quantity * price };
        log::debug!("convert: {quantity} {} {price} => {converted}", if to == PairSide::Base { "/" } else { "*" });
        converted
    }

    /// Compensates for the 0.1% trading fee deducted from the base asset on
    /// BUY fills, so the follow-up SELL does not oversell.
    pub async fn get_fee_optimized_quantity_available(&self, order: &Order) -> Result<Decimal, EngineError> {
        self.load_account().await?;
        let pair = self.get_pair(&order.symbol).await.ok_or(EngineError::NotFound)?;

        let order_quantity = order.executed_quantity;
        let min_order_quantity = order_quantity * Decimal::new(999, 3);
        let account_quantity = self.get_account_quantity(&pair, PairSide::Base).await;

        if order_quantity <= account_quantity {
            return Ok(order_quantity);
        }

        let remainder = account_quantity % min_order_quantity;
        Ok(min_order_quantity + (remainder / pair.step_size).floor())
    }

    pub async fn create_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        market_making: bool,
        reverse: bool,
        strategy_id: Option<Uuid>,
    ) -> Result<Order, EngineError> {
        let pair = self.get_pair(symbol).await.ok_or(EngineError::NotFound)?;
        let side = side.reverse(reverse);
        let quantity = self.truncate_base_quantity(&pair, quantity, true);

        let order = if market_making {
            let price = price.ok_or(EngineError::PriceMustBeSetOnMarketMakingOrder)?;
            log::debug!("create order: {side:?} {symbol}: {quantity} @ {price} #maker");
            self.exchange.create_order(symbol, side, OrderType::LimitMaker, quantity, Some(price)).await?
        } else {
            log::debug!("create order: {side:?} {symbol}: {quantity} #taker");
            self.exchange.create_order(symbol, side, OrderType::Market, quantity, None).await?
        };

        log::info!("created order: order_id={} strategy_id={:?}", order.internal_id, strategy_id);
        self.update_order(order, strategy_id).await
    }

    pub async fn sell_all_maker(&self, symbol: &str, price: Decimal, strategy_id: Option<Uuid>) -> Result<Order, EngineError> {
        let pair = self.get_pair(symbol).await.ok_or(EngineError::NotFound)?;
        let quantity = self.truncate_base_quantity(&pair, self.get_account_quantity(&pair, PairSide::Base).await, false);
        log::debug!("create order: SELL all {symbol}: {quantity} @ {price} #maker");
        let order = self.exchange.create_order(symbol, Side::Sell, OrderType::LimitMaker, quantity, Some(price)).await?;
        self.update_order(order, strategy_id).await
    }

    pub async fn sell_all_market(&self, symbol: &str, strategy_id: Option<Uuid>) -> Result<Order, EngineError> {
        let pair = self.get_pair(symbol).await.ok_or(EngineError::NotFound)?;
        let quantity = self.truncate_base_quantity(&pair, self.get_account_quantity(&pair, PairSide::Base).await, false);
        log::debug!("create order: SELL all {symbol}: {quantity} #taker");
        let order = self.exchange.create_order(symbol, Side::Sell, OrderType::Market, quantity, None).await?;
        self.update_order(order, strategy_id).await
    }

    pub async fn setup_order(&self, internal_id: Uuid) -> Result<Option<Order>, EngineError> {
        let order = self.repository.get_order_by_id(internal_id).await?;
        match order {
            Some(order) if order.is_open() => {
                log::info!("setup order: fetch and update {internal_id}");
                Ok(Some(self.fetch_and_update_order(order).await?))
            }
            other => {
                log::debug!("setup order: skip {} {internal_id}", if other.is_some() { "closed" } else { "not existing" });
                Ok(None)
            }
        }
    }

    async fn fetch_and_update_order(&self, order: Order) -> Result<Order, EngineError> {
        log::debug!("fetch and update order: internal_id={}", order.internal_id);
        let mut updated = self.exchange.get_order(&order.symbol, order.exchange_id).await?;
        updated.internal_id = order.internal_id;
        updated.strategy_id = order.strategy_id;
        let stored = self.repository.store_order(updated).await?;
        self.orders.write().await.insert(stored.internal_id, stored.clone());
        Ok(stored)
    }

    /// Refetches every cached order; used on user-data stream restart.
    pub async fn get_updated_orders(&self) -> Result<Vec<Order>, EngineError> {
        log::debug!("get updated orders");
        let cached: Vec<Order> = self.orders.read().await.values().cloned().collect();
        let mut changed = Vec::new();

        for order in cached {
            let updated = self.fetch_and_update_order(order.clone()).await?;
            if updated != order {
                changed.push(updated);
            }
        }

        log::info!("get updated orders: {} changes", changed.len());
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pair() -> Pair {
        Pair {
            base: "BTC".to_string(),
            quote: "USDT".to_string(),
            min_quantity: Decimal::ZERO,
            max_quantity: Decimal::new(1000, 0),
            step_size: Decimal::new(1, 5),
            min_notional: Decimal::ZERO,
            base_precision: 8,
            quote_precision: 8,
            ask_price: Decimal::ZERO,
            bid_price: Decimal::ZERO,
            ask_quantity: Decimal::ZERO,
            bid_quantity: Decimal::ZERO,
        }
    }

    #[test]
    fn truncate_base_quantity_floors_by_default() {
        let pair = sample_pair();
        let quantity = Decimal::new(123456, 5); // 1.23456
        let floored = OrderManager::truncate_base_quantity_raw(&pair, quantity, false);
        assert_eq!(floored, Decimal::new(123450, 5));
    }

    #[test]
    fn truncate_base_quantity_ceils_when_requested() {
        let pair = sample_pair();
        let quantity = Decimal::new(123456, 5); // 1.23456
        let ceiled = OrderManager::truncate_base_quantity_raw(&pair, quantity, true);
        assert_eq!(ceiled, Decimal::new(123460, 5));
    }

    #[test]
    fn convert_quantity_formula_matches_spec() {
        let price = Decimal::new(15000, 0);
        let qty = Decimal::new(2, 0);
        assert_eq!(qty / price, Decimal::new(2, 0) / Decimal::new(15000, 0));
        assert_eq!(qty * price, Decimal::new(30000, 0));
    }
}
