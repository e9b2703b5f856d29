// ─────────────────────────────────────────────────────────────────────────────
// runner.rs — owns the three persistent tasks and the live strategy set
//
// Ground truth: original_source/analyst/bot/bot.py::Runner, read in full.
// Maintains the stream-name -> strategy-id index so incoming ticker events
// are dispatched only to the strategies that asked for that stream, and
// drives HandlerOutcome (the redesigned replacement for StrategyExit /
// StrategyHalt) into stop/terminate calls.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::Document;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EngineError;
use crate::market_stream::{MarketStream, StreamEvent};
use crate::model::UserDataEvent;
use crate::order_manager::OrderManager;
use crate::repository::Repository;
use crate::strategy::{self, HandlerOutcome, StrategyHandle, StrategyState};
use crate::user_data_stream::UserDataStream;

/// Delay between an order-fill event arriving and it being handed to the
/// owning strategy, so the exchange's own account-balance view has settled.
const ORDER_EVENT_SETTLE: Duration = Duration::from_millis(100);

pub struct Runner {
    order_manager: Arc<OrderManager>,
    repository: Arc<Repository>,
    market_stream: Arc<MarketStream>,
    user_data_stream: Arc<UserDataStream>,
    strategies: RwLock<HashMap<Uuid, Arc<StrategyHandle>>>,
    strategies_by_stream: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl Runner {
    pub fn new(
        order_manager: Arc<OrderManager>,
        repository: Arc<Repository>,
        market_stream: Arc<MarketStream>,
        user_data_stream: Arc<UserDataStream>,
    ) -> Self {
        Runner {
            order_manager,
            repository,
            market_stream,
            user_data_stream,
            strategies: RwLock::new(HashMap::new()),
            strategies_by_stream: RwLock::new(HashMap::new()),
        }
    }

    /// Loads every non-stopped strategy document and re-admits it. Called
    /// once before the persistent tasks start.
    pub async fn setup(&self) -> Result<(), EngineError> {
        self.order_manager.setup().await?;

        for doc in self.repository.list_running_strategy_documents().await? {
            let name = doc.get_str("name").map_err(|_| EngineError::ExchangeError("strategy document missing name".to_string()))?;
            let version = doc.get_str("version").map_err(|_| EngineError::ExchangeError("strategy document missing version".to_string()))?;
            let args = doc.get_document("args").map_err(|_| EngineError::ExchangeError("strategy document missing args".to_string()))?;

            match strategy::construct(name, version, args) {
                Ok(built) => {
                    let handle = Arc::new(StrategyHandle::new(built));
                    self.setup_strategy(handle).await?;
                }
                Err(e) => {
                    log::error!("failed to reconstruct strategy {name}:{version}: {e}");
                }
            }
        }

        Ok(())
    }

    async fn setup_strategy(&self, handle: Arc<StrategyHandle>) -> Result<(), EngineError> {
        self.market_stream.subscribe(&handle.stream_names).await?;

        let mut by_stream = self.strategies_by_stream.write().await;
        for stream in &handle.stream_names {
            by_stream.entry(stream.clone()).or_default().insert(handle.id);
        }
        drop(by_stream);

        self.strategies.write().await.insert(handle.id, handle);
        Ok(())
    }

    /// Deregisters a strategy and returns the streams that were orphaned by
    /// its removal (no other strategy still subscribed to them) — the
    /// caller is responsible for unsubscribing those, not every stream this
    /// strategy happened to use.
    async fn purge_strategy(&self, id: Uuid) -> Vec<String> {
        let handle = self.strategies.write().await.remove(&id);
        let mut orphaned = Vec::new();
        if let Some(handle) = handle {
            let mut by_stream = self.strategies_by_stream.write().await;
            for stream in &handle.stream_names {
                if let Some(ids) = by_stream.get_mut(stream) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        by_stream.remove(stream);
                        orphaned.push(stream.clone());
                    }
                }
            }
        }
        orphaned
    }

    /// Validates, constructs, persists, and admits a new strategy instance.
    pub async fn add_strategy(&self, name: &str, version: &str, args: &Document) -> (bool, String) {
        let built = match strategy::construct(name, version, args) {
            Ok(built) => built,
            Err(e) => return (false, e.to_string()),
        };

        if let Err(e) = built.gatekeeping(&self.order_manager).await {
            return (false, format!("gatekeeping failed: {e}"));
        }

        let handle = Arc::new(StrategyHandle::new(built));
        {
            let mut guard = handle.inner.lock().await;
            if let Err(e) = guard.setup(&self.order_manager).await {
                return (false, format!("setup failed: {e}"));
            }
        }

        let document = handle.inner.lock().await.to_document();
        if let Err(e) = self.repository.store_strategy_document(handle.id, document).await {
            return (false, format!("failed to persist strategy: {e}"));
        }

        match self.setup_strategy(handle.clone()).await {
            Ok(()) => (true, handle.id.to_string()),
            Err(e) => (false, format!("failed to subscribe streams: {e}")),
        }
    }

    /// Control-plane stop request: a no-op unless the strategy is currently
    /// `running`; otherwise marks it `stopping` and persists. Does not
    /// cancel resting orders or remove the strategy from dispatch — that is
    /// the `HandlerOutcome::Halt` path's job (see `halt_strategy`).
    pub async fn stop_strategy(&self, id: Uuid) -> (bool, String) {
        let handle = self.strategies.read().await.get(&id).cloned();
        let Some(handle) = handle else {
            return (false, "strategy not found".to_string());
        };

        let mut guard = handle.inner.lock().await;
        if guard.state() != StrategyState::Running {
            return (true, "nothing to do".to_string());
        }
        guard.set_state(StrategyState::Stopping);
        let document = guard.to_document();
        drop(guard);

        if let Err(e) = self.repository.store_strategy_document(id, document).await {
            return (false, e.to_string());
        }

        (true, "stopping".to_string())
    }

    /// Deletes a strategy's persisted record, removes it from the dispatch
    /// indices, and unsubscribes the streams it alone was using (a stream
    /// still shared with another strategy stays subscribed).
    pub async fn remove_strategy(&self, id: Uuid) -> (bool, String) {
        let orphaned = self.purge_strategy(id).await;
        if !orphaned.is_empty() {
            if let Err(e) = self.market_stream.unsubscribe(&orphaned).await {
                log::error!("failed to unsubscribe streams for strategy {id}: {e}");
            }
        }

        match self.repository.delete_strategy(id).await {
            Ok(()) => (true, "removed".to_string()),
            Err(e) => (false, e.to_string()),
        }
    }

    /// Cancels resting orders without flattening inventory, marks the
    /// strategy `stopped`, persists, and purges it from dispatch. Driven
    /// only by `HandlerOutcome::Halt` (a strategy-raised circuit breaker),
    /// not by the graceful control-plane `stop_strategy`.
    async fn halt_strategy(&self, id: Uuid) {
        let handle = self.strategies.read().await.get(&id).cloned();
        let Some(handle) = handle else { return };

        let mut guard = handle.inner.lock().await;
        if let Err(e) = guard.stop(&self.order_manager).await {
            log::error!("strategy {id} halt stop failed: {e}");
        }
        guard.set_state(StrategyState::Stopped);
        let document = guard.to_document();
        drop(guard);

        if let Err(e) = self.repository.store_strategy_document(id, document).await {
            log::error!("failed to persist halted strategy {id}: {e}");
        }

        self.purge_strategy(id).await;
    }

    async fn handle_outcome(&self, id: Uuid, outcome: HandlerOutcome) {
        match outcome {
            HandlerOutcome::Continue => {}
            HandlerOutcome::Halt => {
                log::warn!("strategy {id} halted");
                self.halt_strategy(id).await;
            }
            HandlerOutcome::Exit => {
                log::info!("strategy {id} exiting");
                if let Some(handle) = self.strategies.read().await.get(&id).cloned() {
                    let mut guard = handle.inner.lock().await;
                    if let Err(e) = guard.terminate(&self.order_manager).await {
                        log::error!("strategy {id} terminate failed: {e}");
                    }
                    guard.set_state(StrategyState::Stopped);
                    let document = guard.to_document();
                    drop(guard);
                    let _ = self.repository.store_strategy_document(id, document).await;
                }
                self.purge_strategy(id).await;
            }
        }
    }

    /// Drives the market data stream: dispatches each ticker to every
    /// strategy subscribed to that stream.
    pub async fn run_market_streams(self: Arc<Self>) -> Result<(), EngineError> {
        let market_stream = self.market_stream.clone();
        let this = self.clone();
        let this_restart = self.clone();

        market_stream
            .run(
                move |event| {
                    let this = this.clone();
                    async move {
                        if let StreamEvent::Ticker(symbol, ticker) = event {
                            let stream_name = format!("{}@ticker", symbol.to_lowercase());
                            let ids: Vec<Uuid> = this
                                .strategies_by_stream
                                .read()
                                .await
                                .get(&stream_name)
                                .map(|set| set.iter().copied().collect())
                                .unwrap_or_default();

                            for id in ids {
                                let handle = this.strategies.read().await.get(&id).cloned();
                                let Some(handle) = handle else { continue };
                                let outcome = {
                                    let mut guard = handle.inner.lock().await;
                                    guard.process_ticker_data(&ticker, &this.order_manager).await
                                };
                                match outcome {
                                    Ok(outcome) => this.handle_outcome(id, outcome).await,
                                    Err(e) => log::error!("strategy {id} ticker handling failed: {e}"),
                                }
                            }
                        }
                    }
                },
                move || {
                    let this = this_restart.clone();
                    async move {
                        if let Err(e) = this.order_manager.load_pairs().await {
                            log::error!("failed to reload pairs after market stream restart: {e}");
                        }
                    }
                },
            )
            .await
    }

    pub async fn keep_alive_user_data_stream(self: Arc<Self>) -> Result<(), EngineError> {
        self.user_data_stream.clone().run_keep_alive().await
    }

    /// Looks the order up by its `strategy_id`, optionally persists it, and
    /// hands it to the owning strategy's `process_order`.
    async fn process_order_to_strategy(&self, order: crate::model::Order, persist: bool) {
        let order = if persist {
            let strategy_id = order.strategy_id;
            match self.order_manager.update_order(order, strategy_id).await {
                Ok(stored) => stored,
                Err(e) => {
                    log::error!("failed to persist order update: {e}");
                    return;
                }
            }
        } else {
            order
        };

        let Some(strategy_id) = order.strategy_id else { return };
        let handle = self.strategies.read().await.get(&strategy_id).cloned();
        let Some(handle) = handle else { return };

        let outcome = {
            let mut guard = handle.inner.lock().await;
            guard.process_order(&order, &self.order_manager).await
        };
        match outcome {
            Ok(outcome) => self.handle_outcome(strategy_id, outcome).await,
            Err(e) => log::error!("strategy {strategy_id} order handling failed: {e}"),
        }
    }

    /// An execution report carries only the exchange's own `(exchange_id,
    /// symbol)` identity — it does not know the internal_id or strategy_id
    /// we assigned at creation. Resolve those against the stored order
    /// before the event can be routed to its owning strategy.
    async fn resolve_order_identity(&self, mut order: crate::model::Order) -> Option<crate::model::Order> {
        match self.order_manager.resolve_by_exchange_id(order.exchange_id, &order.symbol).await {
            Ok(Some(existing)) => {
                order.internal_id = existing.internal_id;
                order.strategy_id = existing.strategy_id;
                Some(order)
            }
            Ok(None) => {
                log::warn!(
                    "execution report for unknown order exchange_id={} symbol={}",
                    order.exchange_id,
                    order.symbol
                );
                None
            }
            Err(e) => {
                log::error!("failed to resolve order identity: {e}");
                None
            }
        }
    }

    async fn on_user_data_message_received(&self, event: UserDataEvent) {
        match event {
            UserDataEvent::Order(order) => {
                tokio::time::sleep(ORDER_EVENT_SETTLE).await;
                if let Some(order) = self.resolve_order_identity(order).await {
                    self.process_order_to_strategy(order, true).await;
                }
            }
            UserDataEvent::AccountPosition(position) => {
                self.order_manager.update_account_with_live_data(&position).await;
            }
            UserDataEvent::Unhandled => {}
        }
    }

    /// Refetches every cached order after a user-data stream reconnect and
    /// dispatches whatever changed — the orders are already persisted by
    /// `OrderManager::get_updated_orders`, so this does not persist again.
    async fn on_user_data_stream_restart(&self) {
        match self.order_manager.get_updated_orders().await {
            Ok(changed) => {
                for order in changed {
                    self.process_order_to_strategy(order, false).await;
                }
            }
            Err(e) => log::error!("failed to refresh orders after reconnect: {e}"),
        }
    }

    pub async fn run_user_data_stream(self: Arc<Self>) -> Result<(), EngineError> {
        let user_data_stream = self.user_data_stream.clone();
        let this = self.clone();
        let this_restart = self.clone();

        user_data_stream
            .run(
                move |event| {
                    let this = this.clone();
                    async move { this.on_user_data_message_received(event).await }
                },
                move || {
                    let this = this_restart.clone();
                    async move { this.on_user_data_stream_restart().await }
                },
            )
            .await
    }

    /// Spawns and joins the three persistent tasks: market data, user data,
    /// and the listen-key keep-alive loop. Any one exiting (they only exit
    /// on an unrecoverable transport error) tears down the others.
    pub async fn run(self: Arc<Self>) -> Result<(), EngineError> {
        self.setup().await?;

        let market_task = tokio::spawn(self.clone().run_market_streams());
        let user_data_task = tokio::spawn(self.clone().run_user_data_stream());
        let keep_alive_task = tokio::spawn(self.clone().keep_alive_user_data_stream());

        tokio::select! {
            res = market_task => res.map_err(|e| EngineError::ExchangeError(e.to_string()))??,
            res = user_data_task => res.map_err(|e| EngineError::ExchangeError(e.to_string()))??,
            res = keep_alive_task => res.map_err(|e| EngineError::ExchangeError(e.to_string()))??,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_event_settle_delay_matches_spec() {
        assert_eq!(ORDER_EVENT_SETTLE, Duration::from_millis(100));
    }
}
