// ─────────────────────────────────────────────────────────────────────────────
// strategy/mod.rs — Strategy trait, state machine, and registration table
//
// Ground truth: analyst/bot/strategies/base.py (Strategy abstract base,
// StrategyState) and analyst/bot/strategies/registry.py (the metaclass this
// module replaces). Registry redesign is mandatory per spec §9: an explicit
// (name, version) -> constructor table populated at program start, instead
// of class-declaration side effects; unknown keys fail loudly.
// ─────────────────────────────────────────────────────────────────────────────
pub mod market_maker_v3;

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::Document;
use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{Order, TickerSnapshot};
use crate::order_manager::OrderManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyState {
    Running,
    Stopping,
    Stopped,
}

/// Redesign (spec §9): replaces the `StrategyExit`/`StrategyHalt` exceptions
/// with a plain enum the Runner matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Continue,
    Exit,
    Halt,
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn id(&self) -> Uuid;
    fn name(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn created_at(&self) -> DateTime<Utc>;
    fn state(&self) -> StrategyState;
    fn set_state(&mut self, state: StrategyState);
    fn get_stream_names(&self) -> Vec<String>;

    /// Validates the pair exists, funds are sufficient, parameters are
    /// positive. Runs once before a strategy is admitted by `Runner::add_strategy`.
    async fn gatekeeping(&self, order_manager: &OrderManager) -> Result<(), EngineError>;

    async fn setup(&mut self, order_manager: &OrderManager) -> Result<(), EngineError>;

    async fn process_ticker_data(
        &mut self,
        ticker: &TickerSnapshot,
        order_manager: &OrderManager,
    ) -> Result<HandlerOutcome, EngineError>;

    async fn process_order(&mut self, order: &Order, order_manager: &OrderManager) -> Result<HandlerOutcome, EngineError>;

    /// Voluntary halt (StrategyHalt path): cancels resting orders but does
    /// not try to flatten inventory.
    async fn stop(&mut self, order_manager: &OrderManager) -> Result<(), EngineError>;

    /// Voluntary exit (StrategyExit path): cancels resting orders and
    /// flattens any remaining inventory with a market order.
    async fn terminate(&mut self, order_manager: &OrderManager) -> Result<(), EngineError>;

    /// Serializes strategy-specific `args` for persistence; `name`/`version`
    /// come from the trait methods above.
    fn to_document(&self) -> Document;
}

/// One lock per strategy instance (not per type) — spec §5 is explicit that
/// "each strategy carries a mutex"; this departs from the original Python's
/// class-level `asyncio.Lock()`, which is shared across all instances of a
/// strategy type and looks like an oversimplification there.
pub struct StrategyHandle {
    pub id: Uuid,
    pub stream_names: Vec<String>,
    pub inner: tokio::sync::Mutex<Box<dyn Strategy>>,
}

impl StrategyHandle {
    pub fn new(strategy: Box<dyn Strategy>) -> Self {
        StrategyHandle { id: strategy.id(), stream_names: strategy.get_stream_names(), inner: tokio::sync::Mutex::new(strategy) }
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

pub type StrategyConstructor =
    fn(args: &Document) -> Result<Box<dyn Strategy>, EngineError>;

static REGISTRY: Lazy<StdMutex<HashMap<(&'static str, &'static str), StrategyConstructor>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

pub fn register(name: &'static str, version: &'static str, constructor: StrategyConstructor) {
    REGISTRY.lock().unwrap().insert((name, version), constructor);
}

/// Unknown `(name, version)` fails loudly at load, per spec §4.7.
pub fn construct(name: &str, version: &str, args: &Document) -> Result<Box<dyn Strategy>, EngineError> {
    let registry = REGISTRY.lock().unwrap();
    let key = registry.keys().find(|(n, v)| *n == name && *v == version).copied();
    match key {
        Some(key) => registry.get(&key).unwrap()(args),
        None => Err(EngineError::ExchangeError(format!("unknown strategy {name}:{version}"))),
    }
}

/// Called once at program start (see main.rs) to populate the table —
/// the explicit replacement for the metaclass's class-declaration side effect.
pub fn register_builtin_strategies() {
    register("market_maker", "v3", market_maker_v3::construct);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_unknown_strategy_fails_loudly() {
        let doc = Document::new();
        let err = construct("nonexistent", "v99", &doc).unwrap_err();
        assert!(matches!(err, EngineError::ExchangeError(_)));
    }
}
