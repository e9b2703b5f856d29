// ─────────────────────────────────────────────────────────────────────────────
// mm-engine-rs: Binance spot ladder market maker
// ─────────────────────────────────────────────────────────────────────────────
mod config;
mod control_plane;
mod error;
mod exchange;
mod kline_cache;
mod market_stream;
mod model;
mod order_manager;
mod rate_governor;
mod repository;
mod runner;
mod signing;
mod strategy;
mod user_data_stream;

use std::sync::Arc;

use control_plane::ControlPlane;
use exchange::{ExchangeClient, LiveExchange};
use kline_cache::InMemoryKlineCache;
use market_stream::MarketStream;
use order_manager::OrderManager;
use repository::Repository;
use runner::Runner;
use user_data_stream::UserDataStream;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();
    log::info!("mm-engine-rs starting");

    let config = config::Config::from_env();

    let exchange: Arc<dyn ExchangeClient> = Arc::new(
        LiveExchange::new(
            config.exchange.api_url.clone(),
            config.exchange.api_key.clone(),
            config.exchange.secret_key.clone(),
        )
        .await
        .expect("failed to initialize exchange client"),
    );

    let repository = Arc::new(
        Repository::connect(
            &config.mongo.host,
            config.mongo.port,
            &config.mongo.username,
            &config.mongo.password,
            &config.mongo.database,
            config.orders_collection(),
            config.strategies_collection(),
        )
        .await
        .expect("failed to connect to mongo"),
    );

    let order_manager = Arc::new(OrderManager::new(exchange.clone(), repository.clone()));

    let market_stream = Arc::new(MarketStream::new(config.exchange.stream_url.clone()));
    let user_data_stream = Arc::new(UserDataStream::new(config.exchange.stream_url.clone(), exchange.clone()));

    strategy::register_builtin_strategies();

    // Out-of-scope collaborators this core only exposes a seam for: no HTTP
    // control plane or kline cache is wired up, but `runner` already
    // satisfies `ControlPlane` and a cache could be handed to the analysis
    // pipeline without touching anything above.
    let _kline_cache = InMemoryKlineCache::new();

    let runner = Arc::new(Runner::new(order_manager, repository, market_stream, user_data_stream));
    let _control_plane: Arc<dyn ControlPlane> = runner.clone();

    if let Err(e) = runner.run().await {
        log::error!("runner exited: {e}");
        std::process::exit(1);
    }
}
