// ─────────────────────────────────────────────────────────────────────────────
// kline_cache.rs — minimal interface to the out-of-scope kline/analysis cache
//
// The historical kline/dataframe analysis pipeline and its Redis/file-backed
// cache adapter are out of scope (spec.md §1); this is only the seam the core
// depends on, shaped like a real cache so a Redis- or file-backed
// implementation can be dropped in later without touching ExchangeClient.
// Pattern grounded on the retrieval pack's file-backed cache
// (YuriAllexei-polypolypoly's `infrastructure/cache.rs`: HashMap + dirty flag
// + load/save), adapted to klines instead of market questions.
// ─────────────────────────────────────────────────────────────────────────────
use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::Kline;

/// Key: `(symbol, interval)`. Out-of-scope callers would fetch a cached
/// window before paging `ExchangeClient::get_klines`.
#[async_trait::async_trait]
pub trait KlineCache: Send + Sync {
    async fn get(&self, symbol: &str, interval: &str) -> Option<Vec<Kline>>;
    async fn put(&self, symbol: &str, interval: &str, klines: Vec<Kline>);
}

/// In-memory implementation; `file_cache_dir` in `Config` is reserved for a
/// file-backed variant following the same load/save shape as the pack's
/// `MarketCache`, not implemented here since no caller in this core needs it.
pub struct InMemoryKlineCache {
    entries: Mutex<HashMap<(String, String), Vec<Kline>>>,
}

impl InMemoryKlineCache {
    pub fn new() -> Self {
        InMemoryKlineCache { entries: Mutex::new(HashMap::new()) }
    }
}

impl Default for InMemoryKlineCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KlineCache for InMemoryKlineCache {
    async fn get(&self, symbol: &str, interval: &str) -> Option<Vec<Kline>> {
        self.entries.lock().unwrap().get(&(symbol.to_string(), interval.to_string())).cloned()
    }

    async fn put(&self, symbol: &str, interval: &str, klines: Vec<Kline>) {
        self.entries.lock().unwrap().insert((symbol.to_string(), interval.to_string()), klines);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = InMemoryKlineCache::new();
        assert!(cache.get("BTCUSDT", "1h").await.is_none());

        let kline = Kline {
            open_time: chrono::Utc::now(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            trades: 3,
        };
        cache.put("BTCUSDT", "1h", vec![kline.clone()]).await;

        let fetched = cache.get("BTCUSDT", "1h").await.unwrap();
        assert_eq!(fetched, vec![kline]);
    }
}
