// ─────────────────────────────────────────────────────────────────────────────
// repository.rs — durable strategy/order persistence
//
// Ground truth: analyst/repositories/{order,strategy}.py, read in full.
// Backed by MongoDB (the `mongodb` crate) since spec §6 names Mongo
// configuration explicitly and no example repo in the retrieval pack
// solves durable persistence any other way — see DESIGN.md.
// ─────────────────────────────────────────────────────────────────────────────
use chrono::Utc;
use mongodb::bson::{doc, Document};
use mongodb::options::{ClientOptions, Credential, FindOptions};
use mongodb::{Client, Collection};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::Order;

pub struct OrderFilter {
    pub strategy_id: Option<Uuid>,
    pub symbol: Option<String>,
    pub statuses: Option<Vec<crate::model::OrderStatus>>,
    pub limit: Option<i64>,
}

impl Default for OrderFilter {
    fn default() -> Self {
        OrderFilter { strategy_id: None, symbol: None, statuses: None, limit: None }
    }
}

pub struct StrategyFilter {
    pub state: Option<String>,
    pub limit: Option<i64>,
}

impl Default for StrategyFilter {
    fn default() -> Self {
        StrategyFilter { state: None, limit: None }
    }
}

pub struct Repository {
    orders: Collection<Order>,
    strategies: Collection<Document>,
}

impl Repository {
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        database: &str,
        orders_collection: &str,
        strategies_collection: &str,
    ) -> Result<Self, EngineError> {
        let mut options = ClientOptions::parse(format!("mongodb://{host}:{port}"))
            .await
            .map_err(EngineError::from)?;
        if !username.is_empty() {
            options.credential = Some(
                Credential::builder().username(username.to_string()).password(password.to_string()).build(),
            );
        }
        let client = Client::with_options(options).map_err(EngineError::from)?;
        let db = client.database(database);

        Ok(Repository {
            orders: db.collection::<Order>(orders_collection),
            strategies: db.collection::<Document>(strategies_collection),
        })
    }

    // ─── Orders ─────────────────────────────────────────────────────────────

    /// Enforces the dual-uniqueness contract: `(exchange_id, symbol)` and
    /// `internal_id` must each be unique. Updates an existing record in
    /// place when `internal_id` already exists (this is what
    /// `OrderManager::update_order` relies on for create-or-update).
    pub async fn store_order(&self, order: Order) -> Result<Order, EngineError> {
        let existing_by_internal = self
            .orders
            .find_one(doc! {"internal_id": order.internal_id.to_string()}, None)
            .await?;

        if existing_by_internal.is_none() && order.exchange_id != 0 {
            let colliding = self
                .orders
                .find_one(doc! {"exchange_id": order.exchange_id, "symbol": &order.symbol}, None)
                .await?;
            if colliding.is_some() {
                return Err(EngineError::AlreadyExists);
            }
        }

        self.orders
            .replace_one(
                doc! {"internal_id": order.internal_id.to_string()},
                &order,
                mongodb::options::ReplaceOptions::builder().upsert(true).build(),
            )
            .await?;

        Ok(order)
    }

    pub async fn get_order_by_id(&self, internal_id: Uuid) -> Result<Option<Order>, EngineError> {
        Ok(self.orders.find_one(doc! {"internal_id": internal_id.to_string()}, None).await?)
    }

    pub async fn get_order(&self, exchange_id: i64, symbol: &str) -> Result<Option<Order>, EngineError> {
        Ok(self.orders.find_one(doc! {"exchange_id": exchange_id, "symbol": symbol}, None).await?)
    }

    pub async fn list_orders(&self, filter: OrderFilter) -> Result<Vec<Order>, EngineError> {
        let mut query = Document::new();
        if let Some(id) = filter.strategy_id {
            query.insert("strategy_id", id.to_string());
        }
        if let Some(symbol) = filter.symbol {
            query.insert("symbol", symbol);
        }
        if let Some(statuses) = filter.statuses {
            let names: Vec<String> = statuses.iter().map(|s| format!("{s:?}")).collect();
            query.insert("status", doc! {"$in": names});
        }

        let mut find_options = FindOptions::builder().sort(doc! {"created_at": -1}).build();
        if let Some(limit) = filter.limit {
            find_options.limit = Some(limit);
        }

        let mut cursor = self.orders.find(query, find_options).await?;
        let mut results = Vec::new();
        use futures_util::stream::TryStreamExt;
        while let Some(order) = cursor.try_next().await? {
            results.push(order);
        }
        results.reverse(); // restore ascending created_at after the desc-sorted "most recent N" fetch
        Ok(results)
    }

    pub async fn delete_order(&self, internal_id: Uuid) -> Result<(), EngineError> {
        self.orders.delete_one(doc! {"internal_id": internal_id.to_string()}, None).await?;
        Ok(())
    }

    pub async fn delete_all_orders(&self) -> Result<(), EngineError> {
        self.orders.delete_many(doc! {}, None).await?;
        Ok(())
    }

    // ─── Strategies ─────────────────────────────────────────────────────────
    //
    // Stored as raw BSON documents (`name`, `version`, `args`, plus the
    // common Strategy fields) rather than a concrete Rust type, since the
    // concrete shape of `args` varies per strategy version — the registry
    // (strategy/mod.rs) is what knows how to rebuild a concrete strategy
    // from this document.

    pub async fn store_strategy_document(&self, id: Uuid, document: Document) -> Result<(), EngineError> {
        let existing = self.strategies.find_one(doc! {"id": id.to_string()}, None).await?;
        if existing.is_none() {
            self.strategies.insert_one(&document, None).await?;
        } else {
            self.strategies
                .replace_one(doc! {"id": id.to_string()}, document, None)
                .await?;
        }
        Ok(())
    }

    pub async fn get_strategy_document(&self, id: Uuid) -> Result<Option<Document>, EngineError> {
        Ok(self.strategies.find_one(doc! {"id": id.to_string()}, None).await?)
    }

    pub async fn list_running_strategy_documents(&self) -> Result<Vec<Document>, EngineError> {
        let mut cursor = self.strategies.find(doc! {"state": {"$ne": "stopped"}}, None).await?;
        let mut results = Vec::new();
        use futures_util::stream::TryStreamExt;
        while let Some(doc) = cursor.try_next().await? {
            results.push(doc);
        }
        Ok(results)
    }

    /// General-purpose listing for the (out-of-scope) control-plane surface:
    /// optional `state` filter, optional `limit` of the most recent
    /// documents, returned in ascending `created_at` order per spec.md §4.7.
    pub async fn list_strategy_documents(&self, filter: StrategyFilter) -> Result<Vec<Document>, EngineError> {
        let mut query = Document::new();
        if let Some(state) = filter.state {
            query.insert("state", state);
        }

        let mut find_options = FindOptions::builder().sort(doc! {"created_at": -1}).build();
        if let Some(limit) = filter.limit {
            find_options.limit = Some(limit);
        }

        let mut cursor = self.strategies.find(query, find_options).await?;
        let mut results = Vec::new();
        use futures_util::stream::TryStreamExt;
        while let Some(doc) = cursor.try_next().await? {
            results.push(doc);
        }
        results.reverse();
        Ok(results)
    }

    pub async fn delete_strategy(&self, id: Uuid) -> Result<(), EngineError> {
        self.strategies.delete_one(doc! {"id": id.to_string()}, None).await?;
        Ok(())
    }

    pub async fn delete_all_strategies(&self) -> Result<(), EngineError> {
        self.strategies.delete_many(doc! {}, None).await?;
        Ok(())
    }
}

pub fn iso8601_now() -> String {
    // Timestamps stored in ISO-8601 UTC with microseconds stripped, per spec §6.
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso8601_now_has_no_fractional_seconds() {
        let ts = iso8601_now();
        assert!(!ts.contains('.'));
        assert!(ts.ends_with('Z'));
    }
}
