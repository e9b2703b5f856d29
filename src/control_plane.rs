// ─────────────────────────────────────────────────────────────────────────────
// control_plane.rs — minimal interface the out-of-scope HTTP control plane
// depends on
//
// The interactive operator prompt and the JWT-authenticated HTTP CRUD surface
// over strategies are out of scope (spec.md §1); this trait is the seam they
// would call through. `Runner` implements it directly with its existing
// `add_strategy`/`stop_strategy`/`remove_strategy` methods — no HTTP server,
// routing, or JWT verification is implemented here.
// ─────────────────────────────────────────────────────────────────────────────
use async_trait::async_trait;
use mongodb::bson::Document;
use uuid::Uuid;

use crate::runner::Runner;

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn add_strategy(&self, name: &str, version: &str, args: &Document) -> (bool, String);
    async fn stop_strategy(&self, id: Uuid) -> (bool, String);
    async fn remove_strategy(&self, id: Uuid) -> (bool, String);
}

#[async_trait]
impl ControlPlane for Runner {
    async fn add_strategy(&self, name: &str, version: &str, args: &Document) -> (bool, String) {
        Runner::add_strategy(self, name, version, args).await
    }

    async fn stop_strategy(&self, id: Uuid) -> (bool, String) {
        Runner::stop_strategy(self, id).await
    }

    async fn remove_strategy(&self, id: Uuid) -> (bool, String) {
        Runner::remove_strategy(self, id).await
    }
}
