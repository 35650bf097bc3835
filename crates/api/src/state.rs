//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use payflow_reconcile::store::PgWorkflowStore;
use payflow_reconcile::{ReconciliationEngine, WebhookReceiver};
use payflow_shared::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    /// Webhook receiver wired to the Postgres-backed engine
    pub receiver: Arc<WebhookReceiver<PgWorkflowStore>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let store = PgWorkflowStore::new(pool.clone());
        let engine = ReconciliationEngine::new(store);
        let receiver = Arc::new(WebhookReceiver::new(
            config.webhook_signing_secret.clone(),
            engine,
        ));

        Self {
            pool,
            config,
            receiver,
        }
    }
}
