use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{encryption::EncryptionService, queue::JobQueue, storage::ObjectStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub storage: Arc<dyn ObjectStore>,
    pub crypto: Arc<EncryptionService>,
    pub queue: Arc<dyn JobQueue>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        storage: Arc<dyn ObjectStore>,
        crypto: Arc<EncryptionService>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self { db, storage, crypto, queue }
    }
}
