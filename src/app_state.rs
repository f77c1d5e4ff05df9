use sqlx::PgPool;
use std::sync::Arc;

use crate::services::jobs::JobService;
use crate::services::queue::DispatchQueue;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<dyn DispatchQueue>,
    pub jobs: JobService,
}

impl AppState {
    pub fn new(db: PgPool, queue: Arc<dyn DispatchQueue>, jobs: JobService) -> Self {
        Self { db, queue, jobs }
    }
}
