//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::pipeline::PipelineService;
use deadpool_postgres::Pool;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Database connection pool backing the durable archive
    pub db_pool: Pool,

    /// The evidence -> proposal pipeline engine
    pub pipeline: Arc<PipelineService>,
}

impl AppState {
    pub fn new(pool: Pool, pipeline: Arc<PipelineService>) -> Self {
        Self {
            db_pool: pool,
            pipeline,
        }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
