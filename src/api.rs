//! HTTP API for the conversation orchestrator

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::runtime::ProductionOrchestrator;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ProductionOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: ProductionOrchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}
