use std::sync::Arc;

use tapir_core::TapService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TapService>,
}

impl AppState {
    pub fn new(service: Arc<TapService>) -> Self {
        Self { service }
    }
}
