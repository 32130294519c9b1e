//! Server state management.

use std::sync::Arc;

use hookrelay_core::{RelayConfig, RelayResult, RelayRuntime};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    runtime: Arc<RelayRuntime>,
}

impl AppState {
    pub fn new(runtime: Arc<RelayRuntime>) -> Self {
        Self { runtime }
    }

    /// Build a runtime from config without starting it.
    pub async fn from_config(config: RelayConfig) -> RelayResult<Self> {
        let runtime = RelayRuntime::new(config).await?;
        Ok(Self::new(Arc::new(runtime)))
    }

    pub fn runtime(&self) -> &Arc<RelayRuntime> {
        &self.runtime
    }
}
