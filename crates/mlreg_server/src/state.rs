use mlreg_core::RegistryConfig;
use mlreg_learn::RegistryService;
use std::sync::Arc;

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RegistryService>,
    pub config: Arc<RegistryConfig>,
}

impl AppState {
    pub fn new(service: RegistryService, config: RegistryConfig) -> Self {
        Self {
            service: Arc::new(service),
            config: Arc::new(config),
        }
    }
}
