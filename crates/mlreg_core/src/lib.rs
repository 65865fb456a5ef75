pub mod background;
pub mod config;
pub mod error;
pub mod logging;

pub use background::{TaskStatus, TrainingTask};
pub use config::RegistryConfig;
pub use error::{ErrorCategory, RegistryError, Result};
