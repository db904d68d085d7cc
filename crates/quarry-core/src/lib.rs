//! quarry-core: configuration and naming rules shared by every Quarry crate.

pub mod config;
pub mod naming;

pub use config::{ConfigError, QuarryConfig};
pub use naming::{NameError, STANDARD_RESOURCE_CLASSES};
