//! # schema-orm-core
//!
//! Foundation types shared by every schema-orm crate. This crate has no
//! dependency on the model layer and provides:
//!
//! - [`error`] - The [`OrmError`] taxonomy, [`ErrorKind`] discriminants and result alias
//! - [`settings`] - Workspace settings (databases, query defaults, logging)
//! - [`settings_loader`] - Loading settings from TOML/JSON files and the environment
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{ErrorKind, OrmError, OrmResult, ValidationError};
pub use settings::{QuerySettings, Settings};
