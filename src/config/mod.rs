//! Configuration module for assistant-models
//!
//! Loads config from `$XDG_CONFIG_HOME/ai-assistant/config.toml` or the platform config dir.
//! Falls back to built-in defaults if the file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//!
//! # Example
//!
//! ```no_run
//! use assistant_models::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Catalog source: {:?}", config.models.catalog);
//! println!("Default temperature: {}", config.defaults.temperature);
//! ```

pub mod schema;

pub use schema::{CatalogSource, Config, ProviderConfig};
