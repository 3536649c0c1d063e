pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod services;

pub use context::AppContext;
pub use error::{AssistantError, Result};
