pub mod backend;
pub mod config;
pub mod error;
pub mod services;
pub mod stores;

pub use config::ChatConfig;
pub use error::{ChatError, Result};
