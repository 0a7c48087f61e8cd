pub mod config;
pub mod error;
pub mod types;

pub use config::LedcamConfig;
pub use error::{LedcamError, Result};
pub use types::*;
