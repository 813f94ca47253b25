pub mod audio;
pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod session;

pub use config::SessionConfig;
pub use error::{Result, VoxError};
