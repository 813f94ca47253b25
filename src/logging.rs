//! Tracing subscriber setup

use crate::error::{Result, VoxError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_DIRECTIVE: &str = "voxrelay=debug,info";

/// Install the global subscriber; `RUST_LOG` overrides `default_directive`
///
/// Panics if a global subscriber is already set.
pub fn init(default_directive: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Test variant of [`init`]
///
/// Output goes through the test harness capture and an already-installed
/// subscriber is reported as an error.
pub fn try_init(default_directive: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .map_err(|e| VoxError::Config(format!("Logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        let _ = try_init(DEFAULT_DIRECTIVE);
        assert!(try_init(DEFAULT_DIRECTIVE).is_err());
    }
}
