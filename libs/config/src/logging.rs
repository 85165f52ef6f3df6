//! Tracing subscriber setup

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber filtered at `level`
///
/// `RUST_LOG`, when set, takes precedence over `level`. Calling this more than
/// once is harmless; later calls keep the subscriber already installed.
pub fn init_tracing(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log filter '{}'", level))?,
    };

    // already initialised by the host application or an earlier call
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        assert!(init_tracing("info").is_ok());
        assert!(init_tracing("request_router=debug").is_ok());
    }
}
