//! Tracing bootstrap for processes embedding the bridge.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "info,skylink_core=debug";

/// Install a global `fmt` subscriber honouring `RUST_LOG`.
///
/// Fails instead of panicking when a subscriber is already installed.
pub fn init(default_filter: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(true)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_an_error() {
        // Another test may have installed a subscriber first; either way the
        // second call must not panic.
        let _ = init(DEFAULT_FILTER);
        assert!(init(DEFAULT_FILTER).is_err());
    }
}
