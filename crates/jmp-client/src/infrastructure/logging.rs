//! Structured logging set-up.

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber whose level is overridden by `RUST_LOG`.
///
/// `level` is the fallback directive used when `RUST_LOG` is unset or
/// invalid, normally [`crate::infrastructure::config::ClientSection::log_level`].
/// Returns `false` if a global subscriber was already installed, so calling
/// this more than once (e.g. from several tests) is harmless.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init("debug");
        assert!(!init("debug"), "second init must not install a subscriber");
    }
}
