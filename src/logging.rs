//! Tracing subscriber setup for programs embedding the device

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `debug` or `info` depending on
/// `verbose`. Returns an error if a subscriber is already installed.
pub fn try_init(verbose: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
}

/// Like [`try_init`], ignoring an already installed subscriber
pub fn init(verbose: bool) {
    let _ = try_init(verbose);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        let _ = try_init(false);
        assert!(try_init(true).is_err());
        init(false);
    }
}
