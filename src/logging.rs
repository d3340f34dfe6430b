//! Log output for the `wpack` binary.
//!
//! The library only emits `tracing` events; installing a subscriber is up to the
//! application.

use tracing::Level;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Installs a stderr formatter. `RUST_LOG` wins over `default_level` when set.
pub fn setup_logger(default_level: Level) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(get_env_filter(default_level)),
        )
        .init();
}

fn get_env_filter(default_level: Level) -> EnvFilter {
    use std::env::{
        self,
        VarError::{NotPresent, NotUnicode},
    };
    match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(s) => EnvFilter::new(s),
        Err(NotPresent) => default_filter(default_level),
        Err(NotUnicode(_)) => EnvFilter::default(),
    }
}

fn default_filter(level: Level) -> EnvFilter {
    let level = level.to_string().to_lowercase();
    EnvFilter::new(format!("warn,worldpack={level},wpack={level}"))
}
