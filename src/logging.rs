// Logging setup for host applications

use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};

/// Install a global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. Returns `false` if a subscriber
/// was already installed, so calling this more than once is harmless.
pub fn init_tracing(config: &Config) -> bool {
    let log_level = config.log_level.to_lowercase();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    let installed = match config.log_format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Text => builder.try_init().is_ok(),
    };

    if installed {
        tracing::debug!(level = %log_level, format = ?config.log_format, "Tracing initialized");
    }
    installed
}
