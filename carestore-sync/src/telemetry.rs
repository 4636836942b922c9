//! Tracing subscriber setup for binaries embedding the store

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Install a global subscriber: human-readable by default, JSON when asked.
///
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing(verbose: bool, json: bool) -> anyhow::Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("carestore_sync={},carestore={},sqlx=warn", level, level).into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    Ok(())
}
