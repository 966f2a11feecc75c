//! Tracing setup

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Result, ScoutError};

/// Install the global subscriber.
///
/// `RUST_LOG` is honored unless `verbose` is set. With `json` the output is
/// one JSON object per event.
pub fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("scout=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scout=info,warn"))
    };

    // Logs go to stderr; stdout carries command output.
    let text = (!json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });
    let structured = json.then(|| fmt::layer().json().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(structured)
        .try_init()
        .map_err(|e| ScoutError::Telemetry(e.to_string()))
}
