//! Tracing subscriber bootstrap.
//!
//! Library code only emits `tracing` events; binaries and tests that want
//! output call [`init`] once.

use tracing_subscriber::EnvFilter;

use crate::config::GeneralConfig;
use crate::error::{Result, TwinError};

/// Install a global `fmt` subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise from
/// `general.log_level` applied to the doppel crates (everything else at
/// `warn`). `general.log_format` selects `"text"` or `"json"` output.
///
/// Returns `Ok(false)` if a global subscriber was already installed.
///
/// # Errors
///
/// Returns [`TwinError::Config`] for an unknown log format.
pub fn init(config: &GeneralConfig) -> Result<bool> {
    let level = config.log_level.trim().to_ascii_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("doppel_core={level},doppel_llm={level},warn"))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false);

    let installed = match config.log_format.trim() {
        "text" | "" => builder.try_init().is_ok(),
        "json" => builder.json().try_init().is_ok(),
        other => {
            return Err(TwinError::Config(format!(
                "general.log_format must be \"text\" or \"json\", got \"{other}\""
            )));
        }
    };
    Ok(installed)
}
