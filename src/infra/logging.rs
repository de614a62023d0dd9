//! Tracing subscriber setup for the binary.

use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "PATCHWRIGHT_LOG";

/// Filter for this run: `--verbose` wins, then `PATCHWRIGHT_LOG`, then `warn`.
pub fn build_filter(verbose: bool) -> EnvFilter
{
    if verbose
    {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber writing to stderr. Safe to call twice.
pub fn init(
    verbose: bool,
    no_color: bool,
)
{
    let _ = fmt()
        .with_env_filter(build_filter(verbose))
        .with_writer(std::io::stderr)
        .with_ansi(!no_color)
        .with_target(false)
        .try_init();
}
