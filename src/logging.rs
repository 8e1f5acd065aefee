//! Log output setup for binaries and examples built on this crate.

use tracing::Level;

/// Installs a global `tracing` subscriber that logs to stdout.
///
/// `verbose` lowers the maximum level from `INFO` to `DEBUG`.
/// Fails if a global subscriber was already installed.
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let max_level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(verbose)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}
