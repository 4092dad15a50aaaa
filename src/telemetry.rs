use std::env;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Filter directive: MINION_LOG, then RUST_LOG, then a level picked by `verbose`.
fn filter_directive(verbose: bool) -> String {
    ["MINION_LOG", "RUST_LOG"]
        .iter()
        .filter_map(|k| env::var(k).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string())
}

/// Install the stderr fmt subscriber once per process. Later calls are no-ops.
pub fn init(verbose: bool) {
    if INIT.get().is_some() {
        return;
    }
    let directive = filter_directive(verbose);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("minion: invalid log filter {directive:?} ({e}); using info");
        EnvFilter::new("info")
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        eprintln!("minion: logging init skipped (global subscriber already set)");
    }
    let _ = INIT.set(());
}
