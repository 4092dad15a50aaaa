use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve the HTTP control plane until interrupted
    Serve,
    /// Print the effective configuration (auth key redacted) and check it
    Doctor,
}

#[derive(Parser, Debug)]
#[command(
    name = "minion",
    version,
    about = "Host-resident execution agent: start, poll, list and terminate shell commands over HTTP.",
    after_long_help = "Examples:\n  minion serve\n  minion --config ./minion.yaml --verbose serve\n  minion doctor\n\n",
    after_help = "\n"
)]
pub struct Cli {
    /// Configuration file (default: $MINION_CONFIG or /etc/minion/minion.yaml)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log at debug level unless MINION_LOG/RUST_LOG say otherwise
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}
