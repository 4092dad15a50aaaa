use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use minion::cli::{Cli, Command};
use minion::{exit_code_for_startup_error, Config, LocalManager};

fn run_doctor(config_path: Option<&Path>) -> ExitCode {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!("minion doctor");
    eprintln!("  version: v{}", version);
    eprintln!("  host: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
    eprintln!("  config file: {}", Config::resolve_path(config_path).display());

    let cfg = match Config::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("  config: invalid ({e})");
            return ExitCode::from(exit_code_for_startup_error(&e.into()));
        }
    };
    eprintln!("  listen: {}", cfg.bind_addr());
    eprintln!("  debug mode: {}", if cfg.common.debug { "on (authentication bypassed)" } else { "off" });
    eprintln!("  auth header: {}", cfg.auth.header);
    eprintln!(
        "  auth key: {}",
        if cfg.auth.key.is_empty() { "(unset; every authenticated request is refused)" } else { "(set, redacted)" }
    );
    eprintln!(
        "  workers: {} (offload delay {}s, finished commands kept {}s)",
        cfg.executor.workers, cfg.executor.offload_delay_secs, cfg.executor.retention_secs
    );
    match cfg.common.base_path.as_deref() {
        None => eprintln!("  base path: (unset; group management disabled)"),
        Some(bp) if Path::new(bp).is_dir() => eprintln!("  base path: {bp}"),
        Some(bp) => eprintln!("  base path: {bp} (warning: not an existing directory)"),
    }
    ExitCode::from(0)
}

fn run_serve(config_path: Option<&Path>) -> anyhow::Result<()> {
    let cfg = Config::load(config_path)?;
    if cfg.common.debug {
        tracing::warn!("debug mode enabled: authentication is bypassed for every request");
    }
    let manager = LocalManager::default().with_retention(cfg.executor.retention());
    minion::serve(Arc::new(cfg), Arc::new(manager))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    minion::telemetry::init(cli.verbose);

    match cli.command {
        Command::Doctor => run_doctor(cli.config.as_deref()),
        Command::Serve => match run_serve(cli.config.as_deref()) {
            Ok(()) => ExitCode::from(0),
            Err(e) => {
                error!("{e:#}");
                eprintln!("minion: {e:#}");
                ExitCode::from(exit_code_for_startup_error(&e))
            }
        },
    }
}
