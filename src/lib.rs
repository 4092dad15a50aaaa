/*!
minion: host-resident execution agent.

An authenticated HTTP control plane in front of a [`manager::CommandManager`]: callers start
shell commands, poll and list their status, terminate them, and create or remove file
groups beneath a configured base directory.

Modules:
- config: YAML/env configuration, frozen at startup
- errors: handler and startup error types
- manager: the command manager interface and the in-process implementation
- server: HTTP parsing, routing, authentication gate, offloading, handlers
- telemetry: tracing subscriber setup
*/

pub mod cli;
pub mod config;
pub mod errors;
pub mod manager;
pub mod server;
pub mod telemetry;

pub use config::Config;
pub use errors::{exit_code_for_startup_error, ApiError, ConfigError};
pub use manager::{CommandManager, CommandState, CommandStatus, LocalManager, Params, RunOptions};
pub use server::{serve, Server};
