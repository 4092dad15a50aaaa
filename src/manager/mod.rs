/*!
Command Manager interface: the collaborator that owns command execution and state.

The HTTP layer only asks the manager to start, terminate or report on invocations by uid.
All methods are blocking and may be called concurrently from worker threads; implementations
synchronize internally.
*/

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

pub mod groups;
pub mod local;

pub use local::LocalManager;

/// Single-valued request parameters handed to a command.
pub type Params = BTreeMap<String, String>;

/// Uploaded file blobs keyed by their (validated) relative filename.
pub type Files = BTreeMap<String, Vec<u8>>;

pub const CREATE_GROUP: &str = "create_group";
pub const REMOVE_GROUP: &str = "remove_group";

/// Per-invocation extras beyond command and params.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Environment overlay for the spawned command.
    pub env: BTreeMap<String, String>,
    /// Exit codes treated as success in addition to 0.
    pub success_codes: Vec<i32>,
    pub files: Files,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Executing,
    Success,
    Error,
    Terminated,
}

impl CommandState {
    pub fn is_finished(self) -> bool {
        !matches!(self, CommandState::Executing)
    }
}

/// Status report for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStatus {
    pub uid: String,
    pub command: String,
    pub status: CommandState,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub start_ts: i64,
    #[serde(default)]
    pub finish_ts: Option<i64>,
    #[serde(default)]
    pub success_codes: Vec<i32>,
    #[serde(default)]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_output: Option<String>,
}

impl CommandStatus {
    pub fn new(uid: &str, command: &str, params: Params, success_codes: Vec<i32>) -> Self {
        CommandStatus {
            uid: uid.to_string(),
            command: command.to_string(),
            status: CommandState::Executing,
            pid: None,
            exit_code: None,
            start_ts: unix_now(),
            finish_ts: None,
            success_codes,
            params,
            output: None,
            error_output: None,
        }
    }

    /// Drop captured stdout/stderr (list view never carries them).
    pub fn strip_output(&mut self) {
        self.output = None;
        self.error_output = None;
    }

    /// Whether this entry belongs in an unfinished-commands listing.
    pub fn listed_for(&self, finish_ts_gte: Option<i64>) -> bool {
        match (self.status.is_finished(), finish_ts_gte, self.finish_ts) {
            (false, _, _) => true,
            (true, Some(gte), Some(ts)) => ts >= gte,
            _ => false,
        }
    }
}

pub trait CommandManager: Send + Sync + 'static {
    /// Start `command`; returns the freshly minted uid.
    fn run(&self, command: &str, params: Params, opts: RunOptions) -> anyhow::Result<String>;

    /// Ask a running invocation to stop. Returns once the manager has recorded the outcome.
    fn terminate(&self, uid: &str) -> anyhow::Result<()>;

    fn status(&self, uid: &str) -> anyhow::Result<CommandStatus>;

    /// Running invocations, plus those finished at or after `finish_ts_gte` when given.
    fn unfinished_commands(
        &self,
        finish_ts_gte: Option<i64>,
    ) -> anyhow::Result<BTreeMap<String, CommandStatus>>;
}

/// Mint a command uid: 128 random bits as lower-case hex.
pub fn mint_uid() -> anyhow::Result<String> {
    let mut buf = [0u8; 16];
    getrandom::getrandom(&mut buf)
        .map_err(|e| anyhow::anyhow!("failed to gather randomness for uid: {e}"))?;
    Ok(buf.iter().map(|b| format!("{b:02x}")).collect())
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as i64
}
