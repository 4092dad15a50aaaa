/*!
In-process command manager.

Shell commands run as `/bin/sh -c <command>` in their own process group with the
environment overlay applied; stdout/stderr are captured on reader threads and a waiter
thread records the outcome. `create_group`/`remove_group` run as built-ins on a thread.

State lives in memory only; a restart forgets every invocation. Finished entries are
evicted once they are older than the retention window, checked on every new start.
*/

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::groups;
use super::{
    mint_uid, unix_now, CommandManager, CommandState, CommandStatus, Params, RunOptions,
    CREATE_GROUP, REMOVE_GROUP,
};

pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const SHELL: &str = "/bin/sh";

struct Entry {
    status: CommandStatus,
    terminating: bool,
}

struct Shared {
    commands: Mutex<HashMap<String, Entry>>,
    changed: Condvar,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.commands.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record the final outcome of `uid` and wake terminate() waiters.
    fn finish(&self, uid: &str, exit_code: Option<i32>, output: String, error_output: String) {
        let mut table = self.table();
        if let Some(entry) = table.get_mut(uid) {
            let st = &mut entry.status;
            st.exit_code = exit_code;
            st.finish_ts = Some(unix_now());
            st.output = Some(output);
            st.error_output = Some(error_output);
            st.status = if entry.terminating {
                CommandState::Terminated
            } else {
                match exit_code {
                    Some(code) if code == 0 || st.success_codes.contains(&code) => {
                        CommandState::Success
                    }
                    _ => CommandState::Error,
                }
            };
            info!(uid, command = %st.command, exit_code = ?exit_code, status = ?st.status, "command finished");
        }
        drop(table);
        self.changed.notify_all();
    }
}

#[derive(Clone)]
pub struct LocalManager {
    shared: Arc<Shared>,
    terminate_grace: Duration,
    retention: Duration,
}

impl Default for LocalManager {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINATE_GRACE)
    }
}

impl LocalManager {
    pub fn new(terminate_grace: Duration) -> Self {
        LocalManager {
            shared: Arc::new(Shared {
                commands: Mutex::new(HashMap::new()),
                changed: Condvar::new(),
            }),
            terminate_grace,
            retention: DEFAULT_RETENTION,
        }
    }

    /// How long finished entries (with their captured output) stay queryable.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Drop finished entries whose finish time is at least `retention` ago.
    fn evict_expired(&self) {
        let cutoff = unix_now() - self.retention.as_secs() as i64;
        let mut table = self.shared.table();
        let before = table.len();
        table.retain(|_, e| match (e.status.status.is_finished(), e.status.finish_ts) {
            (true, Some(ts)) => ts > cutoff,
            _ => true,
        });
        let evicted = before - table.len();
        if evicted > 0 {
            debug!(evicted, "evicted finished commands");
        }
    }

    fn register(&self, status: CommandStatus) {
        let uid = status.uid.clone();
        self.shared.table().insert(
            uid,
            Entry {
                status,
                terminating: false,
            },
        );
    }

    fn spawn_shell(&self, uid: &str, command: &str, opts: &RunOptions) -> Result<Child> {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c")
            .arg(command)
            .envs(&opts.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        cmd.spawn()
            .with_context(|| format!("failed to spawn command {command:?} (uid {uid})"))
    }

    fn watch_child(&self, uid: String, mut child: Child) {
        let shared = self.shared.clone();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        thread::spawn(move || {
            let out_reader = thread::spawn(move || read_all(stdout));
            let err_reader = thread::spawn(move || read_all(stderr));
            let exit_code = match child.wait() {
                Ok(st) => st.code(),
                Err(e) => {
                    warn!(uid = %uid, error = %e, "failed to wait for command");
                    None
                }
            };
            let output = out_reader.join().unwrap_or_default();
            let error_output = err_reader.join().unwrap_or_default();
            shared.finish(&uid, exit_code, output, error_output);
        });
    }

    fn run_builtin(&self, uid: String, command: String, params: Params, opts: RunOptions) {
        let shared = self.shared.clone();
        thread::spawn(move || {
            let outcome = match command.as_str() {
                CREATE_GROUP => groups::create_group(&params, &opts.files),
                _ => groups::remove_group(&params),
            };
            match outcome {
                Ok(msg) => shared.finish(&uid, Some(0), msg, String::new()),
                Err(e) => shared.finish(&uid, Some(1), String::new(), format!("{e:#}")),
            }
        });
    }

    fn wait_finished(&self, uid: &str, timeout: Duration) -> bool {
        let table = self.shared.table();
        let (table, _) = self
            .shared
            .changed
            .wait_timeout_while(table, timeout, |t| {
                t.get(uid).is_some_and(|e| !e.status.status.is_finished())
            })
            .unwrap_or_else(|p| p.into_inner());
        table
            .get(uid)
            .map(|e| e.status.status.is_finished())
            .unwrap_or(true)
    }
}

fn read_all<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut r) = pipe {
        let _ = r.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn signal_group(pid: u32, sig: Signal) -> Result<()> {
    match killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow!("failed to send {sig:?} to process group {pid}: {e}")),
    }
}

impl CommandManager for LocalManager {
    fn run(&self, command: &str, params: Params, opts: RunOptions) -> Result<String> {
        self.evict_expired();
        let uid = mint_uid()?;
        let mut status = CommandStatus::new(&uid, command, params.clone(), opts.success_codes.clone());

        if command == CREATE_GROUP || command == REMOVE_GROUP {
            self.register(status);
            info!(uid = %uid, command, "builtin command started");
            self.run_builtin(uid.clone(), command.to_string(), params, opts);
            return Ok(uid);
        }

        let child = self.spawn_shell(&uid, command, &opts)?;
        status.pid = Some(child.id());
        self.register(status);
        info!(uid = %uid, command, pid = child.id(), "command started");
        self.watch_child(uid.clone(), child);
        Ok(uid)
    }

    fn terminate(&self, uid: &str) -> Result<()> {
        let pid = {
            let mut table = self.shared.table();
            let entry = table
                .get_mut(uid)
                .ok_or_else(|| anyhow!("unknown command uid {uid}"))?;
            if entry.status.status.is_finished() {
                return Ok(());
            }
            entry.terminating = true;
            entry.status.pid
        };

        let Some(pid) = pid else {
            // Built-ins cannot be interrupted; wait for them to settle
            self.wait_finished(uid, self.terminate_grace);
            return Ok(());
        };

        info!(uid, pid, "terminating command");
        signal_group(pid, Signal::SIGTERM)?;
        if self.wait_finished(uid, self.terminate_grace) {
            return Ok(());
        }
        warn!(uid, pid, "command ignored SIGTERM; sending SIGKILL");
        signal_group(pid, Signal::SIGKILL)?;
        if self.wait_finished(uid, self.terminate_grace) {
            Ok(())
        } else {
            Err(anyhow!("command {uid} did not exit after SIGKILL"))
        }
    }

    fn status(&self, uid: &str) -> Result<CommandStatus> {
        self.shared
            .table()
            .get(uid)
            .map(|e| e.status.clone())
            .ok_or_else(|| anyhow!("unknown command uid {uid}"))
    }

    fn unfinished_commands(
        &self,
        finish_ts_gte: Option<i64>,
    ) -> Result<BTreeMap<String, CommandStatus>> {
        Ok(self
            .shared
            .table()
            .iter()
            .filter(|(_, e)| e.status.listed_for(finish_ts_gte))
            .map(|(uid, e)| (uid.clone(), e.status.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_done(m: &LocalManager, uid: &str) -> CommandStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let st = m.status(uid).unwrap();
            if st.status.is_finished() || Instant::now() > deadline {
                return st;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn captures_output_and_env_overlay() {
        let m = LocalManager::default();
        let mut opts = RunOptions::default();
        opts.env.insert("GREETING".into(), "hi".into());
        let uid = m.run("echo $GREETING; echo oops >&2", Params::new(), opts).unwrap();
        let st = wait_done(&m, &uid);
        assert_eq!(st.status, CommandState::Success);
        assert_eq!(st.exit_code, Some(0));
        assert_eq!(st.output.as_deref(), Some("hi\n"));
        assert_eq!(st.error_output.as_deref(), Some("oops\n"));
        assert!(st.finish_ts.is_some());
    }

    #[test]
    fn success_codes_extend_zero() {
        let m = LocalManager::default();
        let opts = RunOptions {
            success_codes: vec![3],
            ..RunOptions::default()
        };
        let ok = m.run("exit 3", Params::new(), opts).unwrap();
        let bad = m.run("exit 4", Params::new(), RunOptions::default()).unwrap();
        assert_eq!(wait_done(&m, &ok).status, CommandState::Success);
        assert_eq!(wait_done(&m, &bad).status, CommandState::Error);
    }

    #[test]
    fn terminate_is_reflected_immediately() {
        let m = LocalManager::new(Duration::from_secs(2));
        let uid = m.run("sleep 30", Params::new(), RunOptions::default()).unwrap();
        assert_eq!(m.status(&uid).unwrap().status, CommandState::Executing);
        m.terminate(&uid).unwrap();
        let st = m.status(&uid).unwrap();
        assert_eq!(st.status, CommandState::Terminated);
        // Terminating a finished command is a no-op
        m.terminate(&uid).unwrap();
    }

    #[test]
    fn unknown_uid_is_an_error() {
        let m = LocalManager::default();
        let err = m.status("deadbeef").unwrap_err();
        assert_eq!(err.to_string(), "unknown command uid deadbeef");
        assert!(m.terminate("deadbeef").is_err());
    }

    #[test]
    fn unfinished_listing_honours_threshold() {
        let m = LocalManager::default();
        let quick = m.run("true", Params::new(), RunOptions::default()).unwrap();
        wait_done(&m, &quick);
        let slow = m.run("sleep 30", Params::new(), RunOptions::default()).unwrap();

        let running = m.unfinished_commands(None).unwrap();
        assert!(running.contains_key(&slow));
        assert!(!running.contains_key(&quick));

        let recent = m.unfinished_commands(Some(unix_now() - 60)).unwrap();
        assert!(recent.contains_key(&quick));
        m.terminate(&slow).unwrap();
    }

    #[test]
    fn finished_entries_expire_after_retention() {
        let m = LocalManager::default().with_retention(Duration::ZERO);
        let done = m.run("true", Params::new(), RunOptions::default()).unwrap();
        wait_done(&m, &done);
        let running = m.run("sleep 30", Params::new(), RunOptions::default()).unwrap();
        assert!(m.status(&done).is_err());
        // Running commands are never evicted
        m.run("true", Params::new(), RunOptions::default()).unwrap();
        assert_eq!(m.status(&running).unwrap().status, CommandState::Executing);
        m.terminate(&running).unwrap();
    }

    #[test]
    fn finished_entries_kept_within_retention() {
        let m = LocalManager::default();
        let done = m.run("true", Params::new(), RunOptions::default()).unwrap();
        wait_done(&m, &done);
        m.run("true", Params::new(), RunOptions::default()).unwrap();
        assert!(m.status(&done).unwrap().status.is_finished());
    }

    #[test]
    fn builtin_create_group() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("g1");
        let m = LocalManager::default();
        let mut params = Params::new();
        params.insert(groups::ROOT_DIR_PARAM.into(), root.display().to_string());
        let mut opts = RunOptions::default();
        opts.files.insert("a/b.txt".into(), b"data".to_vec());
        let uid = m.run(CREATE_GROUP, params, opts).unwrap();
        let st = wait_done(&m, &uid);
        assert_eq!(st.status, CommandState::Success, "{st:?}");
        assert_eq!(std::fs::read(root.join("a/b.txt")).unwrap(), b"data");
        assert!(st.pid.is_none());
    }
}
