/*!
Test support shared across integration tests.

- FakeManager: in-memory CommandManager that records every call
- test_config(debug): loopback config on a free port, key "secret", no offload delay
- start_server(cfg, manager): serve on a background thread, returns the bound address
- http(addr, raw): send one raw HTTP request and parse the reply
*/
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use minion::manager::unix_now;
use minion::{CommandManager, CommandState, CommandStatus, Config, Params, RunOptions, Server};

pub const KEY: &str = "secret";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Run {
        command: String,
        params: Params,
        opts: RunOptions,
    },
    Terminate(String),
    Status(String),
    Unfinished(Option<i64>),
}

#[derive(Default)]
pub struct FakeManager {
    calls: Mutex<Vec<Call>>,
    statuses: Mutex<BTreeMap<String, CommandStatus>>,
    fail_with: Mutex<Option<String>>,
}

impl FakeManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Make every subsequent call fail with `msg`.
    pub fn fail_with(&self, msg: &str) {
        *self.fail_with.lock().unwrap() = Some(msg.to_string());
    }

    /// Seed a finished command carrying captured output.
    pub fn seed_finished(&self, uid: &str, finish_ts: i64) {
        let mut st = CommandStatus::new(uid, "ls", Params::new(), vec![]);
        st.status = CommandState::Success;
        st.exit_code = Some(0);
        st.finish_ts = Some(finish_ts);
        st.output = Some("listing".into());
        st.error_output = Some(String::new());
        self.statuses.lock().unwrap().insert(uid.to_string(), st);
    }

    fn record(&self, call: Call) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(call);
        match self.fail_with.lock().unwrap().as_ref() {
            Some(msg) => Err(anyhow::anyhow!("{msg}")),
            None => Ok(()),
        }
    }
}

impl CommandManager for FakeManager {
    fn run(&self, command: &str, params: Params, opts: RunOptions) -> anyhow::Result<String> {
        self.record(Call::Run {
            command: command.to_string(),
            params: params.clone(),
            opts: opts.clone(),
        })?;
        let mut statuses = self.statuses.lock().unwrap();
        let uid = format!("{:032x}", statuses.len() + 0xabc);
        let mut st = CommandStatus::new(&uid, command, params, opts.success_codes);
        st.pid = Some(4242);
        st.output = Some(String::new());
        st.error_output = Some(String::new());
        statuses.insert(uid.clone(), st);
        Ok(uid)
    }

    fn terminate(&self, uid: &str) -> anyhow::Result<()> {
        self.record(Call::Terminate(uid.to_string()))?;
        let mut statuses = self.statuses.lock().unwrap();
        let st = statuses
            .get_mut(uid)
            .ok_or_else(|| anyhow::anyhow!("unknown command uid {uid}"))?;
        st.status = CommandState::Terminated;
        st.finish_ts = Some(unix_now());
        Ok(())
    }

    fn status(&self, uid: &str) -> anyhow::Result<CommandStatus> {
        self.record(Call::Status(uid.to_string()))?;
        self.statuses
            .lock()
            .unwrap()
            .get(uid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown command uid {uid}"))
    }

    fn unfinished_commands(
        &self,
        finish_ts_gte: Option<i64>,
    ) -> anyhow::Result<BTreeMap<String, CommandStatus>> {
        self.record(Call::Unfinished(finish_ts_gte))?;
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, st)| st.listed_for(finish_ts_gte))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

pub fn test_config(debug: bool) -> Config {
    let mut cfg = Config::default();
    cfg.common.debug = debug;
    cfg.http.host = "127.0.0.1".into();
    cfg.http.port = 0;
    cfg.auth.key = KEY.into();
    cfg.executor.offload_delay_secs = 0;
    cfg
}

/// Serve on a dedicated thread with its own single-threaded runtime.
pub fn start_server(cfg: Config, manager: Arc<dyn CommandManager>) -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        rt.block_on(async move {
            let server = Server::bind(Arc::new(cfg), manager).await.expect("bind");
            tx.send(server.local_addr().expect("local addr")).expect("send addr");
            let _ = server.run().await;
        });
    });
    rx.recv_timeout(Duration::from_secs(10)).expect("server did not start")
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head.lines().find_map(|l| {
            l.to_ascii_lowercase()
                .starts_with(&prefix)
                .then(|| l[prefix.len()..].trim().to_string())
        })
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body)
            .unwrap_or_else(|e| panic!("body is not json ({e}): {}", self.body))
    }
}

/// Send `raw` verbatim and read until the server closes the connection.
pub fn http(addr: SocketAddr, raw: &str) -> RawResponse {
    let mut s = TcpStream::connect(addr).expect("connect");
    s.set_read_timeout(Some(Duration::from_secs(10))).ok();
    s.write_all(raw.as_bytes()).expect("write");
    let mut resp = Vec::new();
    let _ = s.read_to_end(&mut resp);
    let txt = String::from_utf8_lossy(&resp).into_owned();
    let (head, body) = txt.split_once("\r\n\r\n").unwrap_or((txt.as_str(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("no status line in: {txt}"));
    RawResponse {
        status,
        head: head.to_string(),
        body: body.to_string(),
    }
}

pub fn get(addr: SocketAddr, path: &str, extra_headers: &str) -> RawResponse {
    http(
        addr,
        &format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{extra_headers}\r\n"),
    )
}

pub fn post_form(addr: SocketAddr, path: &str, extra_headers: &str, body: &str) -> RawResponse {
    http(
        addr,
        &format!(
            "POST {path} HTTP/1.1\r\nHost: localhost\r\n{extra_headers}Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ),
    )
}

pub fn auth_header() -> String {
    format!("X-Auth: {KEY}\r\n")
}
