mod support;

use minion::manager::unix_now;
use support::{auth_header, get, post_form, start_server, test_config, Call, FakeManager, KEY};

#[test]
fn test_start_redirects_to_status_with_null_response() {
    let fake = FakeManager::new();
    let addr = start_server(test_config(false), fake.clone());

    let headers = format!("{}ENV_RSYNC_PASSWORD: pw\r\nenv_lower: x\r\n", auth_header());
    let r = post_form(
        addr,
        "/command/start/?dst=/q",
        &headers,
        "command=rsync+-a&success_code=0&success_code=23&dst=/a&dst=/b",
    );
    assert_eq!(r.status, 302, "{r:?}");
    let location = r.header("location").expect("location header");
    assert!(location.starts_with("/command/status/") && location.ends_with('/'));
    assert_eq!(r.header("content-type").as_deref(), Some("application/json"));
    let v = r.json();
    assert_eq!(v["status"], "success");
    assert!(v["response"].is_null());

    let calls = fake.calls();
    let Call::Run { command, params, opts } = &calls[0] else {
        panic!("expected run, got {calls:?}");
    };
    assert_eq!(command, "rsync -a");
    // Query arguments come first, so they win
    assert_eq!(params.get("dst").map(String::as_str), Some("/q"));
    assert!(!params.contains_key("success_code"));
    assert_eq!(opts.success_codes, vec![0, 23]);
    assert_eq!(opts.env.get("RSYNC_PASSWORD").map(String::as_str), Some("pw"));
    assert_eq!(opts.env.get("LOWER").map(String::as_str), Some("x"));
}

#[test]
fn test_start_validation_errors_are_400() {
    let fake = FakeManager::new();
    let addr = start_server(test_config(false), fake.clone());

    let r = post_form(addr, "/command/start/", &auth_header(), "");
    assert_eq!(r.status, 400);
    assert_eq!(r.json()["error"], "Missing argument command");

    let r = post_form(addr, "/command/start/", &auth_header(), "command=ls&success_code=zero");
    assert_eq!(r.status, 400);
    assert_eq!(r.json()["status"], "error");
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn test_client_follows_start_redirect_to_status() {
    let fake = FakeManager::new();
    let addr = start_server(test_config(false), fake.clone());

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/command/start/"))
        .header("X-Auth", KEY)
        .form(&[("command", "ls -l"), ("task_id", "t1")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert!(resp.url().path().starts_with("/command/status/"));
    let v: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(v["status"], "success");
    let statuses = v["response"].as_object().unwrap();
    assert_eq!(statuses.len(), 1);
    let (uid, st) = statuses.iter().next().unwrap();
    assert_eq!(st["uid"], uid.as_str());
    assert_eq!(st["command"], "ls -l");
    assert_eq!(st["status"], "executing");
    assert_eq!(st["params"]["task_id"], "t1");
    assert!(matches!(fake.calls().last(), Some(Call::Status(u)) if u == uid));
}

#[test]
fn test_terminate_reports_post_terminate_status() {
    let fake = FakeManager::new();
    let addr = start_server(test_config(false), fake.clone());

    let r = post_form(addr, "/command/start/", &auth_header(), "command=sleep+100");
    let location = r.header("location").unwrap();
    let uid = location
        .trim_start_matches("/command/status/")
        .trim_end_matches('/')
        .to_string();

    let r = post_form(addr, "/command/terminate/", &auth_header(), &format!("cmd_uid={uid}"));
    assert_eq!(r.status, 200, "{r:?}");
    let v = r.json();
    assert_eq!(v["status"], "success");
    assert_eq!(v["response"][&uid]["status"], "terminated");

    let calls = fake.calls();
    let n = calls.len();
    assert_eq!(calls[n - 2], Call::Terminate(uid.clone()));
    assert_eq!(calls[n - 1], Call::Status(uid));
}

#[test]
fn test_terminate_requires_uid() {
    let fake = FakeManager::new();
    let addr = start_server(test_config(false), fake.clone());
    let r = post_form(addr, "/command/terminate/", &auth_header(), "");
    assert_eq!(r.status, 400);
    assert_eq!(r.json()["error"], "Missing argument cmd_uid");
    assert!(fake.calls().is_empty());
}

#[test]
fn test_unknown_uid_is_error_envelope_with_200() {
    let fake = FakeManager::new();
    let addr = start_server(test_config(false), fake.clone());
    let r = get(addr, "/command/status/deadbeef/", &auth_header());
    assert_eq!(r.status, 200);
    let v = r.json();
    assert_eq!(v["status"], "error");
    assert_eq!(v["error"], "unknown command uid deadbeef");
    assert!(v.get("response").is_none());
}

#[test]
fn test_manager_failure_keeps_200() {
    let fake = FakeManager::new();
    fake.fail_with("executor is gone");
    let addr = start_server(test_config(false), fake.clone());
    let r = post_form(addr, "/command/start/", &auth_header(), "command=ls");
    assert_eq!(r.status, 200, "{r:?}");
    assert!(r.header("location").is_none());
    assert_eq!(r.json()["error"], "executor is gone");
}

#[test]
fn test_list_strips_output_and_filters() {
    let fake = FakeManager::new();
    let now = unix_now();
    fake.seed_finished("0000000000000000000000000000aaaa", now - 1000);
    fake.seed_finished("0000000000000000000000000000bbbb", now);
    let addr = start_server(test_config(false), fake.clone());
    post_form(addr, "/command/start/", &auth_header(), "command=sleep+1");

    let r = get(addr, "/command/list/", &auth_header());
    let v = r.json();
    let listed = v["response"].as_object().unwrap();
    assert_eq!(listed.len(), 1, "{listed:?}");
    for st in listed.values() {
        assert!(st.get("output").is_none());
        assert!(st.get("error_output").is_none());
    }

    let r = get(
        addr,
        &format!("/rsync/list/?finish_ts_gte={}", now - 10),
        &auth_header(),
    );
    let v = r.json();
    let listed = v["response"].as_object().unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains_key("0000000000000000000000000000bbbb"));
    assert!(listed["0000000000000000000000000000bbbb"].get("output").is_none());

    let r = get(addr, "/command/list/?finish_ts_gte=0", &auth_header());
    assert_eq!(r.json()["response"].as_object().unwrap().len(), 1);

    assert!(fake.calls().contains(&Call::Unfinished(Some(now - 10))));
    assert!(fake.calls().contains(&Call::Unfinished(None)));
}

#[test]
fn test_list_rejects_non_integer_threshold() {
    let fake = FakeManager::new();
    let addr = start_server(test_config(false), fake.clone());
    let r = get(addr, "/command/list/?finish_ts_gte=yesterday", &auth_header());
    assert_eq!(r.status, 400);
    assert_eq!(r.json()["status"], "error");
    assert!(fake.calls().is_empty());
}

#[test]
fn test_catch_all_and_node_shutdown_start_commands() {
    let fake = FakeManager::new();
    let addr = start_server(test_config(false), fake.clone());

    let r = post_form(addr, "/command/rsync_transfer/", &auth_header(), "src=/a&src=/b");
    assert_eq!(r.status, 302, "{r:?}");
    let r = post_form(addr, "/node/shutdown/", &auth_header(), "command=poweroff");
    assert_eq!(r.status, 302);
    let r = post_form(addr, "/node/shutdown/", &auth_header(), "");
    assert_eq!(r.status, 400);

    let runs: Vec<(String, Option<String>)> = fake
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::Run { command, params, .. } => Some((command, params.get("src").cloned())),
            _ => None,
        })
        .collect();
    assert_eq!(
        runs,
        vec![
            ("rsync_transfer".to_string(), Some("/a".to_string())),
            ("poweroff".to_string(), None),
        ]
    );
}
