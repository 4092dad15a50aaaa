/*!
Endpoint handlers: command lifecycle (start/status/terminate/list/catch-all/node shutdown)
and group management (create/remove).

Every manager call goes through the offloader. Start-style handlers answer with a 302 to
the canonical status URL of the new uid; the coordinator follows it to poll.
*/

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info};

use super::envelope::{api_response, Reply};
use super::http::{HttpRequest, Response};
use super::offload::Offloader;
use super::paths;
use super::routing::{status_url, Route};
use crate::config::Config;
use crate::errors::ApiError;
use crate::manager::groups::{GROUP_PATH_PARAM, ROOT_DIR_PARAM};
use crate::manager::{
    CommandManager, CommandStatus, Files, Params, RunOptions, CREATE_GROUP, REMOVE_GROUP,
};

/// Header prefix marking environment overlay entries (case-insensitive).
pub const ENV_HEADER_PREFIX: &str = "env_";
const SUCCESS_CODE_ARG: &str = "success_code";
const CMD_LOG_TARGET: &str = "minion::cmd";

const MANUAL_TEMPLATE: &str = include_str!("../../templates/manual.html");

/// Shared, read-only state handed to every handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<dyn CommandManager>,
    pub offload: Offloader,
}

impl AppState {
    pub fn new(config: Arc<Config>, manager: Arc<dyn CommandManager>) -> Self {
        let offload = Offloader::new(config.executor.workers, config.executor.offload_delay());
        AppState {
            config,
            manager,
            offload,
        }
    }

    async fn run_command(
        &self,
        command: String,
        params: Params,
        opts: RunOptions,
    ) -> Result<String, ApiError> {
        let manager = self.manager.clone();
        self.offload
            .run(move || manager.run(&command, params, opts))
            .await
    }

    async fn status_of(&self, uid: &str) -> Result<CommandStatus, ApiError> {
        let manager = self.manager.clone();
        let uid = uid.to_string();
        self.offload.run(move || manager.status(&uid)).await
    }
}

type Statuses = BTreeMap<String, CommandStatus>;

/// Run the handler body for an already authenticated route.
pub async fn handle(state: &AppState, route: Route, req: HttpRequest) -> Response {
    let name = route.name();
    match route {
        Route::Ping => Response::plain(200, "OK"),
        Route::Manual => manual(),
        Route::Start => api_response(name, start(state, &req)).await,
        Route::Terminate => api_response(name, terminate(state, &req)).await,
        Route::Status(uid) => api_response(name, status(state, uid)).await,
        Route::NodeShutdown => api_response(name, node_shutdown(state, &req)).await,
        Route::List => api_response(name, list(state, &req)).await,
        Route::CreateGroup => api_response(name, create_group(state, &req)).await,
        Route::RemoveGroup => api_response(name, remove_group(state, &req)).await,
        Route::Command(cmd) => api_response(name, command(state, cmd, &req)).await,
    }
}

fn manual() -> Response {
    Response::html(MANUAL_TEMPLATE.replace("{{version}}", env!("CARGO_PKG_VERSION")))
}

async fn start(state: &AppState, req: &HttpRequest) -> Result<Reply<()>, ApiError> {
    let cmd = required(req, "command")?;
    reject_reserved(&cmd)?;
    let success_codes = success_codes(req)?;
    let params = flatten_params(req, &[SUCCESS_CODE_ARG]);
    let opts = RunOptions {
        env: env_overlay(req),
        success_codes,
        files: Files::new(),
    };
    let uid = state.run_command(cmd.clone(), params, opts).await?;
    info!(uid = %uid, command = %cmd, "command started");
    Ok(Reply::redirect(status_url(&uid)))
}

async fn terminate(state: &AppState, req: &HttpRequest) -> Result<Reply<Statuses>, ApiError> {
    let uid = required(req, "cmd_uid")?;
    let manager = state.manager.clone();
    let target = uid.clone();
    state
        .offload
        .run(move || manager.terminate(&target))
        .await?;
    // Only after terminate has returned, so the report is post-terminate
    let st = state.status_of(&uid).await?;
    info!(uid = %uid, status = ?st.status, "command terminated");
    Ok(Reply::ok(BTreeMap::from([(uid, st)])))
}

async fn status(state: &AppState, uid: String) -> Result<Reply<Statuses>, ApiError> {
    let st = state.status_of(&uid).await?;
    Ok(Reply::ok(BTreeMap::from([(uid, st)])))
}

async fn list(state: &AppState, req: &HttpRequest) -> Result<Reply<Statuses>, ApiError> {
    let finish_ts_gte = match req.argument("finish_ts_gte") {
        Some(v) if !v.trim().is_empty() => v.trim().parse::<i64>().map_err(|_| {
            ApiError::BadRequest(format!("Invalid finish_ts_gte value {v:?}"))
        })?,
        _ => 0,
    };
    let filter = (finish_ts_gte != 0).then_some(finish_ts_gte);
    let manager = state.manager.clone();
    let mut commands = state
        .offload
        .run(move || manager.unfinished_commands(filter))
        .await?;
    for st in commands.values_mut() {
        st.strip_output();
    }
    Ok(Reply::ok(commands))
}

async fn node_shutdown(state: &AppState, req: &HttpRequest) -> Result<Reply<()>, ApiError> {
    let cmd = required(req, "command")?;
    reject_reserved(&cmd)?;
    let params = flatten_params(req, &[]);
    let uid = state
        .run_command(cmd.clone(), params, RunOptions::default())
        .await?;
    info!(uid = %uid, command = %cmd, "node shutdown started");
    Ok(Reply::redirect(status_url(&uid)))
}

async fn command(state: &AppState, cmd: String, req: &HttpRequest) -> Result<Reply<()>, ApiError> {
    reject_reserved(&cmd)?;
    let params = flatten_params(req, &[]);
    let uid = state
        .run_command(cmd.clone(), params, RunOptions::default())
        .await?;
    info!(uid = %uid, command = %cmd, "command started");
    Ok(Reply::redirect(status_url(&uid)))
}

async fn create_group(state: &AppState, req: &HttpRequest) -> Result<Reply<()>, ApiError> {
    let mut params = flatten_params(req, &[]);
    let (task_id, job_id) = log_ids(&params);
    let Some(base) = state.config.common.base_path.as_deref() else {
        error!(target: CMD_LOG_TARGET, task_id = %task_id, job_id = %job_id, "base path is not set, create group cannot be performed");
        return Err(ApiError::Config("group creation is not allowed".into()));
    };

    let mut files = Files::new();
    for upload in &req.files {
        let Some(norm) = paths::safe_upload_name(&upload.field) else {
            error!(
                target: CMD_LOG_TARGET,
                task_id = %task_id,
                job_id = %job_id,
                filename = %upload.field,
                normalized = %paths::normalize_path(&upload.field),
                "cannot create file, normalized path is not allowed"
            );
            return Err(ApiError::Forbidden(format!(
                "File {} is forbidden, path should be relative to group base directory",
                upload.field
            )));
        };
        files.entry(norm).or_insert_with(|| upload.body.clone());
    }

    let root = required(req, ROOT_DIR_PARAM)?;
    let Some(root) = paths::group_path_under(&root, base) else {
        return Err(ApiError::Forbidden(format!(
            "Group base path {} is not under common base path",
            paths::normalize_path(&root)
        )));
    };
    params.insert(ROOT_DIR_PARAM.to_string(), root);

    let opts = RunOptions {
        files,
        ..RunOptions::default()
    };
    let uid = state
        .run_command(CREATE_GROUP.to_string(), params, opts)
        .await?;
    info!(target: CMD_LOG_TARGET, uid = %uid, task_id = %task_id, job_id = %job_id, "create group started");
    Ok(Reply::redirect(status_url(&uid)))
}

async fn remove_group(state: &AppState, req: &HttpRequest) -> Result<Reply<()>, ApiError> {
    let mut params = flatten_params(req, &[]);
    let (task_id, job_id) = log_ids(&params);
    let Some(base) = state.config.common.base_path.as_deref() else {
        error!(target: CMD_LOG_TARGET, task_id = %task_id, job_id = %job_id, "base path is not set, remove group cannot be performed");
        return Err(ApiError::Config("group removal is not allowed".into()));
    };

    let path = required(req, GROUP_PATH_PARAM)?;
    let Some(path) = paths::group_path_strictly_under(&path, base) else {
        return Err(ApiError::Forbidden(format!(
            "Group path {} is not under common base path",
            paths::normalize_path(&path)
        )));
    };
    params.insert(GROUP_PATH_PARAM.to_string(), path);

    let uid = state
        .run_command(REMOVE_GROUP.to_string(), params, RunOptions::default())
        .await?;
    info!(target: CMD_LOG_TARGET, uid = %uid, task_id = %task_id, job_id = %job_id, "remove group started");
    Ok(Reply::redirect(status_url(&uid)))
}

/// Group built-ins only run through their own routes, after the base path checks.
fn reject_reserved(cmd: &str) -> Result<(), ApiError> {
    if cmd == CREATE_GROUP || cmd == REMOVE_GROUP {
        error!(target: CMD_LOG_TARGET, command = cmd, "reserved command requested through a generic route");
        return Err(ApiError::Forbidden(format!(
            "Command {cmd} is reserved, use /command/{cmd}/"
        )));
    }
    Ok(())
}

fn required(req: &HttpRequest, name: &str) -> Result<String, ApiError> {
    req.argument(name)
        .map(str::to_string)
        .ok_or_else(|| ApiError::missing_argument(name))
}

/// One value per argument name: the first occurrence wins.
pub(crate) fn flatten_params(req: &HttpRequest, exclude: &[&str]) -> Params {
    let mut params = Params::new();
    for (k, v) in &req.args {
        if exclude.contains(&k.as_str()) {
            continue;
        }
        params.entry(k.clone()).or_insert_with(|| v.clone());
    }
    params
}

/// Repeated `success_code` arguments as integers; absent means none.
pub(crate) fn success_codes(req: &HttpRequest) -> Result<Vec<i32>, ApiError> {
    req.arguments(SUCCESS_CODE_ARG)
        .into_iter()
        .map(|v| {
            v.trim()
                .parse::<i32>()
                .map_err(|_| ApiError::BadRequest(format!("Invalid success_code value {v:?}")))
        })
        .collect()
}

/// Environment overlay from `ENV_*` headers: prefix stripped, name upper-cased.
pub(crate) fn env_overlay(req: &HttpRequest) -> BTreeMap<String, String> {
    req.headers
        .iter()
        .filter_map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            let var = lower.strip_prefix(ENV_HEADER_PREFIX)?;
            (!var.is_empty()).then(|| (var.to_ascii_uppercase(), value.clone()))
        })
        .collect()
}

fn log_ids(params: &Params) -> (String, String) {
    (
        params.get("task_id").cloned().unwrap_or_default(),
        params.get("job_id").cloned().unwrap_or_default(),
    )
}
