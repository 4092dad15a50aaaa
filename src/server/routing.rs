/*!
URL routing for the agent API.

Routes are tried in table order and the first match wins, so the specific `/command/...`
routes shadow the catch-all `/command/{any}/`. Each route declares its method and whether
the authentication gate applies.
*/

use super::http::Method;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Ping,
    Manual,
    Start,
    Terminate,
    Status(String),
    NodeShutdown,
    List,
    CreateGroup,
    RemoveGroup,
    /// Catch-all: start the named command.
    Command(String),
}

impl Route {
    pub fn method(&self) -> Method {
        match self {
            Route::Ping | Route::Manual | Route::Status(_) | Route::List => Method::Get,
            Route::Start
            | Route::Terminate
            | Route::NodeShutdown
            | Route::CreateGroup
            | Route::RemoveGroup
            | Route::Command(_) => Method::Post,
        }
    }

    /// Liveness and the static manual are the only unauthenticated routes.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Route::Ping | Route::Manual)
    }

    /// Stable label for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Route::Ping => "ping",
            Route::Manual => "manual",
            Route::Start => "start",
            Route::Terminate => "terminate",
            Route::Status(_) => "status",
            Route::NodeShutdown => "node_shutdown",
            Route::List => "list",
            Route::CreateGroup => "create_group",
            Route::RemoveGroup => "remove_group",
            Route::Command(_) => "command",
        }
    }
}

/// Classify a request path (exact match, trailing slash required).
pub fn classify(path: &str) -> Option<Route> {
    match path {
        "/ping/" => return Some(Route::Ping),
        "/command/start/" | "/rsync/start/" => return Some(Route::Start),
        "/rsync/manual/" => return Some(Route::Manual),
        "/command/terminate/" => return Some(Route::Terminate),
        _ => {}
    }
    for prefix in ["/command/status/", "/rsync/status/"] {
        if let Some(uid) = segment_between(path, prefix) {
            if is_lower_hex(uid) {
                return Some(Route::Status(uid.to_string()));
            }
        }
    }
    match path {
        "/node/shutdown/" => return Some(Route::NodeShutdown),
        "/command/list/" | "/rsync/list/" => return Some(Route::List),
        "/command/create_group/" => return Some(Route::CreateGroup),
        "/command/remove_group/" => return Some(Route::RemoveGroup),
        _ => {}
    }
    segment_between(path, "/command/").map(|cmd| Route::Command(cmd.to_string()))
}

/// Canonical status URL for a uid; target of every start redirect.
pub fn status_url(uid: &str) -> String {
    format!("/command/status/{uid}/")
}

/// Non-empty text between `prefix` and the trailing slash.
fn segment_between<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?.strip_suffix('/')?;
    (!rest.is_empty()).then_some(rest)
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
