/*!
Uniform JSON envelope for API handlers.

Every enveloped handler produces exactly one [`Response`]:
- `{"status": "success", "response": <value>}` when the body returns a value,
- `{"status": "error", "error": "<message>"}` when it fails (the failure is logged),
- a fixed error envelope when the envelope itself cannot be serialized.

The Content-Type is fixed before the body is rendered. A handler may set a status or
headers (redirects do); failures that carry their own status override it.
*/

use std::future::Future;

use serde::Serialize;
use tracing::error;

use super::http::Response;
use crate::errors::ApiError;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub(crate) const FALLBACK_ERROR: &str = "failed to construct response, see log file";

/// Successful handler outcome: optional value plus any status/headers the handler set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply<T> {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub value: Option<T>,
}

impl<T> Reply<T> {
    pub fn ok(value: T) -> Self {
        Reply {
            status: 200,
            headers: Vec::new(),
            value: Some(value),
        }
    }

    /// 302 to `location`; the envelope still carries `response: null`.
    pub fn redirect(location: impl Into<String>) -> Self {
        Reply {
            status: 302,
            headers: vec![("Location".to_string(), location.into())],
            value: None,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Envelope<'a, T: Serialize> {
    Success { response: Option<&'a T> },
    Error { error: String },
}

/// Await a handler body and render its outcome as the single response for the request.
pub async fn api_response<T, F>(route: &'static str, body: F) -> Response
where
    T: Serialize,
    F: Future<Output = Result<Reply<T>, ApiError>>,
{
    render(route, body.await)
}

pub fn render<T: Serialize>(route: &'static str, result: Result<Reply<T>, ApiError>) -> Response {
    let mut resp = Response::new(200).with_header("Content-Type", JSON_CONTENT_TYPE);

    let encoded = match &result {
        Ok(reply) => {
            resp.status = reply.status;
            for (k, v) in &reply.headers {
                resp.set_header(k, v.clone());
            }
            serde_json::to_vec(&Envelope::Success {
                response: reply.value.as_ref(),
            })
        }
        Err(e) => {
            log_failure(route, e);
            if let Some(status) = e.http_status() {
                resp.status = status;
            }
            let env: Envelope<'_, ()> = Envelope::Error {
                error: e.to_string(),
            };
            serde_json::to_vec(&env)
        }
    };

    resp.body = match encoded {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(route, error = %e, "failed to dump json response");
            fallback_body()
        }
    };
    resp
}

fn fallback_body() -> Vec<u8> {
    serde_json::json!({ "status": "error", "error": FALLBACK_ERROR })
        .to_string()
        .into_bytes()
}

fn log_failure(route: &'static str, e: &ApiError) {
    match e {
        // Debug on anyhow prints the full cause chain (and backtrace when captured)
        ApiError::Manager(inner) => error!(route, error = %inner, detail = ?inner, "request failed"),
        other => error!(route, error = %other, "request rejected"),
    }
}
