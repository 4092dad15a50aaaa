/*!
Authentication gate for mutating endpoints.

Decision order:
- debug/trust mode authenticates every request;
- otherwise the configured header must carry exactly the pre-shared key.

An empty configured key never authenticates, so a deployment that forgot to set one
fails closed instead of accepting requests without the header.
*/

use super::http::{HttpRequest, Response};
use crate::config::Config;

/// Outcome of the gate for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Trusted,
    Authorized,
    Denied,
}

impl AuthResult {
    pub fn allowed(self) -> bool {
        !matches!(self, AuthResult::Denied)
    }
}

/// Return true when a header value equals the configured key.
/// Comparison walks the whole value so timing does not reveal the matching prefix.
pub(crate) fn key_matches(value: &str, key: &str) -> bool {
    if key.is_empty() {
        return false;
    }
    let (a, b) = (value.as_bytes(), key.as_bytes());
    let mut diff = a.len() ^ b.len();
    for (i, &x) in a.iter().enumerate() {
        diff |= usize::from(x ^ b.get(i).copied().unwrap_or(0));
    }
    diff == 0
}

pub fn authenticate(cfg: &Config, req: &HttpRequest) -> AuthResult {
    if cfg.common.debug {
        return AuthResult::Trusted;
    }
    match req.header(&cfg.auth.header) {
        Some(v) if key_matches(v, &cfg.auth.key) => AuthResult::Authorized,
        _ => AuthResult::Denied,
    }
}

/// Short-circuit answer for a denied request: 403 with no body.
pub fn forbidden() -> Response {
    Response::new(403)
}
