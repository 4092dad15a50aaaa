//! Error mapping guide:
//! - Authentication failures never reach these types; the gate answers 403 with an empty body.
//! - Forbidden/Config/BadRequest are detected before any manager call and carry their own status.
//! - Manager failures keep the default 200 status; the envelope's `status: error` is authoritative.
use std::fmt;
use std::io;

/// Failure raised by a handler body and rendered by the response envelope.
#[derive(Debug)]
pub enum ApiError {
    /// Unsafe path or filename supplied by the caller (403).
    Forbidden(String),
    /// Feature refused because its configuration is missing (500).
    Config(String),
    /// Missing or malformed request argument (400).
    BadRequest(String),
    /// Any failure raised by the offloaded manager call.
    Manager(anyhow::Error),
}

impl ApiError {
    /// HTTP status this failure forces onto the response, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ApiError::Forbidden(_) => Some(403),
            ApiError::Config(_) => Some(500),
            ApiError::BadRequest(_) => Some(400),
            ApiError::Manager(_) => None,
        }
    }

    pub fn missing_argument(name: &str) -> Self {
        ApiError::BadRequest(format!("Missing argument {name}"))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Forbidden(msg) | ApiError::Config(msg) | ApiError::BadRequest(msg) => {
                f.write_str(msg)
            }
            ApiError::Manager(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApiError::Manager(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Manager(e)
    }
}

/// Map a startup failure to a process exit code:
/// - 2 for configuration problems (bad file, invalid values)
/// - 98 when the listen address is already in use
/// - 1 for everything else
pub fn exit_code_for_startup_error(e: &anyhow::Error) -> u8 {
    if e.downcast_ref::<ConfigError>().is_some() {
        2
    } else if let Some(ioe) = e.downcast_ref::<io::Error>() {
        if ioe.kind() == io::ErrorKind::AddrInUse {
            98
        } else {
            1
        }
    } else {
        1
    }
}

/// Configuration loading failure.
#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_yaml::Error),
    Invalid(String),
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config read failed: {e}"),
            ConfigError::Parse(e) => write!(f, "config parse failed: {e}"),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
