use std::io;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingParameter,
    InvalidParameter,
    InvalidPath,
    NotFound,
    PermissionDenied,
    DecodeError,
    Timeout,
    UnknownTool,
    BackendUnavailable,
    UnexpectedFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingParameter => "missing_parameter",
            Self::InvalidParameter => "invalid_parameter",
            Self::InvalidPath => "invalid_path",
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::DecodeError => "decode_error",
            Self::Timeout => "timeout",
            Self::UnknownTool => "unknown_tool",
            Self::BackendUnavailable => "backend_unavailable",
            Self::UnexpectedFailure => "unexpected_failure",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::MissingParameter => "Missing Parameter",
            Self::InvalidParameter => "Invalid Parameter",
            Self::InvalidPath => "Invalid Path",
            Self::NotFound => "Not Found",
            Self::PermissionDenied => "Permission Denied",
            Self::DecodeError => "Decode Error",
            Self::Timeout => "Timeout",
            Self::UnknownTool => "Unknown Tool",
            Self::BackendUnavailable => "Backend Unavailable",
            Self::UnexpectedFailure => "Unexpected Failure",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingParameter => 400,
            Self::InvalidParameter => 400,
            Self::InvalidPath => 400,
            Self::NotFound => 404,
            Self::PermissionDenied => 403,
            Self::DecodeError => 400,
            Self::Timeout => 408,
            Self::UnknownTool => 400,
            Self::BackendUnavailable => 502,
            Self::UnexpectedFailure => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body carried by every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    #[serde(rename = "type")]
    pub type_: ErrorKind,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            type_: kind,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HostwireError {
    #[error("missing parameter: {name}")]
    MissingParameter { name: String },
    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },
    #[error("invalid path: {message}")]
    InvalidPath { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },
    #[error("cannot decode {path} as text (binary content?)")]
    DecodeError { path: String },
    #[error("timed out after {seconds}s: {message}")]
    Timeout { message: String, seconds: u64 },
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },
    #[error("model backend unavailable: {message}")]
    BackendUnavailable { message: String },
    #[error("{message}")]
    UnexpectedFailure { message: String },
}

impl HostwireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingParameter { .. } => ErrorKind::MissingParameter,
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::InvalidPath { .. } => ErrorKind::InvalidPath,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::DecodeError { .. } => ErrorKind::DecodeError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::UnknownTool { .. } => ErrorKind::UnknownTool,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::UnexpectedFailure { .. } => ErrorKind::UnexpectedFailure,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    pub fn missing(name: impl Into<String>) -> Self {
        Self::MissingParameter { name: name.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedFailure {
            message: message.into(),
        }
    }

    /// Maps an I/O failure on `context` (usually a path) onto the taxonomy.
    pub fn from_io(err: io::Error, context: impl std::fmt::Display) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound {
                message: format!("{context}: {err}"),
            },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                message: format!("{context}: {err}"),
            },
            _ => Self::UnexpectedFailure {
                message: format!("{context}: {err}"),
            },
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        let mut body = ErrorBody::new(self.kind(), self.to_string());
        match self {
            Self::MissingParameter { name } => {
                body.extensions
                    .insert("parameter".to_string(), Value::String(name.clone()));
            }
            Self::Timeout { seconds, .. } => {
                body.extensions
                    .insert("timeoutSecs".to_string(), Value::from(*seconds));
            }
            Self::UnknownTool { name } => {
                body.extensions
                    .insert("tool".to_string(), Value::String(name.clone()));
            }
            _ => {}
        }
        body
    }
}

impl From<HostwireError> for ErrorBody {
    fn from(value: HostwireError) -> Self {
        value.to_error_body()
    }
}

impl From<&HostwireError> for ErrorBody {
    fn from(value: &HostwireError) -> Self {
        value.to_error_body()
    }
}
