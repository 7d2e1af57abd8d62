//! Typed errors for the naming core, and their mapping onto the external
//! wire taxonomy of `IllegalArgumentException` / `FileNotFoundException` /
//! `IllegalStateException` / `IndexOutOfBoundsException` / `IOException`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Errors produced by [`crate::path`] validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path must be a non-empty string")]
    Empty,
    #[error("path must start with '/'")]
    NotAbsolute,
    #[error("path must not contain ':'")]
    ContainsColon,
    #[error("path must not contain an empty segment")]
    EmptySegment,
    #[error("path exceeds the maximum length")]
    TooLong,
}

/// Errors produced by [`crate::tree`] mutators and lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("no such file or directory")]
    NotFound,
    #[error("parent directory does not exist")]
    ParentMissing,
    #[error("object is not a directory")]
    NotDirectory,
    #[error("the root directory cannot be deleted")]
    IsRoot,
}

/// Errors produced by [`crate::registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a replica with this endpoint is already registered")]
    AlreadyRegistered,
    #[error("no storage replica is registered to host this file")]
    NoReplica,
}

/// Top-level error type returned by [`crate::service::NamingService`].
///
/// Every core operation collapses into one of these variants before it
/// crosses the HTTP boundary; nothing downstream of the handlers matches
/// on a bare `bool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NamingError {
    #[error("illegal argument: {0}")]
    IllegalArgument(&'static str),
    #[error("file not found")]
    FileNotFound,
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

impl From<PathError> for NamingError {
    fn from(_: PathError) -> Self {
        NamingError::IllegalArgument("malformed path")
    }
}

impl From<TreeError> for NamingError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::NotFound => NamingError::FileNotFound,
            TreeError::ParentMissing => NamingError::FileNotFound,
            TreeError::NotDirectory => NamingError::FileNotFound,
            TreeError::IsRoot => NamingError::IllegalArgument("root cannot be deleted"),
        }
    }
}

impl From<RegistryError> for NamingError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyRegistered => {
                NamingError::IllegalState("endpoint already registered")
            }
            RegistryError::NoReplica => NamingError::FileNotFound,
        }
    }
}

/// `{exception_type, exception_info}` envelope returned for every non-2xx
/// response, per the external wire protocol.
#[derive(Serialize)]
struct ErrorEnvelope {
    exception_type: &'static str,
    exception_info: String,
}

impl NamingError {
    fn exception_type(&self) -> &'static str {
        match self {
            NamingError::IllegalArgument(_) => "IllegalArgumentException",
            NamingError::FileNotFound => "FileNotFoundException",
            NamingError::IllegalState(_) => "IllegalStateException",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            NamingError::IllegalArgument(_) => StatusCode::NOT_FOUND,
            NamingError::FileNotFound => StatusCode::NOT_FOUND,
            NamingError::IllegalState(_) => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for NamingError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            exception_type: self.exception_type(),
            exception_info: self.to_string(),
        };
        (self.status(), axum::Json(body)).into_response()
    }
}

/// Errors surfaced by [`crate::command::CommandClient`] calls to a storage
/// replica. Best-effort callers (replication) log and drop these; callers
/// whose semantics require success (none today, per §4.7.2) would
/// propagate them as `NamingError::IllegalState` via the `IOException`
/// wire category.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("transport error talking to storage replica: {0}")]
    Transport(String),
    #[error("storage replica rejected the command")]
    Rejected,
}
