//! The runtime's typed error taxonomy (spec §7).
//!
//! Every fallible core operation returns a [`RuntimeError`]. The RPC façade
//! ([`crate::rpc`]) is the only place these get mapped to [`tonic::Status`]
//! wire codes; nothing below it should know about gRPC.

use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{kind} {id:?} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id:?} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("resource version conflict on {kind} {id:?}: expected {expected}, have {actual}")]
    ResourceVersionConflict {
        kind: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("incompatible resource sources: {0}")]
    IncompatibleSources(String),

    #[error("operation canceled")]
    Canceled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists { kind, id: id.into() }
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Internal(format!("I/O error: {e}"))
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        RuntimeError::Internal(format!("marshalling error: {e}"))
    }
}

impl From<RuntimeError> for tonic::Status {
    fn from(e: RuntimeError) -> Self {
        use tonic::Code;
        let code = match &e {
            RuntimeError::NotFound { .. } => Code::NotFound,
            RuntimeError::AlreadyExists { .. } => Code::AlreadyExists,
            RuntimeError::ResourceVersionConflict { .. } => Code::Aborted,
            RuntimeError::InvalidArgument(_) => Code::InvalidArgument,
            RuntimeError::ResourceExhausted(_) => Code::ResourceExhausted,
            RuntimeError::IncompatibleSources(_) => Code::FailedPrecondition,
            RuntimeError::Canceled => Code::Cancelled,
            RuntimeError::Internal(_) => Code::Internal,
        };
        tonic::Status::new(code, e.to_string())
    }
}
