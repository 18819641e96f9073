//! Errors - エラー型と分類
//!
//! - `HandlerError`: タスク単位の失敗（attempt_count を消費する）
//! - `StoreError` / `BrokerError`: インフラ側の失敗（リトライで吸収し、タスク失敗にはしない）
//! - `ShuttleError`: API 層へ返すエラー

use thiserror::Error;

use super::ids::{DeliveryId, TaskId};
use super::state::TaskState;

/// ErrorKind は handler エラーの分類
///
/// - Transient: 一時的なエラー（retry policy に回す）
/// - Permanent: 恒久的なエラー（リトライ無意味、即 FAILED）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// A task-level failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    kind: ErrorKind,
    message: String,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::transient(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::transient(message)
    }
}

/// Errors from the Task Record Store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Lost compare-and-swap race (stored state or lease differs).
    #[error("conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: TaskId,
        expected: TaskState,
        actual: TaskState,
    },

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already exists")]
    AlreadyExists(TaskId),

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: TaskState, to: TaskState },

    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Transient infrastructure failure; callers retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Errors from the Queue Broker Adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Transient; the dispatch loop backs off and reconnects.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The delivery was already acked, nacked or redelivered under a new token.
    #[error("unknown ack token {0}")]
    UnknownToken(DeliveryId),
}

/// Errors surfaced to the API layer.
#[derive(Debug, Error)]
pub enum ShuttleError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {id} is already terminal ({state})")]
    AlreadyTerminal { id: TaskId, state: TaskState },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<StoreError> for ShuttleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ShuttleError::NotFound(id),
            other => ShuttleError::Store(other),
        }
    }
}
