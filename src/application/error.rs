use std::any::Any;
use std::convert::Infallible;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::application::remote::StoreError;
use crate::infra::error::InfraError;

/// Failure category carried by every [`QueryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure reaching the store.
    Network,
    /// The store answered with an error payload.
    Remote,
    /// The caller supplied an unusable key, id or identifier.
    Validation,
    /// A time budget ran out, including the retry budget.
    Timeout,
    Unexpected,
}

/// Normalized failure shape stored in cache entries and returned from mutations.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{message}")]
pub struct QueryError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub const CODE_RETRY_EXHAUSTED: &str = "RETRY_EXHAUSTED";
pub const CODE_NOT_FOUND: &str = "NOT_FOUND";
pub const CODE_PANIC: &str = "PANIC";
pub const CODE_DUPLICATE: &str = "DUPLICATE";
pub const CODE_INVALID_INPUT: &str = "INVALID_INPUT";
pub const CODE_INTEGRITY: &str = "INTEGRITY";
pub const CODE_UNKNOWN_TABLE: &str = "UNKNOWN_TABLE";
pub const CODE_DECODE: &str = "DECODE";

/// Codes that fail the same way on every attempt.
const DETERMINISTIC_CODES: &[&str] = &[
    CODE_NOT_FOUND,
    CODE_PANIC,
    CODE_DUPLICATE,
    CODE_INVALID_INPUT,
    CODE_INTEGRITY,
    CODE_UNKNOWN_TABLE,
    CODE_DECODE,
];

/// SQLSTATE classes for data exceptions, integrity violations and syntax or access errors.
const DETERMINISTIC_SQLSTATE_CLASSES: &[&str] = &["22", "23", "42"];

impl QueryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            details: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Remote, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Error settled after every retry failed. The last failure travels in `details`.
    pub fn retries_exhausted(attempts: u32, last: QueryError) -> Self {
        Self::timeout(format!("gave up after {attempts} attempts: {}", last.message))
            .with_code(CODE_RETRY_EXHAUSTED)
            .with_details(json!({ "attempts": attempts, "last_error": last }))
    }

    /// Normalize a panic payload caught from a fetcher or mutator.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::unexpected(format!("panicked: {message}")).with_code(CODE_PANIC)
    }

    /// Transient failures only. Validation errors and remote payloads with a deterministic code
    /// surface on the first attempt with their own kind.
    pub fn is_retryable(&self) -> bool {
        if self.kind == ErrorKind::Validation {
            return false;
        }
        match self.code.as_deref() {
            Some(code) if DETERMINISTIC_CODES.contains(&code) => false,
            Some(code) if self.kind == ErrorKind::Remote && code.len() == 5 => {
                !code
                    .get(..2)
                    .is_some_and(|class| DETERMINISTIC_SQLSTATE_CLASSES.contains(&class))
            }
            _ => true,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code.as_deref() == Some(CODE_NOT_FOUND)
    }
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::Transport(_) => QueryError::network(message),
            StoreError::Timeout => QueryError::timeout(message).with_code("STORE_TIMEOUT"),
            StoreError::InvalidRequest { .. } => QueryError::validation(message),
            StoreError::NotFound => QueryError::remote(message).with_code(CODE_NOT_FOUND),
            StoreError::Duplicate { constraint } => QueryError::remote(message)
                .with_code(CODE_DUPLICATE)
                .with_details(json!({ "constraint": constraint })),
            StoreError::InvalidInput { .. } => QueryError::remote(message).with_code(CODE_INVALID_INPUT),
            StoreError::Integrity { .. } => QueryError::remote(message).with_code(CODE_INTEGRITY),
            StoreError::UnknownTable(table) => QueryError::remote(message)
                .with_code(CODE_UNKNOWN_TABLE)
                .with_details(json!({ "table": table })),
            StoreError::Decode(_) => QueryError::remote(message).with_code(CODE_DECODE),
            StoreError::Persistence { code, .. } => {
                let error = QueryError::remote(message);
                match code {
                    Some(code) => error.with_code(code),
                    None => error,
                }
            }
        }
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::remote(format!("failed to decode row: {err}")).with_code(CODE_DECODE)
    }
}

impl From<String> for QueryError {
    fn from(message: String) -> Self {
        QueryError::unexpected(message)
    }
}

impl From<&str> for QueryError {
    fn from(message: &str) -> Self {
        QueryError::unexpected(message)
    }
}

impl From<Infallible> for QueryError {
    fn from(err: Infallible) -> Self {
        match err {}
    }
}

/// Top-level error of the command-line binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("resource not found")]
    NotFound,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[cfg(test)]
mod tests {
    use std::panic;

    use super::*;

    #[test]
    fn store_errors_map_to_kinds() {
        assert_eq!(
            QueryError::from(StoreError::Transport("reset".into())).kind,
            ErrorKind::Network
        );
        assert_eq!(QueryError::from(StoreError::Timeout).kind, ErrorKind::Timeout);
        assert!(QueryError::from(StoreError::NotFound).is_not_found());

        let duplicate = QueryError::from(StoreError::Duplicate {
            constraint: "teams_name_key".into(),
        });
        assert_eq!(duplicate.kind, ErrorKind::Remote);
        assert_eq!(duplicate.code.as_deref(), Some("DUPLICATE"));
        assert_eq!(
            duplicate.details,
            Some(json!({ "constraint": "teams_name_key" }))
        );

        let rejected = QueryError::from(StoreError::InvalidRequest {
            message: "bad identifier".into(),
        });
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn persistence_code_is_kept() {
        let error = QueryError::from(StoreError::Persistence {
            message: "deadlock detected".into(),
            code: Some("40P01".into()),
        });
        assert_eq!(error.code.as_deref(), Some("40P01"));
        assert!(error.is_retryable());
    }

    #[test]
    fn deterministic_remote_failures_are_not_retryable() {
        let unknown = QueryError::from(StoreError::UnknownTable("mission".into()));
        assert!(!unknown.is_retryable());
        assert!(!QueryError::from(StoreError::NotFound).is_retryable());
        assert!(!QueryError::from(StoreError::Decode("not an array".into())).is_retryable());

        let undefined_column = QueryError::from(StoreError::Persistence {
            message: "column \"titel\" does not exist".into(),
            code: Some("42703".into()),
        });
        assert!(!undefined_column.is_retryable());

        assert!(QueryError::network("reset").is_retryable());
        assert!(QueryError::from(StoreError::Timeout).is_retryable());
        assert!(QueryError::remote("no code").is_retryable());
        assert!(!QueryError::from_panic(Box::new("boom")).is_retryable());
    }

    #[test]
    fn retries_exhausted_wraps_last_error() {
        let error = QueryError::retries_exhausted(4, QueryError::network("offline"));
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.code.as_deref(), Some(CODE_RETRY_EXHAUSTED));
        let details = error.details.expect("details");
        assert_eq!(details["attempts"], 4);
        assert_eq!(details["last_error"]["kind"], "network");
    }

    fn panic_payload(f: impl FnOnce() + panic::UnwindSafe) -> Box<dyn Any + Send> {
        panic::catch_unwind(f).expect_err("closure panics")
    }

    #[test]
    fn panic_payloads_are_normalized() {
        let error = QueryError::from_panic(panic_payload(|| panic!("boom")));
        assert_eq!(error.kind, ErrorKind::Unexpected);
        assert!(error.message.contains("boom"));

        let formatted = panic_payload(|| panic!("code {}", 7));
        assert!(QueryError::from_panic(formatted).message.contains("code 7"));
    }

    #[test]
    fn serializes_without_empty_fields() {
        let value = serde_json::to_value(QueryError::validation("missing id")).expect("json");
        assert_eq!(value, json!({ "kind": "validation", "message": "missing id" }));
    }
}
