//! Error types shared by every connector task.
//!
//! [`BackendError`] is what a [`TableBackend`](crate::TableBackend) returns;
//! [`ConnectorError`] is what the lifecycle entry points (`start`, `put`,
//! `poll`) surface to the host.

use std::fmt;

/// Failure reported by the table-storage backend.
///
/// Carries the HTTP-style status and the raw response body so the host can
/// diagnose a failure without retrying blindly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    /// Status code of the failed call, when the backend has one.
    pub status: Option<u16>,
    /// Backend specific reason string (e.g. `duplicate`, `notFound`).
    pub reason: Option<String>,
    /// Human readable message or raw response body.
    pub body: String,
}

impl BackendError {
    pub fn new(status: Option<u16>, body: impl Into<String>) -> Self {
        Self {
            status,
            reason: None,
            body: body.into(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Conflict raised when creating a dataset or table that already exists.
    pub fn already_exists(body: impl Into<String>) -> Self {
        Self::new(Some(409), body).with_reason("duplicate")
    }

    pub fn not_found(body: impl Into<String>) -> Self {
        Self::new(Some(404), body).with_reason("notFound")
    }

    /// The backend accepted an insert but rejected rows; `body` holds the
    /// per-row errors.
    pub fn insert_rejected(body: impl Into<String>) -> Self {
        Self::new(None, body).with_reason("insertErrors")
    }

    /// Transport level failure with no status code.
    pub fn transport(body: impl Into<String>) -> Self {
        Self::new(None, body)
    }

    pub fn is_already_exists(&self) -> bool {
        self.status == Some(409) || self.reason.as_deref() == Some("duplicate")
    }

    pub fn is_insert_rejected(&self) -> bool {
        self.reason.as_deref() == Some("insertErrors")
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404) || self.reason.as_deref() == Some("notFound")
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, &self.reason) {
            (Some(status), Some(reason)) => write!(f, "[{status} {reason}] {}", self.body),
            (Some(status), None) => write!(f, "[{status}] {}", self.body),
            (None, Some(reason)) => write!(f, "[{reason}] {}", self.body),
            (None, None) => f.write_str(&self.body),
        }
    }
}

impl std::error::Error for BackendError {}

/// Errors surfaced through the task lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// The configured dataset does not exist (source side).
    #[error("dataset `{dataset}` does not exist")]
    DatasetNotFound { dataset: String },

    /// The configured table does not exist (source side).
    #[error("table `{table}` does not exist")]
    TableNotFound { table: String },

    /// Invalid or incomplete configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A record or row is missing its key column.
    #[error("record is missing a non-empty key (column `{column}`)")]
    MissingKey { column: String },

    /// A row is missing the configured insert id column.
    #[error("row for key `{key}` has no value in id column `{column}`")]
    MissingInsertId { key: String, column: String },

    /// A record value cannot be turned into a table row.
    #[error("record `{key}` is not insertable: {reason}")]
    InvalidRow { key: String, reason: String },

    /// The backend accepted the call but rejected individual rows.
    #[error("insert rejected {rows} row(s): {body}")]
    InsertRejected { rows: usize, body: String },

    /// Table-storage call failed.
    #[error("backend call `{op}` failed: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: BackendError,
    },

    /// The transform hook failed for a record.
    #[error("transform failed for record `{key}`: {source}")]
    Transform {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// `put`/`poll` before `start` finished.
    #[error("task `{0}` has not been started")]
    NotStarted(String),

    /// `put`/`poll` after `stop`.
    #[error("task `{0}` has been stopped")]
    Stopped(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConnectorError {
    pub fn backend(op: &'static str, source: BackendError) -> Self {
        Self::Backend { op, source }
    }

    /// Errors the host must not retry (configuration and data errors).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DatasetNotFound { .. }
                | Self::TableNotFound { .. }
                | Self::Config(_)
                | Self::MissingKey { .. }
                | Self::MissingInsertId { .. }
                | Self::InvalidRow { .. }
                | Self::Stopped(_)
        )
    }
}

pub type Result<T, E = ConnectorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_detected_by_status_or_reason() {
        assert!(BackendError::already_exists("Already Exists: Table p:d.t").is_already_exists());
        assert!(BackendError::new(None, "x").with_reason("duplicate").is_already_exists());
        assert!(!BackendError::new(Some(500), "boom").is_already_exists());
    }

    #[test]
    fn backend_error_keeps_the_body_in_the_message() {
        let err = ConnectorError::backend(
            "insertAll",
            BackendError::new(Some(503), r#"{"error":{"message":"backendError"}}"#),
        );
        let msg = err.to_string();
        assert!(msg.contains("insertAll"));
        assert!(msg.contains("backendError"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn configuration_errors_are_fatal() {
        assert!(ConnectorError::DatasetNotFound { dataset: "d".into() }.is_fatal());
        assert!(ConnectorError::MissingKey { column: "id".into() }.is_fatal());
    }
}
