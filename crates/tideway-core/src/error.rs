// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tideway-core.
//!
//! Every engine operation returns [`CoreError`]. Each variant carries a stable
//! machine-readable code (see [`CoreError::error_code`]) so that CLIs and logs
//! can match on it without parsing messages.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while driving workflow runs.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    /// The history log could not be read or written.
    ///
    /// Fatal to the in-flight operation; the whole call is safe to retry.
    StorageUnavailable {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// No workflow run exists with this run ID.
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// No run has ever been started for this workflow ID.
    WorkflowNotFound {
        /// The workflow ID that was not found.
        workflow_id: String,
    },

    /// The query name is not registered for the run's workflow type.
    QueryNotSupported {
        /// Workflow type of the run.
        workflow_type: String,
        /// The requested query name.
        query_name: String,
    },

    /// Replay produced a command inconsistent with the recorded history.
    ///
    /// The run is corrupted and requires operator intervention.
    NonDeterminismDetected {
        /// The affected run.
        run_id: String,
        /// What diverged.
        details: String,
    },

    /// The run already reached a terminal state.
    RunClosed {
        /// The run ID.
        run_id: String,
        /// Its terminal status.
        status: String,
    },

    /// The history tail moved since the caller last read it.
    HistoryConflict {
        /// The run ID.
        run_id: String,
        /// The tail sequence the caller expected.
        expected: u64,
        /// The actual tail sequence.
        actual: u64,
    },

    /// A scheduled activity or timer was already resolved.
    DuplicateResolution {
        /// The run ID.
        run_id: String,
        /// Sequence number of the scheduling event.
        scheduled_event_id: u64,
    },

    /// No workflow implementation is registered for this type.
    WorkflowTypeNotRegistered {
        /// The unknown workflow type.
        workflow_type: String,
    },

    /// The run finished with status FAILED.
    WorkflowFailed {
        /// The workflow ID.
        workflow_id: String,
        /// The run ID.
        run_id: String,
        /// Error message from the `WorkflowFailed` event.
        message: String,
    },

    /// The run finished with status CANCELLED.
    WorkflowCancelled {
        /// The workflow ID.
        workflow_id: String,
        /// The run ID.
        run_id: String,
        /// Optional cancellation reason.
        reason: Option<String>,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A payload could not be encoded or decoded.
    Serialization {
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::StorageUnavailable { .. } => "STORAGE_UNAVAILABLE",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::QueryNotSupported { .. } => "QUERY_NOT_SUPPORTED",
            Self::NonDeterminismDetected { .. } => "NON_DETERMINISM_DETECTED",
            Self::RunClosed { .. } => "RUN_CLOSED",
            Self::HistoryConflict { .. } => "HISTORY_CONFLICT",
            Self::DuplicateResolution { .. } => "DUPLICATE_RESOLUTION",
            Self::WorkflowTypeNotRegistered { .. } => "WORKFLOW_TYPE_NOT_REGISTERED",
            Self::WorkflowFailed { .. } => "WORKFLOW_FAILED",
            Self::WorkflowCancelled { .. } => "WORKFLOW_CANCELLED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable { .. } | Self::HistoryConflict { .. }
        )
    }

    pub(crate) fn storage(operation: &str, details: impl fmt::Display) -> Self {
        Self::StorageUnavailable {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageUnavailable { operation, details } => {
                write!(f, "Storage unavailable during '{}': {}", operation, details)
            }
            Self::RunNotFound { run_id } => {
                write!(f, "Workflow run '{}' not found", run_id)
            }
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "Workflow '{}' not found", workflow_id)
            }
            Self::QueryNotSupported {
                workflow_type,
                query_name,
            } => {
                write!(
                    f,
                    "Query '{}' is not supported by workflow type '{}'",
                    query_name, workflow_type
                )
            }
            Self::NonDeterminismDetected { run_id, details } => {
                write!(
                    f,
                    "Non-determinism detected in run '{}': {}",
                    run_id, details
                )
            }
            Self::RunClosed { run_id, status } => {
                write!(f, "Workflow run '{}' is already {}", run_id, status)
            }
            Self::HistoryConflict {
                run_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "History of run '{}' moved: expected tail {}, found {}",
                    run_id, expected, actual
                )
            }
            Self::DuplicateResolution {
                run_id,
                scheduled_event_id,
            } => {
                write!(
                    f,
                    "Event {} of run '{}' was already resolved",
                    scheduled_event_id, run_id
                )
            }
            Self::WorkflowTypeNotRegistered { workflow_type } => {
                write!(f, "Workflow type '{}' is not registered", workflow_type)
            }
            Self::WorkflowFailed {
                workflow_id,
                run_id,
                message,
            } => {
                write!(
                    f,
                    "Workflow '{}' (run '{}') failed: {}",
                    workflow_id, run_id, message
                )
            }
            Self::WorkflowCancelled {
                workflow_id,
                run_id,
                reason,
            } => {
                if let Some(reason) = reason {
                    write!(
                        f,
                        "Workflow '{}' (run '{}') was cancelled: {}",
                        workflow_id, run_id, reason
                    )
                } else {
                    write!(
                        f,
                        "Workflow '{}' (run '{}') was cancelled",
                        workflow_id, run_id
                    )
                }
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::Serialization { details } => {
                write!(f, "Serialization error: {}", details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::storage("query", err)
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::storage("migrate", err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_codes() {
        let test_cases = vec![
            (
                CoreError::StorageUnavailable {
                    operation: "append".to_string(),
                    details: "disk full".to_string(),
                },
                "STORAGE_UNAVAILABLE",
            ),
            (
                CoreError::RunNotFound {
                    run_id: "run-1".to_string(),
                },
                "RUN_NOT_FOUND",
            ),
            (
                CoreError::QueryNotSupported {
                    workflow_type: "transfer".to_string(),
                    query_name: "nope".to_string(),
                },
                "QUERY_NOT_SUPPORTED",
            ),
            (
                CoreError::NonDeterminismDetected {
                    run_id: "run-1".to_string(),
                    details: "expected timer".to_string(),
                },
                "NON_DETERMINISM_DETECTED",
            ),
            (
                CoreError::HistoryConflict {
                    run_id: "run-1".to_string(),
                    expected: 3,
                    actual: 4,
                },
                "HISTORY_CONFLICT",
            ),
            (
                CoreError::DuplicateResolution {
                    run_id: "run-1".to_string(),
                    scheduled_event_id: 2,
                },
                "DUPLICATE_RESOLUTION",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::RunNotFound {
            run_id: "abc-123".to_string(),
        };
        assert_eq!(err.to_string(), "Workflow run 'abc-123' not found");

        let err = CoreError::QueryNotSupported {
            workflow_type: "money-transfer".to_string(),
            query_name: "balance".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Query 'balance' is not supported by workflow type 'money-transfer'"
        );

        let err = CoreError::WorkflowCancelled {
            workflow_id: "wf".to_string(),
            run_id: "r1".to_string(),
            reason: None,
        };
        assert_eq!(err.to_string(), "Workflow 'wf' (run 'r1') was cancelled");

        let err = CoreError::WorkflowCancelled {
            workflow_id: "wf".to_string(),
            run_id: "r1".to_string(),
            reason: Some("operator".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Workflow 'wf' (run 'r1') was cancelled: operator"
        );

        let err = CoreError::StorageUnavailable {
            operation: "append".to_string(),
            details: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Storage unavailable during 'append': connection refused"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(CoreError::storage("read", "io").is_retryable());
        assert!(
            !CoreError::NonDeterminismDetected {
                run_id: "x".to_string(),
                details: "y".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let err: CoreError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
    }
}
