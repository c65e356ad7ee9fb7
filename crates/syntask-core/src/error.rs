// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for state orchestration.

use thiserror::Error;
use uuid::Uuid;

use crate::states::StateType;

/// Result type using [`OrchestrationError`].
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Errors returned when proposing or persisting a state transition.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum OrchestrationError {
    /// The proposed state type is not reachable from the run's current state type.
    #[error("Run '{run_id}' cannot transition from {from} to {to}")]
    InvalidTransition {
        /// The run.
        run_id: Uuid,
        /// Current state type.
        from: StateType,
        /// Proposed state type.
        to: StateType,
    },

    /// An orchestration rule vetoed the transition.
    #[error("Transition for run '{run_id}' rejected by {rule}: {reason}")]
    PolicyRejected {
        /// The run.
        run_id: Uuid,
        /// Name of the rule that aborted.
        rule: &'static str,
        /// The rule's reason.
        reason: String,
    },

    /// The run does not exist (or was deleted concurrently).
    #[error("Run '{run_id}' not found")]
    RunNotFound {
        /// The run.
        run_id: Uuid,
    },

    /// Another writer changed the run's state between read and write.
    #[error("Run '{run_id}' was modified concurrently")]
    ConcurrencyConflict {
        /// The run.
        run_id: Uuid,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl OrchestrationError {
    /// Stable error code for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::PolicyRejected { .. } => "POLICY_REJECTED",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether a background corrector may skip the affected run and continue.
    ///
    /// Direct API callers surface these errors instead.
    pub fn is_skippable_for_background(&self) -> bool {
        matches!(
            self,
            Self::RunNotFound { .. }
                | Self::InvalidTransition { .. }
                | Self::PolicyRejected { .. }
                | Self::ConcurrencyConflict { .. }
        )
    }

    /// Whether the caller may retry the whole proposal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    pub(crate) fn database(operation: &str, details: impl ToString) -> Self {
        Self::Database {
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }
}

impl From<sqlx::Error> for OrchestrationError {
    fn from(err: sqlx::Error) -> Self {
        Self::database("query", err)
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::database("json", err)
    }
}

impl From<sqlx::migrate::MigrateError> for OrchestrationError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::database("migrate", err)
    }
}
