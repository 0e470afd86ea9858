// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for sagaflow-core.
//!
//! Three layers of failure exist:
//!
//! - [`DefinitionError`]: an invalid workflow graph, reported when the
//!   definition is built and never at runtime.
//! - [`StepFailure`]: one failed attempt of a step. Consumed by the retry and
//!   failover policy, never returned to a caller.
//! - [`CoreError`]: errors returned by the engine's public operations.

use std::time::Duration;

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while building a [`WorkflowDefinition`](crate::definition::WorkflowDefinition).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// Two steps were registered under the same name.
    #[error("step '{0}' is defined more than once")]
    DuplicateStep(String),

    /// A step was registered with an empty name.
    #[error("step name must not be empty")]
    EmptyStepName,

    /// The definition contains no steps at all.
    #[error("workflow definition has no steps")]
    NoSteps,

    /// No entry step was designated.
    #[error("workflow definition has no entry step")]
    MissingEntryStep,

    /// The designated entry step is not defined.
    #[error("entry step '{0}' is not defined")]
    UnknownEntryStep(String),

    /// A recover strategy points at a step that is not defined.
    #[error("failover target '{target}' of '{owner}' is not defined")]
    UnknownFailoverStep {
        /// Step (or `<default>` for the workflow-level strategy) declaring the failover.
        owner: String,
        /// The missing failover target.
        target: String,
    },
}

/// Classification of a single failed step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepFailure {
    /// The action returned an error.
    #[error("step action failed: {message}")]
    Action {
        /// Error message reported by the action.
        message: String,
    },

    /// The action did not complete within the step timeout.
    #[error("step timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },
}

impl StepFailure {
    /// Build an action failure from any displayable error.
    pub fn action(message: impl std::fmt::Display) -> Self {
        Self::Action {
            message: message.to_string(),
        }
    }

    /// Returns true if this failure was caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors returned by engine operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// No instance exists for the identity.
    #[error("Instance '{instance_id}' not found")]
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// The instance has ended and can no longer change.
    #[error("Instance '{instance_id}' has ended and cannot be modified")]
    InstanceEnded {
        /// The ended instance.
        instance_id: String,
    },

    /// An effect referenced a step that is not part of the definition.
    #[error("Step '{step}' is not defined for instance '{instance_id}'")]
    UnknownStep {
        /// The instance the effect was applied to.
        instance_id: String,
        /// The undefined step name.
        step: String,
    },

    /// Storage write contention persisted beyond the configured retry limit.
    #[error("Instance '{instance_id}' write conflict after {attempts} reloads")]
    ConcurrencyConflict {
        /// The contended instance.
        instance_id: String,
        /// How many reload-and-retry rounds were made.
        attempts: u32,
    },

    /// A payload could not be converted to or from its wire form.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The workflow definition failed validation.
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    /// The engine has been shut down.
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::InstanceEnded { .. } => "INSTANCE_ENDED",
            Self::UnknownStep { .. } => "UNKNOWN_STEP",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::InvalidDefinition(_) => "INVALID_DEFINITION",
            Self::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
