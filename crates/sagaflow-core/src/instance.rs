// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable per-identity workflow state.
//!
//! # Instance Status State Machine
//!
//! ```text
//!   ┌─────────────┐  command: start / transition_to
//!   │ NOT_STARTED │──────────────────────────┐
//!   └─────────────┘                          ▼
//!                    retry / failover  ┌─────────┐   async action   ┌──────────────────────────┐
//!                   ┌─────────────────►│ RUNNING │─────────────────►│ WAITING_FOR_ASYNC_RESULT │
//!                   │                  └────┬────┘◄─────────────────└────────────┬─────────────┘
//!                   │                       │     result / timeout               │
//!                   │         ┌─────────────┼──────────────┐                     │
//!                   │      pause          end          exhausted / workflow timeout
//!                   │         ▼             ▼              ▼                     │
//!                   │    ┌────────┐    ┌───────┐      ┌────────┐                 │
//!                   └────│ PAUSED │    │ ENDED │      │ FAILED │◄────────────────┘
//!             command    └────────┘    └───────┘      └────────┘
//! ```
//!
//! `current_step` is set exactly when the status is `RUNNING`,
//! `WAITING_FOR_ASYNC_RESULT` or `PAUSED`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::StepToken;
use crate::effect::Reply;
use crate::error::{CoreError, Result};
use crate::persistence::InstanceRecord;

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// No command has started the workflow yet.
    NotStarted,
    /// A step is about to run (or a synchronous step is running).
    Running,
    /// An asynchronous step action is in flight.
    WaitingForAsyncResult,
    /// Automatic execution stopped until a command resumes it.
    Paused,
    /// The workflow finished.
    Ended,
    /// Retries and failover were exhausted or the workflow timed out.
    Failed,
}

impl InstanceStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::WaitingForAsyncResult => "waiting_for_async_result",
            Self::Paused => "paused",
            Self::Ended => "ended",
            Self::Failed => "failed",
        }
    }

    /// Parse a status from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(Self::NotStarted),
            "running" => Some(Self::Running),
            "waiting_for_async_result" => Some(Self::WaitingForAsyncResult),
            "paused" => Some(Self::Paused),
            "ended" => Some(Self::Ended),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true while a step pointer is held.
    pub fn has_step(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::WaitingForAsyncResult | Self::Paused
        )
    }

    /// Returns true if the instance can no longer execute on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance entered [`InstanceStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// A step failed on every attempt and had no failover step.
    StepsExhausted {
        /// The failing step.
        step: String,
        /// How many times it was attempted.
        attempts: u32,
        /// Message of the last failure.
        message: String,
    },
    /// The workflow exceeded its overall timeout.
    WorkflowTimeout {
        /// Step that was current when the timeout was detected.
        step: Option<String>,
        /// The configured workflow timeout in milliseconds.
        timeout_ms: u64,
    },
    /// A step transition did not produce a usable next move.
    InvalidTransition {
        /// The step whose transition misbehaved.
        step: String,
        /// What went wrong.
        message: String,
    },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StepsExhausted {
                step,
                attempts,
                message,
            } => write!(
                f,
                "step '{}' failed after {} attempt(s): {}",
                step, attempts, message
            ),
            Self::WorkflowTimeout { step, timeout_ms } => match step {
                Some(step) => write!(
                    f,
                    "workflow timed out after {}ms in step '{}'",
                    timeout_ms, step
                ),
                None => write!(f, "workflow timed out after {}ms", timeout_ms),
            },
            Self::InvalidTransition { step, message } => {
                write!(f, "invalid transition from step '{}': {}", step, message)
            }
        }
    }
}

/// Durable state of one workflow instance.
///
/// Handlers receive a shared reference; all changes go through effects.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowInstance<S> {
    /// Externally assigned identity.
    pub instance_id: String,
    /// Workflow type this instance belongs to.
    pub workflow_type: String,
    /// User state, absent until the first state update.
    pub user_state: Option<S>,
    /// Step about to execute (or paused at).
    pub current_step: Option<String>,
    /// Input handed to the current step's action.
    pub step_input: Option<Value>,
    /// Failed attempts of the current step so far.
    pub attempt: u32,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Last applied external command.
    pub last_command_id: Option<String>,
    /// Reply produced for `last_command_id`, replayed on duplicates.
    pub last_reply: Option<Reply>,
    /// Stamp identifying the current step attempt. Bumped on every step
    /// entry, retry, pause and end so stale completions can be detected.
    pub generation: u64,
    /// When the in-flight asynchronous attempt started.
    pub step_started_at: Option<DateTime<Utc>>,
    /// When the current run of the workflow started.
    pub workflow_started_at: Option<DateTime<Utc>>,
    /// Failure details when status is `Failed`.
    pub failure: Option<FailureReason>,
    /// Optimistic concurrency version; 0 means never stored.
    pub version: i64,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance was last stored.
    pub updated_at: DateTime<Utc>,
}

/// Read-only view returned by state queries.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot<S> {
    /// User state.
    pub user_state: Option<S>,
    /// Current step, if any.
    pub current_step: Option<String>,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Failed attempts of the current step so far.
    pub attempt: u32,
    /// Failure details when failed.
    pub failure: Option<FailureReason>,
}

impl<S> WorkflowInstance<S> {
    /// Create a fresh, not yet started instance.
    pub fn new(
        instance_id: impl Into<String>,
        workflow_type: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            workflow_type: workflow_type.into(),
            user_state: None,
            current_step: None,
            step_input: None,
            attempt: 0,
            status: InstanceStatus::NotStarted,
            last_command_id: None,
            last_reply: None,
            generation: 0,
            step_started_at: None,
            workflow_started_at: None,
            failure: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if this instance has never been stored.
    pub fn is_new(&self) -> bool {
        self.version == 0
    }

    /// Token identifying the current step attempt, if a step is current.
    pub fn step_token(&self) -> Option<StepToken> {
        self.current_step.as_ref().map(|step| StepToken {
            instance_id: self.instance_id.clone(),
            step: step.clone(),
            generation: self.generation,
        })
    }

    /// Returns true if the token refers to the attempt currently awaited.
    pub fn is_awaiting(&self, token: &StepToken) -> bool {
        self.status == InstanceStatus::WaitingForAsyncResult
            && self.generation == token.generation
            && self.current_step.as_deref() == Some(token.step.as_str())
    }

    /// Enter a step with a fresh attempt counter.
    pub(crate) fn enter_step(&mut self, step: String, input: Option<Value>) {
        self.current_step = Some(step);
        self.step_input = input;
        self.attempt = 0;
        self.status = InstanceStatus::Running;
        self.step_started_at = None;
        self.failure = None;
        self.generation += 1;
    }

    /// Re-run the current step after a failed attempt.
    pub(crate) fn retry_step(&mut self) {
        self.attempt += 1;
        self.status = InstanceStatus::Running;
        self.step_started_at = None;
        self.generation += 1;
    }

    /// Mark the instance failed and drop the step pointer.
    pub(crate) fn fail(&mut self, reason: FailureReason) {
        self.status = InstanceStatus::Failed;
        self.current_step = None;
        self.step_input = None;
        self.step_started_at = None;
        self.failure = Some(reason);
        self.generation += 1;
    }
}

impl<S: Clone> WorkflowInstance<S> {
    /// Project the query-visible part of the instance.
    pub fn snapshot(&self) -> StateSnapshot<S> {
        StateSnapshot {
            user_state: self.user_state.clone(),
            current_step: self.current_step.clone(),
            status: self.status,
            attempt: self.attempt,
            failure: self.failure.clone(),
        }
    }
}

impl<S: Serialize + DeserializeOwned> WorkflowInstance<S> {
    /// Decode an instance from its persisted record.
    pub fn from_record(record: InstanceRecord) -> Result<Self> {
        let status = InstanceStatus::parse(&record.status).ok_or_else(|| {
            CoreError::Serialization(format!(
                "unknown status '{}' for instance '{}'",
                record.status, record.instance_id
            ))
        })?;

        Ok(Self {
            user_state: decode(record.user_state.as_deref())?,
            step_input: decode(record.step_input.as_deref())?,
            last_reply: decode(record.last_reply.as_deref())?,
            failure: record
                .failure
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            instance_id: record.instance_id,
            workflow_type: record.workflow_type,
            current_step: record.current_step,
            attempt: u32::try_from(record.attempt).unwrap_or(0),
            status,
            last_command_id: record.last_command_id,
            generation: u64::try_from(record.generation).unwrap_or(0),
            step_started_at: record.step_started_at,
            workflow_started_at: record.workflow_started_at,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    /// Encode the instance as a persisted record.
    pub fn to_record(&self) -> Result<InstanceRecord> {
        Ok(InstanceRecord {
            instance_id: self.instance_id.clone(),
            workflow_type: self.workflow_type.clone(),
            status: self.status.as_str().to_string(),
            user_state: encode(self.user_state.as_ref())?,
            current_step: self.current_step.clone(),
            step_input: encode(self.step_input.as_ref())?,
            attempt: i64::from(self.attempt),
            generation: i64::try_from(self.generation).unwrap_or(i64::MAX),
            last_command_id: self.last_command_id.clone(),
            last_reply: encode(self.last_reply.as_ref())?,
            failure: self
                .failure
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            step_started_at: self.step_started_at,
            workflow_started_at: self.workflow_started_at,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn encode<T: Serialize>(value: Option<&T>) -> Result<Option<Vec<u8>>> {
    value
        .map(serde_json::to_vec)
        .transpose()
        .map_err(CoreError::from)
}

fn decode<T: DeserializeOwned>(bytes: Option<&[u8]>) -> Result<Option<T>> {
    bytes
        .map(serde_json::from_slice)
        .transpose()
        .map_err(CoreError::from)
}
