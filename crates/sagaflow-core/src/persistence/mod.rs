// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for sagaflow-core.
//!
//! The engine stores one [`InstanceRecord`] per workflow identity. Writes are
//! guarded by an optimistic `version` column so that two processes touching
//! the same identity cannot silently overwrite each other.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// Persisted form of a workflow instance.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct InstanceRecord {
    /// Workflow identity.
    pub instance_id: String,
    /// Workflow type the instance belongs to.
    pub workflow_type: String,
    /// Status (not_started, running, waiting_for_async_result, paused, ended, failed).
    pub status: String,
    /// JSON-encoded user state.
    pub user_state: Option<Vec<u8>>,
    /// Current step name.
    pub current_step: Option<String>,
    /// JSON-encoded input of the current step.
    pub step_input: Option<Vec<u8>>,
    /// Failed attempts of the current step.
    pub attempt: i64,
    /// Step attempt generation stamp.
    pub generation: i64,
    /// Last applied command identifier.
    pub last_command_id: Option<String>,
    /// JSON-encoded reply to the last command.
    pub last_reply: Option<Vec<u8>>,
    /// JSON-encoded failure reason.
    pub failure: Option<String>,
    /// When the in-flight asynchronous attempt started.
    pub step_started_at: Option<DateTime<Utc>>,
    /// When the current workflow run started.
    pub workflow_started_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version.
    pub version: i64,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance was last written.
    pub updated_at: DateTime<Utc>,
}

/// Result of a versioned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record was written.
    Stored,
    /// The stored version did not match; nothing was written.
    Conflict,
}

/// Durable instance storage keyed by identity.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Load the record for an identity.
    async fn load(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError>;

    /// Write a record if the stored version equals `expected_version`.
    ///
    /// `expected_version == 0` inserts a new record and conflicts if one
    /// already exists. The record's own `version` is the value to store.
    async fn store(
        &self,
        record: &InstanceRecord,
        expected_version: i64,
    ) -> Result<WriteOutcome, CoreError>;

    /// Remove a record. Returns true if one existed.
    async fn delete(&self, instance_id: &str) -> Result<bool, CoreError>;

    /// List records of a workflow type that still hold a step pointer
    /// (running, waiting_for_async_result or paused).
    async fn list_active(&self, workflow_type: &str) -> Result<Vec<InstanceRecord>, CoreError>;
}

/// Statuses returned by [`InstanceStore::list_active`].
pub(crate) const ACTIVE_STATUSES: [&str; 3] = ["running", "waiting_for_async_result", "paused"];
