// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process instance store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CoreError;

use super::{ACTIVE_STATUSES, InstanceRecord, InstanceStore, WriteOutcome};

/// Instance store kept in memory. Contents are lost when it is dropped, but
/// it survives engine restarts when shared through an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, InstanceRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn load(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        Ok(self.records.read().await.get(instance_id).cloned())
    }

    async fn store(
        &self,
        record: &InstanceRecord,
        expected_version: i64,
    ) -> Result<WriteOutcome, CoreError> {
        let mut records = self.records.write().await;
        let current = records.get(&record.instance_id).map(|r| r.version);

        let matches = match current {
            None => expected_version == 0,
            Some(version) => expected_version != 0 && version == expected_version,
        };
        if !matches {
            return Ok(WriteOutcome::Conflict);
        }

        records.insert(record.instance_id.clone(), record.clone());
        Ok(WriteOutcome::Stored)
    }

    async fn delete(&self, instance_id: &str) -> Result<bool, CoreError> {
        Ok(self.records.write().await.remove(instance_id).is_some())
    }

    async fn list_active(&self, workflow_type: &str) -> Result<Vec<InstanceRecord>, CoreError> {
        let records = self.records.read().await;
        let mut active: Vec<_> = records
            .values()
            .filter(|r| r.workflow_type == workflow_type)
            .filter(|r| ACTIVE_STATUSES.contains(&r.status.as_str()))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }
}
