// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step execution.
//!
//! The executor drives one instance at a time per identity. Every read-modify-
//! write of an instance happens while holding that identity's lock, so at most
//! one action start, one transition evaluation and one persisted mutation are
//! in progress for an identity. Asynchronous actions run in their own task and
//! do not hold the lock while they are awaited.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::definition::{BoxFuture, StepContext, StepToken, WorkflowDefinition};
use crate::effect::apply_effect;
use crate::error::{CoreError, Result, StepFailure};
use crate::instance::{FailureReason, InstanceStatus, WorkflowInstance};
use crate::persistence::{InstanceStore, WriteOutcome};
use crate::recovery::{FailureDecision, OutcomeSource, RecoveryCoordinator, decide_failure};
use crate::workflow::Workflow;

/// Per-identity async locks. Entries are dropped once nobody holds or
/// waits for them.
#[derive(Debug, Default)]
pub(crate) struct IdentityLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

pub(crate) struct IdentityGuard<'a> {
    locks: &'a IdentityLocks,
    instance_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl IdentityLocks {
    pub(crate) async fn acquire(&self, instance_id: &str) -> IdentityGuard<'_> {
        let lock = self
            .locks
            .entry(instance_id.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        IdentityGuard {
            locks: self,
            instance_id: instance_id.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .locks
            .remove_if(&self.instance_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Shared execution state of one engine.
pub(crate) struct StepExecutor<W: Workflow> {
    pub(crate) workflow: W,
    pub(crate) definition: WorkflowDefinition<W::State>,
    pub(crate) store: Arc<dyn InstanceStore>,
    pub(crate) config: EngineConfig,
    pub(crate) locks: IdentityLocks,
    pub(crate) coordinator: RecoveryCoordinator,
    pub(crate) shutdown: CancellationToken,
}

impl<W: Workflow> StepExecutor<W> {
    pub(crate) fn new(
        workflow: W,
        definition: WorkflowDefinition<W::State>,
        store: Arc<dyn InstanceStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            workflow,
            definition,
            store,
            config,
            locks: IdentityLocks::default(),
            coordinator: RecoveryCoordinator::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) async fn load(
        &self,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstance<W::State>>> {
        match self.store.load(instance_id).await? {
            Some(record) => Ok(Some(WorkflowInstance::from_record(record)?)),
            None => Ok(None),
        }
    }

    /// Write the instance against the version it was loaded with.
    ///
    /// Returns false on a version conflict, leaving the instance's version
    /// untouched.
    pub(crate) async fn persist(
        &self,
        instance: &mut WorkflowInstance<W::State>,
    ) -> Result<bool> {
        let expected = instance.version;
        let previous_update = instance.updated_at;
        instance.version = expected + 1;
        instance.updated_at = Utc::now();

        let record = instance.to_record()?;
        match self.store.store(&record, expected).await {
            Ok(WriteOutcome::Stored) => Ok(true),
            Ok(WriteOutcome::Conflict) => {
                instance.version = expected;
                instance.updated_at = previous_update;
                Ok(false)
            }
            Err(e) => {
                instance.version = expected;
                instance.updated_at = previous_update;
                Err(e)
            }
        }
    }

    /// Count a write conflict, failing once the retry limit is exhausted.
    pub(crate) fn conflict(&self, instance_id: &str, conflicts: &mut u32) -> Result<()> {
        *conflicts += 1;
        if *conflicts > self.config.conflict_retry_limit {
            warn!(
                instance_id = %instance_id,
                attempts = *conflicts - 1,
                "Giving up after repeated write conflicts"
            );
            return Err(CoreError::ConcurrencyConflict {
                instance_id: instance_id.to_string(),
                attempts: *conflicts - 1,
            });
        }
        debug!(
            instance_id = %instance_id,
            conflicts = *conflicts,
            "Write conflict, reloading instance"
        );
        Ok(())
    }

    /// The workflow timeout, if the instance has exceeded it.
    pub(crate) fn workflow_expired(
        &self,
        instance: &WorkflowInstance<W::State>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let timeout = self.definition.timeout()?;
        let started = instance.workflow_started_at?;
        let elapsed = (now - started).to_std().unwrap_or_default();
        (elapsed >= timeout).then_some(timeout)
    }

    /// Drive an instance in the background.
    pub(crate) fn schedule(self: &Arc<Self>, instance_id: String) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = executor.advance(&instance_id).await {
                error!(
                    instance_id = %instance_id,
                    error = %e,
                    "Failed to advance workflow instance"
                );
            }
        });
    }

    /// Execute steps until the instance stops, suspends on an asynchronous
    /// action, or leaves the running state.
    #[instrument(skip(self), fields(workflow_type = self.workflow.workflow_type()))]
    pub(crate) async fn advance(self: &Arc<Self>, instance_id: &str) -> Result<()> {
        let mut conflicts = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let _guard = self.locks.acquire(instance_id).await;

            // 1. Only running instances execute
            let Some(mut instance) = self.load(instance_id).await? else {
                return Ok(());
            };
            if instance.status != InstanceStatus::Running {
                return Ok(());
            }
            let Some(step_name) = instance.current_step.clone() else {
                return Ok(());
            };
            let now = Utc::now();

            // 2. The workflow deadline is checked before every attempt
            if let Some(timeout) = self.workflow_expired(&instance, now) {
                warn!(
                    instance_id = %instance_id,
                    step = %step_name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Workflow timed out"
                );
                instance.fail(FailureReason::WorkflowTimeout {
                    step: Some(step_name),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
                if !self.persist(&mut instance).await? {
                    self.conflict(instance_id, &mut conflicts)?;
                    continue;
                }
                return Ok(());
            }

            // 3. A pointer to a step that no longer exists cannot execute
            let Some(step) = self.definition.step(&step_name) else {
                error!(
                    instance_id = %instance_id,
                    step = %step_name,
                    "Current step is not defined"
                );
                instance.fail(FailureReason::InvalidTransition {
                    step: step_name,
                    message: "step is not defined".to_string(),
                });
                if !self.persist(&mut instance).await? {
                    self.conflict(instance_id, &mut conflicts)?;
                    continue;
                }
                return Ok(());
            };

            let token = StepToken {
                instance_id: instance_id.to_string(),
                step: step_name.clone(),
                generation: instance.generation,
            };
            let ctx = StepContext::new(
                instance.user_state.clone(),
                instance.step_input.clone(),
                instance.attempt,
                token.clone(),
            );

            // 4. Asynchronous actions: record the wait, then hand off
            if step.suspends() {
                instance.status = InstanceStatus::WaitingForAsyncResult;
                instance.step_started_at = Some(now);
                if !self.persist(&mut instance).await? {
                    self.conflict(instance_id, &mut conflicts)?;
                    continue;
                }

                let timeout = self
                    .definition
                    .step_timeout(&step_name, self.config.default_step_timeout);
                info!(
                    instance_id = %instance_id,
                    step = %step_name,
                    attempt = instance.attempt,
                    generation = instance.generation,
                    "Waiting for asynchronous step"
                );
                // Tracked while still holding the lock, before any result can
                // be applied
                self.launch_async(token.clone(), step.invoke(ctx));
                self.arm_step_timeout(token, timeout, timeout);
                return Ok(());
            }

            // 5. Synchronous actions complete in place
            debug!(
                instance_id = %instance_id,
                step = %step_name,
                attempt = instance.attempt,
                "Executing step"
            );
            let outcome = step
                .invoke(ctx)
                .await
                .map_err(|e| StepFailure::action(format!("{:#}", e)));
            self.settle_outcome(&mut instance, &step_name, outcome, now);

            if !self.persist(&mut instance).await? {
                self.conflict(instance_id, &mut conflicts)?;
                continue;
            }
            if instance.status != InstanceStatus::Running {
                return Ok(());
            }
        }
    }

    fn launch_async(
        self: &Arc<Self>,
        token: StepToken,
        action: BoxFuture<'static, anyhow::Result<Value>>,
    ) {
        let executor = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let action_token = token.clone();

        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;

                _ = shutdown.cancelled() => return,

                outcome = action => outcome,
            };
            let outcome = outcome.map_err(|e| StepFailure::action(format!("{:#}", e)));

            if let Err(e) = executor
                .resolve(&action_token, outcome, OutcomeSource::Completion)
                .await
            {
                error!(
                    instance_id = %action_token.instance_id,
                    step = %action_token.step,
                    error = %e,
                    "Failed to apply asynchronous step result"
                );
            }
        });

        self.coordinator.track_action(&token, handle.abort_handle());
    }

    /// Apply the outcome of an asynchronous attempt.
    ///
    /// Returns false, changing nothing, when the attempt is no longer the one
    /// being awaited.
    pub(crate) async fn resolve(
        self: &Arc<Self>,
        token: &StepToken,
        outcome: std::result::Result<Value, StepFailure>,
        source: OutcomeSource,
    ) -> Result<bool> {
        let mut conflicts = 0;

        loop {
            let guard = self.locks.acquire(&token.instance_id).await;

            let Some(mut instance) = self.load(&token.instance_id).await? else {
                debug!(instance_id = %token.instance_id, "Discarding result for deleted instance");
                return Ok(false);
            };
            if !instance.is_awaiting(token) {
                debug!(
                    instance_id = %token.instance_id,
                    step = %token.step,
                    generation = token.generation,
                    current_generation = instance.generation,
                    source = ?source,
                    "Discarding stale step result"
                );
                return Ok(false);
            }

            let now = Utc::now();
            self.settle_outcome(&mut instance, &token.step, outcome.clone(), now);
            if !self.persist(&mut instance).await? {
                self.conflict(&token.instance_id, &mut conflicts)?;
                continue;
            }
            self.coordinator.settle(token, source);
            drop(guard);

            if instance.status == InstanceStatus::Running {
                self.schedule(instance.instance_id);
            }
            return Ok(true);
        }
    }

    /// Turn an attempt outcome into the next instance state.
    fn settle_outcome(
        &self,
        instance: &mut WorkflowInstance<W::State>,
        step_name: &str,
        outcome: std::result::Result<Value, StepFailure>,
        now: DateTime<Utc>,
    ) {
        let result = match outcome {
            Ok(result) => result,
            Err(failure) => return self.apply_failure(instance, step_name, failure, now),
        };

        let Some(step) = self.definition.step(step_name) else {
            instance.fail(FailureReason::InvalidTransition {
                step: step_name.to_string(),
                message: "step is not defined".to_string(),
            });
            return;
        };

        let effect = match step.transition(instance.user_state.as_ref(), result) {
            Ok(effect) => effect,
            Err(failure) => return self.apply_failure(instance, step_name, failure, now),
        };

        if effect.transition().is_none() && !effect.reply_value().is_some_and(|r| r.is_error()) {
            error!(
                instance_id = %instance.instance_id,
                step = %step_name,
                "Step transition did not move the workflow"
            );
            instance.fail(FailureReason::InvalidTransition {
                step: step_name.to_string(),
                message: "transition must go to a step, end or pause".to_string(),
            });
            return;
        }

        match apply_effect(instance, effect, &self.definition, now) {
            // An error reply rejects the result and counts as a failed attempt
            Ok(reply) if reply.is_error() => {
                let message = reply.into_result().err().unwrap_or_default();
                self.apply_failure(instance, step_name, StepFailure::Action { message }, now);
            }
            Ok(_) => {
                debug!(
                    instance_id = %instance.instance_id,
                    from = %step_name,
                    to = ?instance.current_step,
                    status = %instance.status,
                    "Step completed"
                );
            }
            Err(e) => {
                error!(
                    instance_id = %instance.instance_id,
                    step = %step_name,
                    error = %e,
                    "Step transition rejected"
                );
                instance.fail(FailureReason::InvalidTransition {
                    step: step_name.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn apply_failure(
        &self,
        instance: &mut WorkflowInstance<W::State>,
        step_name: &str,
        failure: StepFailure,
        now: DateTime<Utc>,
    ) {
        match &failure {
            StepFailure::Timeout { timeout } => warn!(
                instance_id = %instance.instance_id,
                step = %step_name,
                attempt = instance.attempt,
                timeout_ms = timeout.as_millis() as u64,
                "Step timed out"
            ),
            StepFailure::Action { message } => warn!(
                instance_id = %instance.instance_id,
                step = %step_name,
                attempt = instance.attempt,
                error = %message,
                "Step action failed"
            ),
        }

        let strategy = self.definition.recover_strategy(step_name);
        let expired = self.workflow_expired(instance, now);

        match decide_failure(step_name, instance.attempt, strategy, &failure, expired) {
            FailureDecision::Retry => {
                instance.retry_step();
                info!(
                    instance_id = %instance.instance_id,
                    step = %step_name,
                    attempt = instance.attempt,
                    "Retrying step"
                );
            }
            FailureDecision::Failover { step, input } => {
                info!(
                    instance_id = %instance.instance_id,
                    step = %step_name,
                    failover = %step,
                    "Retries exhausted, failing over"
                );
                instance.enter_step(step, input);
            }
            FailureDecision::Fail(reason) => {
                error!(
                    instance_id = %instance.instance_id,
                    step = %step_name,
                    reason = %reason,
                    "Workflow failed"
                );
                instance.fail(reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_lock_serializes_and_cleans_up() {
        let locks = Arc::new(IdentityLocks::default());

        let guard = locks.acquire("t-1").await;
        assert_eq!(locks.len(), 1);

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("t-1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_different_identities_do_not_block() {
        let locks = IdentityLocks::default();
        let _a = locks.acquire("a").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b"))
            .await
            .expect("other identities must not wait");
        assert_eq!(locks.len(), 2);
    }
}
