// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timers, retry/failover policy and crash recovery.
//!
//! The coordinator tracks, per instance, the tasks belonging to the attempt
//! that is currently awaited: the asynchronous action and its timeout timer.
//! Exactly one of them wins by settling the attempt under the instance lock;
//! the other is aborted, and anything arriving later is stale because the
//! generation stamp has moved on.
//!
//! On restart, the recovery sweep re-arms the timers of waiting
//! instances from their persisted start time. The action itself is never
//! invoked again because of the restart: its result may still be delivered
//! through [`WorkflowEngine::complete_step`](crate::engine::WorkflowEngine::complete_step),
//! and otherwise the timeout drives the retry policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::definition::{RecoverStrategy, StepToken};
use crate::error::{CoreError, Result, StepFailure};
use crate::executor::StepExecutor;
use crate::instance::{FailureReason, InstanceStatus};
use crate::workflow::Workflow;

/// Who delivered the outcome of an asynchronous attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutcomeSource {
    /// The in-process action task finished.
    Completion,
    /// The step timeout fired.
    Timer,
    /// A caller delivered the result through the engine.
    External,
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    action: Option<AbortHandle>,
    timer: Option<AbortHandle>,
}

impl InFlight {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            action: None,
            timer: None,
        }
    }

    fn abort(&mut self) {
        if let Some(action) = self.action.take() {
            action.abort();
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Tracks the tasks of in-flight asynchronous attempts.
#[derive(Debug, Default)]
pub struct RecoveryCoordinator {
    in_flight: DashMap<String, InFlight>,
}

impl RecoveryCoordinator {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry(&self, token: &StepToken, f: impl FnOnce(&mut InFlight)) {
        let mut entry = self
            .in_flight
            .entry(token.instance_id.clone())
            .or_insert_with(|| InFlight::new(token.generation));
        if entry.generation != token.generation {
            // A newer attempt replaces whatever is left of an older one
            entry.abort();
            *entry = InFlight::new(token.generation);
        }
        f(entry.value_mut());
    }

    pub(crate) fn track_action(&self, token: &StepToken, handle: AbortHandle) {
        self.with_entry(token, |f| f.action = Some(handle));
    }

    pub(crate) fn track_timer(&self, token: &StepToken, handle: AbortHandle) {
        self.with_entry(token, |f| f.timer = Some(handle));
    }

    /// Forget an attempt that has been settled, aborting the task that lost.
    pub(crate) fn settle(&self, token: &StepToken, source: OutcomeSource) {
        let removed = self
            .in_flight
            .remove_if(&token.instance_id, |_, f| f.generation == token.generation);
        if let Some((_, mut in_flight)) = removed {
            match source {
                OutcomeSource::Completion => in_flight.action = None,
                OutcomeSource::Timer => in_flight.timer = None,
                OutcomeSource::External => {}
            }
            in_flight.abort();
        }
    }

    /// Cancel whatever is in flight for an instance.
    pub fn disarm(&self, instance_id: &str) {
        if let Some((_, mut in_flight)) = self.in_flight.remove(instance_id) {
            debug!(
                instance_id = %instance_id,
                generation = in_flight.generation,
                "Disarming in-flight attempt"
            );
            in_flight.abort();
        }
    }

    /// Returns true if tasks are tracked for this attempt.
    pub fn is_tracking(&self, instance_id: &str, generation: u64) -> bool {
        self.in_flight
            .get(instance_id)
            .is_some_and(|f| f.generation == generation)
    }

    /// Number of instances with tracked tasks.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Abort every tracked task.
    pub fn abort_all(&self) {
        self.in_flight.retain(|_, f| {
            f.abort();
            false
        });
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDecision {
    /// Run the same step again.
    Retry,
    /// Enter the failover step with a fresh attempt counter.
    Failover {
        /// Failover step.
        step: String,
        /// Input handed to the failover step.
        input: Option<Value>,
    },
    /// Give up.
    Fail(FailureReason),
}

/// Apply the retry and failover policy to a failed attempt.
///
/// `attempt` is the number of failed attempts before this one. A step with
/// `max_retries = n` is therefore attempted at most `n + 1` times. An expired
/// workflow deadline is terminal and bypasses the policy.
pub fn decide_failure(
    step: &str,
    attempt: u32,
    strategy: &RecoverStrategy,
    failure: &StepFailure,
    workflow_expired: Option<Duration>,
) -> FailureDecision {
    if let Some(timeout) = workflow_expired {
        return FailureDecision::Fail(FailureReason::WorkflowTimeout {
            step: Some(step.to_string()),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        });
    }

    if attempt < strategy.max_retries {
        return FailureDecision::Retry;
    }

    match &strategy.failover_step {
        Some(failover) => FailureDecision::Failover {
            step: failover.clone(),
            input: strategy.failover_input.clone(),
        },
        None => FailureDecision::Fail(FailureReason::StepsExhausted {
            step: step.to_string(),
            attempts: attempt.saturating_add(1),
            message: failure.to_string(),
        }),
    }
}

/// Outcome of a recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Running instances handed back to the executor.
    pub resumed: usize,
    /// Waiting instances whose step timeout was re-armed.
    pub rearmed: usize,
    /// Instances failed because their workflow deadline had passed.
    pub expired: usize,
    /// Paused instances left for a command to resume.
    pub paused: usize,
}

impl<W: Workflow> StepExecutor<W> {
    /// Start the timeout timer of an asynchronous attempt.
    ///
    /// `after` is the time left; `timeout` is the configured step timeout
    /// reported in the failure.
    pub(crate) fn arm_step_timeout(
        self: &Arc<Self>,
        token: StepToken,
        after: Duration,
        timeout: Duration,
    ) {
        let executor = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let timer_token = token.clone();

        let timer = tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {}

                _ = tokio::time::sleep(after) => {
                    let failure = StepFailure::Timeout { timeout };
                    if let Err(e) = executor
                        .resolve(&timer_token, Err(failure), OutcomeSource::Timer)
                        .await
                    {
                        error!(
                            instance_id = %timer_token.instance_id,
                            step = %timer_token.step,
                            error = %e,
                            "Failed to apply step timeout"
                        );
                    }
                }
            }
        });

        debug!(
            instance_id = %token.instance_id,
            step = %token.step,
            generation = token.generation,
            after_ms = after.as_millis() as u64,
            "Step timeout armed"
        );
        self.coordinator.track_timer(&token, timer.abort_handle());
    }

    /// Resume every active instance of this workflow type.
    #[instrument(skip(self), fields(workflow_type = self.workflow.workflow_type()))]
    pub(crate) async fn recover(self: &Arc<Self>) -> Result<RecoveryReport> {
        if self.shutdown.is_cancelled() {
            return Err(CoreError::ShuttingDown);
        }

        let records = self
            .store
            .list_active(self.workflow.workflow_type())
            .await?;
        let mut report = RecoveryReport::default();

        for record in records {
            let instance_id = record.instance_id;
            let mut conflicts = 0;

            loop {
                let guard = self.locks.acquire(&instance_id).await;

                // Reload under the lock; the listing may already be outdated
                let Some(mut instance) = self.load(&instance_id).await? else {
                    break;
                };
                let now = Utc::now();

                match instance.status {
                    InstanceStatus::Running => {
                        if let Some(timeout) = self.workflow_expired(&instance, now) {
                            let step = instance.current_step.clone();
                            instance.fail(FailureReason::WorkflowTimeout {
                                step,
                                timeout_ms: u64::try_from(timeout.as_millis())
                                    .unwrap_or(u64::MAX),
                            });
                            if !self.persist(&mut instance).await? {
                                drop(guard);
                                // Reported by `conflict` once the limit is hit
                                if self.conflict(&instance_id, &mut conflicts).is_err() {
                                    break;
                                }
                                continue;
                            }
                            warn!(
                                instance_id = %instance_id,
                                "Workflow deadline passed while stopped"
                            );
                            report.expired += 1;
                            break;
                        }
                        drop(guard);
                        self.schedule(instance_id.clone());
                        report.resumed += 1;
                    }
                    InstanceStatus::WaitingForAsyncResult => {
                        let Some(token) = instance.step_token() else {
                            break;
                        };
                        if self.coordinator.is_tracking(&instance_id, token.generation) {
                            break;
                        }

                        let timeout = self
                            .definition
                            .step_timeout(&token.step, self.config.default_step_timeout);
                        let elapsed = instance
                            .step_started_at
                            .and_then(|started| (now - started).to_std().ok())
                            .unwrap_or_default();
                        let remaining = timeout.saturating_sub(elapsed);

                        info!(
                            instance_id = %instance_id,
                            step = %token.step,
                            attempt = instance.attempt,
                            remaining_ms = remaining.as_millis() as u64,
                            "Re-arming step timeout of waiting instance"
                        );
                        self.arm_step_timeout(token, remaining, timeout);
                        report.rearmed += 1;
                    }
                    InstanceStatus::Paused => {
                        report.paused += 1;
                    }
                    _ => {}
                }
                break;
            }
        }

        info!(
            resumed = report.resumed,
            rearmed = report.rearmed,
            expired = report.expired,
            paused = report.paused,
            "Recovery sweep finished"
        );
        Ok(report)
    }
}
