// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The public entry point: commands in, replies and state queries out.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::config::EngineConfig;
use crate::definition::{StepToken, WorkflowDefinition};
use crate::effect::{Reply, apply_effect};
use crate::error::{CoreError, Result, StepFailure};
use crate::executor::StepExecutor;
use crate::instance::{InstanceStatus, StateSnapshot, WorkflowInstance};
use crate::persistence::InstanceStore;
use crate::recovery::{OutcomeSource, RecoveryReport};
use crate::workflow::Workflow;

/// Runs instances of one workflow type against an instance store.
///
/// Cloning is cheap; clones share the same executor, locks and timers.
pub struct WorkflowEngine<W: Workflow> {
    executor: Arc<StepExecutor<W>>,
}

impl<W: Workflow> Clone for WorkflowEngine<W> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
        }
    }
}

impl<W: Workflow> WorkflowEngine<W> {
    /// Build an engine, validating the workflow definition.
    ///
    /// Nothing is resumed; call [`recover`](Self::recover) or use
    /// [`start`](Self::start) to pick up instances left by a previous process.
    pub fn new(workflow: W, store: Arc<dyn InstanceStore>, config: EngineConfig) -> Result<Self> {
        let definition = workflow.definition()?;
        info!(
            workflow_type = workflow.workflow_type(),
            entry_step = definition.entry_step(),
            steps = definition.step_names().count(),
            "Workflow engine created"
        );
        Ok(Self {
            executor: Arc::new(StepExecutor::new(workflow, definition, store, config)),
        })
    }

    /// Build an engine and, if configured, run the recovery sweep.
    pub async fn start(
        workflow: W,
        store: Arc<dyn InstanceStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        let recover = config.recover_on_start;
        let engine = Self::new(workflow, store, config)?;
        if recover {
            engine.recover().await?;
        }
        Ok(engine)
    }

    /// Deliver a command to an instance, creating the instance if needed.
    ///
    /// A command whose id equals the last applied command id is not handled
    /// again; its recorded reply is returned instead. Commands reaching an
    /// ended instance are answered but leave its record untouched.
    #[instrument(
        skip(self, command),
        fields(workflow_type = self.executor.workflow.workflow_type())
    )]
    pub async fn invoke(
        &self,
        instance_id: &str,
        command_id: &str,
        command: &W::Command,
    ) -> Result<Reply> {
        let executor = &self.executor;
        let mut conflicts = 0;

        loop {
            if executor.shutdown.is_cancelled() {
                return Err(CoreError::ShuttingDown);
            }

            let guard = executor.locks.acquire(instance_id).await;
            let now = Utc::now();

            // 1. Load or create
            let mut instance = match executor.load(instance_id).await? {
                Some(instance) => instance,
                None => WorkflowInstance::new(
                    instance_id,
                    executor.workflow.workflow_type(),
                    now,
                ),
            };

            // 2. Duplicate commands replay their reply
            if instance.last_command_id.as_deref() == Some(command_id) {
                debug!("Duplicate command, replaying recorded reply");
                return Ok(instance.last_reply.clone().unwrap_or(Reply::Empty));
            }

            // 3. Handle and apply
            let generation = instance.generation;
            let was_ended = instance.status == InstanceStatus::Ended;
            let effect = executor.workflow.handle_command(&instance, command);
            let reply = apply_effect(&mut instance, effect, &executor.definition, now)?;

            // Nothing to remember for an identity that was never started, and
            // an ended instance only answers queries
            if (instance.is_new() && instance.status == InstanceStatus::NotStarted) || was_ended {
                return Ok(reply);
            }

            // 4. Persist together with the dedup record
            instance.last_command_id = Some(command_id.to_string());
            instance.last_reply = Some(reply.clone());
            if !executor.persist(&mut instance).await? {
                executor.conflict(instance_id, &mut conflicts)?;
                continue;
            }

            // 5. A moved generation orphans any in-flight attempt
            if instance.generation != generation {
                executor.coordinator.disarm(instance_id);
            }
            drop(guard);

            debug!(
                status = %instance.status,
                step = ?instance.current_step,
                "Command applied"
            );
            if instance.status == InstanceStatus::Running {
                executor.schedule(instance.instance_id);
            }
            return Ok(reply);
        }
    }

    /// Current state of an instance, without taking its lock.
    ///
    /// Every stored record is a complete post-transition state, so the
    /// snapshot is always consistent.
    pub async fn get_state(&self, instance_id: &str) -> Result<Option<StateSnapshot<W::State>>> {
        Ok(self
            .executor
            .load(instance_id)
            .await?
            .map(|instance| instance.snapshot()))
    }

    /// Full stored instance, including the token of the awaited attempt.
    pub async fn instance(&self, instance_id: &str) -> Result<Option<WorkflowInstance<W::State>>> {
        self.executor.load(instance_id).await
    }

    /// Deliver the result of an asynchronous attempt from outside the engine.
    ///
    /// Returns false when the token is stale: the attempt was already settled
    /// by its action, its timeout, or a command.
    #[instrument(
        skip(self, result),
        fields(instance_id = %token.instance_id, step = %token.step, generation = token.generation)
    )]
    pub async fn complete_step(
        &self,
        token: &StepToken,
        result: std::result::Result<Value, String>,
    ) -> Result<bool> {
        if self.executor.shutdown.is_cancelled() {
            return Err(CoreError::ShuttingDown);
        }
        let outcome = result.map_err(|message| StepFailure::Action { message });
        self.executor
            .resolve(token, outcome, OutcomeSource::External)
            .await
    }

    /// Remove an instance, cancelling its timer and in-flight action.
    #[instrument(skip(self))]
    pub async fn delete(&self, instance_id: &str) -> Result<()> {
        let _guard = self.executor.locks.acquire(instance_id).await;
        self.executor.coordinator.disarm(instance_id);

        if !self.executor.store.delete(instance_id).await? {
            return Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        }
        info!("Instance deleted");
        Ok(())
    }

    /// Resume running instances and re-arm timers of waiting ones.
    ///
    /// Safe to call more than once; attempts already tracked by this engine
    /// are left alone.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.executor.recover().await
    }

    /// Stop all timers and in-flight actions. Persisted state is untouched,
    /// so another engine can recover it.
    pub fn shutdown(&self) {
        info!(
            workflow_type = self.executor.workflow.workflow_type(),
            in_flight = self.executor.coordinator.in_flight(),
            "Shutting down workflow engine"
        );
        self.executor.shutdown.cancel();
        self.executor.coordinator.abort_all();
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.executor.shutdown.is_cancelled()
    }

    /// Number of instances with an asynchronous attempt tracked in this process.
    pub fn in_flight(&self) -> usize {
        self.executor.coordinator.in_flight()
    }

    /// The validated workflow definition.
    pub fn definition(&self) -> &WorkflowDefinition<W::State> {
        &self.executor.definition
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.executor.config
    }
}
