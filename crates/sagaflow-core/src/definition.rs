// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions: named steps, their actions, transitions and policies.
//!
//! A definition is built once, validated, and then shared read-only by the
//! executor and the recovery coordinator.
//!
//! ```ignore
//! let definition = WorkflowDefinition::builder()
//!     .entry_step("withdraw")
//!     .timeout(Duration::from_secs(60))
//!     .add_step(
//!         Step::new("withdraw")
//!             .async_call(|ctx| async move { wallet.withdraw(ctx.input()?).await })
//!             .and_then(|_state, _: ()| Effect::new().transition_to("deposit"))
//!             .timeout(Duration::from_secs(5))
//!             .recover_strategy(RecoverStrategy::retries(1).failover_to("compensate")),
//!     )
//!     .build()?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::effect::Effect;
use crate::error::{DefinitionError, StepFailure};

/// Boxed future returned by step actions.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type ActionFn<S> =
    Arc<dyn Fn(StepContext<S>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

type TransitionFn<S> =
    Arc<dyn Fn(Option<&S>, Value) -> Result<Effect<S>, StepFailure> + Send + Sync>;

/// Identifies one attempt of one step of one instance.
///
/// Completions carrying a token whose generation no longer matches the
/// instance are stale and discarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepToken {
    /// Instance the attempt belongs to.
    pub instance_id: String,
    /// Step being attempted.
    pub step: String,
    /// Generation stamp of the attempt.
    pub generation: u64,
}

/// Everything a step action can see.
#[derive(Debug, Clone)]
pub struct StepContext<S> {
    state: Option<S>,
    input: Option<Value>,
    attempt: u32,
    token: StepToken,
}

impl<S> StepContext<S> {
    pub(crate) fn new(
        state: Option<S>,
        input: Option<Value>,
        attempt: u32,
        token: StepToken,
    ) -> Self {
        Self {
            state,
            input,
            attempt,
            token,
        }
    }

    /// Instance identity.
    pub fn instance_id(&self) -> &str {
        &self.token.instance_id
    }

    /// User state as of step entry.
    pub fn state(&self) -> Option<&S> {
        self.state.as_ref()
    }

    /// Decode the input handed to this step by the previous transition.
    ///
    /// A missing input decodes as JSON `null`, so `Option<T>` and `()` inputs
    /// accept it.
    pub fn input<I: DeserializeOwned>(&self) -> anyhow::Result<I> {
        let value = self.input.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    /// Raw step input.
    pub fn raw_input(&self) -> Option<&Value> {
        self.input.as_ref()
    }

    /// Zero-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Token for delivering the result of this attempt later.
    pub fn token(&self) -> &StepToken {
        &self.token
    }
}

/// Retry and failover policy of a step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecoverStrategy {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Step entered once retries are exhausted.
    pub failover_step: Option<String>,
    /// Input handed to the failover step.
    pub failover_input: Option<Value>,
}

impl RecoverStrategy {
    /// Retry up to `max_retries` times, then fail.
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Enter `step` once retries are exhausted.
    pub fn failover_to(mut self, step: impl Into<String>) -> Self {
        self.failover_step = Some(step.into());
        self
    }

    /// Enter `step` with `input` once retries are exhausted.
    pub fn failover_to_with(mut self, step: impl Into<String>, input: Value) -> Self {
        self.failover_step = Some(step.into());
        self.failover_input = Some(input);
        self
    }
}

/// Entry point of the step builder chain.
pub struct Step;

impl Step {
    /// Start describing a step.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(name: impl Into<String>) -> StepBuilder {
        StepBuilder { name: name.into() }
    }
}

/// A named step awaiting its action.
pub struct StepBuilder {
    name: String,
}

impl StepBuilder {
    /// Attach a synchronous action. Its result is available immediately.
    pub fn call<S, R, F>(self, action: F) -> CallStepBuilder<S, R>
    where
        S: Send + 'static,
        R: Serialize + DeserializeOwned + 'static,
        F: Fn(StepContext<S>) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let action: ActionFn<S> = Arc::new(
            move |ctx: StepContext<S>| -> BoxFuture<'static, anyhow::Result<Value>> {
                let result = action(ctx).and_then(|r| Ok(serde_json::to_value(r)?));
                Box::pin(std::future::ready(result))
            },
        );
        CallStepBuilder {
            name: self.name,
            action,
            suspends: false,
            _result: PhantomData,
        }
    }

    /// Attach an asynchronous action. The instance waits for it without
    /// holding its execution slot, guarded by the step timeout.
    pub fn async_call<S, R, F, Fut>(self, action: F) -> CallStepBuilder<S, R>
    where
        S: Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(StepContext<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let action: ActionFn<S> = Arc::new(
            move |ctx: StepContext<S>| -> BoxFuture<'static, anyhow::Result<Value>> {
                let fut = action(ctx);
                Box::pin(async move {
                    let r = fut.await?;
                    Ok(serde_json::to_value(r)?)
                })
            },
        );
        CallStepBuilder {
            name: self.name,
            action,
            suspends: true,
            _result: PhantomData,
        }
    }
}

/// A step with an action, awaiting its transition.
pub struct CallStepBuilder<S, R> {
    name: String,
    action: ActionFn<S>,
    suspends: bool,
    _result: PhantomData<fn() -> R>,
}

impl<S, R> CallStepBuilder<S, R>
where
    S: 'static,
    R: DeserializeOwned + 'static,
{
    /// Attach the transition computing the next effect from the action result.
    pub fn and_then<F>(self, transition: F) -> StepDefinition<S>
    where
        F: Fn(Option<&S>, R) -> Effect<S> + Send + Sync + 'static,
    {
        let step = self.name.clone();
        let transition: TransitionFn<S> = Arc::new(
            move |state: Option<&S>, value: Value| -> Result<Effect<S>, StepFailure> {
                let result: R = serde_json::from_value(value).map_err(|e| {
                    StepFailure::action(format!("cannot decode result of step '{}': {}", step, e))
                })?;
                Ok(transition(state, result))
            },
        );
        StepDefinition {
            name: self.name,
            action: self.action,
            transition,
            suspends: self.suspends,
            timeout: None,
            recover_strategy: None,
        }
    }
}

/// A fully described step.
pub struct StepDefinition<S> {
    name: String,
    action: ActionFn<S>,
    transition: TransitionFn<S>,
    suspends: bool,
    timeout: Option<Duration>,
    recover_strategy: Option<RecoverStrategy>,
}

impl<S> StepDefinition<S> {
    /// Override the step timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry and failover policy.
    pub fn recover_strategy(mut self, strategy: RecoverStrategy) -> Self {
        self.recover_strategy = Some(strategy);
        self
    }

    /// Step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the action is asynchronous.
    pub fn suspends(&self) -> bool {
        self.suspends
    }

    pub(crate) fn invoke(&self, ctx: StepContext<S>) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.action)(ctx)
    }

    pub(crate) fn transition(
        &self,
        state: Option<&S>,
        result: Value,
    ) -> Result<Effect<S>, StepFailure> {
        (self.transition)(state, result)
    }
}

impl<S> std::fmt::Debug for StepDefinition<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("suspends", &self.suspends)
            .field("timeout", &self.timeout)
            .field("recover_strategy", &self.recover_strategy)
            .finish_non_exhaustive()
    }
}

/// Immutable, validated workflow graph.
pub struct WorkflowDefinition<S> {
    steps: HashMap<String, StepDefinition<S>>,
    order: Vec<String>,
    entry_step: String,
    timeout: Option<Duration>,
    default_step_timeout: Option<Duration>,
    default_recover_strategy: RecoverStrategy,
}

impl<S> WorkflowDefinition<S> {
    /// Start building a definition.
    pub fn builder() -> WorkflowDefinitionBuilder<S> {
        WorkflowDefinitionBuilder::default()
    }

    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition<S>> {
        self.steps.get(name)
    }

    /// The designated entry step.
    pub fn entry_step(&self) -> &str {
        &self.entry_step
    }

    /// Overall workflow timeout, measured from the start of the workflow.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Effective timeout of a step: its own, else the workflow default, else
    /// the engine default.
    pub fn step_timeout(&self, step: &str, engine_default: Duration) -> Duration {
        self.steps
            .get(step)
            .and_then(|s| s.timeout)
            .or(self.default_step_timeout)
            .unwrap_or(engine_default)
    }

    /// Effective recover strategy of a step.
    pub fn recover_strategy(&self, step: &str) -> &RecoverStrategy {
        self.steps
            .get(step)
            .and_then(|s| s.recover_strategy.as_ref())
            .unwrap_or(&self.default_recover_strategy)
    }

    /// Step names in registration order.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

impl<S> std::fmt::Debug for WorkflowDefinition<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("entry_step", &self.entry_step)
            .field("steps", &self.order)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`WorkflowDefinition`].
pub struct WorkflowDefinitionBuilder<S> {
    steps: Vec<StepDefinition<S>>,
    entry_step: Option<String>,
    timeout: Option<Duration>,
    default_step_timeout: Option<Duration>,
    default_recover_strategy: RecoverStrategy,
}

impl<S> Default for WorkflowDefinitionBuilder<S> {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            entry_step: None,
            timeout: None,
            default_step_timeout: None,
            default_recover_strategy: RecoverStrategy::default(),
        }
    }
}

impl<S> WorkflowDefinitionBuilder<S> {
    /// Register a step.
    pub fn add_step(mut self, step: StepDefinition<S>) -> Self {
        self.steps.push(step);
        self
    }

    /// Designate the step entered by [`Effect::start`].
    pub fn entry_step(mut self, name: impl Into<String>) -> Self {
        self.entry_step = Some(name.into());
        self
    }

    /// Set the overall workflow timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Timeout for steps that do not set their own.
    pub fn default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = Some(timeout);
        self
    }

    /// Recover strategy for steps that do not set their own.
    pub fn default_step_recover_strategy(mut self, strategy: RecoverStrategy) -> Self {
        self.default_recover_strategy = strategy;
        self
    }

    /// Validate and freeze the definition.
    pub fn build(self) -> Result<WorkflowDefinition<S>, DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps);
        }

        let mut steps = HashMap::with_capacity(self.steps.len());
        let mut order = Vec::with_capacity(self.steps.len());
        for step in self.steps {
            if step.name.is_empty() {
                return Err(DefinitionError::EmptyStepName);
            }
            if steps.contains_key(&step.name) {
                return Err(DefinitionError::DuplicateStep(step.name));
            }
            order.push(step.name.clone());
            steps.insert(step.name.clone(), step);
        }

        let entry_step = self.entry_step.ok_or(DefinitionError::MissingEntryStep)?;
        if !steps.contains_key(&entry_step) {
            return Err(DefinitionError::UnknownEntryStep(entry_step));
        }

        let failover_targets = order
            .iter()
            .filter_map(|name| {
                steps[name]
                    .recover_strategy
                    .as_ref()
                    .and_then(|r| r.failover_step.as_ref())
                    .map(|target| (name.as_str(), target))
            })
            .chain(
                self.default_recover_strategy
                    .failover_step
                    .as_ref()
                    .map(|target| ("<default>", target)),
            );
        for (owner, target) in failover_targets {
            if !steps.contains_key(target) {
                return Err(DefinitionError::UnknownFailoverStep {
                    owner: owner.to_string(),
                    target: target.clone(),
                });
            }
        }

        Ok(WorkflowDefinition {
            steps,
            order,
            entry_step,
            timeout: self.timeout,
            default_step_timeout: self.default_step_timeout,
            default_recover_strategy: self.default_recover_strategy,
        })
    }
}
