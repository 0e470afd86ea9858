// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Effects: declarative descriptions of what a workflow should do next.
//!
//! Command handlers and step transitions never mutate an instance. They return
//! an [`Effect`], and [`apply_effect`] is the single place where an effect is
//! turned into an instance change. Keeping the two apart makes every handler
//! replayable without a running engine.
//!
//! ```ignore
//! Effect::new()
//!     .update_state(state.with_status(Status::WithdrawSucceeded))
//!     .transition_to_with("deposit", json!({ "amount": 10 }))
//!     .then_reply("transfer started")
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::WorkflowDefinition;
use crate::error::{CoreError, Result};
use crate::instance::{InstanceStatus, WorkflowInstance};

/// Where execution goes after an effect is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Enter the workflow's designated entry step.
    Start {
        /// Optional input handed to the entry step's action.
        input: Option<Value>,
    },
    /// Enter a named step.
    To {
        /// Target step name.
        step: String,
        /// Optional input handed to the step's action.
        input: Option<Value>,
    },
    /// Finish the workflow.
    End,
    /// Stop automatic execution until a later command resumes it.
    Pause,
}

/// Response to the command that produced an effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reply {
    /// Successful reply value.
    Value(Value),
    /// The command was rejected. Any accompanying state change is discarded.
    Error(String),
    /// The handler produced no reply.
    Empty,
}

impl Reply {
    /// Returns true if this reply rejects the command.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Convert into a `Result`, mapping `Empty` to `Ok(None)`.
    pub fn into_result(self) -> std::result::Result<Option<Value>, String> {
        match self {
            Self::Value(v) => Ok(Some(v)),
            Self::Error(msg) => Err(msg),
            Self::Empty => Ok(None),
        }
    }
}

/// Immutable description of a desired instance change.
///
/// Effects compose: a single value may carry a state update, a transition
/// and a reply.
#[derive(Debug, Clone)]
pub struct Effect<S> {
    state: Option<S>,
    transition: Option<Transition>,
    reply: Option<Reply>,
}

impl<S> Default for Effect<S> {
    fn default() -> Self {
        Self {
            state: None,
            transition: None,
            reply: None,
        }
    }
}

impl<S> Effect<S> {
    /// An effect that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// An effect that only replies.
    pub fn reply(value: impl Into<Value>) -> Self {
        Self::new().then_reply(value)
    }

    /// An effect that rejects the command with an error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: None,
            transition: None,
            reply: Some(Reply::Error(message.into())),
        }
    }

    /// Replace the user state.
    pub fn update_state(mut self, state: S) -> Self {
        self.state = Some(state);
        self
    }

    /// Enter the designated entry step.
    pub fn start(mut self) -> Self {
        self.transition = Some(Transition::Start { input: None });
        self
    }

    /// Enter the designated entry step with an input.
    pub fn start_with(mut self, input: Value) -> Self {
        self.transition = Some(Transition::Start { input: Some(input) });
        self
    }

    /// Transition to a named step.
    pub fn transition_to(mut self, step: impl Into<String>) -> Self {
        self.transition = Some(Transition::To {
            step: step.into(),
            input: None,
        });
        self
    }

    /// Transition to a named step, handing it an input.
    pub fn transition_to_with(mut self, step: impl Into<String>, input: Value) -> Self {
        self.transition = Some(Transition::To {
            step: step.into(),
            input: Some(input),
        });
        self
    }

    /// End the workflow.
    pub fn end(mut self) -> Self {
        self.transition = Some(Transition::End);
        self
    }

    /// Pause automatic execution.
    pub fn pause(mut self) -> Self {
        self.transition = Some(Transition::Pause);
        self
    }

    /// Attach a reply value.
    pub fn then_reply(mut self, value: impl Into<Value>) -> Self {
        self.reply = Some(Reply::Value(value.into()));
        self
    }

    /// The state update carried by this effect, if any.
    pub fn state(&self) -> Option<&S> {
        self.state.as_ref()
    }

    /// The transition carried by this effect, if any.
    pub fn transition(&self) -> Option<&Transition> {
        self.transition.as_ref()
    }

    /// The reply carried by this effect, if any.
    pub fn reply_value(&self) -> Option<&Reply> {
        self.reply.as_ref()
    }

    /// Returns true if applying this effect would change persisted state.
    pub fn changes_instance(&self) -> bool {
        self.state.is_some() || self.transition.is_some()
    }
}

enum Next {
    Enter(String, Option<Value>),
    End,
    Pause,
    Stay,
}

/// Apply an effect to an instance.
///
/// The instance is only modified when the whole effect is valid: an unknown
/// transition target or an attempt to change an ended instance leaves it
/// untouched. An error reply discards the rest of the effect.
pub fn apply_effect<S>(
    instance: &mut WorkflowInstance<S>,
    effect: Effect<S>,
    definition: &WorkflowDefinition<S>,
    now: DateTime<Utc>,
) -> Result<Reply> {
    let Effect {
        state,
        transition,
        reply,
    } = effect;
    let reply = reply.unwrap_or(Reply::Empty);

    if reply.is_error() {
        return Ok(reply);
    }

    if instance.status == InstanceStatus::Ended && (state.is_some() || transition.is_some()) {
        return Err(CoreError::InstanceEnded {
            instance_id: instance.instance_id.clone(),
        });
    }

    // Resolve the target before touching anything
    let next = match transition {
        Some(Transition::Start { input }) => {
            Next::Enter(definition.entry_step().to_string(), input)
        }
        Some(Transition::To { step, input }) => {
            if definition.step(&step).is_none() {
                return Err(CoreError::UnknownStep {
                    instance_id: instance.instance_id.clone(),
                    step,
                });
            }
            Next::Enter(step, input)
        }
        Some(Transition::End) => Next::End,
        Some(Transition::Pause) => Next::Pause,
        None => Next::Stay,
    };

    if let Some(state) = state {
        instance.user_state = Some(state);
    }

    match next {
        Next::Enter(step, input) => {
            if matches!(
                instance.status,
                InstanceStatus::NotStarted | InstanceStatus::Failed
            ) {
                instance.workflow_started_at = Some(now);
            }
            instance.enter_step(step, input);
        }
        Next::End => {
            instance.status = InstanceStatus::Ended;
            instance.current_step = None;
            instance.step_input = None;
            instance.step_started_at = None;
            instance.generation += 1;
        }
        Next::Pause => {
            instance.status = InstanceStatus::Paused;
            instance.step_started_at = None;
            instance.generation += 1;
        }
        Next::Stay => {}
    }

    Ok(reply)
}
