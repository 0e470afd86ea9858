// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The trait a saga implements to be driven by the engine.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::definition::WorkflowDefinition;
use crate::effect::Effect;
use crate::error::DefinitionError;
use crate::instance::WorkflowInstance;

/// A durable workflow: its state type, its commands, its step graph and its
/// command handler.
///
/// The handler is pure. It inspects the instance and returns an [`Effect`];
/// the engine applies the effect, persists it and drives any resulting step
/// execution.
pub trait Workflow: Send + Sync + 'static {
    /// User state carried between steps.
    type State: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// External commands accepted by the workflow.
    type Command: Send + Sync + 'static;

    /// Stable name stored with every instance of this workflow.
    fn workflow_type(&self) -> &'static str;

    /// Build the step graph. Called once when the engine is constructed.
    fn definition(&self) -> Result<WorkflowDefinition<Self::State>, DefinitionError>;

    /// Decide what a command does to an instance.
    fn handle_command(
        &self,
        instance: &WorkflowInstance<Self::State>,
        command: &Self::Command,
    ) -> Effect<Self::State>;
}
