// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sagaflow Core - Durable Saga Execution
//!
//! This crate runs multi-step workflows (sagas) whose state survives process
//! restarts. A workflow is a graph of named steps; each step performs an
//! action (synchronous, or asynchronous such as a remote call) and a pure
//! transition deciding where to go next. Steps are retried, timed out and
//! failed over according to per-step policy.
//!
//! # Architecture
//!
//! ```text
//!   command ──► WorkflowEngine::invoke ──► Workflow::handle_command ──► Effect
//!                      │                                                  │
//!                      │                 apply_effect ◄───────────────────┘
//!                      ▼
//!               ┌──────────────┐  persist   ┌────────────────┐
//!               │ StepExecutor │───────────►│ InstanceStore  │  (memory / SQLite)
//!               └──────┬───────┘            └────────────────┘
//!                      │ async action                ▲
//!                      ▼                             │ list_active
//!          ┌───────────────────────┐                 │
//!          │  RecoveryCoordinator  │─────────────────┘
//!          │ timers · retry policy │
//!          │ failover · recovery   │
//!          └───────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! | Property | Behaviour |
//! |----------|-----------|
//! | Per-identity serialization | One action start, transition and write at a time per instance |
//! | Retry bound | A step with `max_retries = n` runs at most `n + 1` times per entry |
//! | Failover | After `n + 1` failures the failover step is entered with `attempt = 0` |
//! | Stale results | Completions for a superseded attempt are discarded by generation stamp |
//! | Crash recovery | Waiting steps get their timeout re-armed, never a second invocation |
//! | Command dedup | Repeating the last command id replays its reply |
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(SqliteStore::from_path(".data/sagaflow.db").await?);
//! let engine = WorkflowEngine::start(TransferWorkflow::new(wallets), store, EngineConfig::from_env()?).await?;
//!
//! engine.invoke("transfer-1", "cmd-1", &TransferCommand::Start { from, to, amount }).await?;
//! let state = engine.get_state("transfer-1").await?;
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod definition;
pub mod effect;
pub mod engine;
pub mod error;
mod executor;
pub mod instance;
pub mod persistence;
pub mod recovery;
pub mod workflow;

pub use config::{ConfigError, EngineConfig};
pub use definition::{
    RecoverStrategy, Step, StepContext, StepDefinition, StepToken, WorkflowDefinition,
    WorkflowDefinitionBuilder,
};
pub use effect::{Effect, Reply, Transition, apply_effect};
pub use engine::WorkflowEngine;
pub use error::{CoreError, DefinitionError, Result, StepFailure};
pub use instance::{FailureReason, InstanceStatus, StateSnapshot, WorkflowInstance};
pub use persistence::{InstanceRecord, InstanceStore, MemoryStore, SqliteStore, WriteOutcome};
pub use recovery::{FailureDecision, RecoveryCoordinator, RecoveryReport, decide_failure};
pub use workflow::Workflow;
