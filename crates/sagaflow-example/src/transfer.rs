// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Money transfer saga.
//!
//! ```text
//!  withdraw ──► deposit ──► end (Completed)
//!     │            │
//!     │ exhausted  │ exhausted
//!     ▼            ▼
//!  failover-   compensate-withdraw ──► end (Compensated)
//!  handler          │ exhausted
//!  (pause)  ◄───────┘
//! ```
//!
//! Wallet calls use command ids derived from the instance id and step, so a
//! retried step never moves money twice.

use std::time::Duration;

use sagaflow_core::{
    DefinitionError, Effect, RecoverStrategy, Step, StepContext, Workflow, WorkflowDefinition,
    WorkflowInstance,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::wallet::WalletService;

/// Workflow type under which transfers are stored.
pub const TRANSFER_WORKFLOW: &str = "wallet-transfer";

/// Where a transfer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Accepted, nothing moved yet.
    Requested,
    /// Source wallet debited.
    Withdrawn,
    /// Destination wallet credited.
    Completed,
    /// Deposit failed and the withdrawal was refunded.
    Compensated,
    /// Manual intervention needed.
    NeedsAttention,
}

/// User state of a transfer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    /// Source wallet.
    pub from: String,
    /// Destination wallet.
    pub to: String,
    /// Amount moved.
    pub amount: u64,
    /// Progress.
    pub status: TransferStatus,
}

impl TransferState {
    fn with_status(&self, status: TransferStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Commands accepted by the transfer saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferCommand {
    /// Start moving `amount` from one wallet to another.
    Start {
        /// Source wallet.
        from: String,
        /// Destination wallet.
        to: String,
        /// Amount to move.
        amount: u64,
    },
    /// Reply with the transfer status.
    Status,
}

/// Retry and timeout settings of the transfer steps.
#[derive(Debug, Clone)]
pub struct TransferPolicy {
    /// Timeout of each wallet call.
    pub step_timeout: Duration,
    /// Retries of the withdrawal before handing over to the failover handler.
    pub withdraw_retries: u32,
    /// Retries of the deposit before compensating.
    pub deposit_retries: u32,
    /// Retries of the refund before handing over to the failover handler.
    pub compensate_retries: u32,
    /// Overall deadline of a transfer.
    pub workflow_timeout: Option<Duration>,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(5),
            withdraw_retries: 1,
            deposit_retries: 2,
            compensate_retries: 3,
            workflow_timeout: None,
        }
    }
}

/// The transfer saga.
#[derive(Debug, Clone)]
pub struct TransferWorkflow {
    wallets: WalletService,
    policy: TransferPolicy,
}

impl TransferWorkflow {
    /// A transfer saga over the given wallets with default policy.
    pub fn new(wallets: WalletService) -> Self {
        Self {
            wallets,
            policy: TransferPolicy::default(),
        }
    }

    /// Override the step policy.
    pub fn with_policy(mut self, policy: TransferPolicy) -> Self {
        self.policy = policy;
        self
    }
}

fn transfer(ctx: &StepContext<TransferState>) -> anyhow::Result<TransferState> {
    ctx.state()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("transfer state missing"))
}

impl Workflow for TransferWorkflow {
    type State = TransferState;
    type Command = TransferCommand;

    fn workflow_type(&self) -> &'static str {
        TRANSFER_WORKFLOW
    }

    fn definition(&self) -> Result<WorkflowDefinition<TransferState>, DefinitionError> {
        let withdraw_wallets = self.wallets.clone();
        let deposit_wallets = self.wallets.clone();
        let refund_wallets = self.wallets.clone();

        let mut builder = WorkflowDefinition::builder()
            .entry_step("withdraw")
            .default_step_timeout(self.policy.step_timeout)
            .add_step(
                Step::new("withdraw")
                    .async_call(move |ctx: StepContext<TransferState>| {
                        let wallets = withdraw_wallets.clone();
                        async move {
                            let t = transfer(&ctx)?;
                            let command_id = format!("{}-withdraw", ctx.instance_id());
                            wallets.withdraw(&t.from, &command_id, t.amount).await?;
                            Ok::<_, anyhow::Error>(())
                        }
                    })
                    .and_then(|state, _: ()| {
                        let mut effect = Effect::new().transition_to("deposit");
                        if let Some(state) = state {
                            effect =
                                effect.update_state(state.with_status(TransferStatus::Withdrawn));
                        }
                        effect
                    })
                    .recover_strategy(
                        RecoverStrategy::retries(self.policy.withdraw_retries)
                            .failover_to("failover-handler"),
                    ),
            )
            .add_step(
                Step::new("deposit")
                    .async_call(move |ctx: StepContext<TransferState>| {
                        let wallets = deposit_wallets.clone();
                        async move {
                            let t = transfer(&ctx)?;
                            let command_id = format!("{}-deposit", ctx.instance_id());
                            wallets.deposit(&t.to, &command_id, t.amount).await?;
                            Ok::<_, anyhow::Error>(())
                        }
                    })
                    .and_then(|state, _: ()| {
                        let mut effect = Effect::new().end();
                        if let Some(state) = state {
                            effect =
                                effect.update_state(state.with_status(TransferStatus::Completed));
                        }
                        effect
                    })
                    .recover_strategy(
                        RecoverStrategy::retries(self.policy.deposit_retries)
                            .failover_to("compensate-withdraw"),
                    ),
            )
            .add_step(
                Step::new("compensate-withdraw")
                    .async_call(move |ctx: StepContext<TransferState>| {
                        let wallets = refund_wallets.clone();
                        async move {
                            let t = transfer(&ctx)?;
                            let command_id = format!("{}-compensate", ctx.instance_id());
                            wallets.deposit(&t.from, &command_id, t.amount).await?;
                            Ok::<_, anyhow::Error>(())
                        }
                    })
                    .and_then(|state, _: ()| {
                        let mut effect = Effect::new().end();
                        if let Some(state) = state {
                            effect =
                                effect.update_state(state.with_status(TransferStatus::Compensated));
                        }
                        effect
                    })
                    .recover_strategy(
                        RecoverStrategy::retries(self.policy.compensate_retries)
                            .failover_to("failover-handler"),
                    ),
            )
            .add_step(
                Step::new("failover-handler")
                    .call(|ctx: StepContext<TransferState>| {
                        tracing::warn!(
                            instance_id = ctx.instance_id(),
                            "Transfer needs manual attention"
                        );
                        Ok(())
                    })
                    .and_then(|state, _: ()| {
                        let mut effect = Effect::new().pause();
                        if let Some(state) = state {
                            effect = effect
                                .update_state(state.with_status(TransferStatus::NeedsAttention));
                        }
                        effect
                    }),
            );

        if let Some(timeout) = self.policy.workflow_timeout {
            builder = builder.timeout(timeout);
        }
        builder.build()
    }

    fn handle_command(
        &self,
        instance: &WorkflowInstance<TransferState>,
        command: &TransferCommand,
    ) -> Effect<TransferState> {
        match command {
            TransferCommand::Start { from, to, amount } => {
                if instance.user_state.is_some() {
                    return Effect::error("transfer already started");
                }
                if *amount == 0 {
                    return Effect::error("amount must be positive");
                }
                if from == to {
                    return Effect::error("source and destination must differ");
                }
                Effect::new()
                    .update_state(TransferState {
                        from: from.clone(),
                        to: to.clone(),
                        amount: *amount,
                        status: TransferStatus::Requested,
                    })
                    .start()
                    .then_reply("transfer started")
            }
            TransferCommand::Status => match &instance.user_state {
                Some(state) => Effect::reply(json!({
                    "status": state.status,
                    "step": instance.current_step,
                })),
                None => Effect::error("no such transfer"),
            },
        }
    }
}
