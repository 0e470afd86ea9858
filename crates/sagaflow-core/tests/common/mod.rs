// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for sagaflow-core integration tests.
//!
//! Provides a two-wallet transfer saga whose steps can be told to fail or
//! hang, plus helpers to wait for an instance to settle.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sagaflow_core::{
    DefinitionError, EngineConfig, Effect, InstanceStatus, InstanceStore, MemoryStore,
    RecoverStrategy, StateSnapshot, Step, StepContext, Workflow, WorkflowDefinition,
    WorkflowEngine, WorkflowInstance,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Balances shared by the saga steps and the test body.
#[derive(Debug, Default)]
pub struct Bank {
    balances: Mutex<HashMap<String, i64>>,
}

impl Bank {
    pub fn with_accounts(accounts: &[(&str, i64)]) -> Arc<Self> {
        let bank = Self::default();
        {
            let mut balances = bank.balances.lock().unwrap();
            for (name, balance) in accounts {
                balances.insert(name.to_string(), *balance);
            }
        }
        Arc::new(bank)
    }

    pub fn balance(&self, account: &str) -> i64 {
        self.balances.lock().unwrap().get(account).copied().unwrap_or(0)
    }

    fn add(&self, account: &str, delta: i64) {
        *self
            .balances
            .lock()
            .unwrap()
            .entry(account.to_string())
            .or_default() += delta;
    }
}

/// Counts step invocations.
#[derive(Debug, Default)]
pub struct Probe {
    pub withdraw_calls: AtomicU32,
    pub deposit_calls: AtomicU32,
    pub compensate_calls: AtomicU32,
}

impl Probe {
    pub fn withdraws(&self) -> u32 {
        self.withdraw_calls.load(Ordering::SeqCst)
    }

    pub fn deposits(&self) -> u32 {
        self.deposit_calls.load(Ordering::SeqCst)
    }

    pub fn compensations(&self) -> u32 {
        self.compensate_calls.load(Ordering::SeqCst)
    }
}

/// Knobs of the test saga.
#[derive(Debug, Clone)]
pub struct SagaOptions {
    /// Run "withdraw" as an asynchronous action.
    pub async_withdraw: bool,
    /// The first N withdraw calls fail.
    pub withdraw_failures: u32,
    pub withdraw_retries: u32,
    pub withdraw_failover: Option<&'static str>,
    /// The first N deposit calls never complete.
    pub deposit_hangs: u32,
    pub deposit_retries: u32,
    pub step_timeout: Duration,
    pub workflow_timeout: Option<Duration>,
}

impl Default for SagaOptions {
    fn default() -> Self {
        Self {
            async_withdraw: false,
            withdraw_failures: 0,
            withdraw_retries: 0,
            withdraw_failover: None,
            deposit_hangs: 0,
            deposit_retries: 0,
            step_timeout: Duration::from_secs(5),
            workflow_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    pub from: String,
    pub to: String,
    pub amount: i64,
    pub completed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct DepositInput {
    amount: i64,
}

#[derive(Debug, Clone)]
pub enum SagaCommand {
    Start {
        from: String,
        to: String,
        amount: i64,
    },
    /// Move a paused or failed instance to a step.
    Resume(String),
    Status,
    Cancel,
}

pub fn start(from: &str, to: &str, amount: i64) -> SagaCommand {
    SagaCommand::Start {
        from: from.to_string(),
        to: to.to_string(),
        amount,
    }
}

pub struct TransferSaga {
    pub bank: Arc<Bank>,
    pub probe: Arc<Probe>,
    pub options: SagaOptions,
}

fn withdraw(
    bank: &Bank,
    probe: &Probe,
    options: &SagaOptions,
    ctx: &StepContext<TransferState>,
) -> anyhow::Result<i64> {
    let n = probe.withdraw_calls.fetch_add(1, Ordering::SeqCst);
    if n < options.withdraw_failures {
        anyhow::bail!("withdraw rejected (call {})", n + 1);
    }
    let state = ctx
        .state()
        .ok_or_else(|| anyhow::anyhow!("missing state"))?;
    bank.add(&state.from, -state.amount);
    Ok(state.amount)
}

impl Workflow for TransferSaga {
    type State = TransferState;
    type Command = SagaCommand;

    fn workflow_type(&self) -> &'static str {
        "test-transfer"
    }

    fn definition(&self) -> Result<WorkflowDefinition<TransferState>, DefinitionError> {
        let mut withdraw_strategy = RecoverStrategy::retries(self.options.withdraw_retries);
        if let Some(failover) = self.options.withdraw_failover {
            withdraw_strategy = withdraw_strategy.failover_to(failover);
        }

        let withdraw_step = if self.options.async_withdraw {
            let (bank, probe) = (self.bank.clone(), self.probe.clone());
            let options = self.options.clone();
            Step::new("withdraw").async_call(move |ctx: StepContext<TransferState>| {
                let result = withdraw(&bank, &probe, &options, &ctx);
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    result
                }
            })
        } else {
            let (bank, probe) = (self.bank.clone(), self.probe.clone());
            let options = self.options.clone();
            Step::new("withdraw").call(move |ctx: StepContext<TransferState>| {
                withdraw(&bank, &probe, &options, &ctx)
            })
        };

        let (bank, probe) = (self.bank.clone(), self.probe.clone());
        let hangs = self.options.deposit_hangs;
        let deposit_step = Step::new("deposit").async_call(move |ctx: StepContext<TransferState>| {
            let bank = bank.clone();
            let n = probe.deposit_calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < hangs {
                    std::future::pending::<()>().await;
                }
                let input: DepositInput = ctx.input()?;
                let state = ctx
                    .state()
                    .ok_or_else(|| anyhow::anyhow!("missing state"))?;
                bank.add(&state.to, input.amount);
                Ok::<_, anyhow::Error>(())
            }
        });

        let probe = self.probe.clone();
        let compensate_step = Step::new("compensate").call(move |_ctx: StepContext<TransferState>| {
            probe.compensate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut builder = WorkflowDefinition::builder()
            .entry_step("withdraw")
            .default_step_timeout(self.options.step_timeout)
            .add_step(
                withdraw_step
                    .and_then(|_state, amount: i64| {
                        Effect::new().transition_to_with("deposit", json!({ "amount": amount }))
                    })
                    .recover_strategy(withdraw_strategy),
            )
            .add_step(
                deposit_step
                    .and_then(|state: Option<&TransferState>, _: ()| {
                        let mut effect = Effect::new().end();
                        if let Some(state) = state {
                            effect = effect.update_state(TransferState {
                                completed: true,
                                ..state.clone()
                            });
                        }
                        effect
                    })
                    .recover_strategy(RecoverStrategy::retries(self.options.deposit_retries)),
            )
            .add_step(compensate_step.and_then(|_state, _: ()| Effect::new().pause()));

        if let Some(timeout) = self.options.workflow_timeout {
            builder = builder.timeout(timeout);
        }
        builder.build()
    }

    fn handle_command(
        &self,
        instance: &WorkflowInstance<TransferState>,
        command: &SagaCommand,
    ) -> Effect<TransferState> {
        match command {
            SagaCommand::Start { from, to, amount } => {
                if *amount <= 0 {
                    return Effect::error("amount must be positive");
                }
                if matches!(
                    instance.status,
                    InstanceStatus::Running
                        | InstanceStatus::WaitingForAsyncResult
                        | InstanceStatus::Paused
                ) {
                    return Effect::error("transfer already running");
                }
                Effect::new()
                    .update_state(TransferState {
                        from: from.clone(),
                        to: to.clone(),
                        amount: *amount,
                        completed: false,
                    })
                    .start()
                    .then_reply("started")
            }
            SagaCommand::Resume(step) => Effect::new()
                .transition_to_with(step.clone(), json!({ "amount": 0 }))
                .then_reply("resumed"),
            SagaCommand::Status => Effect::reply(json!(instance.status.as_str())),
            SagaCommand::Cancel => Effect::new().end().then_reply("cancelled"),
        }
    }
}

pub struct Harness {
    pub engine: WorkflowEngine<TransferSaga>,
    pub bank: Arc<Bank>,
    pub probe: Arc<Probe>,
    pub store: Arc<dyn InstanceStore>,
}

impl Harness {
    pub fn new(options: SagaOptions) -> Self {
        Self::with_store(options, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(options: SagaOptions, store: Arc<dyn InstanceStore>) -> Self {
        let bank = Bank::with_accounts(&[("alice", 100), ("bob", 100)]);
        let probe = Arc::new(Probe::default());
        let engine = engine_for(&bank, &probe, options, store.clone());
        Self {
            engine,
            bank,
            probe,
            store,
        }
    }

    /// A second engine over the same store, bank and probe, as after a restart.
    pub fn restart(&self, options: SagaOptions) -> WorkflowEngine<TransferSaga> {
        engine_for(&self.bank, &self.probe, options, self.store.clone())
    }
}

pub fn engine_for(
    bank: &Arc<Bank>,
    probe: &Arc<Probe>,
    options: SagaOptions,
    store: Arc<dyn InstanceStore>,
) -> WorkflowEngine<TransferSaga> {
    let saga = TransferSaga {
        bank: bank.clone(),
        probe: probe.clone(),
        options,
    };
    let config = EngineConfig::default().with_recover_on_start(false);
    WorkflowEngine::new(saga, store, config).expect("valid test saga")
}

/// Poll until the instance reaches `status`, panicking after five seconds.
pub async fn wait_for_status<W: Workflow>(
    engine: &WorkflowEngine<W>,
    instance_id: &str,
    status: InstanceStatus,
) -> StateSnapshot<W::State> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(snapshot) = engine.get_state(instance_id).await.unwrap()
            && snapshot.status == status
        {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            let current = engine.get_state(instance_id).await.unwrap();
            panic!(
                "instance {} did not reach {:?}, last seen {:?}",
                instance_id,
                status,
                current.map(|s| (s.status, s.current_step, s.attempt))
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
