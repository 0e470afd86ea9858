// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wallet transfer example - one successful transfer and one that fails over.
//!
//! Set `SAGAFLOW_DATABASE_URL` (e.g. `sqlite:.data/sagaflow.db?mode=rwc`) to
//! persist instances in SQLite; otherwise an in-memory store is used.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sagaflow_core::{EngineConfig, InstanceStatus, InstanceStore, MemoryStore, SqliteStore};
use sagaflow_example::{TransferCommand, TransferWorkflow, WalletService};
use tracing::{error, info};

type Engine = sagaflow_core::WorkflowEngine<TransferWorkflow>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sagaflow_core=info".parse()?),
        )
        .init();

    let config = EngineConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    let store: Arc<dyn InstanceStore> = match std::env::var("SAGAFLOW_DATABASE_URL") {
        Ok(url) => {
            info!(url = %url, "Using SQLite instance store");
            Arc::new(SqliteStore::connect(&url).await?)
        }
        Err(_) => {
            info!("SAGAFLOW_DATABASE_URL not set, using in-memory instance store");
            Arc::new(MemoryStore::new())
        }
    };

    let wallets = WalletService::new().with_latency(Duration::from_millis(50));
    wallets.open("alice", 100).await;
    wallets.open("bob", 100).await;

    let engine = Engine::start(TransferWorkflow::new(wallets.clone()), store, config).await?;

    println!("Transfer of 10 from alice to bob:");
    let transfer_id = uuid::Uuid::new_v4().to_string();
    run_transfer(&engine, &transfer_id, "alice", "bob", 10).await?;
    println!(
        "  balances: alice={:?} bob={:?}\n",
        wallets.balance("alice").await,
        wallets.balance("bob").await
    );

    println!("Transfer of 1000 from alice to bob (insufficient funds):");
    let transfer_id = uuid::Uuid::new_v4().to_string();
    run_transfer(&engine, &transfer_id, "alice", "bob", 1000).await?;
    println!(
        "  balances: alice={:?} bob={:?}",
        wallets.balance("alice").await,
        wallets.balance("bob").await
    );

    engine.shutdown();
    Ok(())
}

async fn run_transfer(
    engine: &Engine,
    transfer_id: &str,
    from: &str,
    to: &str,
    amount: u64,
) -> Result<()> {
    let command = TransferCommand::Start {
        from: from.to_string(),
        to: to.to_string(),
        amount,
    };
    let command_id = uuid::Uuid::new_v4().to_string();
    let reply = engine.invoke(transfer_id, &command_id, &command).await?;
    println!("  reply: {:?}", reply);

    // Resending the same command is answered from the dedup record
    let replay = engine.invoke(transfer_id, &command_id, &command).await?;
    println!("  replayed reply: {:?}", replay);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let Some(snapshot) = engine.get_state(transfer_id).await? else {
            anyhow::bail!("transfer {} disappeared", transfer_id);
        };
        if matches!(
            snapshot.status,
            InstanceStatus::Ended | InstanceStatus::Failed | InstanceStatus::Paused
        ) {
            println!(
                "  finished: status={} step={:?} transfer={:?}",
                snapshot.status,
                snapshot.current_step,
                snapshot.user_state.map(|s| s.status)
            );
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("transfer {} did not finish in time", transfer_id);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
