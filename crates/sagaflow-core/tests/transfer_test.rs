// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end transfers through the engine.

mod common;

use common::{Harness, SagaOptions, start, wait_for_status};
use sagaflow_core::{InstanceStatus, Reply};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_withdraw_transfer_completes() {
    let h = Harness::new(SagaOptions::default());

    let reply = h
        .engine
        .invoke("t-1", "cmd-1", &start("alice", "bob", 10))
        .await
        .unwrap();
    assert_eq!(reply, Reply::Value(json!("started")));

    let snapshot = wait_for_status(&h.engine, "t-1", InstanceStatus::Ended).await;
    assert!(snapshot.user_state.unwrap().completed);
    assert_eq!(snapshot.current_step, None);
    assert!(snapshot.failure.is_none());

    assert_eq!(h.bank.balance("alice"), 90);
    assert_eq!(h.bank.balance("bob"), 110);
    assert_eq!(h.probe.withdraws(), 1);
    assert_eq!(h.probe.deposits(), 1);
    assert_eq!(h.engine.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_withdraw_transfer_completes() {
    let h = Harness::new(SagaOptions {
        async_withdraw: true,
        ..Default::default()
    });

    h.engine
        .invoke("t-1", "cmd-1", &start("alice", "bob", 25))
        .await
        .unwrap();

    wait_for_status(&h.engine, "t-1", InstanceStatus::Ended).await;
    assert_eq!(h.bank.balance("alice"), 75);
    assert_eq!(h.bank.balance("bob"), 125);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_instances_are_independent() {
    let h = Harness::new(SagaOptions {
        async_withdraw: true,
        ..Default::default()
    });

    let ids: Vec<String> = (0..20).map(|i| format!("t-{}", i)).collect();
    let invocations = ids.iter().map(|id| {
        let engine = h.engine.clone();
        let id = id.clone();
        async move {
            engine
                .invoke(&id, "cmd-1", &start("alice", "bob", 1))
                .await
        }
    });
    for reply in futures::future::join_all(invocations).await {
        assert_eq!(reply.unwrap(), Reply::Value(json!("started")));
    }

    for id in &ids {
        wait_for_status(&h.engine, id, InstanceStatus::Ended).await;
    }
    assert_eq!(h.bank.balance("alice"), 80);
    assert_eq!(h.bank.balance("bob"), 120);
    assert_eq!(h.probe.withdraws(), 20);
    assert_eq!(h.probe.deposits(), 20);
}

#[tokio::test]
async fn test_rejected_start_leaves_no_instance() {
    let h = Harness::new(SagaOptions::default());

    let reply = h
        .engine
        .invoke("t-1", "cmd-1", &start("alice", "bob", 0))
        .await
        .unwrap();
    assert_eq!(reply, Reply::Error("amount must be positive".to_string()));
    assert!(h.engine.get_state("t-1").await.unwrap().is_none());
    assert_eq!(h.probe.withdraws(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deposit_receives_withdraw_output_as_input() {
    let h = Harness::new(SagaOptions {
        deposit_hangs: u32::MAX,
        ..Default::default()
    });

    h.engine
        .invoke("t-1", "cmd-1", &start("alice", "bob", 30))
        .await
        .unwrap();
    wait_for_status(&h.engine, "t-1", InstanceStatus::WaitingForAsyncResult).await;

    let instance = h.engine.instance("t-1").await.unwrap().unwrap();
    assert_eq!(instance.current_step.as_deref(), Some("deposit"));
    assert_eq!(instance.step_input, Some(json!({ "amount": 30 })));
    assert!(instance.step_started_at.is_some());
    h.engine.shutdown();
}
