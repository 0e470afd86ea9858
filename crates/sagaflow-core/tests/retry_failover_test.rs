// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry bound, failover and restart of failed instances.

mod common;

use common::{Harness, SagaCommand, SagaOptions, start, wait_for_status};
use sagaflow_core::{FailureReason, InstanceStatus};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_step_fails_after_max_retries_plus_one_attempts() {
    let h = Harness::new(SagaOptions {
        withdraw_failures: u32::MAX,
        withdraw_retries: 2,
        ..Default::default()
    });

    h.engine
        .invoke("t-1", "cmd-1", &start("alice", "bob", 10))
        .await
        .unwrap();

    let snapshot = wait_for_status(&h.engine, "t-1", InstanceStatus::Failed).await;
    assert_eq!(h.probe.withdraws(), 3);
    assert_eq!(h.probe.deposits(), 0);
    assert_eq!(snapshot.current_step, None);
    match snapshot.failure {
        Some(FailureReason::StepsExhausted {
            step,
            attempts,
            message,
        }) => {
            assert_eq!(step, "withdraw");
            assert_eq!(attempts, 3);
            assert!(message.contains("withdraw rejected (call 3)"), "{}", message);
        }
        other => panic!("unexpected failure: {:?}", other),
    }
    assert_eq!(h.bank.balance("alice"), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_step_retries_the_same_way() {
    let h = Harness::new(SagaOptions {
        async_withdraw: true,
        withdraw_failures: u32::MAX,
        withdraw_retries: 1,
        ..Default::default()
    });

    h.engine
        .invoke("t-1", "cmd-1", &start("alice", "bob", 10))
        .await
        .unwrap();

    let snapshot = wait_for_status(&h.engine, "t-1", InstanceStatus::Failed).await;
    assert_eq!(h.probe.withdraws(), 2);
    assert!(matches!(
        snapshot.failure,
        Some(FailureReason::StepsExhausted { attempts: 2, .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failover_step_entered_with_fresh_attempt() {
    let h = Harness::new(SagaOptions {
        withdraw_failures: u32::MAX,
        withdraw_retries: 1,
        withdraw_failover: Some("compensate"),
        ..Default::default()
    });

    h.engine
        .invoke("t-1", "cmd-1", &start("alice", "bob", 10))
        .await
        .unwrap();

    let snapshot = wait_for_status(&h.engine, "t-1", InstanceStatus::Paused).await;
    assert_eq!(snapshot.current_step.as_deref(), Some("compensate"));
    assert_eq!(snapshot.attempt, 0);
    assert!(snapshot.failure.is_none());
    assert_eq!(h.probe.withdraws(), 2);
    assert_eq!(h.probe.compensations(), 1);
    assert_eq!(h.probe.deposits(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_paused_instance_resumes_on_command() {
    let h = Harness::new(SagaOptions {
        withdraw_failures: u32::MAX,
        withdraw_failover: Some("compensate"),
        ..Default::default()
    });

    h.engine
        .invoke("t-1", "cmd-1", &start("alice", "bob", 10))
        .await
        .unwrap();
    wait_for_status(&h.engine, "t-1", InstanceStatus::Paused).await;

    h.engine
        .invoke("t-1", "cmd-2", &SagaCommand::Resume("deposit".to_string()))
        .await
        .unwrap();

    wait_for_status(&h.engine, "t-1", InstanceStatus::Ended).await;
    assert_eq!(h.probe.deposits(), 1);
    // Resumed with a zero amount
    assert_eq!(h.bank.balance("bob"), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_failure_then_success() {
    let h = Harness::new(SagaOptions {
        withdraw_failures: 1,
        withdraw_retries: 1,
        ..Default::default()
    });

    h.engine
        .invoke("t-1", "cmd-1", &start("alice", "bob", 10))
        .await
        .unwrap();

    wait_for_status(&h.engine, "t-1", InstanceStatus::Ended).await;
    assert_eq!(h.probe.withdraws(), 2);
    assert_eq!(h.bank.balance("alice"), 90);
    assert_eq!(h.bank.balance("bob"), 110);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_instance_can_be_restarted() {
    let h = Harness::new(SagaOptions {
        withdraw_failures: 1,
        ..Default::default()
    });

    h.engine
        .invoke("t-1", "cmd-1", &start("alice", "bob", 10))
        .await
        .unwrap();
    wait_for_status(&h.engine, "t-1", InstanceStatus::Failed).await;

    h.engine
        .invoke("t-1", "cmd-2", &start("alice", "bob", 10))
        .await
        .unwrap();

    let snapshot = wait_for_status(&h.engine, "t-1", InstanceStatus::Ended).await;
    assert!(snapshot.failure.is_none());
    assert_eq!(h.probe.withdraws(), 2);
    assert_eq!(h.bank.balance("alice"), 90);
}
