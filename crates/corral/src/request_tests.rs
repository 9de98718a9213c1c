// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use crate::usage::Usage;

use super::*;

fn record(id: &str) -> RequestRecord {
    RequestRecord::new(
        id.to_owned(),
        "claude".to_owned(),
        None,
        "hello".to_owned(),
        "cred-1".to_owned(),
    )
}

#[tokio::test]
async fn insert_and_get() {
    let registry = RequestRegistry::new(Duration::from_secs(60));
    registry.insert(record("req-1")).await;

    let fetched = registry.get("req-1").await.unwrap();
    assert_eq!(fetched.state, RequestState::Queued);
    assert!(!fetched.is_terminal());
    assert!(registry.get("req-missing").await.is_none());
}

#[tokio::test]
async fn get_owned_enforces_credential() {
    let registry = RequestRegistry::new(Duration::from_secs(60));
    registry.insert(record("req-1")).await;

    assert!(registry.get_owned("req-1", "cred-1").await.is_some());
    assert!(registry.get_owned("req-1", "cred-2").await.is_none());
}

#[tokio::test]
async fn transitions_are_monotonic() {
    let registry = RequestRegistry::new(Duration::from_secs(60));
    registry.insert(record("req-1")).await;

    assert!(registry.mark_running("req-1").await);
    // Already running: a second transition is refused.
    assert!(!registry.mark_running("req-1").await);

    registry.complete("req-1", "done", Usage::from_exchange("hello", "done"), 12).await;
    let fetched = registry.get("req-1").await.unwrap();
    assert_eq!(fetched.state, RequestState::Completed);
    assert_eq!(fetched.reply.as_deref(), Some("done"));
    assert!(fetched.completed_at_ms.is_some());
    assert_eq!(fetched.latency_ms, Some(12));
    assert!(fetched.is_terminal());
}

#[tokio::test]
async fn fail_records_kind_and_message() {
    let registry = RequestRegistry::new(Duration::from_secs(60));
    registry.insert(record("req-1")).await;
    registry.mark_running("req-1").await;
    registry.fail("req-1", "CLI_FAILED", "no output").await;

    let fetched = registry.get("req-1").await.unwrap();
    assert_eq!(fetched.state, RequestState::Failed);
    assert_eq!(fetched.error_kind.as_deref(), Some("CLI_FAILED"));
    assert_eq!(fetched.error_message.as_deref(), Some("no output"));
    assert!(fetched.failed_at_ms.is_some());
}

#[tokio::test]
async fn cancel_only_while_queued() {
    let registry = RequestRegistry::new(Duration::from_secs(60));
    registry.insert(record("req-1")).await;
    registry.insert(record("req-2")).await;

    assert!(registry.cancel("req-1").await);
    let cancelled = registry.get("req-1").await.unwrap();
    assert_eq!(cancelled.state, RequestState::Failed);
    assert_eq!(cancelled.error_kind.as_deref(), Some("CANCELLED"));

    registry.mark_running("req-2").await;
    assert!(!registry.cancel("req-2").await);
    assert!(!registry.cancel("req-missing").await);
}

#[tokio::test]
async fn polling_is_idempotent_until_retention() {
    let registry = RequestRegistry::new(Duration::from_millis(80));
    registry.insert(record("req-1")).await;
    registry.mark_running("req-1").await;
    registry.complete("req-1", "ok", Usage::default(), 1).await;

    let first = registry.get("req-1").await.unwrap();
    let second = registry.get("req-1").await.unwrap();
    assert_eq!(first.reply, second.reply);
    assert_eq!(first.completed_at_ms, second.completed_at_ms);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(registry.gc().await, 1);
    assert!(registry.get("req-1").await.is_none());
}

#[tokio::test]
async fn gc_spares_non_terminal_records() {
    let registry = RequestRegistry::new(Duration::from_millis(10));
    registry.insert(record("req-queued")).await;
    registry.insert(record("req-done")).await;
    registry.mark_running("req-done").await;
    registry.complete("req-done", "ok", Usage::default(), 1).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    registry.gc().await;

    assert!(registry.get("req-queued").await.is_some());
    assert!(registry.get("req-done").await.is_none());
}
