// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tokio_util::sync::CancellationToken;

use crate::adapter::CliCommand;
use crate::credential::{Credential, CredentialStore};
use crate::error::ErrorCode;
use crate::instance::InstanceLimits;
use crate::pool::{Pool, PoolConfig};
use crate::ratelimit::SlidingWindow;
use crate::request::{RequestRecord, RequestState};
use crate::session::SessionStore;
use crate::storage::Storage;
use crate::usage::UsageLogger;

use super::*;

fn cat() -> CliCommand {
    CliCommand { program: "cat".to_owned(), args: Vec::new(), envs: Vec::new() }
}

fn sh(script: &str) -> CliCommand {
    CliCommand {
        program: "sh".to_owned(),
        args: vec!["-c".to_owned(), script.to_owned()],
        envs: Vec::new(),
    }
}

struct StackOptions {
    max_instances: usize,
    message_cap: u32,
    idle_timeout: Duration,
    per_call_timeout: Duration,
    queue_capacity: usize,
    cli: CliCommand,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            max_instances: 2,
            message_cap: 50,
            idle_timeout: Duration::from_secs(60),
            per_call_timeout: Duration::from_secs(5),
            queue_capacity: 10,
            cli: cat(),
        }
    }
}

struct Stack {
    storage: Arc<Storage>,
    sessions: Arc<SessionStore>,
    pool: Arc<Pool>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

async fn stack(options: StackOptions) -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(Storage::open(&dir.path().join("stack.db")).await.unwrap());
    let shutdown = CancellationToken::new();

    let (usage, _writer) = UsageLogger::spawn(Arc::clone(&storage), shutdown.clone());
    let credentials =
        Arc::new(CredentialStore::new(Arc::clone(&storage), Duration::from_secs(300)));
    let sessions =
        Arc::new(SessionStore::new(Arc::clone(&storage), 50, Duration::from_secs(3600)));
    let limiter = Arc::new(SlidingWindow::new(Duration::from_secs(3600)));
    let requests = crate::request::RequestRegistry::new(Duration::from_secs(3600));

    let pool = Pool::new(PoolConfig {
        max_instances: options.max_instances,
        limits: InstanceLimits {
            message_cap: options.message_cap,
            idle_timeout: options.idle_timeout,
            history_pairs: 4,
        },
        max_age: Duration::from_secs(3600),
        destroy_retry: Duration::from_millis(50),
        maintenance_interval: Duration::from_millis(100),
        per_call_timeout: options.per_call_timeout,
        cli: options.cli,
    });
    pool.spawn_event_loop(shutdown.clone());

    let dispatcher = Dispatcher::new(
        DispatchConfig {
            queue_capacity: options.queue_capacity,
            credential_ceiling: 100,
            address_ceiling: 0,
            default_tool_id: "claude".to_owned(),
        },
        credentials,
        limiter,
        Arc::clone(&sessions),
        Arc::clone(&pool),
        usage,
        requests,
    );
    dispatcher.spawn_drainer(shutdown.clone());

    Stack { storage, sessions, pool, dispatcher, shutdown, _dir: dir }
}

async fn seed_credential(stack: &Stack, secret: &str, ceiling: Option<u32>) -> Credential {
    let cred = Credential::issue("owner-1", "test token", secret, ceiling, None);
    stack.storage.insert_credential(&cred).await.unwrap();
    cred
}

fn submission(secret: &str, prompt: &str) -> Submission {
    Submission {
        bearer: secret.to_owned(),
        prompt: prompt.to_owned(),
        tool_id: None,
        session_id: None,
        stream: false,
        options: None,
        remote_addr: None,
        client: None,
    }
}

async fn wait_terminal(stack: &Stack, id: &str, cred: &Credential) -> RequestRecord {
    for _ in 0..100 {
        if let Some(record) = stack.dispatcher.poll(id, &cred.id).await {
            if record.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    stack.dispatcher.poll(id, &cred.id).await.unwrap()
}

fn completed(outcome: SubmitOutcome) -> CompletedResponse {
    match outcome {
        SubmitOutcome::Completed(response) => *response,
        SubmitOutcome::Queued { request_id } => {
            unreachable!("expected completion, got queued {request_id}")
        }
    }
}

#[tokio::test]
async fn single_submission_completes_with_one_usage_row() {
    let stack = stack(StackOptions::default()).await;
    let cred = seed_credential(&stack, "k1", Some(1000)).await;

    let outcome = stack.dispatcher.submit(submission("k1", "Hello")).await.unwrap();
    let response = completed(outcome);
    assert_eq!(response.status, "ok");
    assert_eq!(response.reply, "Hello");
    assert!(response.usage.total_tokens > 0);
    assert_eq!(response.tool_id, "claude");
    assert!(response.session_id.is_none());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        stack.storage.count_usage_for_request(&response.request_id).await.unwrap(),
        1
    );
    let rows = stack.storage.list_usage_for_credential(&cred.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, 200);

    let stats = stack.pool.stats().await;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.busy, 0);
}

#[tokio::test]
async fn unknown_credential_is_unauthorized() {
    let stack = stack(StackOptions::default()).await;
    let err = stack.dispatcher.submit(submission("nope", "Hello")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

#[tokio::test]
async fn validation_failures_produce_no_usage_rows() {
    let stack = stack(StackOptions::default()).await;
    let cred = seed_credential(&stack, "k1", None).await;

    let err = stack.dispatcher.submit(submission("k1", "   ")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::BadRequest);

    let mut with_options = submission("k1", "Hello");
    with_options.options = Some(SubmissionOptions {
        temperature: Some(3.5),
        ..SubmissionOptions::default()
    });
    let err = stack.dispatcher.submit(with_options).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::BadRequest);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(stack.storage.list_usage_for_credential(&cred.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn session_continuity_feeds_history_forward() {
    let stack = stack(StackOptions::default()).await;
    let cred = seed_credential(&stack, "k1", None).await;
    let session = stack
        .sessions
        .create(&cred.id, "t", Vec::new(), serde_json::Map::new(), None)
        .await
        .unwrap();

    let mut first = submission("k1", "Q1");
    first.session_id = Some(session.id.clone());
    let first = completed(stack.dispatcher.submit(first).await.unwrap());
    assert_eq!(first.reply, "Q1");

    let mut second = submission("k1", "Q2");
    second.session_id = Some(session.id.clone());
    let second = completed(stack.dispatcher.submit(second).await.unwrap());
    // The echoed composed prompt shows the first exchange was forwarded.
    assert!(second.reply.contains("user: Q1"));
    assert!(second.reply.contains("assistant: Q1"));

    let context = stack.sessions.get(&session.id, &cred.id).await.unwrap().unwrap().context;
    assert_eq!(context.len(), 4);
    assert_eq!(context[0].content, "Q1");
    assert_eq!(context[2].content, "Q2");

    // Both calls were served by one bound instance.
    assert_eq!(stack.pool.stats().await.total, 1);
}

#[tokio::test]
async fn foreign_session_is_not_found_and_logged() {
    let stack = stack(StackOptions::default()).await;
    let owner = seed_credential(&stack, "k1", None).await;
    let intruder = seed_credential(&stack, "k2", None).await;
    let session = stack
        .sessions
        .create(&owner.id, "t", Vec::new(), serde_json::Map::new(), None)
        .await
        .unwrap();

    let mut sub = submission("k2", "peek");
    sub.session_id = Some(session.id.clone());
    let err = stack.dispatcher.submit(sub).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NoSuchSession);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let rows = stack.storage.list_usage_for_credential(&intruder.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, 404);
}

#[tokio::test]
async fn rate_limit_rejects_and_logs_the_third_arrival() {
    let stack = stack(StackOptions::default()).await;
    let cred = seed_credential(&stack, "k1", Some(2)).await;

    completed(stack.dispatcher.submit(submission("k1", "one")).await.unwrap());
    completed(stack.dispatcher.submit(submission("k1", "two")).await.unwrap());
    let err = stack.dispatcher.submit(submission("k1", "three")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimited);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let rows = stack.storage.list_usage_for_credential(&cred.id).await.unwrap();
    assert_eq!(rows.len(), 3);
    let mut statuses: Vec<u16> = rows.iter().map(|r| r.status).collect();
    statuses.sort_unstable();
    assert_eq!(statuses, vec![200, 200, 429]);

    let quota = stack.dispatcher.quota(&cred);
    assert_eq!(quota.remaining, 0);
}

#[tokio::test]
#[serial]
async fn capacity_queues_then_drains() {
    let stack = stack(StackOptions {
        max_instances: 1,
        cli: sh("cat > /dev/null; sleep 0.4; echo done"),
        ..StackOptions::default()
    })
    .await;
    let cred = seed_credential(&stack, "k1", None).await;
    let session_a = stack
        .sessions
        .create(&cred.id, "t", Vec::new(), serde_json::Map::new(), None)
        .await
        .unwrap();
    let session_b = stack
        .sessions
        .create(&cred.id, "t", Vec::new(), serde_json::Map::new(), None)
        .await
        .unwrap();

    let mut first = submission("k1", "one");
    first.session_id = Some(session_a.id.clone());
    let dispatcher = Arc::clone(&stack.dispatcher);
    let running = tokio::spawn(async move { dispatcher.submit(first).await });

    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut second = submission("k1", "two");
    second.session_id = Some(session_b.id.clone());
    let outcome = stack.dispatcher.submit(second).await.unwrap();
    let SubmitOutcome::Queued { request_id } = outcome else {
        unreachable!("expected the second submission to queue");
    };

    // The first call finishes and the drainer picks the queued one up.
    completed(running.await.unwrap().unwrap());
    let record = wait_terminal(&stack, &request_id, &cred).await;
    assert_eq!(record.state, RequestState::Completed);
    assert!(record.reply.is_some());
}

#[tokio::test]
#[serial]
async fn queue_overflow_is_capacity_exhausted() {
    let stack = stack(StackOptions {
        max_instances: 1,
        queue_capacity: 1,
        cli: sh("cat > /dev/null; sleep 0.4; echo done"),
        ..StackOptions::default()
    })
    .await;
    let cred = seed_credential(&stack, "k1", None).await;

    let mut first = submission("k1", "one");
    first.session_id = None;
    let dispatcher = Arc::clone(&stack.dispatcher);
    let running = tokio::spawn(async move { dispatcher.submit(first).await });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let queued = stack.dispatcher.submit(submission("k1", "two")).await.unwrap();
    assert!(matches!(queued, SubmitOutcome::Queued { .. }));

    let err = stack.dispatcher.submit(submission("k1", "three")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::CapacityExhausted);

    running.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    let rows = stack.storage.list_usage_for_credential(&cred.id).await.unwrap();
    assert!(rows.iter().any(|r| r.status == 503));
}

#[tokio::test]
#[serial]
async fn cancel_succeeds_only_while_queued() {
    let stack = stack(StackOptions {
        max_instances: 1,
        cli: sh("cat > /dev/null; sleep 0.4; echo done"),
        ..StackOptions::default()
    })
    .await;
    let cred = seed_credential(&stack, "k1", None).await;

    let dispatcher = Arc::clone(&stack.dispatcher);
    let running = tokio::spawn(async move { dispatcher.submit(submission("k1", "one")).await });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let outcome = stack.dispatcher.submit(submission("k1", "two")).await.unwrap();
    let SubmitOutcome::Queued { request_id } = outcome else {
        unreachable!("expected the second submission to queue");
    };

    stack.dispatcher.cancel(&request_id, &cred).await.unwrap();
    let record = stack.dispatcher.poll(&request_id, &cred.id).await.unwrap();
    assert_eq!(record.state, RequestState::Failed);
    assert_eq!(record.error_kind.as_deref(), Some("CANCELLED"));

    // Terminal now, so a second cancel is refused.
    let err = stack.dispatcher.cancel(&request_id, &cred).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::BadRequest);

    let err = stack.dispatcher.cancel("req-missing", &cred).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NoSuchRequest);

    running.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let rows = stack.storage.list_usage_for_credential(&cred.id).await.unwrap();
    assert!(rows.iter().any(|r| r.status == 499));

    // The cancelled submission has exactly its 499 row, nothing else: the
    // drainer must not run (and log) a record that went terminal.
    assert_eq!(
        stack.storage.count_usage_for_request(&request_id).await.unwrap(),
        1
    );
    let record = stack.dispatcher.poll(&request_id, &cred.id).await.unwrap();
    assert_eq!(record.state, RequestState::Failed);
    assert_eq!(record.error_kind.as_deref(), Some("CANCELLED"));
}

#[tokio::test]
#[serial]
async fn idle_recycle_preserves_session_context() {
    let stack = stack(StackOptions {
        idle_timeout: Duration::from_millis(100),
        ..StackOptions::default()
    })
    .await;
    let cred = seed_credential(&stack, "k1", None).await;
    let session = stack
        .sessions
        .create(&cred.id, "t", Vec::new(), serde_json::Map::new(), None)
        .await
        .unwrap();

    let mut first = submission("k1", "first");
    first.session_id = Some(session.id.clone());
    completed(stack.dispatcher.submit(first).await.unwrap());
    let first_instance = stack.pool.stats().await.instances[0].id.clone();

    // Idle long enough for the pool to recycle the worker.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(stack.pool.stats().await.total, 0);

    let mut second = submission("k1", "second");
    second.session_id = Some(session.id.clone());
    let response = completed(stack.dispatcher.submit(second).await.unwrap());
    // Context from the destroyed worker survived via the session store.
    assert!(response.reply.contains("assistant: first"));

    let stats = stack.pool.stats().await;
    assert_eq!(stats.total, 1);
    assert_ne!(stats.instances[0].id, first_instance);
}

#[tokio::test]
#[serial]
async fn cli_timeout_fails_and_destroys_the_instance() {
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("ready");
    let script = format!(
        "cat > /dev/null; if [ -e {} ]; then echo ok; else sleep 10; fi",
        marker.display()
    );
    let stack = stack(StackOptions {
        per_call_timeout: Duration::from_millis(200),
        cli: sh(&script),
        ..StackOptions::default()
    })
    .await;
    let cred = seed_credential(&stack, "k1", None).await;

    let err = stack.dispatcher.submit(submission("k1", "stuck")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::CliTimeout);

    // The tainted worker is gone.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(stack.pool.stats().await.total, 0);

    // A fresh worker serves the next submission.
    std::fs::File::create(&marker).unwrap();
    let response = completed(stack.dispatcher.submit(submission("k1", "go")).await.unwrap());
    assert_eq!(response.reply.trim(), "ok");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let rows = stack.storage.list_usage_for_credential(&cred.id).await.unwrap();
    let mut statuses: Vec<u16> = rows.iter().map(|r| r.status).collect();
    statuses.sort_unstable();
    assert_eq!(statuses, vec![200, 500]);
}

#[tokio::test]
async fn stream_delivers_text_then_done() {
    let stack = stack(StackOptions::default()).await;
    seed_credential(&stack, "k1", None).await;

    let mut sub = submission("k1", "Hi");
    sub.stream = true;
    let mut frames = stack.dispatcher.submit_stream(sub);

    let first = frames.recv().await.unwrap();
    assert!(matches!(first, StreamFrame::Text { ref content } if content == "Hi"));
    let second = frames.recv().await.unwrap();
    assert!(matches!(second, StreamFrame::Done { ref usage, .. } if usage.total_tokens > 0));
    assert!(frames.recv().await.is_none());
}

#[tokio::test]
async fn stream_rejection_is_a_single_error_frame() {
    let stack = stack(StackOptions::default()).await;

    let mut sub = submission("wrong", "Hi");
    sub.stream = true;
    let mut frames = stack.dispatcher.submit_stream(sub);

    let frame = frames.recv().await.unwrap();
    assert!(matches!(frame, StreamFrame::Error { ref kind, .. } if kind == "UNAUTHORIZED"));
    assert!(frames.recv().await.is_none());
}

#[tokio::test]
#[serial]
async fn stream_queued_submission_gets_frames_from_the_drainer() {
    let stack = stack(StackOptions {
        max_instances: 1,
        cli: sh("cat > /dev/null; sleep 0.3; echo done"),
        ..StackOptions::default()
    })
    .await;
    seed_credential(&stack, "k1", None).await;

    let dispatcher = Arc::clone(&stack.dispatcher);
    let running = tokio::spawn(async move { dispatcher.submit(submission("k1", "one")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut sub = submission("k1", "two");
    sub.stream = true;
    let mut frames = stack.dispatcher.submit_stream(sub);

    let first = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, StreamFrame::Queued { .. }));

    running.await.unwrap().unwrap();

    let second = tokio::time::timeout(Duration::from_secs(3), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(second, StreamFrame::Text { .. }));
    let third = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(third, StreamFrame::Done { .. }));
}

#[tokio::test]
#[serial]
async fn shutdown_refuses_new_work_and_fails_queued() {
    let stack = stack(StackOptions {
        max_instances: 1,
        cli: sh("cat > /dev/null; sleep 0.4; echo done"),
        ..StackOptions::default()
    })
    .await;
    let cred = seed_credential(&stack, "k1", None).await;

    let dispatcher = Arc::clone(&stack.dispatcher);
    let running = tokio::spawn(async move { dispatcher.submit(submission("k1", "one")).await });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let outcome = stack.dispatcher.submit(submission("k1", "two")).await.unwrap();
    let SubmitOutcome::Queued { request_id } = outcome else {
        unreachable!("expected the second submission to queue");
    };

    // Drain begins: queued work fails, new work is refused.
    stack.dispatcher.begin_drain();
    stack.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = stack.dispatcher.submit(submission("k1", "three")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ShuttingDown);

    let record = stack.dispatcher.poll(&request_id, &cred.id).await.unwrap();
    assert_eq!(record.state, RequestState::Failed);
    assert_eq!(record.error_kind.as_deref(), Some("SHUTTING_DOWN"));

    // The in-flight call finishes inside the grace period; nothing survives.
    stack.pool.shutdown(Duration::from_secs(1)).await;
    completed(running.await.unwrap().unwrap());
    assert_eq!(stack.pool.stats().await.total, 0);
}

#[tokio::test]
async fn tool_id_falls_back_to_session_then_default() {
    let stack = stack(StackOptions::default()).await;
    let cred = seed_credential(&stack, "k1", None).await;

    let plain = completed(stack.dispatcher.submit(submission("k1", "x")).await.unwrap());
    assert_eq!(plain.tool_id, "claude");

    let session = stack
        .sessions
        .create(&cred.id, "custom-tool", Vec::new(), serde_json::Map::new(), None)
        .await
        .unwrap();
    let mut sub = submission("k1", "y");
    sub.session_id = Some(session.id.clone());
    let with_session = completed(stack.dispatcher.submit(sub).await.unwrap());
    assert_eq!(with_session.tool_id, "custom-tool");
}

#[tokio::test]
async fn poll_is_idempotent_and_owner_scoped() {
    let stack = stack(StackOptions::default()).await;
    let cred = seed_credential(&stack, "k1", None).await;
    let other = seed_credential(&stack, "k2", None).await;

    let response = completed(stack.dispatcher.submit(submission("k1", "x")).await.unwrap());

    let first = stack.dispatcher.poll(&response.request_id, &cred.id).await.unwrap();
    let second = stack.dispatcher.poll(&response.request_id, &cred.id).await.unwrap();
    assert_eq!(first.reply, second.reply);
    assert_eq!(first.completed_at_ms, second.completed_at_ms);

    assert!(stack.dispatcher.poll(&response.request_id, &other.id).await.is_none());
}
