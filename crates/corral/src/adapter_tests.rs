// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;

fn adapter_for(program: &str, args: &[&str], timeout: Duration) -> CliAdapter {
    let command = CliCommand {
        program: program.to_owned(),
        args: args.iter().map(|s| (*s).to_owned()).collect(),
        envs: Vec::new(),
    };
    CliAdapter::new(command, timeout)
}

fn sh(script: &str, timeout: Duration) -> CliAdapter {
    adapter_for("sh", &["-c", script], timeout)
}

#[tokio::test]
async fn cat_echoes_the_prompt() {
    let adapter = adapter_for("cat", &[], Duration::from_secs(5));
    let reply = adapter.execute("hello there").await.unwrap();
    assert_eq!(reply.text, "hello there");
    assert!(reply.stderr.is_empty());
}

#[tokio::test]
async fn nonzero_exit_with_output_is_success() {
    let adapter = sh("cat > /dev/null; echo hi; exit 3", Duration::from_secs(5));
    let reply = adapter.execute("ignored").await.unwrap();
    assert_eq!(reply.text.trim(), "hi");
}

#[tokio::test]
async fn zero_exit_with_empty_output_fails() {
    let adapter = sh("cat > /dev/null; exit 0", Duration::from_secs(5));
    let result = adapter.execute("ignored").await;
    assert!(
        matches!(result, Err(CliError::EmptyOutput { exit_code: Some(0) })),
        "expected EmptyOutput, got {result:?}"
    );
}

#[tokio::test]
async fn nonzero_exit_with_empty_output_fails() {
    let adapter = sh("cat > /dev/null; exit 7", Duration::from_secs(5));
    let result = adapter.execute("ignored").await;
    assert!(
        matches!(result, Err(CliError::EmptyOutput { exit_code: Some(7) })),
        "expected EmptyOutput, got {result:?}"
    );
}

#[tokio::test]
async fn timeout_force_kills_the_child() {
    let adapter = sh("cat > /dev/null; sleep 10", Duration::from_millis(200));
    let started = std::time::Instant::now();
    let result = adapter.execute("ignored").await;
    assert!(
        matches!(result, Err(CliError::Timeout { limit }) if limit == Duration::from_millis(200)),
        "expected Timeout, got {result:?}"
    );
    // The kill happened promptly; we did not wait out the sleep.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn missing_binary_is_spawn_failed() {
    let adapter = adapter_for("corral-no-such-binary", &[], Duration::from_secs(1));
    assert!(matches!(
        adapter.execute("hi").await,
        Err(CliError::SpawnFailed(_))
    ));
}

#[tokio::test]
async fn empty_prompt_is_refused() {
    let adapter = adapter_for("cat", &[], Duration::from_secs(1));
    assert!(matches!(adapter.execute("").await, Err(CliError::BrokenIo(_))));
}

#[tokio::test]
async fn stderr_is_captured_without_failing_the_call() {
    let adapter = sh("cat > /dev/null; echo warn >&2; echo out", Duration::from_secs(5));
    let reply = adapter.execute("ignored").await.unwrap();
    assert_eq!(reply.text.trim(), "out");
    assert!(reply.stderr.contains("warn"));
}

#[test]
fn from_argv_splits_program_and_args() {
    let argv = vec!["claude".to_owned(), "--print".to_owned()];
    let command = CliCommand::from_argv(&argv);
    assert_eq!(command.program, "claude");
    assert_eq!(command.args, vec!["--print".to_owned()]);

    let empty = CliCommand::from_argv(&[]);
    assert_eq!(empty.program, "claude");
    assert!(empty.args.is_empty());
}

#[test]
fn with_env_accumulates() {
    let command = CliCommand::from_argv(&["cat".to_owned()])
        .with_env("A", "1")
        .with_env("B", "2");
    assert_eq!(command.envs.len(), 2);
}
