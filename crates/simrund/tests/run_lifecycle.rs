//! End-to-end run lifecycle through the registry: local and remote backends,
//! timeouts, cancellation, notifications, and event subscriptions.

mod common;

use common::{
    collect, config, fake_ssh, registry, registry_with, slow_ssh, unreachable_ssh, wait_for_state, Recorder,
    Refusing,
};
use simrun_core::{
    ConnectionCause, ExecutableSpec, FailureReason, ListScope, NotificationChannel,
    NotificationPreference, OutputSource, RemoteTarget, RunDescriptor, RunEvent, RunState,
    TriggerPolicy,
};
use simrund::controller::CancelOutcome;
use simrund::notify::Transport;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn states(record: &simrun_core::RunRecord) -> Vec<RunState> {
    record.history.iter().map(|t| t.state).collect()
}

#[tokio::test]
async fn echo_hello_succeeds() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&config(dir.path(), &fake_ssh(dir.path())));

    let id = registry
        .submit(RunDescriptor::local(ExecutableSpec::new("echo", ["hello"]), dir.path()))
        .unwrap();
    let record = registry.wait_for_completion(&id).await.unwrap();

    assert_eq!(record.state, RunState::Succeeded);
    assert_eq!(record.exit_code, Some(0));
    assert!(record.failure_reason.is_none());
    assert_eq!(states(&record), vec![RunState::Pending, RunState::Running, RunState::Succeeded]);
    let lines: Vec<_> = record.output_tail.iter().map(|l| (l.source, l.text.as_str())).collect();
    assert_eq!(lines, vec![(OutputSource::Stdout, "hello")]);
    assert!(record.started_at.is_some() && record.ended_at >= record.started_at);
}

#[tokio::test]
async fn nonexistent_executable_errors_without_exit_code() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&config(dir.path(), &fake_ssh(dir.path())));

    let id = registry
        .submit(RunDescriptor::local(
            ExecutableSpec::new("/no/such/solver", ["input.inp"]),
            dir.path(),
        ))
        .unwrap();
    let record = registry.wait_for_completion(&id).await.unwrap();

    assert_eq!(record.state, RunState::Errored);
    assert_eq!(record.exit_code, None);
    assert!(matches!(record.failure_reason, Some(FailureReason::Launch { .. })));
    assert!(!states(&record).contains(&RunState::Running));
}

#[tokio::test]
async fn nonzero_exit_fails_with_code() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&config(dir.path(), &fake_ssh(dir.path())));

    let id = registry
        .submit(
            RunDescriptor::local(ExecutableSpec::new("sh", ["-c", "echo 'SCF NOT CONVERGED' >&2; exit 3"]), dir.path())
                .with_error_markers(["NOT CONVERGED"]),
        )
        .unwrap();
    let record = registry.wait_for_completion(&id).await.unwrap();

    assert_eq!(record.state, RunState::Failed);
    assert_eq!(record.exit_code, Some(3));
    assert_eq!(record.failure_reason, Some(FailureReason::ExitCode { code: 3 }));
    assert_eq!(record.marker_hits.len(), 1);
}

#[tokio::test]
async fn unreachable_remote_host_errors_before_running() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&config(dir.path(), &unreachable_ssh(dir.path())));

    let id = registry
        .submit(RunDescriptor::remote(
            ExecutableSpec::new("astra", ["input.inp"]),
            "/scratch/run",
            RemoteTarget::new("nowhere.invalid", "sim"),
        ))
        .unwrap();
    let record = registry.wait_for_completion(&id).await.unwrap();

    assert_eq!(record.state, RunState::Errored);
    assert_eq!(record.exit_code, None);
    assert_eq!(states(&record), vec![RunState::Pending, RunState::Connecting, RunState::Errored]);
    match record.failure_reason {
        Some(FailureReason::Connection { cause, .. }) => assert_eq!(cause, ConnectionCause::Unreachable),
        other => panic!("unexpected reason: {other:?}"),
    }
}

#[tokio::test]
async fn remote_run_goes_through_connecting() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&config(dir.path(), &fake_ssh(dir.path())));

    let id = registry
        .submit(RunDescriptor::remote(
            ExecutableSpec::new("sh", ["-c", "echo remote ok"]),
            dir.path(),
            RemoteTarget::new("hpc", "sim"),
        ))
        .unwrap();
    let record = registry.wait_for_completion(&id).await.unwrap();

    assert_eq!(record.state, RunState::Succeeded);
    assert_eq!(
        states(&record),
        vec![RunState::Pending, RunState::Connecting, RunState::Running, RunState::Succeeded]
    );
    assert_eq!(record.output_tail.last_text(1), vec!["remote ok"]);
    registry.ssh().close_all().await;
}

#[tokio::test]
async fn cancel_while_connecting_never_runs() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&config(dir.path(), &slow_ssh(dir.path(), 3)));
    let target = RemoteTarget::new("slow.example", "sim");

    let id = registry
        .submit(RunDescriptor::remote(
            ExecutableSpec::new("astra", ["input.inp"]),
            "/scratch/run",
            target.clone(),
        ))
        .unwrap();
    let mut events = registry.subscribe(&id).unwrap();
    wait_for_state(&mut events, RunState::Connecting).await;

    let started = Instant::now();
    assert_eq!(registry.cancel(&id).unwrap(), CancelOutcome::Requested);
    let record = registry.wait_for_completion(&id).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(record.state, RunState::Cancelled);
    assert_eq!(record.exit_code, None);
    assert_eq!(states(&record), vec![RunState::Pending, RunState::Connecting, RunState::Cancelled]);
    assert_eq!(registry.ssh().session_count(&target).await, 0);
}

#[tokio::test]
async fn timeout_fails_run_promptly() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&config(dir.path(), &fake_ssh(dir.path())));

    let started = Instant::now();
    let id = registry
        .submit(
            RunDescriptor::local(ExecutableSpec::new("sleep", ["10"]), dir.path())
                .with_timeout(Duration::from_millis(200)),
        )
        .unwrap();
    let record = registry.wait_for_completion(&id).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(record.state, RunState::Failed);
    assert_eq!(record.failure_reason, Some(FailureReason::Timeout { limit_ms: 200 }));
    assert!(record.exit_code.is_some());
}

#[tokio::test]
async fn cancel_running_run_and_late_cancel_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&config(dir.path(), &fake_ssh(dir.path())));

    let id = registry
        .submit(RunDescriptor::local(ExecutableSpec::new("sleep", ["30"]), dir.path()))
        .unwrap();
    let mut events = registry.subscribe(&id).unwrap();
    wait_for_state(&mut events, RunState::Running).await;

    assert_eq!(registry.cancel(&id).unwrap(), CancelOutcome::Requested);
    let record = registry.wait_for_completion(&id).await.unwrap();
    assert_eq!(record.state, RunState::Cancelled);
    assert_eq!(record.exit_code, None);

    let before = registry.get_status(&id).unwrap();
    assert_eq!(
        registry.cancel(&id).unwrap(),
        CancelOutcome::AlreadyCompleted(RunState::Cancelled)
    );
    let after = registry.get_status(&id).unwrap();
    assert_eq!(before.history, after.history);
    assert_eq!(before.ended_at, after.ended_at);
}

#[tokio::test]
async fn concurrent_submissions_get_distinct_ids() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(registry(&config(dir.path(), &fake_ssh(dir.path()))));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let registry = Arc::clone(&registry);
        let cwd = dir.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            registry
                .submit(RunDescriptor::local(ExecutableSpec::new("sh", ["-c", "true"]), cwd))
                .unwrap()
        }));
    }
    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 50);

    for id in &ids {
        registry.wait_for_completion(id).await.unwrap();
    }
    assert_eq!(registry.list_runs(ListScope::Terminal).len(), 50);
    assert!(registry.list_runs(ListScope::Active).is_empty());
}

#[tokio::test]
async fn failed_notification_does_not_change_outcome() {
    let dir = TempDir::new().unwrap();
    let topic = Arc::new(Recorder::default());
    let registry = registry_with(
        &config(dir.path(), &fake_ssh(dir.path())),
        Arc::new(Refusing),
        Arc::clone(&topic) as Arc<dyn Transport>,
    );

    let id = registry
        .submit(
            RunDescriptor::local(ExecutableSpec::new("echo", ["done"]), dir.path()).with_notification(
                NotificationPreference {
                    channels: vec![
                        NotificationChannel::Email("user@example.com".into()),
                        NotificationChannel::Topic("h2o-runs".into()),
                    ],
                    trigger: TriggerPolicy::Always,
                },
            ),
        )
        .unwrap();
    let record = registry.wait_for_completion(&id).await.unwrap();

    assert_eq!(record.state, RunState::Succeeded);
    assert_eq!(record.warnings.len(), 1);
    assert!(record.warnings[0].starts_with("email notification to user@example.com failed"));
    assert_eq!(topic.destinations(), vec!["h2o-runs"]);
    let subject = topic.sent.lock().unwrap()[0].1.subject.clone();
    assert!(subject.contains("SUCCEEDED"));
}

#[tokio::test]
async fn on_success_trigger_skips_failed_runs() {
    let dir = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let registry = registry_with(
        &config(dir.path(), &fake_ssh(dir.path())),
        Arc::clone(&recorder) as Arc<dyn Transport>,
        Arc::clone(&recorder) as Arc<dyn Transport>,
    );

    let id = registry
        .submit(
            RunDescriptor::local(ExecutableSpec::new("sh", ["-c", "exit 1"]), dir.path())
                .with_notification(NotificationPreference {
                    channels: vec![NotificationChannel::Email("user@example.com".into())],
                    trigger: TriggerPolicy::OnSuccess,
                }),
        )
        .unwrap();
    let record = registry.wait_for_completion(&id).await.unwrap();

    assert_eq!(record.state, RunState::Failed);
    assert!(recorder.destinations().is_empty());
}

#[tokio::test]
async fn subscription_is_ordered_and_ends_at_terminal_state() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&config(dir.path(), &fake_ssh(dir.path())));

    let id = registry
        .submit(RunDescriptor::local(
            ExecutableSpec::new("sh", ["-c", "echo 1; echo 2; echo 3"]),
            dir.path(),
        ))
        .unwrap();
    let events = collect(registry.subscribe(&id).unwrap()).await;

    let ranks: Vec<u8> = events.iter().filter_map(RunEvent::state).map(|s| s.rank()).collect();
    assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "states went backwards: {ranks:?}");
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let lines: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Output { line, .. } => Some(line.text.as_str()),
            RunEvent::StateChanged { .. } => None,
        })
        .collect();
    assert_eq!(lines, vec!["1", "2", "3"]);

    // A late subscriber gets the same lines from the tail, then the final state.
    let replay = collect(registry.subscribe(&id).unwrap()).await;
    assert_eq!(replay.len(), 4);
    assert_eq!(replay.last().unwrap().state(), Some(RunState::Succeeded));
}
