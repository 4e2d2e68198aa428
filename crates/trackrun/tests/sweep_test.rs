// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::mocks::{Call, RecordingTransport};
use common::{age_file, set_mtime};
use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use trackrun::journal::{Marker, RunJournal};
use trackrun::{Payload, RecordKind, Sender};

fn run_dir(root: &TempDir, uid: &str, name: &str, status: Marker) -> RunJournal {
    let journal = RunJournal::create(root.path(), uid).unwrap();
    journal
        .write_run(&json!({"name": name, "status": "running", "folder": "/"}))
        .unwrap();
    journal.touch(status).unwrap();
    journal.touch(Marker::Heartbeat).unwrap();
    journal
}

fn sender(root: &TempDir, transport: &Arc<RecordingTransport>) -> Sender {
    Sender::new(root.path(), transport.clone())
}

#[tokio::test]
async fn test_records_replayed_in_modification_order() {
    let root = TempDir::new().unwrap();
    let journal = run_dir(&root, "run-a", "ordered", Marker::Running);
    journal.touch(Marker::Created).unwrap();
    for (name, body, mtime) in [
        ("metrics-100.json", json!({"n": "metrics"}), 100),
        ("event-50.json", json!({"n": "event"}), 50),
        ("update-75.json", json!({"n": "update"}), 75),
    ] {
        let path = journal.dir().join(name);
        fs::write(&path, body.to_string()).unwrap();
        set_mtime(&path, mtime);
    }

    let transport = Arc::new(RecordingTransport::default());
    let report = sender(&root, &transport).sweep().await.unwrap();

    assert_eq!(
        transport.sent(),
        vec![
            (RecordKind::Event, Payload::Json(json!({"n": "event"}))),
            (RecordKind::Update, Payload::Json(json!({"n": "update"}))),
            (RecordKind::Metrics, Payload::Json(json!({"n": "metrics"}))),
        ]
    );
    assert_eq!(report.runs[0].replayed, 3);
    for name in ["metrics-100.json", "event-50.json", "update-75.json"] {
        assert!(!journal.dir().join(name).exists());
        assert!(journal.dir().join(format!("{name}-proc")).is_file());
    }

    // nothing left to replay
    let again = sender(&root, &transport).sweep().await.unwrap();
    assert_eq!(again.runs[0].replayed, 0);
    assert_eq!(transport.sent().len(), 3);
}

#[tokio::test]
async fn test_stale_running_run_becomes_lost() {
    let root = TempDir::new().unwrap();
    let journal = run_dir(&root, "run-b", "stale", Marker::Running);
    journal.touch(Marker::Created).unwrap();
    age_file(&journal.dir().join("heartbeat"), Duration::from_secs(400));

    let transport = Arc::new(RecordingTransport::default());
    let report = sender(&root, &transport).sweep().await.unwrap();

    assert!(report.runs[0].went_lost);
    assert!(journal.has(Marker::Lost));
    assert!(!journal.has(Marker::Running));
    assert_eq!(transport.heartbeats(), 0);
    assert_eq!(
        transport.updates(),
        vec![json!({"name": "stale", "status": "lost"})]
    );

    // a lost run is no longer swept
    let again = sender(&root, &transport).sweep().await.unwrap();
    assert!(again.runs.is_empty());
}

#[tokio::test]
async fn test_missing_heartbeat_falls_back_to_run_file() {
    let root = TempDir::new().unwrap();
    let journal = run_dir(&root, "run-c", "silent", Marker::Running);
    journal.touch(Marker::Created).unwrap();
    journal.remove(Marker::Heartbeat).unwrap();
    age_file(&journal.dir().join("run.json"), Duration::from_secs(200));

    let transport = Arc::new(RecordingTransport::default());
    sender(&root, &transport).sweep().await.unwrap();
    assert!(journal.has(Marker::Lost));
}

#[tokio::test]
async fn test_fresh_running_run_gets_heartbeat() {
    let root = TempDir::new().unwrap();
    let journal = run_dir(&root, "run-d", "alive", Marker::Running);
    journal.touch(Marker::Created).unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let report = sender(&root, &transport).sweep().await.unwrap();

    assert!(!report.runs[0].went_lost);
    assert!(journal.has(Marker::Running));
    assert_eq!(transport.calls(), vec![Call::Heartbeat("alive".into())]);
}

#[tokio::test]
async fn test_run_created_once() {
    let root = TempDir::new().unwrap();
    let journal = run_dir(&root, "run-e", "fresh", Marker::Running);

    let transport = Arc::new(RecordingTransport::default());
    let report = sender(&root, &transport).sweep().await.unwrap();
    assert!(report.runs[0].created);
    assert!(journal.has(Marker::Created));

    sender(&root, &transport).sweep().await.unwrap();
    let creations: Vec<Call> = transport
        .calls()
        .into_iter()
        .filter(|call| matches!(call, Call::CreateRun(_)))
        .collect();
    assert_eq!(
        creations,
        vec![Call::CreateRun(
            json!({"name": "fresh", "status": "running", "folder": "/"})
        )]
    );
}

#[tokio::test]
async fn test_unnamed_run_takes_server_name() {
    let root = TempDir::new().unwrap();
    let journal = RunJournal::create(root.path(), "run-f").unwrap();
    journal.write_run(&json!({"status": "running"})).unwrap();
    journal.touch(Marker::Running).unwrap();
    journal.touch(Marker::Heartbeat).unwrap();

    let transport = Arc::new(RecordingTransport::named("server-side"));
    let report = sender(&root, &transport).sweep().await.unwrap();

    assert_eq!(report.runs[0].name, "server-side");
    assert_eq!(journal.read_run().unwrap()["name"], json!("server-side"));
    assert!(transport
        .calls()
        .contains(&Call::Heartbeat("server-side".into())));
}

#[tokio::test]
async fn test_completed_run_is_sent_once_drained() {
    let root = TempDir::new().unwrap();
    let journal = run_dir(&root, "run-g", "done", Marker::Completed);
    journal.touch(Marker::Created).unwrap();
    journal
        .write_record(RecordKind::Event, &Payload::Binary(vec![0x90]))
        .unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let first = sender(&root, &transport).sweep().await.unwrap();
    assert_eq!(first.runs[0].replayed, 1);
    assert!(!first.runs[0].sent);
    assert!(journal.has(Marker::Completed));

    let second = sender(&root, &transport).sweep().await.unwrap();
    assert!(second.runs[0].sent);
    assert!(journal.has(Marker::Sent));
    assert!(!journal.has(Marker::Completed));
    assert_eq!(
        transport.updates(),
        vec![json!({"name": "done", "status": "completed"})]
    );

    let third = sender(&root, &transport).sweep().await.unwrap();
    assert!(third.runs.is_empty());
}

#[tokio::test]
async fn test_failed_runs_are_swept_too() {
    let root = TempDir::new().unwrap();
    let journal = run_dir(&root, "run-h", "broken", Marker::Failed);
    journal.touch(Marker::Created).unwrap();

    let transport = Arc::new(RecordingTransport::default());
    let report = sender(&root, &transport).sweep().await.unwrap();
    assert!(report.runs[0].sent);
    assert_eq!(
        transport.updates(),
        vec![json!({"name": "broken", "status": "failed"})]
    );
}

#[tokio::test]
async fn test_replay_stops_at_first_failure() {
    let root = TempDir::new().unwrap();
    let journal = run_dir(&root, "run-i", "flaky", Marker::Completed);
    journal.touch(Marker::Created).unwrap();
    for (index, name) in ["update-1.json", "update-2.json", "update-3.json"]
        .iter()
        .enumerate()
    {
        let path = journal.dir().join(name);
        fs::write(&path, json!({"seq": index}).to_string()).unwrap();
        set_mtime(&path, 1000 + index as i64);
    }

    let transport = Arc::new(RecordingTransport::default());
    *transport.sends_before_failure.lock().unwrap() = Some(1);
    let report = sender(&root, &transport).sweep().await.unwrap();

    let run = &report.runs[0];
    assert_eq!(run.replayed, 1);
    assert!(run.interrupted);
    assert!(!run.sent);
    assert!(journal.dir().join("update-1.json-proc").is_file());
    assert!(journal.dir().join("update-2.json").is_file());
    assert!(journal.dir().join("update-3.json").is_file());
    assert_eq!(journal.pending_records().unwrap().len(), 2);
}

#[tokio::test]
async fn test_replayed_alert_is_attached() {
    let root = TempDir::new().unwrap();
    let journal = run_dir(&root, "run-j", "alerted", Marker::Running);
    journal.touch(Marker::Created).unwrap();
    journal
        .write_record(
            RecordKind::Alert,
            &Payload::Json(json!({"name": "loss-too-high", "source": "user"})),
        )
        .unwrap();

    let transport = Arc::new(RecordingTransport::default());
    *transport.alert_id.lock().unwrap() = Some("alert-7".into());
    sender(&root, &transport).sweep().await.unwrap();

    assert_eq!(
        transport.sent_kinds(),
        vec![RecordKind::Alert, RecordKind::Update]
    );
    assert_eq!(
        transport.updates(),
        vec![json!({"name": "alerted", "alerts": ["alert-7"]})]
    );
}

#[tokio::test]
async fn test_unreadable_run_is_reported_and_skipped() {
    let root = TempDir::new().unwrap();
    let broken = RunJournal::create(root.path(), "run-k").unwrap();
    fs::write(broken.dir().join("run.json"), "{not json").unwrap();
    broken.touch(Marker::Running).unwrap();
    run_dir(&root, "run-l", "healthy", Marker::Running);

    let transport = Arc::new(RecordingTransport::default());
    let report = sender(&root, &transport).sweep().await.unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "run-k");
    assert_eq!(report.runs.len(), 1);
    assert_eq!(report.runs[0].uid, "run-l");
}
