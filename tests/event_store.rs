//! Event Store Integration Tests
//!
//! Tests for event log format, append operations, and replay order.

use std::path::PathBuf;

use bioframe::core::{generate_idempotency_key, hash_input, EventStore, Pipeline};
use bioframe::domain::{Event, EventDetail, EventType, PipelineRun, RunState, StepStatus};
use tempfile::TempDir;
use uuid::Uuid;

fn run_started(run_id: Uuid) -> Event {
    Event::new(
        run_id,
        None,
        EventType::RunStarted,
        format!("{}:start", run_id),
        "Run started".to_string(),
        StepStatus::Running,
    )
    .with_detail(EventDetail::Run {
        pipeline: Pipeline::from_tools("qc", &["fastqc"]),
        original_inputs: vec![PathBuf::from("/up/sample_R1.fastq")],
    })
}

#[test]
fn test_event_json_fields() {
    let run_id = Uuid::new_v4();
    let event = Event::new(
        run_id,
        Some(2),
        EventType::StepFinished,
        format!("{}:2:abc123", run_id),
        "Step finished".to_string(),
        StepStatus::Failed,
    )
    .with_duration(1500)
    .with_error("exit code 1".to_string());

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event_type"], "step_finished");
    assert_eq!(json["status"], "failed");
    assert_eq!(json["step_index"], 2);
    assert_eq!(json["duration_ms"], 1500);
    assert_eq!(json["error"], "exit code 1");
    assert!(json["timestamp"].as_str().unwrap().contains('T'));
}

#[tokio::test]
async fn test_append_then_replay_in_order() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp.path(), run_id).await.unwrap();

    store.append(&run_started(run_id)).await.unwrap();
    for index in 1..=3 {
        let event = Event::new(
            run_id,
            Some(index),
            EventType::StepStarted,
            format!("{}:{}:abc", run_id, index),
            format!("Step {} started", index),
            StepStatus::Running,
        );
        store.append(&event).await.unwrap();
    }

    let events = store.replay().await.unwrap();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0].event_type, EventType::RunStarted);
    for (i, event) in events[1..].iter().enumerate() {
        assert_eq!(event.step_index, Some(i + 1));
    }

    let content = std::fs::read_to_string(store.events_path()).unwrap();
    assert_eq!(content.lines().count(), 4);
}

#[tokio::test]
async fn test_replay_rebuilds_run() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp.path(), run_id).await.unwrap();

    store.append(&run_started(run_id)).await.unwrap();
    store
        .append(
            &Event::new(
                run_id,
                Some(1),
                EventType::StepFinished,
                format!("{}:1:abc", run_id),
                "Step finished".to_string(),
                StepStatus::Succeeded,
            )
            .with_detail(EventDetail::StepOutcome {
                reason: "all expected outputs present".to_string(),
                exit_code: Some(0),
                timed_out: false,
                attempts: 1,
                outputs: vec![PathBuf::from("/runs/x/step_1_fastqc/report.html")],
                log_path: None,
                issue: None,
            }),
        )
        .await
        .unwrap();
    store
        .append(&Event::new(
            run_id,
            None,
            EventType::RunCompleted,
            format!("{}:complete", run_id),
            "Run completed".to_string(),
            StepStatus::Succeeded,
        ))
        .await
        .unwrap();

    let run = PipelineRun::from_events(&store.replay().await.unwrap()).unwrap();
    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.steps[0].outputs.len(), 1);
}

#[tokio::test]
async fn test_list_runs_ignores_foreign_directories() {
    let temp = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    EventStore::open_in(temp.path(), run_id).await.unwrap();
    std::fs::create_dir_all(temp.path().join("not-a-run")).unwrap();

    let runs = EventStore::list_runs_in(temp.path()).await.unwrap();
    assert_eq!(runs, vec![run_id]);
}

#[test]
fn test_idempotency_key_format() {
    let run_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
    let key = generate_idempotency_key(run_id, 2, "spades", &[PathBuf::from("/up/a.fq")]);

    let parts: Vec<&str> = key.split(':').collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], "550e8400-e29b-41d4-a716-446655440000");
    assert_eq!(parts[1], "2");
    assert_eq!(parts[2].len(), 16);
}

#[test]
fn test_idempotency_key_depends_on_inputs_and_step() {
    let run_id = Uuid::new_v4();
    let a = [PathBuf::from("/up/a.fq")];
    let b = [PathBuf::from("/up/b.fq")];

    let key1 = generate_idempotency_key(run_id, 1, "fastqc", &a);
    assert_eq!(key1, generate_idempotency_key(run_id, 1, "fastqc", &a));
    assert_ne!(key1, generate_idempotency_key(run_id, 1, "fastqc", &b));
    assert_ne!(key1, generate_idempotency_key(run_id, 2, "fastqc", &a));
    assert_ne!(key1, generate_idempotency_key(run_id, 1, "multiqc", &a));
}

#[test]
fn test_input_hash_special_chars() {
    let hashes = [hash_input("hello\nworld"), hash_input("unicode: 日本語"), hash_input("")];

    assert!(hashes.iter().all(|h| h.len() == 16));
    assert_ne!(hashes[0], hashes[1]);
    assert_ne!(hashes[0], hashes[2]);
}
