use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use httpmock::{Method::GET, MockServer};
use mcsupport_core::ManualClock;
use mcsupport_transcript::{
    build_correlation_engine, inspect_transcript_store, load_transcript_ingress_events,
    run_transcript_replay, ArtifactFetcher, Attribution, FetchError, HttpArtifactFetcher,
    MessageEvent, MessageSegment, TranscriptConfig, TranscriptEventLog, UploadOutcome,
    AMBIGUOUS_ATTRIBUTION_MARKER,
};
use serde_json::json;

const T0: u64 = 1_700_000_000_000;

struct FlakyFetcher {
    failures_left: AtomicUsize,
}

#[async_trait]
impl ArtifactFetcher for FlakyFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(FetchError::Unavailable {
                url: url.to_string(),
                message: "simulated outage".to_string(),
            });
        }
        Ok(b"payload".to_vec())
    }
}

fn helper_config() -> TranscriptConfig {
    TranscriptConfig {
        privileged_participants: vec!["helper-1".to_string()],
        ..TranscriptConfig::default()
    }
}

fn write_ndjson(path: &Path, rows: &[serde_json::Value]) {
    let body = rows
        .iter()
        .map(|row| row.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(path, format!("{body}\n")).expect("write ingress file");
}

fn upload_row(at_secs: u64, uploader: &str, name: &str, size: u64, url: &str) -> serde_json::Value {
    json!({
        "type": "upload",
        "timestamp_ms": T0 + at_secs * 1_000,
        "room_id": "help-1",
        "uploader_id": uploader,
        "file": { "name": name, "byte_size": size, "fetch_url": url }
    })
}

fn message_row(at_secs: u64, event_id: &str, sender: &str, segments: serde_json::Value) -> serde_json::Value {
    json!({
        "type": "message",
        "timestamp_ms": T0 + at_secs * 1_000,
        "event": {
            "event_id": event_id,
            "room_id": "help-1",
            "sender_id": sender,
            "segments": segments
        }
    })
}

fn record_contents(state_dir: &Path, record_id: &str) -> Vec<String> {
    let raw = fs::read_to_string(state_dir.join("records").join(format!("{record_id}.json")))
        .expect("record file");
    let record: serde_json::Value = serde_json::from_str(&raw).expect("record json");
    record["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .map(|message| message["content"].as_str().expect("content").to_string())
        .collect()
}

#[tokio::test]
async fn integration_ndjson_replay_over_http_builds_expected_transcripts() {
    let server = MockServer::start();
    let crash = server.mock(|when, then| {
        when.method(GET).path("/files/crash.zip");
        then.status(200).body("PK-crash");
    });
    let log = server.mock(|when, then| {
        when.method(GET).path("/files/latest.log");
        then.status(200).body("[main/INFO]: boot");
    });
    let screenshot = server.mock(|when, then| {
        when.method(GET).path("/images/shot.png");
        then.status(200).body("png");
    });

    let temp = tempfile::tempdir().expect("tempdir");
    let ingress = temp.path().join("ingress.ndjson");
    write_ndjson(
        &ingress,
        &[
            upload_row(0, "user-1", "crash.zip", 8, &server.url("/files/crash.zip")),
            upload_row(1, "user-1", "crash.zip", 8, &server.url("/files/crash.zip")),
            message_row(
                30,
                "m-1",
                "user-1",
                json!([
                    { "kind": "text", "text": "crashes when loading world" },
                    { "kind": "image", "name": "shot.png", "fetch_url": server.url("/images/shot.png") }
                ]),
            ),
            message_row(
                35,
                "m-2",
                "helper-1",
                json!([
                    { "kind": "mention", "participant_id": "user-1" },
                    { "kind": "text", "text": "remove optifine" }
                ]),
            ),
            upload_row(40, "user-2", "latest.log", 17, &server.url("/files/latest.log")),
            message_row(50, "m-3", "helper-1", json!([{ "kind": "text", "text": "post your mods list" }])),
            message_row(700, "m-4", "helper-1", json!([
                { "kind": "mention", "participant_id": "user-1" },
                { "kind": "text", "text": "fixed?" }
            ])),
        ],
    );

    let loaded = load_transcript_ingress_events(&ingress).expect("load ingress");
    assert_eq!(loaded.invalid_lines, 0);

    let clock = Arc::new(ManualClock::new(0));
    let fetcher = HttpArtifactFetcher::new(Duration::from_secs(5), 1_024).expect("fetcher");
    let engine = build_correlation_engine(temp.path(), helper_config(), Arc::new(fetcher), clock.clone())
        .expect("engine");
    let summary = run_transcript_replay(&engine, &clock, &loaded.events).await;

    assert_eq!(summary.events, 7);
    assert_eq!(summary.uploads_created, 2);
    assert_eq!(summary.uploads_reused, 1);
    assert_eq!(summary.messages_single, 2);
    assert_eq!(summary.messages_broadcast, 1);
    assert_eq!(summary.messages_unattributed, 1);
    assert_eq!(summary.sessions_evicted, 2);

    crash.assert_calls(1);
    log.assert_calls(1);
    screenshot.assert_calls(1);

    let marker = AMBIGUOUS_ATTRIBUTION_MARKER;
    assert_eq!(
        record_contents(temp.path(), "crash.zip"),
        vec![
            "crashes when loading world [image:crash.zip-m-1-shot.png]".to_string(),
            "remove optifine".to_string(),
            format!("{marker}post your mods list"),
        ]
    );
    assert_eq!(
        record_contents(temp.path(), "latest.log"),
        vec![format!("{marker}post your mods list")]
    );

    let report = inspect_transcript_store(temp.path()).expect("inspect");
    assert_eq!(report.records, 2);
    assert_eq!(report.messages, 4);
    assert_eq!(report.images, 1);
    assert!(report.records_missing_artifact.is_empty());

    let events = TranscriptEventLog::new(
        &engine.store().events_log_path(),
        mcsupport_core::LogRotationPolicy::default(),
    )
    .load()
    .expect("event log");
    assert!(events
        .iter()
        .any(|event| event.reason_code == "session_evicted_conversation_window"));
}

#[tokio::test]
async fn integration_failed_download_leaves_room_as_if_upload_never_happened() {
    let temp = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(T0));
    let engine = build_correlation_engine(
        temp.path(),
        helper_config(),
        Arc::new(FlakyFetcher {
            failures_left: AtomicUsize::new(1),
        }),
        clock.clone(),
    )
    .expect("engine");
    let file = mcsupport_transcript::FileDescriptor {
        name: "crash.zip".to_string(),
        byte_size: 7,
        fetch_url: "https://cdn.example/crash.zip".to_string(),
    };

    let failed = engine.register_upload("help-1", "user-1", &file).await;
    assert!(matches!(failed, UploadOutcome::RolledBack { .. }));
    assert_eq!(engine.fingerprint_count(), 0);
    assert_eq!(engine.session_count(), 0);
    assert!(!temp.path().join("records/crash.zip.json").exists());
    assert!(!temp.path().join("fingerprints.json").exists()
        || fs::read_to_string(temp.path().join("fingerprints.json"))
            .expect("index")
            .contains("\"entries\": []"));

    let message = MessageEvent {
        event_id: "m-1".to_string(),
        room_id: "help-1".to_string(),
        sender_id: "user-1".to_string(),
        segments: vec![MessageSegment::text("did it upload?")],
    };
    assert_eq!(engine.handle_message(&message).await, Attribution::None);

    clock.advance_secs(5);
    let retried = engine.register_upload("help-1", "user-1", &file).await;
    assert_eq!(retried.record_id(), Some("crash.zip"));
    assert_eq!(engine.handle_message(&message).await, Attribution::Single("crash.zip".to_string()));
}

#[tokio::test]
async fn integration_helper_message_before_upload_is_reconciled_in_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(T0));
    let engine = build_correlation_engine(
        temp.path(),
        helper_config(),
        Arc::new(FlakyFetcher {
            failures_left: AtomicUsize::new(0),
        }),
        clock.clone(),
    )
    .expect("engine");
    let helper = |event_id: &str, text: &str| MessageEvent {
        event_id: event_id.to_string(),
        room_id: "help-1".to_string(),
        sender_id: "helper-1".to_string(),
        segments: vec![MessageSegment::text(text)],
    };

    assert_eq!(
        engine.handle_message(&helper("m-1", "send latest.log")).await,
        Attribution::Deferred
    );
    clock.advance_secs(20);
    assert_eq!(
        engine.handle_message(&helper("m-2", "not crash-report")).await,
        Attribution::Deferred
    );
    assert_eq!(engine.pending_len(), 2);

    clock.advance_secs(30);
    let outcome = engine
        .register_upload(
            "help-1",
            "user-1",
            &mcsupport_transcript::FileDescriptor {
                name: "latest.log".to_string(),
                byte_size: 7,
                fetch_url: "https://cdn.example/latest.log".to_string(),
            },
        )
        .await;
    assert_eq!(outcome.record_id(), Some("latest.log"));
    assert_eq!(engine.pending_len(), 0);
    assert_eq!(
        record_contents(temp.path(), "latest.log"),
        vec!["send latest.log".to_string(), "not crash-report".to_string()]
    );
}
