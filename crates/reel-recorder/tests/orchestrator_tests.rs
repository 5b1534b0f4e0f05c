//! End-to-end orchestration tests against the in-memory SFU and stand-in
//! muxer/probe executables.
//!
//! Run with: cargo test -p reel-recorder --test orchestrator_tests

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reel_protocol::{ControlReply, ControlRequest, RecordingEvent, RecordingId};
use reel_recorder::control::RoomEvent;
use reel_recorder::sfu::fake::{FakeDirectory, CONSUMER_AUDIO_PT, CONSUMER_VIDEO_PT};
use reel_recorder::sfu::RtpProducer;
use reel_recorder::{ControlSurface, RecorderConfig};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// A stand-in muxer: touches its output file (the last argument), then
/// stays alive until it reads the graceful-quit command, like ffmpeg.
const FAKE_MUXER: &str = r#"#!/bin/sh
for arg in "$@"; do out="$arg"; done
touch "$out"
while read line; do
  [ "$line" = "q" ] && exit 0
done
exit 0
"#;

const FAKE_PROBE: &str = r#"#!/bin/sh
echo '{"format": {"duration": "6.0"}}'
"#;

struct TestHarness {
    #[allow(dead_code)]
    dir: TempDir,
    sfu: Arc<FakeDirectory>,
    surface: Arc<ControlSurface>,
    events: broadcast::Receiver<RoomEvent>,
}

fn write_executable(path: &Path, contents: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn test_config(root: &Path) -> RecorderConfig {
    let ffmpeg = root.join("fake-ffmpeg");
    let ffprobe = root.join("fake-ffprobe");
    write_executable(&ffmpeg, FAKE_MUXER);
    write_executable(&ffprobe, FAKE_PROBE);

    RecorderConfig {
        record_dir: root.join("files"),
        ffmpeg_path: ffmpeg.display().to_string(),
        ffprobe_path: ffprobe.display().to_string(),
        keyframe_interval: Duration::from_millis(50),
        mixed_min_runtime: Duration::from_millis(200),
        per_participant_min_runtime: Duration::ZERO,
        ..RecorderConfig::default()
    }
}

fn harness() -> TestHarness {
    harness_with(|config| config)
}

fn harness_with(tweak: impl FnOnce(RecorderConfig) -> RecorderConfig) -> TestHarness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reel_recorder=debug".into()),
        )
        .with_test_writer()
        .try_init();

    let dir = TempDir::new().unwrap();
    let config = tweak(test_config(dir.path()));
    let sfu = Arc::new(FakeDirectory::new());
    let surface = ControlSurface::new(config, sfu.clone());
    let events = surface.subscribe();

    TestHarness {
        dir,
        sfu,
        surface,
        events,
    }
}

/// Drain events until one matches, with a deadline.
async fn wait_for_event(
    events: &mut broadcast::Receiver<RoomEvent>,
    mut matches: impl FnMut(&RecordingEvent) -> bool,
) -> RecordingEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let room_event = events.recv().await.expect("event channel closed");
            if matches(&room_event.event) {
                return room_event.event;
            }
        }
    })
    .await
    .expect("event not observed in time")
}

#[tokio::test]
async fn mixed_recording_end_to_end() {
    let mut h = harness();
    let room = h.sfu.add_room("studio");
    room.add_video_producer("alice");
    room.add_video_producer("bob");
    room.add_audio_producer("alice");
    room.add_audio_producer("bob");

    let recording = h
        .surface
        .start_mixed_recording("studio", "alice", Some(1280), Some(720))
        .await
        .unwrap();
    let id = recording.id;

    assert_eq!(recording.file_name, format!("mixed-{id}.mp4"));
    assert_eq!(recording.inputs.len(), 4);

    // Every endpoint is connected to its own loopback pair, RTCP one above.
    let endpoints = room.router.endpoints();
    assert_eq!(endpoints.len(), 4);
    let mut ports = Vec::new();
    for endpoint in &endpoints {
        let (ip, rtp, rtcp) = endpoint.connected_to().unwrap();
        assert_eq!(ip, "127.0.0.1");
        assert_eq!(rtcp, rtp + 1);
        ports.push(rtp);
    }
    ports.sort();
    ports.dedup();
    assert_eq!(ports.len(), 4, "peer ports must be distinct");

    // Consumers were created paused and resumed after the muxer spawn.
    for endpoint in &endpoints {
        for consumer in endpoint.consumers() {
            assert!(!consumer.is_paused());
        }
    }

    // SDP files carry the consumer-assigned payload types.
    for input in &recording.inputs {
        let sdp = std::fs::read_to_string(&input.sdp_path).unwrap();
        let expected = match input.bound.kind {
            reel_protocol::MediaKind::Video => format!("a=rtpmap:{CONSUMER_VIDEO_PT} VP8/90000"),
            reel_protocol::MediaKind::Audio => {
                format!("a=rtpmap:{CONSUMER_AUDIO_PT} opus/48000/2")
            }
        };
        assert!(sdp.contains(&expected), "missing {expected} in {sdp}");
        assert!(sdp.contains(&format!("a=rtcp:{} IN IP4 127.0.0.1", input.bound.rtp_port + 1)));
    }

    // Keyframes keep flowing while the recording runs.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let video_consumer = endpoints
        .iter()
        .flat_map(|e| e.consumers())
        .find(|c| c.keyframe_request_count() > 0)
        .expect("at least one video consumer got keyframe requests");
    assert!(video_consumer.keyframe_request_count() >= 2);

    match h.surface.status(id).await {
        ControlReply::RecordingStatus {
            active,
            input_count,
            ..
        } => {
            assert!(active);
            assert_eq!(input_count, 4);
        }
        other => panic!("unexpected reply: {other:?}"),
    }

    let summary = h.surface.stop_mixed_recording(id).await.unwrap();
    assert!(summary.file_exists, "stand-in muxer touches the output");
    assert_eq!(summary.duration_secs, Some(6.0));
    assert!(summary.expected_duration_secs >= 0.0);
    assert!(summary.path.ends_with(format!("mixed-{id}.mp4")));

    // The auxiliary SDP directory is gone, the registry entry is removed
    // and every consumer and endpoint is closed.
    assert!(!recording.sdp_dir.exists());
    assert!(h.surface.registry().is_empty().await);
    for endpoint in &endpoints {
        assert!(endpoint.is_closed());
        for consumer in endpoint.consumers() {
            assert!(consumer.is_closed());
        }
    }

    let stopped = wait_for_event(&mut h.events, |e| {
        matches!(e, RecordingEvent::RecordingStopped { .. })
    })
    .await;
    assert_eq!(stopped.recording_id(), id);
}

#[tokio::test]
async fn per_participant_recording_produces_one_file_per_producer() {
    let mut h = harness();
    let room = h.sfu.add_room("trio");
    room.add_video_producer("p1");
    room.add_video_producer("p2");
    room.add_video_producer("p3");

    let recording = h.surface.start_recording("trio", "p1").await.unwrap();
    let id = recording.id;
    assert_eq!(recording.inputs.len(), 3);

    for input in &recording.inputs {
        assert!(input.sdp_path.exists());
        let output = input.output_path.as_ref().unwrap();
        assert!(output.extension().is_some_and(|e| e == "webm"));
    }

    let summary = h.surface.stop_recording(id).await.unwrap();
    assert!(summary.file_exists);
    assert_eq!(summary.duration_secs, Some(6.0));

    let metadata_path = recording.output_path.join("metadata.json");
    let metadata: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(metadata_path).unwrap()).unwrap();
    assert_eq!(metadata["room"], "trio");
    assert_eq!(metadata["files"].as_array().unwrap().len(), 3);
    assert!(metadata["started_at"].is_string());
    assert!(metadata["ended_at"].is_string());

    assert!(h.surface.registry().is_empty().await);
    wait_for_event(&mut h.events, |e| {
        matches!(e, RecordingEvent::RecordingStopped { .. })
    })
    .await;
}

#[tokio::test]
async fn start_before_router_exists_is_rejected() {
    let h = harness();

    let reply = h
        .surface
        .handle(ControlRequest::StartRecording {
            room: "ghost".into(),
            user: "u".into(),
        })
        .await;

    match reply {
        ControlReply::Error { message } => assert!(message.contains("not ready")),
        other => panic!("unexpected reply: {other:?}"),
    }
    // No files were created.
    assert!(h.surface.registry().is_empty().await);
}

#[tokio::test]
async fn room_without_producers_is_rejected() {
    let h = harness();
    h.sfu.add_room("empty");

    let err = h
        .surface
        .start_mixed_recording("empty", "u", None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no usable producers"));
}

#[tokio::test]
async fn unconsumable_producers_are_skipped_not_fatal() {
    let h = harness();
    let room = h.sfu.add_room("mixed-caps");
    let denied = room.add_video_producer("old-codec");
    room.router.deny_consume(denied.id());
    room.add_audio_producer("fine");

    let recording = h
        .surface
        .start_mixed_recording("mixed-caps", "u", None, None)
        .await
        .unwrap();
    assert_eq!(recording.inputs.len(), 1);
    assert_eq!(recording.inputs[0].bound.kind, reel_protocol::MediaKind::Audio);

    h.surface.stop_mixed_recording(recording.id).await.unwrap();
}

#[tokio::test]
async fn only_first_four_videos_are_tiled() {
    let h = harness();
    let room = h.sfu.add_room("crowd");
    for i in 0..6 {
        room.add_video_producer(&format!("p{i}"));
    }

    let recording = h
        .surface
        .start_mixed_recording("crowd", "u", None, None)
        .await
        .unwrap();
    assert_eq!(recording.inputs.len(), 4);

    h.surface.stop_mixed_recording(recording.id).await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent_then_not_found() {
    let h = harness();
    let room = h.sfu.add_room("once");
    room.add_audio_producer("solo");

    let recording = h
        .surface
        .start_mixed_recording("once", "u", None, None)
        .await
        .unwrap();
    let id = recording.id;

    // Two concurrent stops observe the same summary.
    let (first, second) = tokio::join!(
        h.surface.stop_mixed_recording(id),
        h.surface.stop_mixed_recording(id),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.file_name, second.file_name);
    assert_eq!(first.duration_secs, second.duration_secs);

    // Once the entry is gone, stop is NotFound.
    let err = h.surface.stop_mixed_recording(id).await.unwrap_err();
    assert!(matches!(
        err,
        reel_recorder::RecorderError::NotFound(found) if found == id
    ));
}

#[tokio::test]
async fn repeated_starts_get_distinct_ids_and_disjoint_ports() {
    let h = harness();
    let room_a = h.sfu.add_room("a");
    room_a.add_video_producer("a1");
    room_a.add_audio_producer("a1");
    let room_b = h.sfu.add_room("b");
    room_b.add_video_producer("b1");
    room_b.add_audio_producer("b1");

    let rec_a = h
        .surface
        .start_mixed_recording("a", "u", None, None)
        .await
        .unwrap();
    let rec_b = h
        .surface
        .start_mixed_recording("b", "u", None, None)
        .await
        .unwrap();

    assert_ne!(rec_a.id, rec_b.id);

    let mut ports: Vec<u16> = rec_a
        .inputs
        .iter()
        .chain(rec_b.inputs.iter())
        .map(|i| i.bound.rtp_port)
        .collect();
    let total = ports.len();
    ports.sort();
    ports.dedup();
    assert_eq!(ports.len(), total, "peer ports must be disjoint");

    h.surface.stop_mixed_recording(rec_a.id).await.unwrap();
    h.surface.stop_mixed_recording(rec_b.id).await.unwrap();
}

#[tokio::test]
async fn immediate_stop_is_held_to_the_minimum_runtime_floor() {
    let h = harness_with(|mut config| {
        config.mixed_min_runtime = Duration::from_millis(600);
        config
    });
    let room = h.sfu.add_room("quick");
    room.add_audio_producer("solo");

    let recording = h
        .surface
        .start_mixed_recording("quick", "u", None, None)
        .await
        .unwrap();

    let begun = Instant::now();
    h.surface.stop_mixed_recording(recording.id).await.unwrap();
    assert!(
        begun.elapsed() >= Duration::from_millis(550),
        "stop returned after {:?}",
        begun.elapsed()
    );
}

#[tokio::test]
async fn closing_every_producer_fails_the_recording() {
    let mut h = harness();
    let room = h.sfu.add_room("fragile");
    let producer = room.add_video_producer("only");

    let recording = h
        .surface
        .start_mixed_recording("fragile", "u", None, None)
        .await
        .unwrap();
    let id = recording.id;

    producer.close();

    let error = wait_for_event(&mut h.events, |e| {
        matches!(e, RecordingEvent::RecordingError { .. })
    })
    .await;
    assert_eq!(error.recording_id(), id);
    match error {
        RecordingEvent::RecordingError { message, .. } => {
            assert!(message.contains("producer"), "message: {message}");
        }
        _ => unreachable!(),
    }

    assert!(h.surface.registry().is_empty().await);
}

#[tokio::test]
async fn stale_recordings_are_force_stopped_by_the_health_check() {
    let mut h = harness_with(|mut config| {
        config.stale_after = Duration::from_millis(400);
        config.health_interval = Duration::from_millis(100);
        config.mixed_min_runtime = Duration::ZERO;
        config
    });
    let room = h.sfu.add_room("forgotten");
    room.add_audio_producer("solo");

    let recording = h
        .surface
        .start_mixed_recording("forgotten", "u", None, None)
        .await
        .unwrap();
    let id = recording.id;

    let error = wait_for_event(&mut h.events, |e| {
        matches!(e, RecordingEvent::RecordingError { .. })
    })
    .await;
    assert_eq!(error.recording_id(), id);
    match error {
        RecordingEvent::RecordingError { message, .. } => {
            assert!(message.contains("stale"), "message: {message}");
        }
        _ => unreachable!(),
    }
    assert!(h.surface.registry().is_empty().await);
}

#[tokio::test]
async fn failed_muxer_spawn_cleans_up_endpoints() {
    let h = harness_with(|mut config| {
        config.ffmpeg_path = "/nonexistent/muxer-binary".to_string();
        config
    });
    let room = h.sfu.add_room("broken");
    room.add_video_producer("alice");

    let err = h
        .surface
        .start_mixed_recording("broken", "u", None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        reel_recorder::RecorderError::MuxerSpawnFailed(_)
    ));

    assert!(h.surface.registry().is_empty().await);
    for endpoint in room.router.endpoints() {
        assert!(endpoint.is_closed());
        for consumer in endpoint.consumers() {
            assert!(consumer.is_closed());
        }
    }
}

#[tokio::test]
async fn status_for_unknown_recording_reports_inactive() {
    let h = harness();

    match h
        .surface
        .handle(ControlRequest::RecordingStatus {
            recording_id: RecordingId(12345),
        })
        .await
    {
        ControlReply::RecordingStatus { active, .. } => assert!(!active),
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn lifecycle_events_arrive_in_order() {
    let mut h = harness();
    let room = h.sfu.add_room("events");
    room.add_audio_producer("solo");

    let recording = h
        .surface
        .start_mixed_recording("events", "u", None, None)
        .await
        .unwrap();
    h.surface.stop_mixed_recording(recording.id).await.unwrap();

    let mut order = Vec::new();
    while let Ok(room_event) = h.events.try_recv() {
        order.push(match room_event.event {
            RecordingEvent::RecordingStateChanged { state, .. } => format!("state:{state:?}"),
            RecordingEvent::RecordingStarted { .. } => "started".to_string(),
            RecordingEvent::RecordingStopped { .. } => "stopped".to_string(),
            RecordingEvent::RecordingError { .. } => "error".to_string(),
        });
    }

    assert_eq!(
        order,
        vec![
            "state:Starting",
            "started",
            "state:Stopping",
            "state:Processing",
            "stopped"
        ]
    );
}
