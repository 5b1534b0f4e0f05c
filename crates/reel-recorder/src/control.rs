//! Control surface: translates inbound start/stop/status requests into
//! recorder calls and emits lifecycle events to the session.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use reel_protocol::{
    ControlReply, ControlRequest, RecordingEvent, RecordingId, RecordingMode, RecordingState,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::RecorderConfig;
use crate::error::{RecorderError, Result};
use crate::ports::PortAllocator;
use crate::recorder::{MixedRecorder, PerParticipantRecorder, StopSummary};
use crate::registry::{ActiveRecording, RecordingRegistry};
use crate::sfu::SfuDirectory;

/// A lifecycle event scoped to the room it concerns. The room server relays
/// it to the originating client and every session member.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub room: String,
    pub event: RecordingEvent,
}

/// Owns the registry and the two recorders; the single entry point for the
/// room server's recording requests.
pub struct ControlSurface {
    config: Arc<RecorderConfig>,
    sfu: Arc<dyn SfuDirectory>,
    registry: Arc<RecordingRegistry>,
    per_participant: PerParticipantRecorder,
    mixed: MixedRecorder,
    events: broadcast::Sender<RoomEvent>,
    health: StdMutex<Option<JoinHandle<()>>>,
}

impl ControlSurface {
    pub fn new(config: RecorderConfig, sfu: Arc<dyn SfuDirectory>) -> Arc<Self> {
        let config = Arc::new(config);
        let ports = Arc::new(PortAllocator::from_config(&config));
        let (events, _) = broadcast::channel(256);

        let surface = Arc::new(Self {
            per_participant: PerParticipantRecorder::new(config.clone(), ports.clone()),
            mixed: MixedRecorder::new(config.clone(), ports),
            registry: Arc::new(RecordingRegistry::new()),
            config,
            sfu,
            events,
            health: StdMutex::new(None),
        });
        surface.spawn_health_monitor();
        surface
    }

    pub fn registry(&self) -> &RecordingRegistry {
        &self.registry
    }

    /// Subscribe to lifecycle events for relaying to session members.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    /// Dispatch one control request, mapping errors into an error reply.
    pub async fn handle(self: &Arc<Self>, request: ControlRequest) -> ControlReply {
        match request {
            ControlRequest::StartRecording { room, user } => {
                match self.start_recording(&room, &user).await {
                    Ok(recording) => ControlReply::RecordingStarted {
                        recording_id: recording.id,
                        file_name: recording.file_name.clone(),
                    },
                    Err(e) => error_reply(e),
                }
            }
            ControlRequest::StopRecording { recording_id } => {
                match self.stop_recording(recording_id).await {
                    Ok(summary) => ControlReply::RecordingStopped {
                        file_name: summary.file_name,
                        path: summary.path.display().to_string(),
                        file_exists: summary.file_exists,
                        duration_secs: summary.duration_secs,
                    },
                    Err(e) => error_reply(e),
                }
            }
            ControlRequest::StartMixedRecording {
                room,
                user,
                width,
                height,
            } => match self.start_mixed_recording(&room, &user, width, height).await {
                Ok(recording) => ControlReply::MixedRecordingStarted {
                    recording_id: recording.id,
                    file_name: recording.file_name.clone(),
                    path: recording.output_path.display().to_string(),
                },
                Err(e) => error_reply(e),
            },
            ControlRequest::StopMixedRecording { recording_id } => {
                match self.stop_mixed_recording(recording_id).await {
                    Ok(summary) => ControlReply::MixedRecordingStopped {
                        file_name: summary.file_name,
                        path: summary.path.display().to_string(),
                        file_exists: summary.file_exists,
                        duration_secs: summary.duration_secs,
                        expected_duration_secs: summary.expected_duration_secs,
                    },
                    Err(e) => error_reply(e),
                }
            }
            ControlRequest::RecordingStatus { recording_id } => self.status(recording_id).await,
        }
    }

    pub async fn start_recording(
        self: &Arc<Self>,
        room: &str,
        user: &str,
    ) -> Result<Arc<ActiveRecording>> {
        let router = self
            .sfu
            .router(room)
            .await
            .ok_or_else(|| RecorderError::RouterUnready(room.to_string()))?;
        let producers = self.sfu.producers(room).await;

        let id = self.registry.next_id();
        self.emit_state(room, id, RecordingState::Starting);

        let recording = match self
            .per_participant
            .start(id, room, user, router, producers)
            .await
        {
            Ok(recording) => recording,
            Err(e) => {
                self.emit_error(room, id, &e.to_string());
                return Err(e);
            }
        };

        self.register(recording.clone()).await;
        Ok(recording)
    }

    pub async fn start_mixed_recording(
        self: &Arc<Self>,
        room: &str,
        user: &str,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<Arc<ActiveRecording>> {
        let router = self
            .sfu
            .router(room)
            .await
            .ok_or_else(|| RecorderError::RouterUnready(room.to_string()))?;
        let producers = self.sfu.producers(room).await;

        let id = self.registry.next_id();
        self.emit_state(room, id, RecordingState::Starting);

        let recording = match self
            .mixed
            .start(id, room, user, router, producers, width, height)
            .await
        {
            Ok(recording) => recording,
            Err(e) => {
                self.emit_error(room, id, &e.to_string());
                return Err(e);
            }
        };

        self.register(recording.clone()).await;
        Ok(recording)
    }

    pub async fn stop_recording(&self, id: RecordingId) -> Result<StopSummary> {
        let recording = self
            .registry
            .get(id)
            .await
            .ok_or(RecorderError::NotFound(id))?;
        if recording.mode != RecordingMode::PerParticipant {
            return Err(RecorderError::NotFound(id));
        }
        self.stop_internal(recording).await
    }

    pub async fn stop_mixed_recording(&self, id: RecordingId) -> Result<StopSummary> {
        let recording = self
            .registry
            .get(id)
            .await
            .ok_or(RecorderError::NotFound(id))?;
        if recording.mode != RecordingMode::Mixed {
            return Err(RecorderError::NotFound(id));
        }
        self.stop_internal(recording).await
    }

    pub async fn status(&self, id: RecordingId) -> ControlReply {
        match self.registry.get(id).await {
            Some(recording) => ControlReply::RecordingStatus {
                active: true,
                elapsed_secs: recording.elapsed().as_secs_f64(),
                file_name: recording.file_name.clone(),
                input_count: recording.inputs.len(),
            },
            None => ControlReply::RecordingStatus {
                active: false,
                elapsed_secs: 0.0,
                file_name: String::new(),
                input_count: 0,
            },
        }
    }

    async fn register(self: &Arc<Self>, recording: Arc<ActiveRecording>) {
        self.registry.insert(recording.clone()).await;

        let monitor = tokio::spawn(monitor_recording(self.clone(), recording.clone()));
        *recording.monitor.lock().unwrap() = Some(monitor);

        self.emit(
            &recording.room,
            RecordingEvent::RecordingStarted {
                recording_id: recording.id,
                timestamp: Utc::now(),
                file_name: recording.file_name.clone(),
            },
        );
    }

    /// The shared stop path. Idempotent: the first caller runs the shutdown
    /// and stores the summary, concurrent callers park on the latch and
    /// receive the same value; callers arriving after removal get NotFound
    /// from the public entry points.
    async fn stop_internal(&self, recording: Arc<ActiveRecording>) -> Result<StopSummary> {
        let mut latch = recording.stop_result.lock().await;
        if let Some(summary) = latch.clone() {
            return Ok(summary);
        }

        self.emit_state(&recording.room, recording.id, RecordingState::Stopping);

        let summary = match recording.mode {
            RecordingMode::PerParticipant => self.per_participant.stop(&recording).await?,
            RecordingMode::Mixed => self.mixed.stop(&recording).await?,
        };

        self.emit_state(&recording.room, recording.id, RecordingState::Processing);
        self.registry.remove(recording.id).await;
        *latch = Some(summary.clone());

        self.emit(
            &recording.room,
            RecordingEvent::RecordingStopped {
                recording_id: recording.id,
                timestamp: Utc::now(),
                file_name: summary.file_name.clone(),
            },
        );

        Ok(summary)
    }

    /// Terminal-error path used by the recording monitor and the health
    /// check: best-effort shutdown, registry removal and a single
    /// `recordingError` event instead of `recordingStopped`.
    pub async fn fail_recording(&self, id: RecordingId, message: String) {
        let Some(recording) = self.registry.get(id).await else {
            return;
        };

        let mut latch = recording.stop_result.lock().await;
        if latch.is_some() {
            // A normal stop won the race; nothing to report.
            return;
        }

        tracing::error!(%id, "recording failed: {message}");

        let summary = match recording.mode {
            RecordingMode::PerParticipant => self.per_participant.stop(&recording).await,
            RecordingMode::Mixed => self.mixed.stop(&recording).await,
        };
        self.registry.remove(id).await;
        if let Ok(summary) = summary {
            *latch = Some(summary);
        }

        self.emit(
            &recording.room,
            RecordingEvent::RecordingError {
                recording_id: id,
                timestamp: Utc::now(),
                message,
            },
        );
    }

    /// Periodic sweep force-stopping recordings that outlived the stale
    /// threshold.
    fn spawn_health_monitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.health_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(surface) = weak.upgrade() else {
                    return;
                };

                for id in surface.registry.ids().await {
                    let Some(recording) = surface.registry.get(id).await else {
                        continue;
                    };
                    if recording.elapsed() > surface.config.stale_after {
                        tracing::warn!(%id, "recording exceeded stale threshold, force-stopping");
                        let message = RecorderError::Timeout(id).to_string();
                        surface.fail_recording(id, message).await;
                    }
                }
            }
        });

        *self.health.lock().unwrap() = Some(handle);
    }

    fn emit(&self, room: &str, event: RecordingEvent) {
        let _ = self.events.send(RoomEvent {
            room: room.to_string(),
            event,
        });
    }

    fn emit_state(&self, room: &str, id: RecordingId, state: RecordingState) {
        self.emit(
            room,
            RecordingEvent::RecordingStateChanged {
                recording_id: id,
                timestamp: Utc::now(),
                state,
            },
        );
    }

    fn emit_error(&self, room: &str, id: RecordingId, message: &str) {
        self.emit(
            room,
            RecordingEvent::RecordingError {
                recording_id: id,
                timestamp: Utc::now(),
                message: message.to_string(),
            },
        );
    }
}

impl Drop for ControlSurface {
    fn drop(&mut self) {
        if let Some(health) = self.health.lock().unwrap().take() {
            health.abort();
        }
    }
}

fn error_reply(e: RecorderError) -> ControlReply {
    ControlReply::Error {
        message: e.to_string(),
    }
}

/// Watches one recording: records the muxer-started instant, detects muxer
/// crashes and escalated stderr errors, and fails the recording once every
/// producer is gone.
async fn monitor_recording(surface: Arc<ControlSurface>, recording: Arc<ActiveRecording>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let mut failure: Option<String> = None;
        {
            let mut muxers = recording.muxers.lock().await;
            if muxers.is_empty() {
                // The stop path has drained them; nothing left to watch.
                return;
            }

            for muxer in muxers.iter_mut() {
                if let Some(at) = muxer.started_at() {
                    let mut started = recording.muxer_started.lock().unwrap();
                    if started.is_none() {
                        *started = Some(at);
                    }
                }
                if let Some(line) = muxer.failure() {
                    failure = Some(RecorderError::MuxerCrash(line).to_string());
                }
                if let Some(status) = muxer.try_exited() {
                    if !status.success() {
                        failure =
                            Some(RecorderError::MuxerCrash(status.to_string()).to_string());
                    }
                }
            }
        }

        if failure.is_none()
            && recording
                .inputs
                .iter()
                .all(|i| i.bound.consumer.is_producer_closed())
        {
            failure = Some("every producer closed".to_string());
        }

        if let Some(message) = failure {
            // Drop our own handle first so the stop path does not abort the
            // very task running it.
            recording.monitor.lock().unwrap().take();
            surface.fail_recording(recording.id, message).await;
            return;
        }
    }
}
