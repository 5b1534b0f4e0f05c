//! Per-participant recording: one independent muxer and file per producer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use reel_protocol::{MediaKind, RecordingId, RecordingMode};
use serde_json::json;
use tokio::sync::Mutex;

use super::{
    bind_usable, ensure_writable_dir, resume_inputs, wind_down, RecordingInput, StopSummary,
};
use crate::config::RecorderConfig;
use crate::error::{RecorderError, Result};
use crate::keyframe::KeyframePump;
use crate::muxer::{probe, MuxerProcess, PROTOCOL_WHITELIST};
use crate::ports::PortAllocator;
use crate::registry::ActiveRecording;
use crate::sdp;
use crate::sfu::{MediaRouter, RtpProducer};

pub struct PerParticipantRecorder {
    config: Arc<RecorderConfig>,
    ports: Arc<PortAllocator>,
}

impl PerParticipantRecorder {
    pub fn new(config: Arc<RecorderConfig>, ports: Arc<PortAllocator>) -> Self {
        Self { config, ports }
    }

    /// Record every consumable producer of the room into its own WebM file
    /// under `<root>/per/<room>/<rec_id>/`.
    pub async fn start(
        &self,
        id: RecordingId,
        room: &str,
        user: &str,
        router: Arc<dyn MediaRouter>,
        producers: Vec<Arc<dyn RtpProducer>>,
    ) -> Result<Arc<ActiveRecording>> {
        if producers.is_empty() {
            return Err(RecorderError::NoInputs(room.to_string()));
        }

        let dir = self.config.per_participant_dir(room, id.0);
        ensure_writable_dir(&dir)?;

        let bound = bind_usable(&router, &producers, &self.ports).await?;
        if bound.is_empty() {
            return Err(RecorderError::NoInputs(room.to_string()));
        }

        // Write every SDP before any muxer is spawned so a failure here
        // leaves no subprocess behind.
        let mut inputs: Vec<RecordingInput> = Vec::with_capacity(bound.len());
        for input in bound {
            let base = format!("{}-{}-{}", input.kind, input.peer_id, input.producer_id);
            let sdp_path = dir.join(format!("{base}.sdp"));
            let output_path = dir.join(format!("{base}.webm"));

            if let Err(e) = std::fs::write(&sdp_path, sdp::synthesize(&input.codec, input.rtp_port))
            {
                input.close().await;
                self.ports.release_pair(input.rtp_port);
                for prior in &inputs {
                    prior.bound.close().await;
                    self.ports.release_pair(prior.bound.rtp_port);
                }
                return Err(e.into());
            }

            inputs.push(RecordingInput {
                bound: input,
                sdp_path,
                output_path: Some(output_path),
            });
        }

        let mut muxers = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let output = input.output_path.as_ref().expect("per-participant output");
            let args = muxer_args(input.bound.kind, &input.sdp_path, output);
            let label = format!("per-{id}-{}", input.bound.producer_id);

            match MuxerProcess::spawn(
                &self.config.ffmpeg_path,
                &args,
                &label,
                self.config.muxer_error_threshold,
            ) {
                Ok(muxer) => muxers.push(muxer),
                Err(e) => {
                    wind_down(muxers, &inputs, &self.ports).await;
                    return Err(e);
                }
            }
        }

        resume_inputs(&inputs).await;

        let pump = KeyframePump::start(
            inputs
                .iter()
                .filter(|i| i.bound.kind == MediaKind::Video)
                .map(|i| i.bound.consumer.clone())
                .collect(),
            self.config.keyframe_interval,
        );

        tracing::info!(%id, %room, inputs = inputs.len(), "started per-participant recording");

        Ok(Arc::new(ActiveRecording {
            id,
            room: room.to_string(),
            user: user.to_string(),
            mode: RecordingMode::PerParticipant,
            file_name: id.to_string(),
            output_path: dir.clone(),
            sdp_dir: dir,
            started_at: Utc::now(),
            min_runtime: self.config.per_participant_min_runtime,
            muxer_started: StdMutex::new(None),
            inputs,
            muxers: Mutex::new(muxers),
            pump: StdMutex::new(Some(pump)),
            monitor: StdMutex::new(None),
            stop_result: Mutex::new(None),
        }))
    }

    /// Stop every muxer, close the media resources and write the
    /// `metadata.json` sidecar describing what was produced.
    pub async fn stop(&self, recording: &ActiveRecording) -> Result<StopSummary> {
        let elapsed = recording.elapsed();
        if elapsed < recording.min_runtime {
            tokio::time::sleep(recording.min_runtime - elapsed).await;
        }

        recording.cancel_timers();

        let muxers: Vec<MuxerProcess> = recording.muxers.lock().await.drain(..).collect();
        let muxer_started = muxers
            .iter()
            .find_map(|m| m.started_at())
            .or(*recording.muxer_started.lock().unwrap())
            .unwrap_or(recording.started_at);
        let ended_at = Utc::now();
        let expected_duration_secs =
            (ended_at - muxer_started).num_milliseconds().max(0) as f64 / 1000.0;

        wind_down(muxers, &recording.inputs, &self.ports).await;

        let files: Vec<PathBuf> = recording
            .inputs
            .iter()
            .filter_map(|i| i.output_path.clone())
            .collect();

        let mut file_exists = !files.is_empty();
        let mut duration_secs: Option<f64> = None;
        for file in &files {
            if !file.exists() {
                file_exists = false;
                continue;
            }
            if let Some(duration) = probe::probe_duration(&self.config.ffprobe_path, file).await {
                duration_secs = Some(duration_secs.map_or(duration, |d: f64| d.max(duration)));
            }
        }

        let metadata = json!({
            "recording_id": recording.id,
            "room": recording.room,
            "user": recording.user,
            "started_at": recording.started_at.to_rfc3339(),
            "ended_at": ended_at.to_rfc3339(),
            "duration_secs": duration_secs,
            "files": files,
        });
        let metadata_path = recording.output_path.join("metadata.json");
        if let Err(e) = std::fs::write(
            &metadata_path,
            serde_json::to_string_pretty(&metadata).unwrap_or_default(),
        ) {
            tracing::warn!("failed to write {}: {e}", metadata_path.display());
        }

        tracing::info!(id = %recording.id, "stopped per-participant recording");

        Ok(StopSummary {
            file_name: recording.file_name.clone(),
            path: recording.output_path.clone(),
            file_exists,
            duration_secs,
            expected_duration_secs,
        })
    }
}

/// Argument vector for one single-input muxer re-encoding to WebM.
fn muxer_args(kind: MediaKind, sdp_path: &Path, output_path: &Path) -> Vec<String> {
    let mut args = vec![
        "-protocol_whitelist".to_string(),
        PROTOCOL_WHITELIST.to_string(),
        "-fflags".to_string(),
        "+genpts".to_string(),
        "-i".to_string(),
        sdp_path.display().to_string(),
    ];

    match kind {
        MediaKind::Video => args.extend(
            [
                "-map", "0:v:0", "-c:v", "libvpx", "-b:v", "2M", "-pix_fmt", "yuv420p", "-r",
                "30",
            ]
            .map(String::from),
        ),
        MediaKind::Audio => {
            args.extend(["-map", "0:a:0", "-c:a", "libopus", "-b:a", "128k"].map(String::from))
        }
    }

    args.push("-y".to_string());
    args.push(output_path.display().to_string());
    args
}
