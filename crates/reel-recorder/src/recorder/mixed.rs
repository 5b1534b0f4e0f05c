//! Mixed recording: one muxer fed by every input, tiling video into a grid
//! and mixing audio into a single MP4.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use reel_protocol::{MediaKind, RecordingId, RecordingMode};
use tokio::sync::Mutex;

use super::{
    bind_usable, ensure_writable_dir, resume_inputs, wind_down, RecordingInput, StopSummary,
};
use crate::config::RecorderConfig;
use crate::error::{RecorderError, Result};
use crate::filter::{build_filter_graph, FilterGraph};
use crate::keyframe::KeyframePump;
use crate::muxer::{probe, MuxerProcess, PROTOCOL_WHITELIST};
use crate::ports::PortAllocator;
use crate::registry::ActiveRecording;
use crate::sdp;
use crate::sfu::{MediaRouter, RtpProducer};

/// The composition tiles at most this many video streams.
pub const MAX_VIDEO_TILES: usize = 4;

pub struct MixedRecorder {
    config: Arc<RecorderConfig>,
    ports: Arc<PortAllocator>,
}

impl MixedRecorder {
    pub fn new(config: Arc<RecorderConfig>, ports: Arc<PortAllocator>) -> Self {
        Self { config, ports }
    }

    /// Record the room into `<root>/mixed-<rec_id>.mp4`, with per-input SDP
    /// files under `<root>/sdp/<rec_id>/`.
    pub async fn start(
        &self,
        id: RecordingId,
        room: &str,
        user: &str,
        router: Arc<dyn MediaRouter>,
        producers: Vec<Arc<dyn RtpProducer>>,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<Arc<ActiveRecording>> {
        let width = width.unwrap_or(self.config.mixed_width);
        let height = height.unwrap_or(self.config.mixed_height);

        // The first four video producers in enumeration order participate
        // in the tiling; every audio producer contributes to the mix.
        let videos: Vec<_> = producers
            .iter()
            .filter(|p| p.kind() == MediaKind::Video)
            .cloned()
            .collect();
        if videos.len() > MAX_VIDEO_TILES {
            tracing::warn!(
                ignored = videos.len() - MAX_VIDEO_TILES,
                "more video producers than tiles, ignoring the rest"
            );
        }
        let mut selected: Vec<Arc<dyn RtpProducer>> =
            videos.into_iter().take(MAX_VIDEO_TILES).collect();
        selected.extend(
            producers
                .iter()
                .filter(|p| p.kind() == MediaKind::Audio)
                .cloned(),
        );

        if selected.is_empty() {
            return Err(RecorderError::NoInputs(room.to_string()));
        }

        ensure_writable_dir(&self.config.record_dir)?;
        let sdp_dir = self.config.mixed_sdp_dir(id.0);
        ensure_writable_dir(&sdp_dir)?;

        let bound = bind_usable(&router, &selected, &self.ports).await?;
        if bound.is_empty() {
            let _ = std::fs::remove_dir_all(&sdp_dir);
            return Err(RecorderError::NoInputs(room.to_string()));
        }

        let mut inputs: Vec<RecordingInput> = Vec::with_capacity(bound.len());
        for input in bound {
            let prefix = match input.kind {
                MediaKind::Video => 'v',
                MediaKind::Audio => 'a',
            };
            let sdp_path = sdp_dir.join(format!("{prefix}-{}.sdp", input.producer_id));

            if let Err(e) = std::fs::write(&sdp_path, sdp::synthesize(&input.codec, input.rtp_port))
            {
                input.close().await;
                self.ports.release_pair(input.rtp_port);
                for prior in &inputs {
                    prior.bound.close().await;
                    self.ports.release_pair(prior.bound.rtp_port);
                }
                let _ = std::fs::remove_dir_all(&sdp_dir);
                return Err(e.into());
            }

            inputs.push(RecordingInput {
                bound: input,
                sdp_path,
                output_path: None,
            });
        }

        let video_count = inputs
            .iter()
            .filter(|i| i.bound.kind == MediaKind::Video)
            .count();
        let audio_count = inputs.len() - video_count;
        let graph = build_filter_graph(
            video_count,
            audio_count,
            width,
            height,
            self.config.frame_rate,
        );

        let file_name = format!("mixed-{id}.mp4");
        let output_path = self.config.record_dir.join(&file_name);
        let sdp_paths: Vec<PathBuf> = inputs.iter().map(|i| i.sdp_path.clone()).collect();
        let args = muxer_args(&sdp_paths, &graph, &output_path, self.config.frame_rate);

        let muxer = match MuxerProcess::spawn(
            &self.config.ffmpeg_path,
            &args,
            &format!("mixed-{id}"),
            self.config.muxer_error_threshold,
        ) {
            Ok(muxer) => muxer,
            Err(e) => {
                wind_down(Vec::new(), &inputs, &self.ports).await;
                let _ = std::fs::remove_dir_all(&sdp_dir);
                return Err(e);
            }
        };

        resume_inputs(&inputs).await;

        let pump = KeyframePump::start(
            inputs
                .iter()
                .filter(|i| i.bound.kind == MediaKind::Video)
                .map(|i| i.bound.consumer.clone())
                .collect(),
            self.config.keyframe_interval,
        );

        tracing::info!(
            %id,
            %room,
            video_inputs = video_count,
            audio_inputs = audio_count,
            "started mixed recording"
        );

        Ok(Arc::new(ActiveRecording {
            id,
            room: room.to_string(),
            user: user.to_string(),
            mode: RecordingMode::Mixed,
            file_name,
            output_path,
            sdp_dir,
            started_at: Utc::now(),
            min_runtime: self.config.mixed_min_runtime,
            muxer_started: StdMutex::new(None),
            inputs,
            muxers: Mutex::new(vec![muxer]),
            pump: StdMutex::new(Some(pump)),
            monitor: StdMutex::new(None),
            stop_result: Mutex::new(None),
        }))
    }

    /// Hold the stop to the minimum runtime floor, run the quit ladder,
    /// close media resources, clean the SDP directory and probe the output.
    pub async fn stop(&self, recording: &ActiveRecording) -> Result<StopSummary> {
        let elapsed = recording.elapsed();
        if elapsed < recording.min_runtime {
            tracing::info!(
                id = %recording.id,
                "holding stop for the minimum runtime floor"
            );
            tokio::time::sleep(recording.min_runtime - elapsed).await;
        }

        recording.cancel_timers();

        let muxers: Vec<MuxerProcess> = recording.muxers.lock().await.drain(..).collect();
        let muxer_started = muxers
            .iter()
            .find_map(|m| m.started_at())
            .or(*recording.muxer_started.lock().unwrap())
            .unwrap_or(recording.started_at);
        let expected_duration_secs =
            (Utc::now() - muxer_started).num_milliseconds().max(0) as f64 / 1000.0;

        wind_down(muxers, &recording.inputs, &self.ports).await;

        if let Err(e) = std::fs::remove_dir_all(&recording.sdp_dir) {
            tracing::warn!(
                "failed to remove {}: {e}",
                recording.sdp_dir.display()
            );
        }

        let file_exists = recording.output_path.exists();
        let duration_secs = if file_exists {
            probe::probe_duration(&self.config.ffprobe_path, &recording.output_path).await
        } else {
            None
        };

        tracing::info!(id = %recording.id, file_exists, "stopped mixed recording");

        Ok(StopSummary {
            file_name: recording.file_name.clone(),
            path: recording.output_path.clone(),
            file_exists,
            duration_secs,
            expected_duration_secs,
        })
    }
}

/// Argument vector for the single mixed muxer: every SDP as an input, the
/// filter graph, and the H.264/AAC encoder contract tuned so a partially
/// written file stays playable.
fn muxer_args(
    sdp_paths: &[PathBuf],
    graph: &FilterGraph,
    output_path: &Path,
    frame_rate: u32,
) -> Vec<String> {
    let mut args = vec!["-fflags".to_string(), "+genpts".to_string()];

    // The whitelist is a per-input demuxer option: it only covers the input
    // that follows it, so it has to be repeated before every SDP.
    for sdp in sdp_paths {
        args.push("-protocol_whitelist".to_string());
        args.push(PROTOCOL_WHITELIST.to_string());
        args.push("-i".to_string());
        args.push(sdp.display().to_string());
    }

    args.push("-filter_complex".to_string());
    args.push(graph.expr.clone());

    if let Some(video_label) = &graph.video_label {
        let gop = frame_rate.to_string();
        args.extend(["-map".to_string(), video_label.clone()]);
        args.extend(
            [
                "-c:v",
                "libx264",
                "-profile:v",
                "baseline",
                "-preset",
                "ultrafast",
                "-tune",
                "zerolatency",
                "-pix_fmt",
                "yuv420p",
            ]
            .map(String::from),
        );
        args.extend(["-g".to_string(), gop.clone(), "-keyint_min".to_string(), gop]);
        args.extend(["-sc_threshold", "0", "-bf", "0", "-flags", "+cgop"].map(String::from));
    }

    if let Some(audio_label) = &graph.audio_label {
        args.extend(["-map".to_string(), audio_label.clone()]);
        args.extend(
            ["-c:a", "aac", "-b:a", "128k", "-ar", "48000", "-ac", "2"].map(String::from),
        );
    }

    args.extend(
        [
            "-movflags",
            "+faststart+frag_keyframe+empty_moov",
            "-y",
        ]
        .map(String::from),
    );
    args.push(output_path.display().to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_for_two_videos_and_one_audio() {
        let graph = build_filter_graph(2, 1, 1280, 720, 30);
        let sdps = vec![
            PathBuf::from("/r/sdp/1/v-a.sdp"),
            PathBuf::from("/r/sdp/1/v-b.sdp"),
            PathBuf::from("/r/sdp/1/a-c.sdp"),
        ];
        let args = muxer_args(&sdps, &graph, Path::new("/r/mixed-1.mp4"), 30);
        let joined = args.join(" ");

        assert!(joined.starts_with("-fflags +genpts"));
        // Every input carries its own whitelist.
        for sdp in ["v-a", "v-b", "a-c"] {
            assert!(joined
                .contains(&format!(
                    "-protocol_whitelist file,crypto,data,udp,rtp -i /r/sdp/1/{sdp}.sdp"
                )));
        }
        assert_eq!(joined.matches("-protocol_whitelist").count(), 3);
        assert!(joined.contains("-map [vout]"));
        assert!(joined.contains("-c:v libx264 -profile:v baseline -preset ultrafast"));
        assert!(joined.contains("-g 30 -keyint_min 30 -sc_threshold 0 -bf 0 -flags +cgop"));
        assert!(joined.contains("-map [aout] -c:a aac -b:a 128k -ar 48000 -ac 2"));
        assert!(joined.contains("-movflags +faststart+frag_keyframe+empty_moov"));
        assert!(joined.ends_with("-y /r/mixed-1.mp4"));
    }

    #[test]
    fn audio_only_args_skip_the_video_encoder() {
        let graph = build_filter_graph(0, 1, 1280, 720, 30);
        let sdps = vec![PathBuf::from("/r/sdp/2/a-x.sdp")];
        let args = muxer_args(&sdps, &graph, Path::new("/r/mixed-2.mp4"), 30);
        let joined = args.join(" ");

        assert!(!joined.contains("libx264"));
        assert!(joined.contains("-map [aout]"));
    }
}
