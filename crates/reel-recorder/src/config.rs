use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

/// Recorder configuration, loaded from environment variables with sensible
/// defaults so the subsystem runs out of the box next to a local SFU.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Root directory for recorded files and auxiliary SDP files.
    pub record_dir: PathBuf,
    /// Path of the external muxer binary.
    pub ffmpeg_path: String,
    /// Path of the external duration-probe binary.
    pub ffprobe_path: String,
    /// Candidate range for loopback RTP peer ports.
    pub port_range: Range<u16>,
    /// How many candidates to try before giving up on a free port pair.
    pub port_attempts: usize,
    /// Frame size of the mixed composition.
    pub mixed_width: u32,
    pub mixed_height: u32,
    /// Target frame rate of the mixed composition; also the GOP length.
    pub frame_rate: u32,
    /// Interval between keyframe requests to video consumers.
    pub keyframe_interval: Duration,
    /// A mixed stop request is held until this much time has elapsed since
    /// start, so an immediate stop still yields a non-empty file.
    pub mixed_min_runtime: Duration,
    /// Same floor for per-participant recordings.
    pub per_participant_min_runtime: Duration,
    /// Recordings older than this are force-stopped by the health check.
    pub stale_after: Duration,
    /// How often the health check sweeps active recordings.
    pub health_interval: Duration,
    /// Muxer stderr error lines tolerated before the recording is failed.
    pub muxer_error_threshold: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            record_dir: PathBuf::from("./files"),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            port_range: 15000..55000,
            port_attempts: 64,
            mixed_width: 1280,
            mixed_height: 720,
            frame_rate: 30,
            keyframe_interval: Duration::from_secs(1),
            mixed_min_runtime: Duration::from_secs(5),
            per_participant_min_runtime: Duration::ZERO,
            stale_after: Duration::from_secs(2 * 60 * 60),
            health_interval: Duration::from_secs(30),
            muxer_error_threshold: 20,
        }
    }
}

impl RecorderConfig {
    pub fn load() -> Self {
        let defaults = Self::default();

        let record_dir = std::env::var("RECORD_FILE_LOCATION_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| defaults.record_dir.clone());

        let ffmpeg_path =
            std::env::var("FFMPEG_PATH").unwrap_or_else(|_| defaults.ffmpeg_path.clone());
        let ffprobe_path =
            std::env::var("FFPROBE_PATH").unwrap_or_else(|_| defaults.ffprobe_path.clone());

        let port_min = env_parse("RECORD_RTP_PORT_MIN", defaults.port_range.start);
        let port_max = env_parse("RECORD_RTP_PORT_MAX", defaults.port_range.end);
        // Each allocation takes an RTP/RTCP pair, so the range must span at
        // least two ports.
        let port_range = if port_max.saturating_sub(port_min) >= 2 {
            port_min..port_max
        } else {
            tracing::warn!(
                port_min,
                port_max,
                "RTP port range cannot hold a port pair, falling back to default"
            );
            defaults.port_range.clone()
        };

        let mixed_min_runtime = Duration::from_secs(env_parse(
            "RECORD_MIXED_MIN_RUNTIME_SECS",
            defaults.mixed_min_runtime.as_secs(),
        ));
        let stale_after = Duration::from_secs(env_parse(
            "RECORD_STALE_AFTER_SECS",
            defaults.stale_after.as_secs(),
        ));

        Self {
            record_dir,
            ffmpeg_path,
            ffprobe_path,
            port_range,
            mixed_min_runtime,
            stale_after,
            ..defaults
        }
    }

    /// Directory holding one per-participant recording's SDP and output files.
    pub fn per_participant_dir(&self, room: &str, recording_id: u64) -> PathBuf {
        self.record_dir
            .join("per")
            .join(room)
            .join(recording_id.to_string())
    }

    /// Directory holding a mixed recording's auxiliary SDP files.
    pub fn mixed_sdp_dir(&self, recording_id: u64) -> PathBuf {
        self.record_dir.join("sdp").join(recording_id.to_string())
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(%name, %raw, "unparseable value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_and_ranges() {
        let config = RecorderConfig::default();
        assert_eq!(config.record_dir, PathBuf::from("./files"));
        assert_eq!(config.port_range, 15000..55000);
        assert!(config.port_attempts >= 50);
    }

    #[test]
    fn directory_layout() {
        let config = RecorderConfig::default();
        assert_eq!(
            config.per_participant_dir("lobby", 42),
            PathBuf::from("./files/per/lobby/42")
        );
        assert_eq!(config.mixed_sdp_dir(42), PathBuf::from("./files/sdp/42"));
    }
}
