//! The two recording orchestrators and the plumbing they share.

pub mod mixed;
pub mod per_participant;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reel_protocol::MediaKind;

use crate::binder::{self, BoundInput};
use crate::error::{RecorderError, Result};
use crate::muxer::MuxerProcess;
use crate::ports::PortAllocator;
use crate::sfu::{MediaRouter, RtpProducer};

pub use mixed::MixedRecorder;
pub use per_participant::PerParticipantRecorder;

/// One muxer input: a bound producer plus the SDP file describing it and,
/// for per-participant recordings, its own output file.
pub struct RecordingInput {
    pub bound: BoundInput,
    pub sdp_path: PathBuf,
    pub output_path: Option<PathBuf>,
}

/// What a completed stop reports back to the control surface.
#[derive(Debug, Clone)]
pub struct StopSummary {
    pub file_name: String,
    pub path: PathBuf,
    pub file_exists: bool,
    pub duration_secs: Option<f64>,
    pub expected_duration_secs: f64,
}

/// Create `dir` and prove it accepts writes before any endpoint or process
/// is allocated against it.
pub(crate) fn ensure_writable_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(RecorderError::OutputUnwritable)?;

    let probe = dir.join(".write-probe");
    std::fs::write(&probe, b"ok").map_err(RecorderError::OutputUnwritable)?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Bind every consumable producer in order. Producers the router cannot
/// consume are skipped with a warning; any other binding failure closes the
/// inputs bound so far and propagates.
pub(crate) async fn bind_usable(
    router: &Arc<dyn MediaRouter>,
    producers: &[Arc<dyn RtpProducer>],
    ports: &PortAllocator,
) -> Result<Vec<BoundInput>> {
    let mut bound = Vec::new();

    for producer in producers {
        match binder::bind(router, producer, ports).await {
            Ok(input) => bound.push(input),
            Err(RecorderError::RouterCannotConsume(id)) => {
                tracing::warn!(producer = %id, "router cannot consume producer, skipping");
            }
            Err(e) => {
                for input in &bound {
                    input.close().await;
                    ports.release_pair(input.rtp_port);
                }
                return Err(e);
            }
        }
    }

    Ok(bound)
}

/// Resume every consumer and ask video consumers for an immediate IDR so
/// the muxer's first GOP starts decodable.
pub(crate) async fn resume_inputs(inputs: &[RecordingInput]) {
    for input in inputs {
        if let Err(e) = input.bound.consumer.resume().await {
            tracing::warn!(consumer = %input.bound.consumer.id(), "resume failed: {e}");
            continue;
        }
        if input.bound.kind == MediaKind::Video {
            if let Err(e) = input.bound.consumer.request_keyframe().await {
                tracing::warn!(consumer = %input.bound.consumer.id(), "keyframe request failed: {e}");
            }
        }
    }
}

/// Stop ordering for a whole recording: muxers are asked to quit first so
/// they can finalize their containers, consumers and endpoints are closed
/// second, and only then are stubborn muxers starved out and killed.
pub(crate) async fn wind_down(
    muxers: Vec<MuxerProcess>,
    inputs: &[RecordingInput],
    ports: &PortAllocator,
) {
    let mut stubborn = Vec::new();
    for mut muxer in muxers {
        match muxer.request_quit().await {
            Some(status) => tracing::info!("muxer exited with {status}"),
            None => stubborn.push(muxer),
        }
    }

    for input in inputs {
        input.bound.close().await;
    }

    for mut muxer in stubborn {
        match muxer.wait_starved().await {
            Some(status) => tracing::info!("muxer exited after input close with {status}"),
            None => {
                tracing::warn!("muxer ignored quit and input starvation, killing");
                muxer.kill().await;
            }
        }
    }

    for input in inputs {
        ports.release_pair(input.bound.rtp_port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_dir_check_creates_nested_directories() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("per/room/123");
        ensure_writable_dir(&nested).unwrap();
        assert!(nested.is_dir());
        assert!(!nested.join(".write-probe").exists());
    }

    #[test]
    fn unwritable_dir_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();

        // A path through a regular file cannot be created as a directory.
        let err = ensure_writable_dir(&file.join("sub")).unwrap_err();
        assert!(matches!(err, RecorderError::OutputUnwritable(_)));
    }
}
