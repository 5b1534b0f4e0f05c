use reel_protocol::RecordingId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Router for room {0} is not ready")]
    RouterUnready(String),

    #[error("Room {0} has no usable producers")]
    NoInputs(String),

    #[error("Router cannot consume producer {0}")]
    RouterCannotConsume(uuid::Uuid),

    #[error("No free RTP port pair after {0} attempts")]
    ResourceExhaustion(usize),

    #[error("Failed to spawn muxer: {0}")]
    MuxerSpawnFailed(std::io::Error),

    #[error("Muxer exited unexpectedly: {0}")]
    MuxerCrash(String),

    #[error("Output directory not writable: {0}")]
    OutputUnwritable(std::io::Error),

    #[error("Unknown recording {0}")]
    NotFound(RecordingId),

    #[error("Recording {0} exceeded the stale threshold")]
    Timeout(RecordingId),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;
