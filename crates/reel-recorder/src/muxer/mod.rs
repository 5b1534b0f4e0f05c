//! Supervision of the external muxer and probe processes.

pub mod probe;
mod supervisor;

pub use supervisor::{MuxerProcess, StopGrace};

/// Protocols the muxer may open: SDP files from disk plus loopback RTP.
pub const PROTOCOL_WHITELIST: &str = "file,crypto,data,udp,rtp";
