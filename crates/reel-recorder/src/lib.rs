//! Recording orchestrator for a live SFU session.
//!
//! Sits beside the SFU and, on demand, loops the RTP of selected producers
//! back over localhost into a supervised ffmpeg process, producing either
//! one container file per participant or a single mixed file with tiled
//! video and summed audio.
//!
//! The SFU itself is an external collaborator reached through the traits in
//! [`sfu`]; the [`control::ControlSurface`] is the entry point for the room
//! server's start/stop/status requests.

pub mod binder;
pub mod config;
pub mod control;
pub mod error;
pub mod filter;
pub mod keyframe;
pub mod muxer;
pub mod ports;
pub mod recorder;
pub mod registry;
pub mod sdp;
pub mod sfu;

pub use config::RecorderConfig;
pub use control::ControlSurface;
pub use error::{RecorderError, Result};
