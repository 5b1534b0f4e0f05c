//! Shared protocol types for the reel recording subsystem.
//!
//! The room server embeds these messages into its own session socket
//! protocol; this crate only defines the vocabulary, not a transport.

mod messages;
mod types;

pub use messages::{ControlReply, ControlRequest, RecordingEvent};
pub use types::{MediaKind, RecordingId, RecordingMode, RecordingState};
