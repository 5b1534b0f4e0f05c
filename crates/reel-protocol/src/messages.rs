use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RecordingId, RecordingState};

/// Recording control requests carried on the session socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Start a per-participant recording of a room.
    StartRecording { room: String, user: String },

    /// Stop a per-participant recording.
    StopRecording { recording_id: RecordingId },

    /// Start a mixed (tiled + mixed-audio) recording of a room.
    StartMixedRecording {
        room: String,
        user: String,
        width: Option<u32>,
        height: Option<u32>,
    },

    /// Stop a mixed recording.
    StopMixedRecording { recording_id: RecordingId },

    /// Query the state of a recording.
    RecordingStatus { recording_id: RecordingId },
}

/// Replies to [`ControlRequest`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    RecordingStarted {
        recording_id: RecordingId,
        file_name: String,
    },

    MixedRecordingStarted {
        recording_id: RecordingId,
        file_name: String,
        path: String,
    },

    RecordingStopped {
        file_name: String,
        path: String,
        file_exists: bool,
        duration_secs: Option<f64>,
    },

    MixedRecordingStopped {
        file_name: String,
        path: String,
        file_exists: bool,
        duration_secs: Option<f64>,
        expected_duration_secs: f64,
    },

    RecordingStatus {
        active: bool,
        elapsed_secs: f64,
        file_name: String,
        input_count: usize,
    },

    Error {
        message: String,
    },
}

/// Lifecycle events broadcast to the requesting client and all members of
/// the recorded room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordingEvent {
    RecordingStarted {
        recording_id: RecordingId,
        timestamp: DateTime<Utc>,
        file_name: String,
    },

    RecordingStopped {
        recording_id: RecordingId,
        timestamp: DateTime<Utc>,
        file_name: String,
    },

    RecordingStateChanged {
        recording_id: RecordingId,
        timestamp: DateTime<Utc>,
        state: RecordingState,
    },

    RecordingError {
        recording_id: RecordingId,
        timestamp: DateTime<Utc>,
        message: String,
    },
}

impl RecordingEvent {
    /// The recording this event concerns.
    pub fn recording_id(&self) -> RecordingId {
        match self {
            RecordingEvent::RecordingStarted { recording_id, .. }
            | RecordingEvent::RecordingStopped { recording_id, .. }
            | RecordingEvent::RecordingStateChanged { recording_id, .. }
            | RecordingEvent::RecordingError { recording_id, .. } => *recording_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_as_tagged_json() {
        let req = ControlRequest::StartMixedRecording {
            room: "lobby".into(),
            user: "ada".into(),
            width: Some(1280),
            height: Some(720),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"start_mixed_recording\""));

        let back: ControlRequest = serde_json::from_str(&json).unwrap();
        match back {
            ControlRequest::StartMixedRecording { room, width, .. } => {
                assert_eq!(room, "lobby");
                assert_eq!(width, Some(1280));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn events_carry_id_and_timestamp() {
        let event = RecordingEvent::RecordingStateChanged {
            recording_id: RecordingId(1_700_000_000_000),
            timestamp: Utc::now(),
            state: RecordingState::Stopping,
        };
        assert_eq!(event.recording_id(), RecordingId(1_700_000_000_000));

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"state\":\"stopping\""));
        assert!(json.contains("\"recording_id\":1700000000000"));
    }
}
