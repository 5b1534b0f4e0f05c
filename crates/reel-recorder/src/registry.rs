//! The registry of live recordings.
//!
//! Owned by the control surface and consulted by every start/stop/status
//! request; the only mutable structure shared between recordings.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reel_protocol::{RecordingId, RecordingMode};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::keyframe::KeyframePump;
use crate::muxer::MuxerProcess;
use crate::recorder::{RecordingInput, StopSummary};

/// The live state of one recording: endpoints, consumers, timers and the
/// supervised muxer process(es).
pub struct ActiveRecording {
    pub id: RecordingId,
    pub room: String,
    pub user: String,
    pub mode: RecordingMode,
    /// Client-facing name: the output file for mixed recordings, the
    /// recording directory name for per-participant ones.
    pub file_name: String,
    /// The output file (mixed) or directory (per-participant).
    pub output_path: PathBuf,
    /// Where the auxiliary SDP files live.
    pub sdp_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    /// Stop requests are held until this much time has elapsed since start.
    pub min_runtime: Duration,
    /// The moment the muxer was first observed processing frames.
    pub muxer_started: StdMutex<Option<DateTime<Utc>>>,
    pub inputs: Vec<RecordingInput>,
    /// One muxer for mixed recordings, one per input for per-participant.
    /// Drained by the stop path.
    pub muxers: Mutex<Vec<MuxerProcess>>,
    pub pump: StdMutex<Option<KeyframePump>>,
    pub monitor: StdMutex<Option<JoinHandle<()>>>,
    /// Latch making stop idempotent: the first stop stores its summary,
    /// concurrent and later stops receive the same value.
    pub stop_result: Mutex<Option<StopSummary>>,
}

impl std::fmt::Debug for ActiveRecording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRecording")
            .field("id", &self.id)
            .field("room", &self.room)
            .field("user", &self.user)
            .field("mode", &self.mode)
            .field("file_name", &self.file_name)
            .field("output_path", &self.output_path)
            .field("sdp_dir", &self.sdp_dir)
            .field("started_at", &self.started_at)
            .field("min_runtime", &self.min_runtime)
            .finish_non_exhaustive()
    }
}

impl ActiveRecording {
    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Cancel the keyframe pump and the monitor task. Always called before
    /// the muxer quit ladder runs.
    pub fn cancel_timers(&self) {
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.stop();
        }
        if let Some(monitor) = self.monitor.lock().unwrap().take() {
            monitor.abort();
        }
    }
}

/// Maps recording ids to live recordings. Entries are inserted on start
/// success and removed only after the muxer has been signaled and all
/// endpoints and consumers are closed.
pub struct RecordingRegistry {
    recordings: RwLock<HashMap<RecordingId, Arc<ActiveRecording>>>,
    last_id: AtomicU64,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self {
            recordings: RwLock::new(HashMap::new()),
            last_id: AtomicU64::new(0),
        }
    }

    /// Next recording id: wall-clock milliseconds, bumped past the previous
    /// id so two starts in the same millisecond stay distinct.
    pub fn next_id(&self) -> RecordingId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        loop {
            let last = self.last_id.load(Ordering::SeqCst);
            let candidate = now.max(last + 1);
            if self
                .last_id
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return RecordingId(candidate);
            }
        }
    }

    pub async fn insert(&self, recording: Arc<ActiveRecording>) {
        self.recordings
            .write()
            .await
            .insert(recording.id, recording);
    }

    pub async fn get(&self, id: RecordingId) -> Option<Arc<ActiveRecording>> {
        self.recordings.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: RecordingId) -> Option<Arc<ActiveRecording>> {
        self.recordings.write().await.remove(&id)
    }

    pub async fn ids(&self) -> Vec<RecordingId> {
        self.recordings.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.recordings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.recordings.read().await.is_empty()
    }
}

impl Default for RecordingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let registry = RecordingRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        let c = registry.next_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn ids_are_unique_under_contention() {
        let registry = Arc::new(RecordingRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                (0..100).map(|_| registry.next_id()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<RecordingId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
