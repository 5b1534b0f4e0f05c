//! In-memory SFU used by the test suite.
//!
//! Implements the whole [`super`] seam with inspectable state: tests can add
//! rooms and producers, deny consumability, close producers mid-recording
//! and assert on endpoint connections, consumer resumes and keyframe
//! requests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reel_protocol::MediaKind;
use uuid::Uuid;

use super::{
    MediaConsumer, MediaRouter, ParameterValue, PlainEndpoint, RtpCapabilities,
    RtpCodecParameters, RtpParameters, RtpProducer, SfuDirectory,
};
use crate::error::{RecorderError, Result};

/// Consumer-side payload types handed out by the fake SFU. Deliberately
/// different from the producer-side ones so tests catch code that reads the
/// producer's parameters where the consumer's are required.
pub const CONSUMER_AUDIO_PT: u8 = 100;
pub const CONSUMER_VIDEO_PT: u8 = 101;

#[derive(Default)]
pub struct FakeDirectory {
    rooms: Mutex<HashMap<String, Arc<FakeRoom>>>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room with a live router. Rooms that were never added stand
    /// in for "router not created yet".
    pub fn add_room(&self, room: &str) -> Arc<FakeRoom> {
        let handle = Arc::new(FakeRoom::new());
        self.rooms
            .lock()
            .unwrap()
            .insert(room.to_string(), handle.clone());
        handle
    }
}

#[async_trait]
impl SfuDirectory for FakeDirectory {
    async fn router(&self, room: &str) -> Option<Arc<dyn MediaRouter>> {
        let rooms = self.rooms.lock().unwrap();
        rooms
            .get(room)
            .map(|r| r.router.clone() as Arc<dyn MediaRouter>)
    }

    async fn producers(&self, room: &str) -> Vec<Arc<dyn RtpProducer>> {
        let rooms = self.rooms.lock().unwrap();
        match rooms.get(room) {
            Some(r) => r
                .producers
                .lock()
                .unwrap()
                .iter()
                .map(|p| p.clone() as Arc<dyn RtpProducer>)
                .collect(),
            None => Vec::new(),
        }
    }
}

pub struct FakeRoom {
    pub router: Arc<FakeRouter>,
    producers: Mutex<Vec<Arc<FakeProducer>>>,
}

impl FakeRoom {
    fn new() -> Self {
        Self {
            router: Arc::new(FakeRouter::default()),
            producers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_audio_producer(&self, peer: &str) -> Arc<FakeProducer> {
        let producer = Arc::new(FakeProducer::audio(peer));
        self.producers.lock().unwrap().push(producer.clone());
        producer
    }

    pub fn add_video_producer(&self, peer: &str) -> Arc<FakeProducer> {
        let producer = Arc::new(FakeProducer::video(peer));
        self.producers.lock().unwrap().push(producer.clone());
        producer
    }
}

#[derive(Default)]
pub struct FakeRouter {
    unconsumable: Mutex<HashSet<Uuid>>,
    endpoints: Mutex<Vec<Arc<FakeEndpoint>>>,
    fail_endpoint_create: AtomicBool,
    fail_consume: AtomicBool,
}

impl FakeRouter {
    /// Make `can_consume` report a capability mismatch for one producer.
    pub fn deny_consume(&self, producer_id: Uuid) {
        self.unconsumable.lock().unwrap().insert(producer_id);
    }

    /// Make the next transport creations fail.
    pub fn fail_endpoint_create(&self, fail: bool) {
        self.fail_endpoint_create.store(fail, Ordering::SeqCst);
    }

    /// Make consumer creation fail on endpoints created from here on.
    pub fn fail_consume(&self, fail: bool) {
        self.fail_consume.store(fail, Ordering::SeqCst);
    }

    /// Every plain endpoint this router has created.
    pub fn endpoints(&self) -> Vec<Arc<FakeEndpoint>> {
        self.endpoints.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaRouter for FakeRouter {
    fn can_consume(&self, producer_id: Uuid, caps: &RtpCapabilities) -> bool {
        !caps.codecs.is_empty() && !self.unconsumable.lock().unwrap().contains(&producer_id)
    }

    async fn create_plain_endpoint(&self) -> Result<Arc<dyn PlainEndpoint>> {
        if self.fail_endpoint_create.load(Ordering::SeqCst) {
            return Err(RecorderError::Transport(
                "plain transport creation refused".to_string(),
            ));
        }
        let endpoint = Arc::new(FakeEndpoint::default());
        if self.fail_consume.load(Ordering::SeqCst) {
            endpoint.fail_consume(true);
        }
        self.endpoints.lock().unwrap().push(endpoint.clone());
        Ok(endpoint)
    }
}

pub struct FakeProducer {
    id: Uuid,
    peer: String,
    kind: MediaKind,
    codec: RtpCodecParameters,
    closed: AtomicBool,
}

impl FakeProducer {
    fn audio(peer: &str) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert("minptime".to_string(), ParameterValue::Number(10));
        parameters.insert("useinbandfec".to_string(), ParameterValue::Number(1));
        Self {
            id: Uuid::new_v4(),
            peer: peer.to_string(),
            kind: MediaKind::Audio,
            codec: RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters,
            },
            closed: AtomicBool::new(false),
        }
    }

    fn video(peer: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: peer.to_string(),
            kind: MediaKind::Video,
            codec: RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: BTreeMap::new(),
            },
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate the peer going away mid-recording.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl RtpProducer for FakeProducer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn peer_id(&self) -> String {
        self.peer.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeEndpoint {
    connected: Mutex<Option<(String, u16, u16)>>,
    consumers: Mutex<Vec<Arc<FakeConsumer>>>,
    closed: AtomicBool,
    fail_consume: AtomicBool,
}

impl FakeEndpoint {
    pub fn connected_to(&self) -> Option<(String, u16, u16)> {
        self.connected.lock().unwrap().clone()
    }

    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.consumers.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_consume(&self, fail: bool) {
        self.fail_consume.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PlainEndpoint for FakeEndpoint {
    async fn connect(&self, ip: &str, rtp_port: u16, rtcp_port: u16) -> Result<()> {
        *self.connected.lock().unwrap() = Some((ip.to_string(), rtp_port, rtcp_port));
        Ok(())
    }

    async fn consume(
        &self,
        producer: Arc<dyn RtpProducer>,
        _caps: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>> {
        if self.fail_consume.load(Ordering::SeqCst) {
            return Err(RecorderError::Transport(
                "consumer creation refused".to_string(),
            ));
        }

        let consumer = Arc::new(FakeConsumer::new(producer, paused));
        self.consumers.lock().unwrap().push(consumer.clone());
        Ok(consumer)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConsumer {
    id: Uuid,
    producer: Arc<dyn RtpProducer>,
    params: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    keyframe_requests: AtomicUsize,
}

impl FakeConsumer {
    fn new(producer: Arc<dyn RtpProducer>, paused: bool) -> Self {
        // Renumber the payload type the way a real SFU does on the consumer
        // side; the codec itself is inherited from the producer.
        let codec = match producer.kind() {
            MediaKind::Audio => RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: CONSUMER_AUDIO_PT,
                clock_rate: 48000,
                channels: Some(2),
                parameters: {
                    let mut parameters = BTreeMap::new();
                    parameters.insert("minptime".to_string(), ParameterValue::Number(10));
                    parameters.insert("useinbandfec".to_string(), ParameterValue::Number(1));
                    parameters
                },
            },
            MediaKind::Video => RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: CONSUMER_VIDEO_PT,
                clock_rate: 90000,
                channels: None,
                parameters: BTreeMap::new(),
            },
        };

        Self {
            id: Uuid::new_v4(),
            producer,
            params: RtpParameters {
                codecs: vec![codec],
            },
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            keyframe_requests: AtomicUsize::new(0),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn keyframe_request_count(&self) -> usize {
        self.keyframe_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaConsumer for FakeConsumer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn producer_id(&self) -> Uuid {
        self.producer.id()
    }

    fn kind(&self) -> MediaKind {
        self.producer.kind()
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.params.clone()
    }

    fn is_producer_closed(&self) -> bool {
        self.producer.is_closed()
    }

    async fn resume(&self) -> Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn request_keyframe(&self) -> Result<()> {
        self.keyframe_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
