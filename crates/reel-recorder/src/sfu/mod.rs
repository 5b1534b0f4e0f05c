//! Abstraction over the external SFU.
//!
//! The orchestrator never talks to a concrete SFU directly; it sees routers,
//! producers, plain endpoints and consumers through these traits, which keeps
//! the recording logic unit-testable against the in-memory [`fake`] SFU.

mod rtp;

pub mod fake;

pub use rtp::{
    recorder_capabilities, ParameterValue, RecordingCodec, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters,
};

use std::sync::Arc;

use async_trait::async_trait;
use reel_protocol::MediaKind;
use uuid::Uuid;

use crate::error::Result;

/// Resolves room names to live SFU state. Implemented by the room server.
#[async_trait]
pub trait SfuDirectory: Send + Sync {
    /// The live router of a room, if the SFU has created one yet.
    async fn router(&self, room: &str) -> Option<Arc<dyn MediaRouter>>;

    /// Producers currently publishing into a room, in enumeration order.
    async fn producers(&self, room: &str) -> Vec<Arc<dyn RtpProducer>>;
}

/// One SFU router: the packet-forwarding core of a room.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    /// Whether the router can route `producer_id` to a consumer restricted
    /// to `caps`.
    fn can_consume(&self, producer_id: Uuid, caps: &RtpCapabilities) -> bool;

    /// Create a plain RTP endpoint on 127.0.0.1 with RTCP on its own port
    /// and the remote address statically declared (non-comedia).
    async fn create_plain_endpoint(&self) -> Result<Arc<dyn PlainEndpoint>>;
}

/// An incoming RTP stream owned by the SFU. May close at any moment.
pub trait RtpProducer: Send + Sync {
    fn id(&self) -> Uuid;

    /// Identifier of the peer that contributes this stream.
    fn peer_id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn is_closed(&self) -> bool;
}

/// A plain transport created for the recorder on the loopback interface.
#[async_trait]
pub trait PlainEndpoint: Send + Sync {
    /// Declare the static remote this endpoint sends RTP and RTCP to.
    async fn connect(&self, ip: &str, rtp_port: u16, rtcp_port: u16) -> Result<()>;

    /// Attach a consumer of `producer` to this endpoint. Created paused;
    /// packets only flow after [`MediaConsumer::resume`].
    async fn consume(
        &self,
        producer: Arc<dyn RtpProducer>,
        caps: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>>;

    async fn close(&self);
}

/// An outgoing RTP stream bound to one producer, delivered to one endpoint.
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> Uuid;

    fn producer_id(&self) -> Uuid;

    fn kind(&self) -> MediaKind;

    /// The consumer-assigned RTP parameters. These may differ from the
    /// producer's (the SFU renumbers payload types on the consumer side),
    /// and they are what the synthesized SDP must match bit-exactly.
    fn rtp_parameters(&self) -> RtpParameters;

    /// Whether the upstream producer has closed.
    fn is_producer_closed(&self) -> bool;

    async fn resume(&self) -> Result<()>;

    /// Ask the producing endpoint for an IDR frame. No-op on audio.
    async fn request_keyframe(&self) -> Result<()>;

    async fn close(&self);
}
