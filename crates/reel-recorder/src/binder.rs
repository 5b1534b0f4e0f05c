//! Binds one producer to a loopback endpoint with a paused recording
//! consumer, yielding everything the SDP synthesizer and muxer need.

use std::sync::Arc;

use reel_protocol::MediaKind;
use uuid::Uuid;

use crate::error::{RecorderError, Result};
use crate::ports::PortAllocator;
use crate::sfu::{
    recorder_capabilities, MediaConsumer, MediaRouter, PlainEndpoint, RecordingCodec, RtpProducer,
};

/// One producer wired for recording: a connected loopback endpoint, a paused
/// consumer and the codec the muxer will receive on `rtp_port`/`rtp_port+1`.
pub struct BoundInput {
    pub producer_id: Uuid,
    pub peer_id: String,
    pub kind: MediaKind,
    pub codec: RecordingCodec,
    pub rtp_port: u16,
    pub endpoint: Arc<dyn PlainEndpoint>,
    pub consumer: Arc<dyn MediaConsumer>,
}

impl std::fmt::Debug for BoundInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundInput")
            .field("producer_id", &self.producer_id)
            .field("peer_id", &self.peer_id)
            .field("kind", &self.kind)
            .field("codec", &self.codec)
            .field("rtp_port", &self.rtp_port)
            .finish_non_exhaustive()
    }
}

impl BoundInput {
    /// Close the consumer and endpoint. Ports are released by the caller,
    /// which owns the allocator.
    pub async fn close(&self) {
        self.consumer.close().await;
        self.endpoint.close().await;
    }
}

/// Run the binding sequence for one producer: plain endpoint → paused
/// consumer → codec extraction → port allocation → connect.
///
/// A `RouterCannotConsume` return means the producer should be skipped with
/// a warning; any other error is fatal for this input and all partially
/// created resources have already been closed.
pub async fn bind(
    router: &Arc<dyn MediaRouter>,
    producer: &Arc<dyn RtpProducer>,
    ports: &PortAllocator,
) -> Result<BoundInput> {
    let caps = recorder_capabilities();

    if !router.can_consume(producer.id(), &caps) {
        return Err(RecorderError::RouterCannotConsume(producer.id()));
    }

    let endpoint = router.create_plain_endpoint().await?;

    let consumer = match endpoint.consume(producer.clone(), &caps, true).await {
        Ok(consumer) => consumer,
        Err(e) => {
            endpoint.close().await;
            return Err(e);
        }
    };

    let codec =
        match RecordingCodec::from_rtp_parameters(producer.kind(), &consumer.rtp_parameters()) {
            Some(codec) => codec,
            None => {
                consumer.close().await;
                endpoint.close().await;
                return Err(RecorderError::Transport(format!(
                    "consumer {} has no {} codec",
                    consumer.id(),
                    producer.kind()
                )));
            }
        };

    let rtp_port = match ports.allocate_pair() {
        Ok(port) => port,
        Err(e) => {
            consumer.close().await;
            endpoint.close().await;
            return Err(e);
        }
    };

    if let Err(e) = endpoint.connect("127.0.0.1", rtp_port, rtp_port + 1).await {
        consumer.close().await;
        endpoint.close().await;
        ports.release_pair(rtp_port);
        return Err(e);
    }

    tracing::debug!(
        producer = %producer.id(),
        kind = %producer.kind(),
        rtp_port,
        "bound recording consumer"
    );

    Ok(BoundInput {
        producer_id: producer.id(),
        peer_id: producer.peer_id(),
        kind: producer.kind(),
        codec,
        rtp_port,
        endpoint,
        consumer,
    })
}
