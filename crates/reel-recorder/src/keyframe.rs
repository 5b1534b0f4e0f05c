//! Periodic keyframe requests so the muxer keeps receiving decodable GOPs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::sfu::MediaConsumer;

/// A background task asking every video consumer for an IDR frame at a
/// fixed interval. Aborted (not merely dropped on the floor) in the stop
/// path before the recording is torn down.
pub struct KeyframePump {
    handle: JoinHandle<()>,
}

impl KeyframePump {
    pub fn start(consumers: Vec<Arc<dyn MediaConsumer>>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The immediate post-resume request is issued by the recorder;
            // the pump only covers the steady state.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                for consumer in &consumers {
                    if consumer.is_producer_closed() {
                        continue;
                    }
                    if let Err(e) = consumer.request_keyframe().await {
                        tracing::warn!(consumer = %consumer.id(), "keyframe request failed: {e}");
                    }
                }
            }
        });

        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for KeyframePump {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfu::fake::FakeDirectory;
    use crate::sfu::{MediaRouter, PlainEndpoint, SfuDirectory};

    #[tokio::test]
    async fn pumps_until_stopped() {
        let directory = FakeDirectory::new();
        let room = directory.add_room("lobby");
        let producer = room.add_video_producer("alice");
        let router = directory.router("lobby").await.unwrap();
        let endpoint = router.create_plain_endpoint().await.unwrap();
        let consumer = endpoint
            .consume(producer, &crate::sfu::recorder_capabilities(), true)
            .await
            .unwrap();

        let fake = room.router.endpoints()[0].consumers()[0].clone();

        let pump = KeyframePump::start(vec![consumer], Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let while_running = fake.keyframe_request_count();
        assert!(while_running >= 2, "got {while_running} requests");

        pump.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_stop = fake.keyframe_request_count();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fake.keyframe_request_count(), after_stop);
    }

    #[tokio::test]
    async fn skips_consumers_whose_producer_closed() {
        let directory = FakeDirectory::new();
        let room = directory.add_room("lobby");
        let producer = room.add_video_producer("alice");
        let router = directory.router("lobby").await.unwrap();
        let endpoint = router.create_plain_endpoint().await.unwrap();
        let consumer = endpoint
            .consume(producer.clone(), &crate::sfu::recorder_capabilities(), true)
            .await
            .unwrap();
        let fake = room.router.endpoints()[0].consumers()[0].clone();

        producer.close();
        let pump = KeyframePump::start(vec![consumer], Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        pump.stop();

        assert_eq!(fake.keyframe_request_count(), 0);
    }
}
