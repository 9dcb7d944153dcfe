use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{forward, Envelope, PubSub, PubSubResult, Subscription};

/// In-process pub/sub for tests and single-replica deployments.
#[derive(Debug, Default)]
pub struct LocalPubSub {
    channels: parking_lot::RwLock<HashMap<String, broadcast::Sender<Bytes>>>,
}

impl LocalPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Bytes> {
        if let Some(sender) = self.channels.read().get(channel) {
            return sender.clone();
        }
        let mut guard = self.channels.write();
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    /// Publishes an already encoded frame, bypassing the envelope codec.
    pub fn publish_raw(&self, channel: &str, frame: Bytes) {
        // no subscribers is not an error for at-most-once delivery
        let _ = self.sender_for(channel).send(frame);
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, channel: &str, id: &str, payload: Bytes) -> PubSubResult<()> {
        let frame = Envelope::new(id, payload).encode()?;
        self.publish_raw(channel, Bytes::from(frame));
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        cancel: CancellationToken,
    ) -> PubSubResult<Subscription> {
        let mut source = self.sender_for(channel).subscribe();
        let (tx, subscription) = Subscription::channel_pair(channel);
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                let raw = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    recv = source.recv() => match recv {
                        Ok(raw) => raw,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "local subscriber lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if !forward(&channel, &raw, &tx).await {
                    break;
                }
            }
            debug!(channel = %channel, "local subscription ended");
        });
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn delivers_envelopes_to_subscribers() {
        let bus = LocalPubSub::new();
        let cancel = CancellationToken::new();
        let mut sub = bus.subscribe("relay:client", cancel.clone()).await.unwrap();
        bus.publish("relay:client", "s-1", Bytes::from_static(b"frame"))
            .await
            .unwrap();

        let envelope = sub.recv().await.expect("envelope");
        assert_eq!(sub.channel(), "relay:client");
        assert_eq!(envelope.id, "s-1");
        assert_eq!(envelope.payload, Bytes::from_static(b"frame"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn skips_undecodable_frames() {
        let bus = LocalPubSub::new();
        let cancel = CancellationToken::new();
        let mut sub = bus.subscribe("relay:host", cancel.clone()).await.unwrap();
        bus.publish_raw("relay:host", Bytes::from_static(b"\xff"));
        bus.publish("relay:host", "h-1", Bytes::from_static(b"ok"))
            .await
            .unwrap();

        let envelope = sub.recv().await.expect("envelope after garbage");
        assert_eq!(envelope.id, "h-1");
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_ends_the_subscription() {
        let bus = LocalPubSub::new();
        let cancel = CancellationToken::new();
        let mut sub = bus.subscribe("relay:host", cancel.clone()).await.unwrap();
        cancel.cancel();
        let next = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("subscription should close promptly");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = LocalPubSub::new();
        let cancel = CancellationToken::new();
        let mut hosts = bus.subscribe("relay:host", cancel.clone()).await.unwrap();
        bus.publish("relay:client", "s-1", Bytes::from_static(b"x"))
            .await
            .unwrap();
        bus.publish("relay:host", "h-1", Bytes::from_static(b"y"))
            .await
            .unwrap();
        assert_eq!(hosts.recv().await.unwrap().id, "h-1");
        cancel.cancel();
    }
}
