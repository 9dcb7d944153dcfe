use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{forward, Envelope, PubSub, PubSubResult, Subscription};

/// Redis PUBLISH/SUBSCRIBE backend shared by all relay replicas.
#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisPubSub {
    pub async fn connect(url: &str) -> PubSubResult<Self> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, id: &str, payload: Bytes) -> PubSubResult<()> {
        let frame = Envelope::new(id, payload).encode()?;
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, frame).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        cancel: CancellationToken,
    ) -> PubSubResult<Subscription> {
        // subscriptions hold their own connection; the publisher multiplexes commands
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let (tx, subscription) = Subscription::channel_pair(channel);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let messages = pubsub.into_on_message();
            futures_util::pin_mut!(messages);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    next = messages.next() => match next {
                        Some(msg) => {
                            if !forward(&channel, msg.get_payload_bytes(), &tx).await {
                                break;
                            }
                        }
                        None => {
                            warn!(channel = %channel, "redis subscription stream ended");
                            break;
                        }
                    },
                }
            }
            debug!(channel = %channel, "redis subscription ended");
        });
        Ok(subscription)
    }
}
