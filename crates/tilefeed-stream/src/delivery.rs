//! Per-subscriber delivery task.

use std::sync::Arc;

use tracing::{debug, warn};

use tilefeed_core::FeedError;

use crate::hub::Hub;
use crate::message::ServerMessage;
use crate::subscriber::{Subscriber, SubscriberSink};

/// Push notices and paced batches to `sink` until the subscriber is closed.
///
/// A failed send removes the subscriber from the hub; there is no retry.
pub async fn run_delivery<S: SubscriberSink>(
    hub: Arc<Hub>,
    sub: Arc<Subscriber>,
    mut sink: S,
) -> Result<(), FeedError> {
    let min_wait = hub.pacing().min_interval();

    loop {
        if sub.is_closed() {
            debug!(subscriber = sub.id(), "delivery stopped");
            return Ok(());
        }

        let mut frames: Vec<ServerMessage> = sub.take_notices();
        let mut next_in = min_wait;
        if let Some(delivery) = hub.tick(&sub) {
            next_in = delivery.next_in;
            if !delivery.items.is_empty() {
                frames.push(ServerMessage::Transactions(delivery.items));
            }
        }

        for frame in frames {
            let text = frame.to_json()?;
            if let Err(e) = sink.send_text(text).await {
                warn!(subscriber = sub.id(), error = %e, "send failed, removing subscriber");
                hub.unregister(sub.id());
                return Err(FeedError::SubscriberSendFailure {
                    subscriber: sub.id(),
                    reason: e.to_string(),
                });
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(next_in.max(min_wait)) => {}
            _ = sub.woken() => {}
            _ = hub.items_ready() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::subscriber::ChannelSink;
    use chrono::Utc;
    use tilefeed_core::BroadcastItem;
    use tokio::sync::mpsc;

    fn hub() -> Arc<Hub> {
        Arc::new(Hub::new(StreamConfig {
            base_send_interval_ms: 20,
            min_send_interval_ms: 5,
            ..Default::default()
        }))
    }

    fn item() -> BroadcastItem {
        BroadcastItem {
            event_name: "AgentMoved".into(),
            fields: vec!["0xa".into()],
            timestamp: Utc::now(),
            location: None,
        }
    }

    #[tokio::test]
    async fn delivers_transactions_frame() {
        let hub = hub();
        let sub = hub.register();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_delivery(hub.clone(), sub.clone(), ChannelSink(tx)));

        hub.offer(vec![item(), item()]);
        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "transactions");
        assert_eq!(frame["data"].as_array().unwrap().len(), 2);

        hub.unregister(sub.id());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn send_failure_removes_subscriber() {
        let hub = hub();
        let sub = hub.register();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        hub.offer(vec![item()]);

        let err = run_delivery(hub.clone(), sub.clone(), ChannelSink(tx)).await.unwrap_err();
        assert!(matches!(err, FeedError::SubscriberSendFailure { .. }));
        assert_eq!(hub.subscriber_count(), 0);
        assert!(sub.is_closed());
    }
}
