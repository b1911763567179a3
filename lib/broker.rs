//! In-process fan-out of wallet notifications.
//!
//! Producers (the wallet service and the blockchain monitor) publish after
//! persisting; subscribers (push dispatcher, long-poll cursors, tests) each
//! get an independent lagging-tolerant receiver.

use tokio::sync::broadcast;
use tokio_stream::{StreamExt as _, wrappers::BroadcastStream};

use crate::types::Notification;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct MessageBroker {
    tx: broadcast::Sender<Notification>,
}

impl Default for MessageBroker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MessageBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Delivery is best-effort: with no live subscribers the notification
    /// is simply dropped here (it is already persisted).
    pub fn publish(&self, notification: &Notification) {
        let receivers = self.tx.receiver_count();
        tracing::debug!(
            id = %notification.id,
            notification_type = %notification.notification_type,
            wallet_id = %notification.wallet_id,
            receivers,
            "publishing notification",
        );
        drop(self.tx.send(notification.clone()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Subscription as a stream, dropping lagged slots.
    pub fn stream(&self) -> impl futures::Stream<Item = Notification> + use<> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|item| item.ok())
    }
}

#[cfg(test)]
mod tests {
    use super::MessageBroker;
    use crate::types::{Notification, NotificationType};

    fn notification(id: &str) -> Notification {
        Notification {
            id: id.to_owned(),
            notification_type: NotificationType::NewBlock,
            data: serde_json::Value::Null,
            wallet_id: "livenet".to_owned(),
            creator_id: None,
            created_on: 0,
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_all_subscribers() {
        let broker = MessageBroker::default();
        let mut rx1 = broker.subscribe();
        let mut rx2 = broker.subscribe();
        broker.publish(&notification("n-1"));
        assert_eq!(rx1.recv().await.unwrap().id, "n-1");
        assert_eq!(rx2.recv().await.unwrap().id, "n-1");
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let broker = MessageBroker::default();
        broker.publish(&notification("n-1"));
    }
}
