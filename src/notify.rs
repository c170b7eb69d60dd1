use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::collab::{NotificationKind, Notifier};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub member_id: Ulid,
    pub kind: NotificationKind,
    pub payload: Value,
}

/// Broadcast hub: one channel per member that has a live subscriber.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a member's notifications. Creates the channel if needed.
    pub fn subscribe(&self, member_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(member_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop a member's channel once nobody listens any more.
    pub fn prune(&self, member_id: &Ulid) {
        self.channels
            .remove_if(member_id, |_, sender| sender.receiver_count() == 0);
    }
}

impl Notifier for NotifyHub {
    /// No-op if nobody is listening.
    fn notify(&self, member_id: Ulid, kind: NotificationKind, payload: Value) {
        if let Some(sender) = self.channels.get(&member_id) {
            let _ = sender.send(Notification {
                member_id,
                kind,
                payload,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let member = Ulid::new();
        let mut rx = hub.subscribe(member);

        hub.notify(
            member,
            NotificationKind::WaitlistPromoted,
            serde_json::json!({"occurrence_id": "x"}),
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.member_id, member);
        assert_eq!(received.kind, NotificationKind::WaitlistPromoted);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.notify(Ulid::new(), NotificationKind::BookingConfirmed, Value::Null);
    }

    #[tokio::test]
    async fn prune_keeps_live_channels() {
        let hub = NotifyHub::new();
        let member = Ulid::new();
        let rx = hub.subscribe(member);
        hub.prune(&member);
        assert!(hub.channels.contains_key(&member));
        drop(rx);
        hub.prune(&member);
        assert!(!hub.channels.contains_key(&member));
    }
}
