use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Notification, NotificationKind};

const CHANNEL_CAPACITY: usize = 256;

/// Outbound notification sink. Fire-and-forget: delivery failures never
/// reach the caller and never undo the write that triggered them.
pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: Ulid, kind: NotificationKind, payload: serde_json::Value);
}

/// Broadcast hub with one channel per user. Whatever delivers notifications
/// (push, email, SSE) subscribes here.
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

    /// Subscribe to a user's notifications. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Notifier for NotifyHub {
    /// No-op if nobody is listening. A channel whose last receiver went away is dropped.
    fn notify(&self, user_id: Ulid, kind: NotificationKind, payload: serde_json::Value) {
        let delivered = match self.channels.get(&user_id) {
            Some(sender) => sender
                .send(Notification {
                    user_id,
                    kind,
                    payload,
                })
                .is_ok(),
            None => return,
        };
        if !delivered {
            self.channels
                .remove_if(&user_id, |_, sender| sender.receiver_count() == 0);
        }
    }
}
