//! Scheduled push notifications.
//!
//! The dispatcher only reads the head of its queue and deletes what it
//! has sent. It never touches bookings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::{now_ms, Ms, Notification};
use crate::observability::{NOTIFICATIONS_DISPATCHED_TOTAL, NOTIFICATIONS_FAILED_TOTAL};
use crate::store::{Directory, StoreError};

#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// The pending notification with the smallest time.
    async fn earliest(&self) -> Result<Option<Notification>, StoreError>;

    /// Returns whether the notification was still queued.
    async fn remove(&self, id: Ulid) -> Result<bool, StoreError>;
}

#[derive(Debug)]
pub struct PushError(pub String);

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "push delivery failed: {}", self.0)
    }
}

impl std::error::Error for PushError {}

/// Delivery transport for push notifications.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), PushError>;
}

/// Message body in the shape a mobile push gateway expects.
pub fn push_payload(notification: &Notification) -> serde_json::Value {
    json!({
        "notification": {
            "title": notification.title,
            "body": notification.message,
        },
        "token": notification.token,
        "android": { "priority": "high" },
    })
}

/// Sender that writes the payload to the log instead of a gateway.
#[derive(Debug, Default)]
pub struct LogPushSender;

#[async_trait]
impl PushSender for LogPushSender {
    async fn send(&self, notification: &Notification) -> Result<(), PushError> {
        info!("push {}: {}", notification.id, push_payload(notification));
        Ok(())
    }
}

/// Send the earliest notification if it is due at `now`, then drop it
/// from the queue whether or not delivery succeeded.
pub async fn dispatch_due(
    queue: &dyn NotificationQueue,
    sender: &dyn PushSender,
    now: Ms,
) -> Result<Option<Notification>, StoreError> {
    let Some(next) = queue.earliest().await? else {
        return Ok(None);
    };
    if next.time > now {
        return Ok(None);
    }

    match sender.send(&next).await {
        Ok(()) => {
            metrics::counter!(NOTIFICATIONS_DISPATCHED_TOTAL).increment(1);
            debug!("dispatched notification {}", next.id);
        }
        Err(e) => {
            metrics::counter!(NOTIFICATIONS_FAILED_TOTAL).increment(1);
            warn!("notification {}: {e}", next.id);
        }
    }
    queue.remove(next.id).await?;
    Ok(Some(next))
}

/// Outcome of one [`broadcast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
}

/// Push `title` and `message` to every user with a push token, now,
/// bypassing the queue. A failed delivery is counted and skipped.
pub async fn broadcast(
    directory: &dyn Directory,
    sender: &dyn PushSender,
    title: &str,
    message: &str,
) -> Result<BroadcastReport, StoreError> {
    let tokens = directory.push_tokens().await?;
    let now = now_ms();
    let mut report = BroadcastReport::default();
    for token in tokens {
        let notification = Notification {
            id: Ulid::new(),
            time: now,
            title: title.to_string(),
            message: message.to_string(),
            token,
            booking_id: None,
        };
        match sender.send(&notification).await {
            Ok(()) => {
                metrics::counter!(NOTIFICATIONS_DISPATCHED_TOTAL).increment(1);
                report.sent += 1;
            }
            Err(e) => {
                metrics::counter!(NOTIFICATIONS_FAILED_TOTAL).increment(1);
                warn!("broadcast to {}: {e}", notification.token);
                report.failed += 1;
            }
        }
    }
    info!("broadcast {title:?}: {} sent, {} failed", report.sent, report.failed);
    Ok(report)
}

/// Background task: one due notification per tick.
pub async fn run_dispatcher(queue: Arc<dyn NotificationQueue>, sender: Arc<dyn PushSender>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = dispatch_due(queue.as_ref(), sender.as_ref(), now_ms()).await {
            warn!("notification dispatch failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;
    use crate::store::MemoryStore;
    use std::path::PathBuf;
    use tokio::sync::Mutex;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomslot_test_dispatch");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Ulid>>,
        tokens: Mutex<Vec<String>>,
        fail: bool,
        /// Push token the gateway rejects.
        reject: Option<&'static str>,
    }

    #[async_trait]
    impl PushSender for Recorder {
        async fn send(&self, notification: &Notification) -> Result<(), PushError> {
            self.sent.lock().await.push(notification.id);
            self.tokens.lock().await.push(notification.token.clone());
            if self.fail || self.reject == Some(notification.token.as_str()) {
                return Err(PushError("gateway unavailable".into()));
            }
            Ok(())
        }
    }

    async fn schedule(store: &MemoryStore, time: Ms, title: &str) -> Notification {
        store
            .schedule_notification(time, title.into(), "msg".into(), "push-tok".into())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sends_earliest_due_one_per_call() {
        let store = MemoryStore::open(&test_wal_path("earliest.wal")).unwrap();
        let sender = Recorder::default();
        let second = schedule(&store, 2_000, "second").await;
        let first = schedule(&store, 1_000, "first").await;
        let future = schedule(&store, 10_000, "future").await;

        let sent = dispatch_due(&store, &sender, 5_000).await.unwrap();
        assert_eq!(sent, Some(first.clone()));
        let sent = dispatch_due(&store, &sender, 5_000).await.unwrap();
        assert_eq!(sent, Some(second.clone()));
        assert_eq!(dispatch_due(&store, &sender, 5_000).await.unwrap(), None);

        assert_eq!(*sender.sent.lock().await, vec![first.id, second.id]);
        assert_eq!(store.notifications(None).await, vec![future]);
    }

    #[tokio::test]
    async fn nothing_due_on_empty_queue() {
        let store = MemoryStore::open(&test_wal_path("empty.wal")).unwrap();
        assert_eq!(dispatch_due(&store, &LogPushSender, now_ms()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_delivery_is_still_removed() {
        let store = MemoryStore::open(&test_wal_path("failed.wal")).unwrap();
        let sender = Recorder {
            fail: true,
            ..Default::default()
        };
        let n = schedule(&store, 1_000, "doomed").await;

        let sent = dispatch_due(&store, &sender, 1_000).await.unwrap();
        assert_eq!(sent.map(|n| n.id), Some(n.id));
        assert!(store.notifications(None).await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_push_token() {
        let store = MemoryStore::open(&test_wal_path("broadcast.wal")).unwrap();
        for (token, push) in [("u1", Some("p1")), ("u2", None), ("u3", Some("p3")), ("u4", Some("p4"))] {
            store
                .upsert_user(User {
                    token: token.into(),
                    email: format!("{token}@x.io"),
                    push_token: push.map(str::to_string),
                })
                .await
                .unwrap();
        }
        let sender = Recorder {
            reject: Some("p3"),
            ..Default::default()
        };

        let report = broadcast(&store, &sender, "Fire drill", "East stairs").await.unwrap();
        assert_eq!(report, BroadcastReport { sent: 2, failed: 1 });
        assert_eq!(*sender.tokens.lock().await, vec!["p1", "p3", "p4"]);
        // Nothing lands in the queue
        assert!(store.notifications(None).await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_without_users_sends_nothing() {
        let store = MemoryStore::open(&test_wal_path("broadcast_empty.wal")).unwrap();
        let report = broadcast(&store, &LogPushSender, "t", "m").await.unwrap();
        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn payload_shape() {
        let n = Notification {
            id: Ulid::new(),
            time: 0,
            title: "Room booked".into(),
            message: "Everest at 09:00".into(),
            token: "push-tok".into(),
            booking_id: None,
        };
        let payload = push_payload(&n);
        assert_eq!(payload["notification"]["title"], "Room booked");
        assert_eq!(payload["notification"]["body"], "Everest at 09:00");
        assert_eq!(payload["token"], "push-tok");
        assert_eq!(payload["android"]["priority"], "high");
    }
}
