use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::model::*;
use crate::notify::{BookingEvent, NotifyHub};
use crate::store::{Directory, MemoryStore, StoreError};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the WAL once `threshold` records have been appended since
/// the last compaction. Returns whether it compacted.
pub async fn compact_if_needed(store: &MemoryStore, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    store.compact().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

// ── Reminders ────────────────────────────────────────────────────

fn reminder_title(kind: AmenityKind) -> &'static str {
    match kind {
        AmenityKind::MeetingRoom => "Meeting room reminder",
        AmenityKind::Cafeteria => "Cafeteria reminder",
    }
}

/// Queue a reminder `lead` ms before the booking starts, addressed to the
/// owner's push token, replacing any reminder already queued for it.
/// Bookings already started, and owners without a push token, get none
/// and lose any stale one. A start closer than `lead` is reminded at `now`.
pub async fn schedule_reminder(
    store: &MemoryStore,
    booking: &Booking,
    lead: Ms,
    now: Ms,
) -> Result<Option<Notification>, StoreError> {
    if booking.span.start <= now {
        store.cancel_reminders(booking.id).await?;
        return Ok(None);
    }
    let Some(push_token) = store.push_token(&booking.owner).await? else {
        debug!("no push token for owner of booking {}", booking.id);
        store.cancel_reminders(booking.id).await?;
        return Ok(None);
    };
    let time = (booking.span.start - lead).max(now);
    let message = format!("{} starts at {}", booking.resource_label, iso_ms(booking.span.start));
    let notification = store
        .replace_reminder(booking.id, time, reminder_title(booking.kind).to_string(), message, push_token)
        .await?;
    Ok(Some(notification))
}

async fn forward_reminders(mut rx: broadcast::Receiver<BookingEvent>, store: Arc<MemoryStore>, lead: Ms) {
    loop {
        match rx.recv().await {
            Ok(BookingEvent::Created(booking) | BookingEvent::Updated(booking)) => {
                if let Err(e) = schedule_reminder(&store, &booking, lead, now_ms()).await {
                    warn!("reminder for booking {} not scheduled: {e}", booking.id);
                }
            }
            Ok(BookingEvent::Removed { id, .. }) => match store.cancel_reminders(id).await {
                Ok(0) => {}
                Ok(n) => debug!("cancelled {n} reminders for booking {id}"),
                Err(e) => warn!("reminders for booking {id} not cancelled: {e}"),
            },
            Err(RecvError::Lagged(n)) => warn!("reminder bridge skipped {n} booking events"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Subscribe to booking events of every amenity and keep the queued
/// reminders in step: queued on create, moved on update, dropped on remove.
pub fn spawn_reminder_bridge(notify: &NotifyHub, store: Arc<MemoryStore>, lead: Duration) {
    let lead = lead.as_millis() as Ms;
    for kind in AmenityKind::ALL {
        let rx = notify.subscribe(kind);
        tokio::spawn(forward_reminders(rx, store.clone(), lead));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    const H: Ms = 3_600_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomslot_test_tasks");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn booking(owner: &str, start: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            kind: AmenityKind::MeetingRoom,
            resource_id: Ulid::new(),
            resource_label: "Everest".into(),
            floor_id: 1,
            date: day_of(start).unwrap(),
            span: Span::new(start, start + H),
            occupants: vec![],
            owner: owner.into(),
            status: "confirmed".into(),
        }
    }

    async fn store_with_user(name: &str) -> MemoryStore {
        let store = MemoryStore::open(&test_wal_path(name)).unwrap();
        store
            .upsert_user(User {
                token: "tok".into(),
                email: "a@x.io".into(),
                push_token: Some("push".into()),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn reminder_scheduled_ahead_of_start() {
        let store = store_with_user("reminder_ahead.wal").await;
        let now = now_ms();
        let b = booking("tok", now + 2 * H);

        let n = schedule_reminder(&store, &b, H / 4, now).await.unwrap().unwrap();
        assert_eq!(n.time, b.span.start - H / 4);
        assert_eq!(n.token, "push");
        assert_eq!(n.booking_id, Some(b.id));
        assert!(n.message.contains("Everest"));
        assert_eq!(store.notifications(Some("push")).await, vec![n]);
    }

    #[tokio::test]
    async fn reminder_clamped_to_now_and_skipped_when_started() {
        let store = store_with_user("reminder_clamp.wal").await;
        let now = now_ms();

        let soon = booking("tok", now + H / 10);
        let n = schedule_reminder(&store, &soon, H, now).await.unwrap().unwrap();
        assert_eq!(n.time, now);

        let started = booking("tok", now - H / 2);
        assert!(schedule_reminder(&store, &started, H, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_reminder_without_push_token() {
        let store = store_with_user("reminder_no_token.wal").await;
        let b = booking("stranger", now_ms() + 2 * H);
        assert!(schedule_reminder(&store, &b, H, now_ms()).await.unwrap().is_none());
        assert!(store.notifications(None).await.is_empty());
    }

    /// Poll the queue until `done` holds or a second passes.
    async fn wait_for_queue(store: &MemoryStore, done: impl Fn(&[Notification]) -> bool) -> Vec<Notification> {
        for _ in 0..100 {
            let queued = store.notifications(None).await;
            if done(queued.as_slice()) {
                return queued;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        store.notifications(None).await
    }

    #[tokio::test]
    async fn bridge_reacts_to_created_events() {
        let store = Arc::new(store_with_user("reminder_bridge.wal").await);
        let hub = NotifyHub::new();
        spawn_reminder_bridge(&hub, store.clone(), Duration::from_secs(900));

        let b = booking("tok", now_ms() + 2 * H);
        hub.send(&BookingEvent::Created(b.clone()));

        let queued = wait_for_queue(&store, |q| !q.is_empty()).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].time, b.span.start - 900_000);
    }

    #[tokio::test]
    async fn bridge_drops_reminder_of_removed_booking() {
        let store = Arc::new(store_with_user("reminder_removed.wal").await);
        let hub = NotifyHub::new();
        spawn_reminder_bridge(&hub, store.clone(), Duration::from_secs(900));

        let b = booking("tok", now_ms() + 2 * H);
        hub.send(&BookingEvent::Created(b.clone()));
        assert_eq!(wait_for_queue(&store, |q| !q.is_empty()).await.len(), 1);

        hub.send(&BookingEvent::Removed { kind: b.kind, id: b.id });
        assert!(wait_for_queue(&store, |q| q.is_empty()).await.is_empty());
    }

    #[tokio::test]
    async fn bridge_moves_reminder_with_updated_start() {
        let store = Arc::new(store_with_user("reminder_moved.wal").await);
        let hub = NotifyHub::new();
        spawn_reminder_bridge(&hub, store.clone(), Duration::from_secs(900));

        let b = booking("tok", now_ms() + 2 * H);
        hub.send(&BookingEvent::Created(b.clone()));
        assert_eq!(wait_for_queue(&store, |q| !q.is_empty()).await.len(), 1);

        let mut moved = b.clone();
        moved.span = Span::new(b.span.start + 3 * H, b.span.end + 3 * H);
        hub.send(&BookingEvent::Updated(moved.clone()));

        let want = moved.span.start - 900_000;
        let queued = wait_for_queue(&store, |q| q.first().is_some_and(|n| n.time == want)).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].time, want);
        assert_eq!(queued[0].booking_id, Some(b.id));
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let store = store_with_user("compact_threshold.wal").await;
        assert!(!compact_if_needed(&store, 5).await.unwrap());
        assert!(compact_if_needed(&store, 1).await.unwrap());
        assert_eq!(store.appends_since_compact().await, 0);
    }
}
