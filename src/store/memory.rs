use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};
use ulid::Ulid;

use super::table::{sort_bookings, BookingState, CatalogState, QueueState};
use super::wal::{Replay, Wal};
use super::{Catalog, Directory, Store, StoreError, Transaction};
use crate::dispatch::NotificationQueue;
use crate::limits::*;
use crate::model::*;

// ── Group-commit WAL channel ─────────────────────────────────────

enum WalCommand {
    Append {
        record: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches appends so one fsync covers every record
/// that arrived while the previous flush was running.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { record, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };
        let mut batch: Vec<Pending> = vec![(record, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            warn!("WAL flush of {} records failed: {e}", batch.len());
        }
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(record, _)| wal.append_buffered(record));
    let result = appended.and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Cut the failed batch off the file so the next batch lands right
        // after the last durable record.
        if let Err(e) = wal.rewind() {
            warn!("WAL rewind after failed flush failed: {e}");
        }
    }
    result
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, record: Vec<Event>) -> Result<(), StoreError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { record, response: tx })
        .await
        .map_err(|_| StoreError::Closed)?;
    rx.await
        .map_err(|_| StoreError::Closed)?
        .map_err(|e| StoreError::Io(e.to_string()))
}

// ── Store ────────────────────────────────────────────────────────

/// In-process tables made durable by a write-ahead log.
///
/// Lock order is bookings, then catalog, then the notification queue.
/// A [`MemoryTx`] holds the bookings write lock for its whole life, which
/// makes every transaction serializable against every other.
pub struct MemoryStore {
    bookings: Arc<RwLock<BookingState>>,
    catalog: RwLock<CatalogState>,
    queue: Mutex<QueueState>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl MemoryStore {
    /// Replay the WAL at `path` and start the background writer.
    /// Must be called from within a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let Replay { records, valid_len } = Wal::replay(path)?;
        let mut bookings = BookingState::default();
        let mut catalog = CatalogState::default();
        let mut queue = QueueState::default();
        let mut events = 0usize;
        for event in records.iter().flatten() {
            bookings.apply(event);
            catalog.apply(event);
            queue.apply(event);
            events += 1;
        }
        debug!(
            "replayed {} WAL records ({events} events) from {}",
            records.len(),
            path.display()
        );

        let wal = Wal::open(path, valid_len)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            bookings: Arc::new(RwLock::new(bookings)),
            catalog: RwLock::new(catalog),
            queue: Mutex::new(queue),
            wal_tx,
        })
    }

    // ── Admin writes ─────────────────────────────────────────

    pub async fn upsert_resource(&self, resource: Resource) -> Result<(), StoreError> {
        if resource.label.len() > MAX_LABEL_LEN {
            return Err(StoreError::LimitExceeded("resource label too long"));
        }
        let mut catalog = self.catalog.write().await;
        if !catalog.resources.contains_key(&resource.id) && catalog.resources.len() >= MAX_RESOURCES {
            return Err(StoreError::LimitExceeded("too many resources"));
        }
        let event = Event::ResourceUpserted(resource);
        wal_append(&self.wal_tx, vec![event.clone()]).await?;
        catalog.apply(&event);
        Ok(())
    }

    /// Returns whether the resource existed. Its bookings are left alone.
    pub async fn delete_resource(&self, id: Ulid) -> Result<bool, StoreError> {
        let mut catalog = self.catalog.write().await;
        if !catalog.resources.contains_key(&id) {
            return Ok(false);
        }
        let event = Event::ResourceDeleted { id };
        wal_append(&self.wal_tx, vec![event.clone()]).await?;
        catalog.apply(&event);
        Ok(true)
    }

    pub async fn upsert_user(&self, user: User) -> Result<(), StoreError> {
        if user.token.len() > MAX_TOKEN_LEN
            || user.email.len() > MAX_LABEL_LEN
            || user.push_token.as_ref().is_some_and(|t| t.len() > MAX_TOKEN_LEN)
        {
            return Err(StoreError::LimitExceeded("user field too long"));
        }
        let mut catalog = self.catalog.write().await;
        let event = Event::UserUpserted(user);
        wal_append(&self.wal_tx, vec![event.clone()]).await?;
        catalog.apply(&event);
        Ok(())
    }

    pub async fn resources(&self, kind: Option<AmenityKind>) -> Vec<Resource> {
        let catalog = self.catalog.read().await;
        catalog
            .resources
            .values()
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .cloned()
            .collect()
    }

    /// Queue a push notification for delivery at `time`.
    pub async fn schedule_notification(
        &self,
        time: Ms,
        title: String,
        message: String,
        token: String,
    ) -> Result<Notification, StoreError> {
        self.enqueue(time, title, message, token, None).await
    }

    /// Queue the reminder for `booking_id`. Reminders already queued for
    /// that booking are removed in the same WAL record.
    pub async fn replace_reminder(
        &self,
        booking_id: Ulid,
        time: Ms,
        title: String,
        message: String,
        token: String,
    ) -> Result<Notification, StoreError> {
        self.enqueue(time, title, message, token, Some(booking_id)).await
    }

    async fn enqueue(
        &self,
        time: Ms,
        title: String,
        message: String,
        token: String,
        booking_id: Option<Ulid>,
    ) -> Result<Notification, StoreError> {
        if title.len() > MAX_TITLE_LEN || message.len() > MAX_MESSAGE_LEN || token.len() > MAX_TOKEN_LEN {
            return Err(StoreError::LimitExceeded("notification field too long"));
        }
        let mut queue = self.queue.lock().await;
        let mut events: Vec<Event> = booking_id
            .map(|b| queue.for_booking(b))
            .unwrap_or_default()
            .into_iter()
            .map(|id| Event::NotificationRemoved { id })
            .collect();
        if queue.len() - events.len() >= MAX_PENDING_NOTIFICATIONS {
            return Err(StoreError::LimitExceeded("notification queue full"));
        }
        let notification = Notification {
            id: Ulid::new(),
            time,
            title,
            message,
            token,
            booking_id,
        };
        events.push(Event::NotificationScheduled(notification.clone()));
        wal_append(&self.wal_tx, events.clone()).await?;
        for event in &events {
            queue.apply(event);
        }
        Ok(notification)
    }

    /// Drop every reminder queued for `booking_id`. Returns how many went.
    pub async fn cancel_reminders(&self, booking_id: Ulid) -> Result<usize, StoreError> {
        let mut queue = self.queue.lock().await;
        let events: Vec<Event> = queue
            .for_booking(booking_id)
            .into_iter()
            .map(|id| Event::NotificationRemoved { id })
            .collect();
        if events.is_empty() {
            return Ok(0);
        }
        wal_append(&self.wal_tx, events.clone()).await?;
        for event in &events {
            queue.apply(event);
        }
        Ok(events.len())
    }

    /// Pending notifications ordered by time, optionally for one push token.
    pub async fn notifications(&self, token: Option<&str>) -> Vec<Notification> {
        let queue = self.queue.lock().await;
        queue
            .iter()
            .filter(|n| token.is_none_or(|t| n.token == t))
            .cloned()
            .collect()
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL as a snapshot of the current tables.
    ///
    /// Read guards on every table are held until the swap completes, so
    /// no commit can land between the snapshot and the new log.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let bookings = self.bookings.read().await;
        let catalog = self.catalog.read().await;
        let queue = self.queue.lock().await;

        let mut records = catalog.snapshot();
        records.extend(bookings.snapshot());
        records.extend(queue.snapshot());

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await
            .map_err(|_| StoreError::Closed)?
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let guard = self.bookings.clone().write_owned().await;
        Ok(Box::new(MemoryTx {
            state: guard,
            wal_tx: self.wal_tx.clone(),
            events: Vec::new(),
            undo: Vec::new(),
            done: false,
        }))
    }

    async fn find_booking(&self, kind: AmenityKind, id: Ulid) -> Result<Option<Booking>, StoreError> {
        let state = self.bookings.read().await;
        Ok(state.table(kind).get(&id).cloned())
    }

    async fn bookings_overlapping(
        &self,
        kind: AmenityKind,
        resource_id: Option<Ulid>,
        date: Option<NaiveDate>,
        span: Span,
    ) -> Result<Vec<Booking>, StoreError> {
        let state = self.bookings.read().await;
        let table = state.table(kind);
        let mut out: Vec<Booking> = match resource_id {
            Some(rid) => table.overlapping(rid, span).cloned().collect(),
            None => table.overlapping_any(span).cloned().collect(),
        };
        if let Some(date) = date {
            out.retain(|b| b.date == date);
        }
        sort_bookings(&mut out);
        Ok(out)
    }

    async fn bookings_from(&self, kind: AmenityKind, from: NaiveDate) -> Result<Vec<Booking>, StoreError> {
        let state = self.bookings.read().await;
        Ok(state.bookings_on_or_after(kind, from))
    }

    async fn all_bookings(&self, kind: AmenityKind) -> Result<Vec<Booking>, StoreError> {
        let state = self.bookings.read().await;
        let mut out: Vec<Booking> = state.table(kind).rows().cloned().collect();
        sort_bookings(&mut out);
        Ok(out)
    }

    async fn find_ledger_by_id(&self, id: Ulid) -> Result<Option<LedgerEntry>, StoreError> {
        let state = self.bookings.read().await;
        Ok(state.ledger.get(&id).cloned())
    }

    async fn ledger_for_owner(&self, owner: &str, from: NaiveDate) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = self.bookings.read().await;
        let mut out: Vec<LedgerEntry> = state
            .ledger
            .rows()
            .filter(|e| e.owner == owner && e.date >= from)
            .cloned()
            .collect();
        // Details slot 0 is the ISO start, which sorts chronologically.
        out.sort_by(|a, b| {
            (a.date, a.details.first(), a.id).cmp(&(b.date, b.details.first(), b.id))
        });
        Ok(out)
    }
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn find_resource(&self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        Ok(self.catalog.read().await.resources.get(&id).cloned())
    }

    async fn resources_by_min_capacity(
        &self,
        kind: AmenityKind,
        min_capacity: u32,
    ) -> Result<Vec<Resource>, StoreError> {
        let catalog = self.catalog.read().await;
        Ok(catalog
            .resources
            .values()
            .filter(|r| r.kind == kind && r.capacity >= min_capacity)
            .cloned()
            .collect())
    }

    async fn count_resources(&self, kind: AmenityKind) -> Result<usize, StoreError> {
        let catalog = self.catalog.read().await;
        Ok(catalog.resources.values().filter(|r| r.kind == kind).count())
    }
}

#[async_trait]
impl Directory for MemoryStore {
    async fn resolve_email(&self, token: &str) -> Result<Option<String>, StoreError> {
        let catalog = self.catalog.read().await;
        Ok(catalog.users.get(token).map(|u| u.email.clone()))
    }

    async fn push_token(&self, token: &str) -> Result<Option<String>, StoreError> {
        let catalog = self.catalog.read().await;
        Ok(catalog.users.get(token).and_then(|u| u.push_token.clone()))
    }

    async fn push_tokens(&self) -> Result<Vec<String>, StoreError> {
        let catalog = self.catalog.read().await;
        let mut users: Vec<&User> = catalog.users.values().collect();
        users.sort_by(|a, b| a.token.cmp(&b.token));
        Ok(users.into_iter().filter_map(|u| u.push_token.clone()).collect())
    }
}

#[async_trait]
impl NotificationQueue for MemoryStore {
    async fn earliest(&self) -> Result<Option<Notification>, StoreError> {
        Ok(self.queue.lock().await.earliest().cloned())
    }

    async fn remove(&self, id: Ulid) -> Result<bool, StoreError> {
        let mut queue = self.queue.lock().await;
        if !queue.contains(&id) {
            return Ok(false);
        }
        let event = Event::NotificationRemoved { id };
        wal_append(&self.wal_tx, vec![event.clone()]).await?;
        queue.apply(&event);
        Ok(true)
    }
}

// ── Transaction ──────────────────────────────────────────────────

/// Writes apply to the tables immediately and are recorded with their
/// inverses. Commit makes them durable as one WAL record; anything short
/// of a successful commit replays the inverses in reverse.
pub struct MemoryTx {
    state: OwnedRwLockWriteGuard<BookingState>,
    wal_tx: mpsc::Sender<WalCommand>,
    events: Vec<Event>,
    undo: Vec<Event>,
    done: bool,
}

impl MemoryTx {
    fn apply(&mut self, event: Event) {
        if let Some(inverse) = self.state.apply(&event) {
            self.undo.push(inverse);
        }
        self.events.push(event);
    }

    fn undo_all(&mut self) {
        while let Some(inverse) = self.undo.pop() {
            self.state.apply(&inverse);
        }
        self.events.clear();
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.done {
            if !self.events.is_empty() {
                debug!("rolling back {} uncommitted writes", self.events.len());
            }
            self.undo_all();
        }
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn insert_booking(&mut self, booking: NewBooking) -> Result<Booking, StoreError> {
        let table = self.state.table(booking.kind);
        if let Some(conflicting) = table.first_conflict(booking.resource_id, booking.span, None) {
            return Err(StoreError::ConstraintViolation { conflicting });
        }
        if table.resource_load(&booking.resource_id) >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(StoreError::LimitExceeded("too many bookings on resource"));
        }
        let booking = booking.with_id(Ulid::new());
        self.apply(Event::BookingInserted(booking.clone()));
        Ok(booking)
    }

    async fn find_booking(&self, kind: AmenityKind, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.state.table(kind).get(&id).cloned())
    }

    async fn bookings_overlapping(
        &self,
        kind: AmenityKind,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Vec<Booking>, StoreError> {
        let mut out: Vec<Booking> = self
            .state
            .table(kind)
            .overlapping(resource_id, span)
            .cloned()
            .collect();
        sort_bookings(&mut out);
        Ok(out)
    }

    async fn update_booking(&mut self, booking: &Booking) -> Result<(), StoreError> {
        if self.state.table(booking.kind).get(&booking.id).is_none() {
            return Err(StoreError::Missing(booking.id));
        }
        self.apply(Event::BookingUpdated(booking.clone()));
        Ok(())
    }

    async fn delete_booking(&mut self, kind: AmenityKind, id: Ulid) -> Result<bool, StoreError> {
        if self.state.table(kind).get(&id).is_none() {
            return Ok(false);
        }
        self.apply(Event::BookingDeleted { kind, id });
        Ok(true)
    }

    async fn insert_ledger_entry(&mut self, entry: NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        let entry = entry.with_id(Ulid::new());
        self.apply(Event::LedgerInserted(entry.clone()));
        Ok(entry)
    }

    async fn find_ledger_entry(
        &self,
        booking_id: Ulid,
        kind: AmenityKind,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self.state.ledger.for_booking(&booking_id, kind).cloned())
    }

    async fn update_ledger_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        if self.state.ledger.get(&entry.id).is_none() {
            return Err(StoreError::Missing(entry.id));
        }
        self.apply(Event::LedgerUpdated(entry.clone()));
        Ok(())
    }

    async fn delete_ledger_entry(&mut self, booking_id: Ulid, kind: AmenityKind) -> Result<bool, StoreError> {
        let Some(id) = self.state.ledger.for_booking(&booking_id, kind).map(|e| e.id) else {
            return Ok(false);
        };
        self.apply(Event::LedgerDeleted { id });
        Ok(true)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        if self.events.is_empty() {
            self.done = true;
            return Ok(());
        }
        let record = self.events.clone();
        wal_append(&self.wal_tx, record).await?;
        self.done = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) {}
}
