mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;

pub use error::{ConflictReason, EngineError, NotFound};
pub use slots::{generate_slots, merge_overlapping, validate_duration, SlotPolicy};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<Ledger>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Rewrite the log as the minimal event set for the state it describes.
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Every append already queued when the first one arrives goes into the same
/// `fsync`; all senders in the batch get the same result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            // The whole batch fails together; none of it may reach the log.
            wal.discard_pending();
            return Err(e);
        }
    }
    wal.flush_sync()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let result = compact_in_place(wal);
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Runs on the writer task, so no append can interleave with the rewrite.
fn compact_in_place(wal: &mut Wal) -> io::Result<()> {
    let events = Wal::replay(wal.path())?;
    let (ledgers, _) = rebuild(&events);
    let snapshot = snapshot_events(&ledgers);
    Wal::write_compact_file(wal.path(), &snapshot)?;
    wal.swap_compact_file()
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::Store("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::Store("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::Store(e.to_string()))
}

// ── State reconstruction ─────────────────────────────────

/// Apply an event directly to a ledger (no locking; caller holds the lock).
fn apply_event(ledger: &mut Ledger, event: &Event, index: &DashMap<Ulid, String>) {
    match event {
        Event::AvailabilitySet { availability } => {
            ledger.availability = Some(availability.clone());
        }
        Event::AvailabilityDeleted { .. } => {
            ledger.availability = None;
        }
        Event::ExceptionAdded { exception, .. } => {
            if let Some(availability) = ledger.availability.as_mut() {
                availability.upsert_exception(exception.clone());
            }
        }
        Event::ExceptionRemoved { date, .. } => {
            if let Some(availability) = ledger.availability.as_mut() {
                availability.remove_exception(*date);
            }
        }
        Event::BlockedTimeAdded { blocked } => {
            index.insert(blocked.id, blocked.professional_id.clone());
            ledger.insert_blocked(blocked.clone());
        }
        Event::BlockedTimeRemoved { id, .. } => {
            ledger.remove_blocked(*id);
            index.remove(id);
        }
        Event::BookingRequested { booking } => {
            index.insert(booking.id, booking.professional_id.clone());
            ledger.insert_booking(booking.clone());
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(booking) = ledger.booking_mut(*id) {
                booking.status = *status;
            }
        }
    }
}

/// Fold a replayed event stream into ledgers plus the record → professional index.
fn rebuild(events: &[Event]) -> (HashMap<String, Ledger>, DashMap<Ulid, String>) {
    let mut ledgers: HashMap<String, Ledger> = HashMap::new();
    let index = DashMap::new();
    for event in events {
        let pid = event.professional_id();
        let ledger = ledgers
            .entry(pid.to_string())
            .or_insert_with(|| Ledger::new(pid.to_string()));
        apply_event(ledger, event, &index);
    }
    ledgers.retain(|_, l| !l.is_empty());
    (ledgers, index)
}

/// Minimal events that recreate `ledgers`. Bookings carry their current
/// status, so status history collapses into one record each.
fn snapshot_events(ledgers: &HashMap<String, Ledger>) -> Vec<Event> {
    let mut pids: Vec<&String> = ledgers.keys().collect();
    pids.sort();
    let mut events = Vec::new();
    for pid in pids {
        let ledger = &ledgers[pid];
        if let Some(availability) = &ledger.availability {
            events.push(Event::AvailabilitySet {
                availability: availability.clone(),
            });
        }
        for blocked in &ledger.blocked {
            events.push(Event::BlockedTimeAdded {
                blocked: blocked.clone(),
            });
        }
        for booking in &ledger.bookings {
            events.push(Event::BookingRequested {
                booking: booking.clone(),
            });
        }
    }
    events
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    ledgers: DashMap<String, SharedLedger>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking / blocked-time id → professional id.
    record_index: Arc<DashMap<Ulid, String>>,
    clock: Arc<dyn Clock>,
    policy: SlotPolicy,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_clock(wal_path, Arc::new(SystemClock), SlotPolicy::default())
    }

    /// Replay the WAL at `wal_path` and start its writer task. Must be called
    /// from inside a tokio runtime.
    pub fn with_clock(wal_path: PathBuf, clock: Arc<dyn Clock>, policy: SlotPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let (rebuilt, index) = rebuild(&events);
        let ledgers = DashMap::with_capacity(rebuilt.len());
        for (pid, ledger) in rebuilt {
            ledgers.insert(pid, Arc::new(RwLock::new(ledger)));
        }
        tracing::info!(
            "replayed {} events into {} professional ledgers",
            events.len(),
            ledgers.len()
        );

        Ok(Self {
            ledgers,
            wal_tx,
            record_index: Arc::new(index),
            clock,
            policy,
        })
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn policy(&self) -> SlotPolicy {
        self.policy
    }

    pub fn professional_count(&self) -> usize {
        self.ledgers.len()
    }

    pub(super) fn ledger(&self, professional_id: &str) -> Option<SharedLedger> {
        self.ledgers.get(professional_id).map(|e| e.value().clone())
    }

    pub(super) fn ledger_or_create(&self, professional_id: &str) -> Result<SharedLedger, EngineError> {
        if let Some(ledger) = self.ledger(professional_id) {
            return Ok(ledger);
        }
        if self.ledgers.len() >= crate::limits::MAX_PROFESSIONALS {
            return Err(EngineError::LimitExceeded("too many professionals"));
        }
        Ok(self
            .ledgers
            .entry(professional_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Ledger::new(professional_id.to_string()))))
            .value()
            .clone())
    }

    /// Snapshot of every ledger handle; never hold DashMap refs across an await.
    pub(super) fn all_ledgers(&self) -> Vec<SharedLedger> {
        self.ledgers.iter().map(|e| e.value().clone()).collect()
    }

    pub(super) fn record_owner(&self, id: &Ulid) -> Option<String> {
        self.record_index.get(id).map(|e| e.value().clone())
    }

    /// Claim a new record id for `professional_id`. Ids are unique across all
    /// professionals, so the claim goes through the shared index rather than
    /// any one ledger lock. Pair with `commit_claimed`, which releases it if
    /// the record never lands.
    pub(super) fn claim_record_id(&self, id: Ulid, professional_id: &str) -> Result<(), EngineError> {
        match self.record_index.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(professional_id.to_string());
                Ok(())
            }
        }
    }

    /// Look up the professional owning a record and take their write lock.
    pub(super) async fn resolve_record_write(
        &self,
        id: Ulid,
        missing: NotFound,
    ) -> Result<OwnedRwLockWriteGuard<Ledger>, EngineError> {
        let pid = self.record_owner(&id).ok_or_else(|| EngineError::NotFound(missing.clone()))?;
        let ledger = self.ledger(&pid).ok_or(EngineError::NotFound(missing))?;
        Ok(ledger.write_owned().await)
    }

    /// WAL-append then apply, on a task that owns the write guard.
    ///
    /// Once validation has passed the commit runs to completion even if the
    /// caller's future is dropped, so the log and the in-memory ledger never
    /// disagree. The ledger stays locked until the event is applied.
    pub(super) async fn commit(
        &self,
        guard: OwnedRwLockWriteGuard<Ledger>,
        event: Event,
    ) -> Result<(), EngineError> {
        self.commit_inner(guard, event, None).await
    }

    /// `commit` for an event that creates the record `claimed`; the claim is
    /// dropped again if the event never reaches the log.
    pub(super) async fn commit_claimed(
        &self,
        guard: OwnedRwLockWriteGuard<Ledger>,
        event: Event,
        claimed: Ulid,
    ) -> Result<(), EngineError> {
        self.commit_inner(guard, event, Some(claimed)).await
    }

    async fn commit_inner(
        &self,
        mut guard: OwnedRwLockWriteGuard<Ledger>,
        event: Event,
        claimed: Option<Ulid>,
    ) -> Result<(), EngineError> {
        let wal_tx = self.wal_tx.clone();
        let index = self.record_index.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = wal_append(&wal_tx, &event).await {
                if let Some(id) = claimed {
                    index.remove(&id);
                }
                return Err(e);
            }
            apply_event(&mut guard, &event, &index);
            Ok::<(), EngineError>(())
        });
        task.await
            .map_err(|e| EngineError::Store(format!("commit task failed: {e}")))?
    }

    /// Rewrite the WAL to the minimal event set for the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::Store("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Store("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Store(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
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
