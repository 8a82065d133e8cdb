use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::{SlotWrite, StoreError, Timeline, ViewingStore};

/// Every viewing recorded for one property, sorted by `scheduled_at`.
#[derive(Debug, Default)]
struct PropertyState {
    revision: u64,
    viewings: Vec<Viewing>,
}

impl PropertyState {
    fn insert(&mut self, viewing: Viewing) {
        let pos = self
            .viewings
            .binary_search_by_key(&viewing.scheduled_at, |v| v.scheduled_at)
            .unwrap_or_else(|e| e);
        self.viewings.insert(pos, viewing);
    }

    fn position(&self, id: Ulid) -> Option<usize> {
        self.viewings.iter().position(|v| v.id == id)
    }

    fn remove(&mut self, id: Ulid) -> Option<Viewing> {
        self.position(id).map(|pos| self.viewings.remove(pos))
    }

    fn active(&self) -> impl Iterator<Item = &Viewing> {
        self.viewings.iter().filter(|v| v.status.is_active())
    }
}

type SharedPropertyState = Arc<RwLock<PropertyState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        record: Viewing,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Viewing>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued, then
/// fsync once and answer every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Viewing, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<(Viewing, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        // Appends are batched by the caller loop and never routed here.
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed outside batch")));
        }
    }
}

/// Viewing store: indexed in memory per property, optionally made durable by a WAL.
pub struct LogStore {
    properties: DashMap<Ulid, SharedPropertyState>,
    /// Reverse lookup: viewing id → property id
    index: DashMap<Ulid, Ulid>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Writers take this shared; compaction takes it exclusively so that no
    /// append lands between the snapshot and the file swap.
    compaction: RwLock<()>,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl LogStore {
    pub fn in_memory() -> Self {
        Self {
            properties: DashMap::new(),
            index: DashMap::new(),
            wal_tx: None,
            compaction: RwLock::new(()),
        }
    }

    /// Replay the log at `path` and keep appending to it. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let records = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut latest: HashMap<Ulid, Viewing> = HashMap::new();
        for record in records {
            latest.insert(record.id, record);
        }

        let mut by_property: HashMap<Ulid, PropertyState> = HashMap::new();
        let index = DashMap::new();
        for viewing in latest.into_values() {
            index.insert(viewing.id, viewing.property_id);
            by_property
                .entry(viewing.property_id)
                .or_default()
                .insert(viewing);
        }

        let properties = DashMap::new();
        for (pid, state) in by_property {
            properties.insert(pid, Arc::new(RwLock::new(state)));
        }

        info!("replayed {} viewings from {}", index.len(), path.display());
        Ok(Self {
            properties,
            index,
            wal_tx: Some(wal_tx),
            compaction: RwLock::new(()),
        })
    }

    pub fn viewing_count(&self) -> usize {
        self.index.len()
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else { return 0 };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    fn property(&self, id: &Ulid) -> Option<SharedPropertyState> {
        self.properties.get(id).map(|e| e.value().clone())
    }

    /// Write a record via the background group-commit writer. No-op when in-memory.
    async fn append(&self, record: &Viewing) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                record: record.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn scan(&self, keep: impl Fn(&Viewing) -> bool) -> Vec<Viewing> {
        let states: Vec<SharedPropertyState> =
            self.properties.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for state in states {
            let guard = state.read().await;
            out.extend(guard.viewings.iter().filter(|v| keep(v)).cloned());
        }
        out.sort_by_key(|v| v.scheduled_at);
        out
    }
}

#[async_trait]
impl ViewingStore for LogStore {
    async fn find_active_bookings(&self, property_id: Ulid) -> Result<Timeline, StoreError> {
        let Some(state) = self.property(&property_id) else {
            return Ok(Timeline {
                property_id,
                revision: 0,
                bookings: Vec::new(),
            });
        };
        let guard = state.read().await;
        Ok(Timeline {
            property_id,
            revision: guard.revision,
            bookings: guard.active().cloned().collect(),
        })
    }

    async fn find_by_id(&self, id: Ulid) -> Result<Option<Viewing>, StoreError> {
        let Some(pid) = self.index.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(state) = self.property(&pid) else {
            return Ok(None);
        };
        let guard = state.read().await;
        Ok(guard.position(id).map(|pos| guard.viewings[pos].clone()))
    }

    async fn save(&self, viewing: Viewing) -> Result<Viewing, StoreError> {
        let _gate = self.compaction.read().await;
        let pid = self
            .index
            .get(&viewing.id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(viewing.id))?;
        if pid != viewing.property_id {
            return Err(StoreError::Rejected("viewings cannot move between properties"));
        }
        let state = self.property(&pid).ok_or(StoreError::NotFound(viewing.id))?;
        let mut guard = state.write().await;
        let pos = guard
            .position(viewing.id)
            .ok_or(StoreError::NotFound(viewing.id))?;

        let current = &guard.viewings[pos];
        if current.version != viewing.version {
            return Err(StoreError::VersionConflict {
                id: viewing.id,
                expected: viewing.version,
                actual: current.version,
            });
        }
        if current.scheduled_at != viewing.scheduled_at
            || current.duration_minutes != viewing.duration_minutes
        {
            return Err(StoreError::Rejected(
                "scheduling changes must go through an interval commit",
            ));
        }
        if current.status.is_terminal() && viewing.status.is_active() {
            return Err(StoreError::Rejected("terminal viewings cannot be reactivated"));
        }

        let mut record = viewing;
        record.version += 1;
        self.append(&record).await?;
        guard.viewings[pos] = record.clone();
        Ok(record)
    }

    async fn commit_slot(&self, write: SlotWrite) -> Result<Viewing, StoreError> {
        let _gate = self.compaction.read().await;
        let SlotWrite {
            viewing: mut record,
            expected_revision,
        } = write;
        let pid = record.property_id;

        if let Some(existing) = self.index.get(&record.id).map(|e| *e.value())
            && existing != pid
        {
            return Err(StoreError::Rejected("viewings cannot move between properties"));
        }
        if !record.status.is_active() {
            return Err(StoreError::Rejected("interval writes must leave the viewing active"));
        }

        let state = self.properties.entry(pid).or_default().value().clone();
        let mut guard = state.write().await;
        if guard.revision != expected_revision {
            return Err(StoreError::SerializationFailure { property_id: pid });
        }

        match guard.position(record.id) {
            None if record.version != 0 => return Err(StoreError::NotFound(record.id)),
            None => {}
            Some(_) if record.version == 0 => return Err(StoreError::AlreadyExists(record.id)),
            Some(pos) => {
                let current = &guard.viewings[pos];
                if current.version != record.version {
                    return Err(StoreError::VersionConflict {
                        id: record.id,
                        expected: record.version,
                        actual: current.version,
                    });
                }
                if current.status.is_terminal() {
                    return Err(StoreError::Rejected("terminal viewings cannot be rescheduled"));
                }
            }
        }

        record.version += 1;
        self.append(&record).await?;
        guard.remove(record.id);
        guard.insert(record.clone());
        guard.revision += 1;
        self.index.insert(record.id, pid);
        Ok(record)
    }

    async fn find_overdue(&self, now: Ms) -> Result<Vec<Viewing>, StoreError> {
        Ok(self
            .scan(|v| v.status == ViewingStatus::Confirmed && v.ends_at() <= now)
            .await)
    }

    async fn find_upcoming(&self, window: Span) -> Result<Vec<Viewing>, StoreError> {
        Ok(self
            .scan(|v| {
                v.status == ViewingStatus::Confirmed
                    && window.start <= v.scheduled_at
                    && v.scheduled_at < window.end
            })
            .await)
    }

    async fn find_by_status(&self, status: ViewingStatus) -> Result<Vec<Viewing>, StoreError> {
        Ok(self.scan(|v| v.status == status).await)
    }

    async fn count_active_by_tenant_and_property(
        &self,
        tenant_id: Ulid,
        property_id: Ulid,
    ) -> Result<usize, StoreError> {
        let Some(state) = self.property(&property_id) else {
            return Ok(0);
        };
        let guard = state.read().await;
        Ok(guard.active().filter(|v| v.tenant_id == tenant_id).count())
    }

    async fn compact(&self, threshold: u64) -> Result<bool, StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(false);
        };
        if self.appends_since_compact().await < threshold {
            return Ok(false);
        }

        let _gate = self.compaction.write().await;
        let records = self.scan(|_| true).await;
        let count = records.len();
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact {
                records,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Io(e.to_string()))?;
        info!("compacted viewing log to {count} records");
        Ok(true)
    }
}
