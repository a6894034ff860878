use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::{DirectoryStore, RecordUpdate, ReservationStore, StoreError, StoreResult};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        change: Change,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        changes: Vec<Change>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { change, response } => {
                let mut batch = vec![(change, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { change, response }) => {
                            batch.push((change, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel drained, flush
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

fn flush_batch(wal: &mut Wal, batch: &[(Change, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (change, _) in batch {
        if let Err(e) = wal.append_buffered(change) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Change, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
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
        WalCommand::Compact { changes, response } => {
            let result = Wal::write_compact_file(wal.path(), &changes)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { change, response } => {
            let result = flush_batch(wal, &[]).and_then(|()| {
                wal.append_buffered(&change)?;
                wal.flush_sync()
            });
            let _ = response.send(result);
        }
    }
}

/// One department's records: DashMap indexes in memory, every change
/// persisted to a WAL before it is applied.
pub struct WalStore {
    department: String,
    path: PathBuf,
    records: DashMap<Ulid, Reservation>,
    /// Active reservation spans per resource.
    calendars: DashMap<Ulid, ResourceCalendar>,
    by_owner: DashMap<String, Vec<Ulid>>,
    resources: DashMap<Ulid, Resource>,
    blocks: DashMap<Ulid, BlockedInterval>,
    members: DashMap<String, Member>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by appends, exclusive while compaction snapshots, so every
    /// change durable in the old file is applied before the snapshot is taken.
    compaction_gate: RwLock<()>,
}

impl WalStore {
    /// Replay `path` and start the group-commit writer. Must run inside a tokio runtime.
    pub fn open(department: &str, path: &Path) -> io::Result<Self> {
        let changes = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            department: department.to_string(),
            path: path.to_path_buf(),
            records: DashMap::new(),
            calendars: DashMap::new(),
            by_owner: DashMap::new(),
            resources: DashMap::new(),
            blocks: DashMap::new(),
            members: DashMap::new(),
            wal_tx,
            compaction_gate: RwLock::new(()),
        };
        for change in &changes {
            store.apply(change);
        }
        info!(
            department,
            path = %path.display(),
            replayed = changes.len(),
            "store opened"
        );
        Ok(store)
    }

    pub fn department(&self) -> &str {
        &self.department
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a change to the in-memory indexes (no WAL).
    fn apply(&self, change: &Change) {
        match change {
            Change::ResourceAdded(resource) => {
                self.resources.insert(resource.id, resource.clone());
            }
            Change::BlockAdded(block) => {
                self.blocks.insert(block.id, block.clone());
            }
            Change::BlockRemoved { id, .. } => {
                self.blocks.remove(id);
            }
            Change::MemberSet(member) => {
                self.members.insert(member.account.clone(), member.clone());
            }
            Change::MemberRemoved { account } => {
                self.members.remove(account);
            }
            Change::ReservationCreated(reservation) => {
                let previous = self
                    .records
                    .get(&reservation.id)
                    .map(|r| (r.active, r.resource_id));
                if let Some((true, old_resource)) = previous {
                    self.unlist(old_resource, reservation.id);
                }
                if reservation.active {
                    self.calendars
                        .entry(reservation.resource_id)
                        .or_default()
                        .insert(CalendarEntry {
                            id: reservation.id,
                            span: reservation.span,
                        });
                }
                let mut owned = self.by_owner.entry(reservation.owner.clone()).or_default();
                if !owned.contains(&reservation.id) {
                    owned.push(reservation.id);
                }
                drop(owned);
                self.records.insert(reservation.id, reservation.clone());
            }
            Change::ReservationMoved {
                id,
                resource_id,
                resource_name,
                span,
                changed_at,
            } => {
                if let Some(mut record) = self.records.get_mut(id) {
                    if record.active {
                        self.unlist(record.resource_id, *id);
                        self.calendars
                            .entry(*resource_id)
                            .or_default()
                            .insert(CalendarEntry { id: *id, span: *span });
                    }
                    record.resource_id = *resource_id;
                    record.resource_name = resource_name.clone();
                    record.span = *span;
                    record.changed_at = Some(*changed_at);
                }
            }
            Change::ReservationDeactivated { id, changed_at } => {
                if let Some(mut record) = self.records.get_mut(id) {
                    if record.active {
                        self.unlist(record.resource_id, *id);
                    }
                    record.active = false;
                    record.changed_at = Some(*changed_at);
                }
            }
        }
    }

    fn unlist(&self, resource_id: Ulid, id: Ulid) {
        if let Some(mut calendar) = self.calendars.get_mut(&resource_id) {
            calendar.remove(id);
        }
    }

    /// Write to the WAL via the group-commit writer, then apply.
    async fn persist(&self, change: Change) -> StoreResult<()> {
        let _gate = self.compaction_gate.read().await;
        self.wal_append(&change).await?;
        self.apply(&change);
        Ok(())
    }

    async fn wal_append(&self, change: &Change) -> StoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                change: change.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    fn collect(&self, ids: impl IntoIterator<Item = Ulid>) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = ids
            .into_iter()
            .filter_map(|id| self.records.get(&id).map(|r| r.clone()))
            .collect();
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    /// Minimal change list that recreates the current state.
    fn snapshot(&self) -> Vec<Change> {
        let mut changes = Vec::new();
        changes.extend(
            self.resources
                .iter()
                .map(|e| Change::ResourceAdded(e.value().clone())),
        );
        changes.extend(self.blocks.iter().map(|e| Change::BlockAdded(e.value().clone())));
        changes.extend(self.members.iter().map(|e| Change::MemberSet(e.value().clone())));
        let mut reservations: Vec<Reservation> =
            self.records.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);
        changes.extend(reservations.into_iter().map(Change::ReservationCreated));
        changes
    }

    /// Rewrite the WAL with only the changes needed to recreate the current state.
    pub async fn compact(&self) -> StoreResult<()> {
        let _gate = self.compaction_gate.write().await;
        let changes = self.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                changes,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
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

#[async_trait]
impl ReservationStore for WalStore {
    async fn query_by_owner_and_week(
        &self,
        owner: &str,
        week: Span,
    ) -> StoreResult<Vec<Reservation>> {
        let ids = self
            .by_owner
            .get(owner)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut found = self.collect(ids);
        found.retain(|r| r.active && week.contains_instant(r.span.start));
        Ok(found)
    }

    async fn query_by_resource_and_range(
        &self,
        resource_id: Ulid,
        range: Span,
    ) -> StoreResult<Vec<Reservation>> {
        let ids: Vec<Ulid> = match self.calendars.get(&resource_id) {
            Some(calendar) => calendar.overlapping(&range).map(|e| e.id).collect(),
            None => Vec::new(),
        };
        Ok(self.collect(ids))
    }

    async fn query_blocks(
        &self,
        department: &str,
        resource_id: Ulid,
    ) -> StoreResult<Vec<BlockedInterval>> {
        if department != self.department {
            return Ok(Vec::new());
        }
        let mut blocks: Vec<BlockedInterval> = self
            .blocks
            .iter()
            .filter(|b| b.resource_id == resource_id)
            .map(|b| b.value().clone())
            .collect();
        blocks.sort_by_key(|b| b.span.start);
        Ok(blocks)
    }

    async fn get(&self, id: Ulid) -> StoreResult<Option<Reservation>> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn put(&self, reservation: &Reservation) -> StoreResult<()> {
        self.persist(Change::ReservationCreated(reservation.clone()))
            .await
    }

    async fn update(&self, id: Ulid, update: RecordUpdate) -> StoreResult<Reservation> {
        let active = self
            .records
            .get(&id)
            .map(|r| r.active)
            .ok_or(StoreError::NotFound(id))?;
        if !active {
            return Err(StoreError::Inactive(id));
        }
        let change = match update {
            RecordUpdate::Move {
                resource_id,
                resource_name,
                span,
                changed_at,
            } => Change::ReservationMoved {
                id,
                resource_id,
                resource_name,
                span,
                changed_at,
            },
            RecordUpdate::Deactivate { changed_at } => {
                Change::ReservationDeactivated { id, changed_at }
            }
        };
        self.persist(change).await?;
        self.records
            .get(&id)
            .map(|r| r.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn query_by_owner(&self, owner: &str) -> StoreResult<Vec<Reservation>> {
        let ids = self
            .by_owner
            .get(owner)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        Ok(self.collect(ids))
    }

    async fn query_all(&self) -> StoreResult<Vec<Reservation>> {
        let ids: Vec<Ulid> = self.records.iter().map(|e| *e.key()).collect();
        Ok(self.collect(ids))
    }

    async fn query_active_in_range(&self, range: Span) -> StoreResult<Vec<Reservation>> {
        let mut ids = Vec::new();
        for calendar in self.calendars.iter() {
            ids.extend(calendar.overlapping(&range).map(|e| e.id));
        }
        Ok(self.collect(ids))
    }
}

#[async_trait]
impl DirectoryStore for WalStore {
    async fn get_resource(&self, id: Ulid) -> StoreResult<Option<Resource>> {
        Ok(self.resources.get(&id).map(|r| r.clone()))
    }

    async fn list_resources(&self) -> StoreResult<Vec<Resource>> {
        Ok(self.resources.iter().map(|e| e.value().clone()).collect())
    }

    async fn put_resource(&self, resource: &Resource) -> StoreResult<()> {
        self.persist(Change::ResourceAdded(resource.clone())).await
    }

    async fn get_block(&self, id: Ulid) -> StoreResult<Option<BlockedInterval>> {
        Ok(self.blocks.get(&id).map(|b| b.clone()))
    }

    async fn put_block(&self, block: &BlockedInterval) -> StoreResult<()> {
        self.persist(Change::BlockAdded(block.clone())).await
    }

    async fn remove_block(&self, id: Ulid) -> StoreResult<Option<BlockedInterval>> {
        let Some(block) = self.blocks.get(&id).map(|b| b.clone()) else {
            return Ok(None);
        };
        self.persist(Change::BlockRemoved {
            id,
            resource_id: block.resource_id,
        })
        .await?;
        Ok(Some(block))
    }

    async fn blocks_in_range(&self, range: Span) -> StoreResult<Vec<BlockedInterval>> {
        let mut blocks: Vec<BlockedInterval> = self
            .blocks
            .iter()
            .filter(|b| b.span.overlaps(&range))
            .map(|b| b.value().clone())
            .collect();
        blocks.sort_by_key(|b| b.span.start);
        Ok(blocks)
    }

    async fn get_member(&self, account: &str) -> StoreResult<Option<Member>> {
        Ok(self.members.get(account).map(|m| m.clone()))
    }

    async fn list_members(&self) -> StoreResult<Vec<Member>> {
        let mut members: Vec<Member> = self.members.iter().map(|e| e.value().clone()).collect();
        members.sort_by(|a, b| a.account.cmp(&b.account));
        Ok(members)
    }

    async fn put_member(&self, member: &Member) -> StoreResult<()> {
        self.persist(Change::MemberSet(member.clone())).await
    }

    async fn remove_member(&self, account: &str) -> StoreResult<bool> {
        if !self.members.contains_key(account) {
            return Ok(false);
        }
        self.persist(Change::MemberRemoved {
            account: account.to_string(),
        })
        .await?;
        Ok(true)
    }
}
