use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::error::StoreError;
use crate::model::{BookingRequest, BookingStatus, Event, ResourceId, TimeSlot, Ts};
use crate::wal::{run_writer, Journal, JournalCommand};

/// Keyed request store with conditional writes and the secondary lookups the core needs.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Insert a new record. Its `version` is reset to 1.
    async fn create(&self, request: BookingRequest) -> Result<BookingRequest, StoreError>;

    async fn get(&self, id: Ulid) -> Result<Option<BookingRequest>, StoreError>;

    /// Replace the record only if its stored version still equals `expected_version`.
    /// Returns the stored record with its version bumped.
    async fn update_conditionally(
        &self,
        request: BookingRequest,
        expected_version: u64,
    ) -> Result<BookingRequest, StoreError>;

    /// Oldest first.
    async fn query_by_status(
        &self,
        status: BookingStatus,
        limit: usize,
    ) -> Result<Vec<BookingRequest>, StoreError>;

    /// CONFIRMED requests occupying `(resource, date, slot)`.
    async fn query_conflicts(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
        slot: &TimeSlot,
    ) -> Result<Vec<BookingRequest>, StoreError>;

    /// The user's requests on `date` that count toward the daily quota.
    async fn query_user_bookings_on_date(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<BookingRequest>, StoreError>;

    /// Newest first.
    async fn query_by_user(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BookingRequest>, StoreError>;

    /// Requests created before `cutoff` whose status is one of `statuses`, oldest first.
    async fn query_older_than(
        &self,
        cutoff: Ts,
        statuses: &[BookingStatus],
        limit: usize,
    ) -> Result<Vec<BookingRequest>, StoreError>;

    /// Returns false when the record was already gone.
    async fn delete(&self, id: Ulid) -> Result<bool, StoreError>;

    async fn count_by_status(&self) -> Result<BTreeMap<BookingStatus, usize>, StoreError>;
}

pub type SharedRecord = Arc<RwLock<BookingRequest>>;

// ── Journaled in-memory store ────────────────────────────

/// All records live in memory; every mutation is journaled before it becomes visible.
pub struct JournaledStore {
    records: DashMap<Ulid, SharedRecord>,
    wal_tx: mpsc::Sender<JournalCommand>,
    /// Writers hold it shared; compaction holds it exclusively while it snapshots.
    compaction_gate: RwLock<()>,
}

impl JournaledStore {
    /// Replay the journal at `path` and start its writer task.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let journal_err = |e: std::io::Error| StoreError::Journal(e.to_string());
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(journal_err)?;
        }
        let (journal, events) = Journal::recover(path).map_err(journal_err)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(run_writer(journal, wal_rx));

        let records: DashMap<Ulid, SharedRecord> = DashMap::new();
        let replayed = events.len();
        for event in events {
            match event {
                Event::RequestWritten(request) => {
                    records.insert(request.request_id, Arc::new(RwLock::new(request)));
                }
                Event::RequestDeleted { id } => {
                    records.remove(&id);
                }
            }
        }

        let store = Self {
            records,
            wal_tx,
            compaction_gate: RwLock::new(()),
        };
        info!(events = replayed, records = store.len(), path = %path.display(), "journal replayed");
        for id in store.stale_processing() {
            warn!(request_id = %id, "request left in processing by a previous run");
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records persisted as PROCESSING. Right after `open` these belong to no live execution.
    pub fn stale_processing(&self) -> Vec<Ulid> {
        self.records
            .iter()
            .filter(|e| {
                e.value()
                    .try_read()
                    .is_ok_and(|r| r.status == BookingStatus::Processing)
            })
            .map(|e| *e.key())
            .collect()
    }

    fn record(&self, id: &Ulid) -> Option<SharedRecord> {
        self.records.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of every record without holding a shard lock across awaits.
    async fn snapshot(&self) -> Vec<BookingRequest> {
        let arcs: Vec<SharedRecord> = self.records.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            out.push(arc.read().await.clone());
        }
        out
    }

    async fn scan<F>(&self, mut keep: F) -> Vec<BookingRequest>
    where
        F: FnMut(&BookingRequest) -> bool + Send,
    {
        let mut out = self.snapshot().await;
        out.retain(|r| keep(r));
        out
    }

    async fn wal_append(&self, event: Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(JournalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))
    }

    /// Rewrite the journal as one record per live request.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.write().await;
        let events: Vec<Event> = self
            .snapshot()
            .await
            .into_iter()
            .map(Event::RequestWritten)
            .collect();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(JournalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Journal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Compacts when the journal has grown past `threshold` appends. Returns whether it did.
    pub async fn compact_if_needed(&self, threshold: u64) -> Result<bool, StoreError> {
        let appends = self.appends_since_compact().await;
        if appends < threshold {
            return Ok(false);
        }
        self.compact().await?;
        info!(appends, records = self.len(), "journal compacted");
        Ok(true)
    }
}

#[async_trait]
impl BookingStore for JournaledStore {
    async fn create(&self, mut request: BookingRequest) -> Result<BookingRequest, StoreError> {
        let id = request.request_id;
        if self.records.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        request.version = 1;
        let _gate = self.compaction_gate.read().await;
        self.wal_append(Event::RequestWritten(request.clone())).await?;
        self.records.insert(id, Arc::new(RwLock::new(request.clone())));
        Ok(request)
    }

    async fn get(&self, id: Ulid) -> Result<Option<BookingRequest>, StoreError> {
        match self.record(&id) {
            Some(arc) => Ok(Some(arc.read().await.clone())),
            None => Ok(None),
        }
    }

    async fn update_conditionally(
        &self,
        mut request: BookingRequest,
        expected_version: u64,
    ) -> Result<BookingRequest, StoreError> {
        let id = request.request_id;
        let arc = self.record(&id).ok_or(StoreError::NotFound(id))?;
        let _gate = self.compaction_gate.read().await;
        let mut guard = arc.write().await;
        if guard.version != expected_version {
            return Err(StoreError::VersionConflict {
                id,
                expected: expected_version,
                actual: guard.version,
            });
        }
        request.version = expected_version + 1;
        self.wal_append(Event::RequestWritten(request.clone())).await?;
        *guard = request.clone();
        Ok(request)
    }

    async fn query_by_status(
        &self,
        status: BookingStatus,
        limit: usize,
    ) -> Result<Vec<BookingRequest>, StoreError> {
        let mut out = self.scan(|r| r.status == status).await;
        out.sort_by_key(|r| (r.created_at, r.request_id));
        out.truncate(limit);
        Ok(out)
    }

    async fn query_conflicts(
        &self,
        resource_id: ResourceId,
        date: NaiveDate,
        slot: &TimeSlot,
    ) -> Result<Vec<BookingRequest>, StoreError> {
        let slot = *slot;
        Ok(self
            .scan(|r| {
                r.status == BookingStatus::Confirmed
                    && r.resource_id == resource_id
                    && r.booking_date == date
                    && r.time_slot == slot
            })
            .await)
    }

    async fn query_user_bookings_on_date(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<BookingRequest>, StoreError> {
        Ok(self
            .scan(|r| {
                r.user_id == user_id && r.booking_date == date && r.status.counts_toward_quota()
            })
            .await)
    }

    async fn query_by_user(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BookingRequest>, StoreError> {
        let mut out = self.scan(|r| r.user_id == user_id).await;
        out.sort_by(|a, b| (b.created_at, b.request_id).cmp(&(a.created_at, a.request_id)));
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    async fn query_older_than(
        &self,
        cutoff: Ts,
        statuses: &[BookingStatus],
        limit: usize,
    ) -> Result<Vec<BookingRequest>, StoreError> {
        let mut out = self
            .scan(|r| r.created_at < cutoff && statuses.contains(&r.status))
            .await;
        out.sort_by_key(|r| (r.created_at, r.request_id));
        out.truncate(limit);
        Ok(out)
    }

    async fn delete(&self, id: Ulid) -> Result<bool, StoreError> {
        let Some(arc) = self.record(&id) else {
            return Ok(false);
        };
        let _gate = self.compaction_gate.read().await;
        let _guard = arc.write().await;
        if !self.records.contains_key(&id) {
            return Ok(false);
        }
        self.wal_append(Event::RequestDeleted { id }).await?;
        self.records.remove(&id);
        Ok(true)
    }

    async fn count_by_status(&self) -> Result<BTreeMap<BookingStatus, usize>, StoreError> {
        let mut counts: BTreeMap<BookingStatus, usize> =
            BookingStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for r in self.snapshot().await {
            *counts.entry(r.status).or_default() += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::Priority;
    use chrono::{TimeDelta, TimeZone, Utc};
    use std::path::PathBuf;

    pub(crate) fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtside_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    pub(crate) fn sample(user: &str, court: ResourceId, date: NaiveDate, status: BookingStatus) -> BookingRequest {
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap();
        BookingRequest {
            request_id: Ulid::new(),
            user_id: user.into(),
            resource_id: court,
            booking_date: date,
            time_slot: TimeSlot::parse("De 08:00 AM a 09:00 AM").unwrap(),
            status,
            priority: Priority::Medium,
            retry_count: 0,
            max_retries: 3,
            auto_retry: true,
            notes: None,
            created_at: now,
            updated_at: now,
            requested_at: now,
            expires_at: None,
            confirmed_at: None,
            scheduled_for: None,
            scheduled_job_id: None,
            confirmation_code: None,
            error_message: None,
            external_booking_id: None,
            version: 0,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 4, d).unwrap()
    }

    #[tokio::test]
    async fn create_get_and_duplicate() {
        let store = JournaledStore::open(&test_wal_path("create_get.wal")).unwrap();
        let r = store.create(sample("ana", 1, day(5), BookingStatus::Pending)).await.unwrap();
        assert_eq!(r.version, 1);
        assert_eq!(store.get(r.request_id).await.unwrap(), Some(r.clone()));
        assert!(matches!(
            store.create(r.clone()).await,
            Err(StoreError::AlreadyExists(id)) if id == r.request_id
        ));
        assert_eq!(store.get(Ulid::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_version() {
        let store = JournaledStore::open(&test_wal_path("conditional.wal")).unwrap();
        let r = store.create(sample("ana", 1, day(5), BookingStatus::Pending)).await.unwrap();

        let mut first = r.clone();
        first.status = BookingStatus::Processing;
        let stored = store.update_conditionally(first, 1).await.unwrap();
        assert_eq!(stored.version, 2);

        let mut stale = r.clone();
        stale.status = BookingStatus::Cancelled;
        let err = store.update_conditionally(stale, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 1, actual: 2, .. }));
        assert_eq!(
            store.get(r.request_id).await.unwrap().unwrap().status,
            BookingStatus::Processing
        );
    }

    #[tokio::test]
    async fn secondary_lookups() {
        let store = JournaledStore::open(&test_wal_path("lookups.wal")).unwrap();
        let confirmed = store.create(sample("ana", 1, day(5), BookingStatus::Confirmed)).await.unwrap();
        store.create(sample("ana", 1, day(5), BookingStatus::Failed)).await.unwrap();
        store.create(sample("ana", 2, day(5), BookingStatus::Pending)).await.unwrap();
        store.create(sample("ben", 1, day(6), BookingStatus::Pending)).await.unwrap();

        let slot = confirmed.time_slot;
        let conflicts = store.query_conflicts(1, day(5), &slot).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].request_id, confirmed.request_id);
        assert!(store.query_conflicts(2, day(5), &slot).await.unwrap().is_empty());

        // FAILED does not count toward the quota.
        assert_eq!(store.query_user_bookings_on_date("ana", day(5)).await.unwrap().len(), 2);
        assert_eq!(store.query_by_status(BookingStatus::Pending, 10).await.unwrap().len(), 2);
        assert_eq!(store.query_by_status(BookingStatus::Pending, 1).await.unwrap().len(), 1);
        assert_eq!(store.query_by_user("ana", 10, 0).await.unwrap().len(), 3);
        assert_eq!(store.query_by_user("ana", 10, 2).await.unwrap().len(), 1);

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts[&BookingStatus::Pending], 2);
        assert_eq!(counts[&BookingStatus::Expired], 0);
    }

    #[tokio::test]
    async fn older_than_filters_by_age_and_status() {
        let store = JournaledStore::open(&test_wal_path("older_than.wal")).unwrap();
        let old = sample("ana", 1, day(5), BookingStatus::Pending);
        let created = old.created_at;
        let old = store.create(old).await.unwrap();
        let mut fresh = sample("ana", 1, day(6), BookingStatus::Pending);
        fresh.created_at = created + TimeDelta::hours(30);
        store.create(fresh).await.unwrap();

        let cutoff = created + TimeDelta::hours(1);
        let hits = store
            .query_older_than(cutoff, &[BookingStatus::Pending, BookingStatus::Scheduled], 100)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].request_id, old.request_id);
        assert!(store
            .query_older_than(cutoff, &[BookingStatus::Confirmed], 100)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn replay_restores_latest_versions_and_deletes() {
        let path = test_wal_path("replay.wal");
        let (kept, deleted) = {
            let store = JournaledStore::open(&path).unwrap();
            let a = store.create(sample("ana", 1, day(5), BookingStatus::Pending)).await.unwrap();
            let b = store.create(sample("ben", 2, day(6), BookingStatus::Pending)).await.unwrap();
            let mut a2 = a.clone();
            a2.status = BookingStatus::Processing;
            let a2 = store.update_conditionally(a2, a.version).await.unwrap();
            assert!(store.delete(b.request_id).await.unwrap());
            assert!(!store.delete(b.request_id).await.unwrap());
            (a2, b.request_id)
        };

        let store = JournaledStore::open(&path).unwrap();
        assert_eq!(store.get(kept.request_id).await.unwrap(), Some(kept.clone()));
        assert_eq!(store.get(deleted).await.unwrap(), None);
        assert_eq!(store.stale_processing(), vec![kept.request_id]);
    }

    #[tokio::test]
    async fn compaction_preserves_live_records() {
        let path = test_wal_path("compaction.wal");
        let id = {
            let store = JournaledStore::open(&path).unwrap();
            let mut r = store.create(sample("ana", 1, day(5), BookingStatus::Failed)).await.unwrap();
            for _ in 0..20 {
                r.retry_count += 1;
                r = store.update_conditionally(r.clone(), r.version).await.unwrap();
            }
            assert!(!store.compact_if_needed(1000).await.unwrap());
            assert!(store.compact_if_needed(10).await.unwrap());
            assert_eq!(store.appends_since_compact().await, 0);
            r.request_id
        };

        assert_eq!(crate::wal::Replay::read(&path).unwrap().events.len(), 1);
        let store = JournaledStore::open(&path).unwrap();
        let r = store.get(id).await.unwrap().unwrap();
        assert_eq!(r.retry_count, 20);
        assert_eq!(r.version, 21);
    }
}
