//! In-memory implementations of the collaborator traits.
//!
//! Used by unit and integration tests. Each double keeps its state behind
//! `std::sync` locks and can inject a number of transient failures so
//! retry paths can be exercised without real infrastructure.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    ArrivalBuffer, BufferedMessage, CommitOutcome, Delivery, DeliveryError, ExecutionStore,
    ImportBatch, ImportSink, ObjectStore, StartOutcome, StoredObject,
};
use crate::error::{ReadError, StoreError};
use crate::event::UNVERSIONED;
use crate::format::rows::MeasurementRows;
use crate::machine::{Execution, ExecutionState};
use crate::models::{ExecutionId, FileDescriptor, FileType, NotificationEvent};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

/// Decrement a failure budget; true if a failure should be injected.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ── Object store ────────────────────────────────────────────────────────

#[derive(Default)]
struct Versions {
    /// Versions in write order; the last one is current.
    order: Vec<String>,
    content: HashMap<String, Vec<u8>>,
}

/// Versioned object store. Reading version `"null"` returns the current
/// version of the key.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, Versions>>,
    read_failures: AtomicU32,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, version: &str, bytes: Vec<u8>) {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let entry = objects.entry(key.to_string()).or_default();
        entry.order.retain(|v| v != version);
        entry.order.push(version.to_string());
        entry.content.insert(version.to_string(), bytes);
    }

    pub fn delete_version(&self, key: &str, version: &str) {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = objects.get_mut(key) {
            entry.order.retain(|v| v != version);
            entry.content.remove(version);
        }
    }

    /// Fail the next `n` reads with [`ReadError::Unavailable`].
    pub fn fail_next_reads(&self, n: u32) {
        self.read_failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn read(&self, key: &str, version: &str) -> Result<Vec<u8>, ReadError> {
        if take_failure(&self.read_failures) {
            return Err(ReadError::Unavailable("injected read failure".into()));
        }
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        let not_found = || ReadError::NotFound {
            key: key.to_string(),
            version: version.to_string(),
        };
        let entry = objects.get(key).ok_or_else(not_found)?;
        let version = if version == UNVERSIONED {
            entry.order.last().ok_or_else(not_found)?.as_str()
        } else {
            version
        };
        entry.content.get(version).cloned().ok_or_else(not_found)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, ReadError> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(key, v)| {
                let current = v.order.last()?;
                Some(StoredObject {
                    key: key.clone(),
                    etag: Some(current.clone()),
                    size: v.content.get(current).map(|b| b.len() as u64).unwrap_or(0),
                    last_modified: None,
                })
            })
            .collect())
    }
}

// ── Arrival buffer ──────────────────────────────────────────────────────

struct QueuedMessage {
    id: u64,
    body: String,
    receive_count: u32,
    visible_at: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
}

/// Queue with a visibility timeout and a dead-letter list.
pub struct InMemoryBuffer {
    queue: Mutex<(u64, Vec<QueuedMessage>)>,
    dead: Mutex<Vec<String>>,
    visibility_timeout: Duration,
    max_receive_count: u32,
    ack_failures: AtomicU32,
}

impl InMemoryBuffer {
    pub fn new(visibility_timeout: Duration, max_receive_count: u32) -> Self {
        Self {
            queue: Mutex::new((0, Vec::new())),
            dead: Mutex::new(Vec::new()),
            visibility_timeout,
            max_receive_count,
            ack_failures: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` calls to `ack` with [`StoreError::Unavailable`].
    pub fn fail_next_acks(&self, n: u32) {
        self.ack_failures.store(n, Ordering::SeqCst);
    }

    pub fn push(&self, body: impl Into<String>) {
        let now = Utc::now();
        let mut guard = lock(&self.queue);
        let (next_id, queue) = &mut *guard;
        *next_id += 1;
        queue.push(QueuedMessage {
            id: *next_id,
            body: body.into(),
            receive_count: 0,
            visible_at: now,
            enqueued_at: now,
        });
    }

    /// Messages still in the queue, visible or not.
    pub fn len(&self) -> usize {
        lock(&self.queue).1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_letters(&self) -> Vec<String> {
        lock(&self.dead).clone()
    }
}

#[async_trait]
impl ArrivalBuffer for InMemoryBuffer {
    async fn receive(&self, max: usize) -> Result<Vec<BufferedMessage>, StoreError> {
        let now = Utc::now();
        let mut guard = lock(&self.queue);
        let queue = &mut guard.1;

        let (exhausted, kept): (Vec<_>, Vec<_>) = std::mem::take(queue)
            .into_iter()
            .partition(|m| m.visible_at <= now && m.receive_count >= self.max_receive_count);
        *queue = kept;
        lock(&self.dead).extend(exhausted.into_iter().map(|m| m.body));

        let mut out = Vec::new();
        for m in queue.iter_mut().filter(|m| m.visible_at <= now).take(max) {
            m.receive_count += 1;
            m.visible_at = now + to_chrono(self.visibility_timeout);
            out.push(BufferedMessage {
                receipt: m.id.to_string(),
                body: m.body.clone(),
                receive_count: m.receive_count,
                enqueued_at: m.enqueued_at,
            });
        }
        Ok(out)
    }

    async fn ack(&self, receipt: &str) -> Result<(), StoreError> {
        if take_failure(&self.ack_failures) {
            return Err(StoreError::Unavailable("ack failed".to_string()));
        }
        lock(&self.queue).1.retain(|m| m.id.to_string() != receipt);
        Ok(())
    }

    async fn release(&self, receipt: &str, delay: Duration) -> Result<(), StoreError> {
        let visible_at = Utc::now() + to_chrono(delay);
        for m in lock(&self.queue).1.iter_mut() {
            if m.id.to_string() == receipt {
                m.visible_at = visible_at;
            }
        }
        Ok(())
    }
}

// ── Execution store ─────────────────────────────────────────────────────

struct Entry {
    execution: Execution,
    lease: Option<(String, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct InMemoryExecutionStore {
    entries: Mutex<HashMap<ExecutionId, Entry>>,
    start_failures: AtomicU32,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls to `start` with [`StoreError::Unavailable`].
    pub fn fail_next_starts(&self, n: u32) {
        self.start_failures.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn start(
        &self,
        id: &ExecutionId,
        descriptor: &FileDescriptor,
    ) -> Result<StartOutcome, StoreError> {
        if take_failure(&self.start_failures) {
            return Err(StoreError::Unavailable("injected start failure".into()));
        }
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.get(id) {
            return Ok(StartOutcome {
                execution: existing.execution.clone(),
                created: false,
            });
        }
        let mut execution = Execution::new(descriptor.clone(), Utc::now());
        execution.id = id.clone();
        entries.insert(
            id.clone(),
            Entry {
                execution: execution.clone(),
                lease: None,
            },
        );
        Ok(StartOutcome {
            execution,
            created: true,
        })
    }

    async fn load(&self, id: &ExecutionId) -> Result<Option<Execution>, StoreError> {
        Ok(lock(&self.entries).get(id).map(|e| e.execution.clone()))
    }

    async fn save(
        &self,
        expected_version: i64,
        execution: &Execution,
    ) -> Result<bool, StoreError> {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(&execution.id) else {
            return Ok(false);
        };
        if entry.execution.version != expected_version || entry.execution.is_terminal() {
            return Ok(false);
        }
        let mut stored = execution.clone();
        stored.version = expected_version + 1;
        entry.execution = stored;
        Ok(true)
    }

    async fn claim(
        &self,
        id: &ExecutionId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(id) else {
            return Ok(false);
        };
        match &entry.lease {
            Some((holder, expires)) if holder != owner && *expires > now => Ok(false),
            _ => {
                entry.lease = Some((owner.to_string(), now + to_chrono(ttl)));
                Ok(true)
            }
        }
    }

    async fn release(&self, id: &ExecutionId, owner: &str) -> Result<(), StoreError> {
        if let Some(entry) = lock(&self.entries).get_mut(id) {
            if matches!(&entry.lease, Some((holder, _)) if holder == owner) {
                entry.lease = None;
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        state: Option<ExecutionState>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let entries = lock(&self.entries);
        let mut out: Vec<Execution> = entries
            .values()
            .map(|e| e.execution.clone())
            .filter(|e| state.map_or(true, |s| e.state == s))
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.as_str().cmp(b.id.as_str())));
        out.truncate(limit);
        Ok(out)
    }

    async fn resumable(&self, limit: usize) -> Result<Vec<ExecutionId>, StoreError> {
        let now = Utc::now();
        let entries = lock(&self.entries);
        let mut ids: Vec<ExecutionId> = entries
            .values()
            .filter(|e| !e.execution.is_terminal())
            .filter(|e| e.execution.retry_at.map_or(true, |due| due <= now))
            .filter(|e| e.lease.as_ref().map_or(true, |(_, expires)| *expires <= now))
            .map(|e| e.execution.id.clone())
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids.truncate(limit);
        Ok(ids)
    }
}

// ── Import sink ─────────────────────────────────────────────────────────

/// Natural keys of the rows in a batch, matching the relational tables'
/// primary keys.
pub fn natural_keys(rows: &MeasurementRows) -> Vec<String> {
    match rows {
        MeasurementRows::Spectra(r) => r.iter().map(|s| format!("{}/{}", s.stw, s.backend)).collect(),
        MeasurementRows::Mechanism(r) => r.iter().map(|m| m.stw.to_string()).collect(),
        MeasurementRows::Housekeeping(r) => {
            r.iter().map(|h| format!("{}/{}", h.stw, h.shk_type)).collect()
        }
        MeasurementRows::Attitude(r) => r.iter().map(|a| a.stw.to_string()).collect(),
    }
}

#[derive(Default)]
struct SinkState {
    committed: HashSet<(String, String)>,
    rows: HashMap<FileType, HashSet<String>>,
    commits: usize,
}

#[derive(Default)]
pub struct InMemoryImportSink {
    state: Mutex<SinkState>,
    failures: AtomicU32,
}

impl InMemoryImportSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` commits with [`StoreError::Unavailable`].
    pub fn fail_next_commits(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Distinct rows stored for a file type.
    pub fn row_count(&self, file_type: FileType) -> usize {
        lock(&self.state).rows.get(&file_type).map_or(0, |r| r.len())
    }

    /// Transactions that wrote rows.
    pub fn commit_count(&self) -> usize {
        lock(&self.state).commits
    }
}

#[async_trait]
impl ImportSink for InMemoryImportSink {
    async fn commit(&self, batch: &ImportBatch) -> Result<CommitOutcome, StoreError> {
        if take_failure(&self.failures) {
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }
        let mut state = lock(&self.state);
        let key = (
            batch.source_object_key.clone(),
            batch.source_object_version.clone(),
        );
        if !state.committed.insert(key) {
            return Ok(CommitOutcome::AlreadyCommitted);
        }
        state
            .rows
            .entry(batch.file_type)
            .or_default()
            .extend(natural_keys(&batch.rows));
        state.commits += 1;
        Ok(CommitOutcome::Committed {
            rows: batch.rows.len() as u64,
        })
    }
}

// ── Delivery ────────────────────────────────────────────────────────────

/// Records delivered events; can fail transiently or reject everything.
#[derive(Default)]
pub struct RecordingDelivery {
    events: Mutex<Vec<NotificationEvent>>,
    failures: AtomicU32,
    rejecting: bool,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// A delivery that rejects every event permanently.
    pub fn rejecting() -> Self {
        Self {
            rejecting: true,
            ..Self::default()
        }
    }

    /// Fail the next `n` deliveries with [`DeliveryError::Transient`].
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        if self.rejecting {
            return Err(DeliveryError::Rejected("subscriber refuses events".into()));
        }
        if take_failure(&self.failures) {
            return Err(DeliveryError::Transient("injected delivery failure".into()));
        }
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::rows::FbaRecord;

    fn descriptor(key: &str) -> FileDescriptor {
        FileDescriptor::new(key, "v1", Utc::now())
    }

    #[tokio::test]
    async fn test_object_store_versions() {
        let store = InMemoryObjectStore::new();
        store.put("fba/a.fba", "v1", vec![1]);
        store.put("fba/a.fba", "v2", vec![2]);
        assert_eq!(store.read("fba/a.fba", "v1").await.unwrap(), vec![1]);
        assert_eq!(store.read("fba/a.fba", UNVERSIONED).await.unwrap(), vec![2]);

        store.delete_version("fba/a.fba", "v1");
        assert!(matches!(
            store.read("fba/a.fba", "v1").await,
            Err(ReadError::NotFound { .. })
        ));

        store.fail_next_reads(1);
        assert!(matches!(
            store.read("fba/a.fba", "v2").await,
            Err(ReadError::Unavailable(_))
        ));
        assert!(store.read("fba/a.fba", "v2").await.is_ok());

        let listed = store.list("fba/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].etag.as_deref(), Some("v2"));
        assert!(store.list("shk/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_buffer_visibility_and_dead_letters() {
        let buffer = InMemoryBuffer::new(Duration::from_secs(3600), 2);
        buffer.push("a");
        let first = buffer.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(buffer.receive(10).await.unwrap().is_empty());

        buffer.release(&first[0].receipt, Duration::ZERO).await.unwrap();
        let second = buffer.receive(10).await.unwrap();
        assert_eq!(second[0].receive_count, 2);

        buffer.release(&second[0].receipt, Duration::ZERO).await.unwrap();
        assert!(buffer.receive(10).await.unwrap().is_empty());
        assert_eq!(buffer.dead_letters(), vec!["a".to_string()]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_execution_store_cas_and_terminal() {
        let store = InMemoryExecutionStore::new();
        let d = descriptor("L0/x/0ce86a42.ac1");
        let id = d.execution_id();
        let started = store.start(&id, &d).await.unwrap();
        assert!(started.created);
        assert!(!store.start(&id, &d).await.unwrap().created);

        let mut e = started.execution;
        e.state = ExecutionState::Routing;
        assert!(store.save(0, &e).await.unwrap());
        assert!(!store.save(0, &e).await.unwrap());

        e.state = ExecutionState::Failed;
        assert!(store.save(1, &e).await.unwrap());
        e.state = ExecutionState::Pending;
        assert!(!store.save(2, &e).await.unwrap());
        assert_eq!(
            store.load(&id).await.unwrap().unwrap().state,
            ExecutionState::Failed
        );
    }

    #[tokio::test]
    async fn test_leases() {
        let store = InMemoryExecutionStore::new();
        let d = descriptor("L0/x/0ce86a42.fba");
        let id = d.execution_id();
        store.start(&id, &d).await.unwrap();

        assert_eq!(store.resumable(10).await.unwrap(), vec![id.clone()]);
        assert!(store.claim(&id, "w1", Duration::from_secs(60)).await.unwrap());
        assert!(!store.claim(&id, "w2", Duration::from_secs(60)).await.unwrap());
        assert!(store.resumable(10).await.unwrap().is_empty());

        store.release(&id, "w1").await.unwrap();
        assert!(store.claim(&id, "w2", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_sink_is_idempotent() {
        let sink = InMemoryImportSink::new();
        let batch = ImportBatch {
            source_object_key: "fba/a.fba".into(),
            source_object_version: "v1".into(),
            file_type: FileType::Fba,
            rows: MeasurementRows::Mechanism(vec![
                FbaRecord { stw: 1, mech_type: "REF".into() },
                FbaRecord { stw: 2, mech_type: "SK1".into() },
            ]),
            import_timestamp: Utc::now(),
        };
        assert_eq!(
            sink.commit(&batch).await.unwrap(),
            CommitOutcome::Committed { rows: 2 }
        );
        assert_eq!(
            sink.commit(&batch).await.unwrap(),
            CommitOutcome::AlreadyCommitted
        );
        assert_eq!(sink.row_count(FileType::Fba), 2);
        assert_eq!(sink.commit_count(), 1);
    }
}
