//! In-memory backend with fault injection
//!
//! Objects and KV indexes live in process memory. Every call is queued to a
//! small worker pool, so callbacks run on worker threads exactly like a real
//! cluster client. Completion order across workers is not deterministic.
//!
//! A [`FaultPlan`] can:
//! - fail chosen write operations (by 1-based ordinal) or a random share of them
//! - fail every KV operation on chosen keys
//! - fail the next N calls at launch
//! - stall an index (calls neither apply nor complete until released)

use super::{Backend, BackendError, BackendResult, IndexId, ListCallback, OpCallback, ValueCallback};
use crate::core::layout::LayoutDescriptor;
use crate::core::oid::ObjectId;
use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Errno used for injected I/O failures
const EIO: i32 = -5;

/// Fault injection settings
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// 1-based ordinals of `write_object` calls that fail
    pub failing_writes: BTreeSet<u64>,
    /// Probability in [0, 1] that any write fails
    pub write_fault_rate: f64,
    /// Error reported by failing writes; I/O error when unset
    pub write_error: Option<BackendError>,
    /// KV keys whose operations fail
    pub failing_keys: AHashSet<String>,
    /// Objects whose deletes fail
    pub failing_objects: AHashSet<ObjectId>,
    /// Number of upcoming calls that fail to launch
    pub launch_failures: u32,
    /// Indexes whose operations are held without completing
    pub stalled_indexes: AHashSet<IndexId>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(mut self, ordinals: impl IntoIterator<Item = u64>) -> Self {
        self.failing_writes.extend(ordinals);
        self
    }

    pub fn with_write_fault_rate(mut self, rate: f64) -> Self {
        self.write_fault_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_write_error(mut self, err: BackendError) -> Self {
        self.write_error = Some(err);
        self
    }

    pub fn fail_key(mut self, key: impl Into<String>) -> Self {
        self.failing_keys.insert(key.into());
        self
    }

    pub fn fail_object(mut self, oid: ObjectId) -> Self {
        self.failing_objects.insert(oid);
        self
    }

    pub fn fail_launches(mut self, count: u32) -> Self {
        self.launch_failures = count;
        self
    }

    pub fn stall_index(mut self, index: IndexId) -> Self {
        self.stalled_indexes.insert(index);
        self
    }
}

/// One backend call, as recorded in the history
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOp {
    Create(ObjectId),
    Write { oid: ObjectId, offset: u64, len: usize },
    Delete(ObjectId),
    KvPut { index: IndexId, key: String },
    KvDelete { index: IndexId, key: String },
}

#[derive(Debug, Clone)]
struct StoredObject {
    layout_id: u8,
    data: Vec<u8>,
}

#[derive(Default)]
struct Store {
    objects: RwLock<AHashMap<ObjectId, StoredObject>>,
    indexes: RwLock<AHashMap<IndexId, BTreeMap<String, String>>>,
    mutations: AtomicU64,
    history: Mutex<Vec<BackendOp>>,
}

impl Store {
    fn mutated(&self, op: BackendOp) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.history.lock().push(op);
    }

    fn create(&self, oid: ObjectId, layout: LayoutDescriptor) -> BackendResult<()> {
        let mut objects = self.objects.write();
        if objects.contains_key(&oid) {
            return Err(BackendError::AlreadyExists);
        }
        objects.insert(
            oid,
            StoredObject {
                layout_id: layout.layout_id,
                data: Vec::new(),
            },
        );
        drop(objects);
        self.mutated(BackendOp::Create(oid));
        Ok(())
    }

    fn write(&self, oid: ObjectId, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut objects = self.objects.write();
        let object = objects.get_mut(&oid).ok_or(BackendError::NotFound)?;
        let start = offset as usize;
        let end = start + data.len();
        if object.data.len() < end {
            object.data.resize(end, 0);
        }
        object.data[start..end].copy_from_slice(data);
        drop(objects);
        self.mutated(BackendOp::Write {
            oid,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn delete(&self, oid: ObjectId) -> BackendResult<()> {
        if self.objects.write().remove(&oid).is_none() {
            return Err(BackendError::NotFound);
        }
        self.mutated(BackendOp::Delete(oid));
        Ok(())
    }

    fn kv_put(&self, index: IndexId, key: String, value: String) -> BackendResult<()> {
        self.indexes
            .write()
            .entry(index)
            .or_default()
            .insert(key.clone(), value);
        self.mutated(BackendOp::KvPut { index, key });
        Ok(())
    }

    fn kv_delete(&self, index: IndexId, key: String) -> BackendResult<()> {
        let removed = self
            .indexes
            .write()
            .get_mut(&index)
            .and_then(|entries| entries.remove(&key));
        if removed.is_none() {
            return Err(BackendError::NotFound);
        }
        self.mutated(BackendOp::KvDelete { index, key });
        Ok(())
    }

    fn kv_get(&self, index: IndexId, key: &str) -> BackendResult<String> {
        self.indexes
            .read()
            .get(&index)
            .and_then(|entries| entries.get(key).cloned())
            .ok_or(BackendError::NotFound)
    }

    fn kv_next(
        &self,
        index: IndexId,
        after: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<(String, String)>> {
        let indexes = self.indexes.read();
        let entries = indexes.get(&index).ok_or(BackendError::NotFound)?;
        let lower = match after {
            Some(marker) => Bound::Excluded(marker.to_string()),
            None => Bound::Unbounded,
        };
        Ok(entries
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

struct Shared {
    store: Store,
    faults: Mutex<FaultPlan>,
    write_seq: AtomicU64,
    stalled: Mutex<Vec<Job>>,
}

/// Thread-pool backed in-memory backend
pub struct InMemoryBackend {
    shared: Arc<Shared>,
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl InMemoryBackend {
    /// Backend with `workers` completion threads
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            store: Store::default(),
            faults: Mutex::new(FaultPlan::default()),
            write_seq: AtomicU64::new(0),
            stalled: Mutex::new(Vec::new()),
        });

        let (tx, rx) = unbounded::<Job>();
        let workers = (0..workers.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("backend-worker-{}", i))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::error!("Failed to spawn backend worker: {}", e);
                    None
                }
            })
            .collect();

        InMemoryBackend {
            shared,
            jobs: Some(tx),
            workers,
        }
    }

    /// Replace the fault plan
    pub fn set_faults(&self, plan: FaultPlan) {
        *self.shared.faults.lock() = plan;
    }

    pub fn clear_faults(&self) {
        self.set_faults(FaultPlan::default());
    }

    /// Fail the next `count` writes, counted from now
    pub fn fail_next_writes(&self, count: u64) {
        let next = self.shared.write_seq.load(Ordering::SeqCst) + 1;
        self.shared
            .faults
            .lock()
            .failing_writes
            .extend(next..next + count);
    }

    /// Stop stalling every index and run the held calls
    pub fn release_stalled(&self) {
        self.shared.faults.lock().stalled_indexes.clear();
        let held: Vec<Job> = std::mem::take(&mut *self.shared.stalled.lock());
        debug!("Releasing {} stalled backend calls", held.len());
        for job in held {
            self.submit(job);
        }
    }

    /// Successful mutations so far
    pub fn mutations(&self) -> u64 {
        self.shared.store.mutations.load(Ordering::SeqCst)
    }

    /// Successful mutations in the order they were applied
    pub fn history(&self) -> Vec<BackendOp> {
        self.shared.store.history.lock().clone()
    }

    pub fn object_data(&self, oid: ObjectId) -> Option<Vec<u8>> {
        self.shared.store.objects.read().get(&oid).map(|o| o.data.clone())
    }

    pub fn object_layout(&self, oid: ObjectId) -> Option<u8> {
        self.shared.store.objects.read().get(&oid).map(|o| o.layout_id)
    }

    pub fn object_exists(&self, oid: ObjectId) -> bool {
        self.shared.store.objects.read().contains_key(&oid)
    }

    pub fn object_count(&self) -> usize {
        self.shared.store.objects.read().len()
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.shared.store.objects.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Insert an object directly, bypassing history and counters
    pub fn seed_object(&self, oid: ObjectId, layout_id: u8, data: &[u8]) {
        self.shared.store.objects.write().insert(
            oid,
            StoredObject {
                layout_id,
                data: data.to_vec(),
            },
        );
    }

    pub fn kv_value(&self, index: IndexId, key: &str) -> Option<String> {
        self.shared.store.kv_get(index, key).ok()
    }

    /// All entries of an index in key order
    pub fn kv_entries(&self, index: IndexId) -> Vec<(String, String)> {
        self.shared
            .store
            .indexes
            .read()
            .get(&index)
            .map(|entries| entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    fn submit(&self, job: Job) {
        match &self.jobs {
            Some(tx) => {
                if let Err(err) = tx.send(job) {
                    // Pool is gone; run inline so the completion still fires.
                    (err.into_inner())();
                }
            }
            None => job(),
        }
    }

    /// Consume one pending launch failure, if any
    fn launch_fails(&self) -> bool {
        let mut faults = self.shared.faults.lock();
        if faults.launch_failures > 0 {
            faults.launch_failures -= 1;
            return true;
        }
        false
    }

    fn key_fails(&self, key: &str) -> bool {
        self.shared.faults.lock().failing_keys.contains(key)
    }

    fn index_stalled(&self, index: IndexId) -> bool {
        self.shared.faults.lock().stalled_indexes.contains(&index)
    }

    /// Queue a KV job, honouring launch failures, failing keys and stalls
    fn kv_job<T, F, C>(&self, index: IndexId, key: Option<&str>, op: F, done: C)
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> BackendResult<T> + Send + 'static,
        C: FnOnce(BackendResult<T>) + Send + 'static,
    {
        if self.launch_fails() {
            done(Err(BackendError::LaunchFailed("injected launch failure".into())));
            return;
        }
        if key.map(|k| self.key_fails(k)).unwrap_or(false) {
            let message = format!("injected failure on key {:?}", key);
            self.submit(Box::new(move || {
                done(Err(BackendError::Failed {
                    code: EIO,
                    message,
                }))
            }));
            return;
        }

        let shared = self.shared.clone();
        let job: Job = Box::new(move || done(op(&shared.store)));
        if self.index_stalled(index) {
            trace!("Stalling call on index {}", index);
            self.shared.stalled.lock().push(job);
        } else {
            self.submit(job);
        }
    }

    fn object_job<F>(&self, op: F, done: OpCallback)
    where
        F: FnOnce(&Store) -> BackendResult<()> + Send + 'static,
    {
        if self.launch_fails() {
            done(Err(BackendError::LaunchFailed("injected launch failure".into())));
            return;
        }
        let shared = self.shared.clone();
        self.submit(Box::new(move || done(op(&shared.store))));
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Drop for InMemoryBackend {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Backend for InMemoryBackend {
    fn create_object(&self, oid: ObjectId, layout: LayoutDescriptor, done: OpCallback) {
        self.object_job(move |store| store.create(oid, layout), done);
    }

    fn write_object(&self, oid: ObjectId, offset: u64, data: Bytes, done: OpCallback) {
        let ordinal = self.shared.write_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let injected = {
            let faults = self.shared.faults.lock();
            let fails = faults.failing_writes.contains(&ordinal)
                || (faults.write_fault_rate > 0.0 && rand::random::<f64>() < faults.write_fault_rate);
            fails.then(|| {
                faults.write_error.clone().unwrap_or(BackendError::Failed {
                    code: EIO,
                    message: "injected write failure".into(),
                })
            })
        };

        if let Some(err) = injected {
            debug!("Injecting failure into write #{} on {}", ordinal, oid);
            self.object_job(move |_| Err(err), done);
            return;
        }
        self.object_job(move |store| store.write(oid, offset, &data), done);
    }

    fn delete_object(&self, oid: ObjectId, _layout_id: u8, done: OpCallback) {
        if self.shared.faults.lock().failing_objects.contains(&oid) {
            self.object_job(
                move |_| {
                    Err(BackendError::Failed {
                        code: EIO,
                        message: format!("injected delete failure on {}", oid),
                    })
                },
                done,
            );
            return;
        }
        self.object_job(move |store| store.delete(oid), done);
    }

    fn kv_put(&self, index: IndexId, key: String, value: String, done: OpCallback) {
        let lookup = key.clone();
        self.kv_job(index, Some(&lookup), move |store| store.kv_put(index, key, value), done);
    }

    fn kv_delete(&self, index: IndexId, key: String, done: OpCallback) {
        let lookup = key.clone();
        self.kv_job(index, Some(&lookup), move |store| store.kv_delete(index, key), done);
    }

    fn kv_get(&self, index: IndexId, key: String, done: ValueCallback) {
        let lookup = key.clone();
        self.kv_job(index, Some(&lookup), move |store| store.kv_get(index, &key), done);
    }

    fn kv_next(&self, index: IndexId, after: Option<String>, limit: usize, done: ListCallback) {
        self.kv_job(
            index,
            None,
            move |store| store.kv_next(index, after.as_deref(), limit),
            done,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    fn wait<T: Send + 'static>(f: impl FnOnce(Box<dyn FnOnce(BackendResult<T>) + Send>)) -> BackendResult<T> {
        let (tx, rx) = bounded(1);
        f(Box::new(move |r| {
            let _ = tx.send(r);
        }));
        rx.recv().unwrap()
    }

    fn oid(n: u64) -> ObjectId {
        ObjectId::from_parts(1, n)
    }

    #[test]
    fn test_object_lifecycle() {
        let backend = InMemoryBackend::new(2);
        let layout = LayoutDescriptor::for_id(1);

        wait(|cb| backend.create_object(oid(1), layout, cb)).unwrap();
        assert_eq!(
            wait(|cb| backend.create_object(oid(1), layout, cb)),
            Err(BackendError::AlreadyExists)
        );
        wait(|cb| backend.write_object(oid(1), 4, Bytes::from_static(b"data"), cb)).unwrap();
        assert_eq!(backend.object_data(oid(1)).unwrap(), b"\0\0\0\0data");

        wait(|cb| backend.delete_object(oid(1), 1, cb)).unwrap();
        assert_eq!(
            wait(|cb| backend.delete_object(oid(1), 1, cb)),
            Err(BackendError::NotFound)
        );
        // create, write, delete; the failed delete is not a mutation
        assert_eq!(backend.mutations(), 3);
    }

    #[test]
    fn test_kv_listing_is_ordered_after_marker() {
        let backend = InMemoryBackend::new(2);
        let index = oid(99);
        for key in ["c", "a", "b", "d"] {
            wait(|cb| backend.kv_put(index, key.into(), key.to_uppercase(), cb)).unwrap();
        }
        let page = wait(|cb| backend.kv_next(index, Some("a".into()), 2, cb)).unwrap();
        assert_eq!(
            page,
            vec![("b".to_string(), "B".to_string()), ("c".to_string(), "C".to_string())]
        );
        assert_eq!(
            wait(|cb| backend.kv_get(index, "zz".into(), cb)),
            Err(BackendError::NotFound)
        );
    }

    #[test]
    fn test_injected_faults() {
        let backend = InMemoryBackend::new(2);
        let layout = LayoutDescriptor::for_id(1);
        wait(|cb| backend.create_object(oid(1), layout, cb)).unwrap();

        backend.fail_next_writes(1);
        assert!(wait(|cb| backend.write_object(oid(1), 0, Bytes::from_static(b"x"), cb)).is_err());
        assert!(wait(|cb| backend.write_object(oid(1), 0, Bytes::from_static(b"x"), cb)).is_ok());

        backend.set_faults(FaultPlan::new().fail_launches(1).fail_key("bad"));
        assert!(matches!(
            wait(|cb| backend.kv_put(oid(2), "ok".into(), "v".into(), cb)),
            Err(BackendError::LaunchFailed(_))
        ));
        assert!(wait(|cb| backend.kv_put(oid(2), "ok".into(), "v".into(), cb)).is_ok());
        assert!(matches!(
            wait(|cb| backend.kv_put(oid(2), "bad".into(), "v".into(), cb)),
            Err(BackendError::Failed { code: EIO, .. })
        ));
    }

    #[test]
    fn test_stalled_index_holds_calls_until_released() {
        let backend = InMemoryBackend::new(2);
        let index = oid(7);
        backend.set_faults(FaultPlan::new().stall_index(index));

        let (tx, rx) = bounded(1);
        backend.kv_put(
            index,
            "k".into(),
            "v".into(),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        assert!(rx.recv_timeout(std::time::Duration::from_millis(50)).is_err());
        assert!(backend.kv_value(index, "k").is_none());

        backend.release_stalled();
        assert!(rx.recv().unwrap().is_ok());
        assert_eq!(backend.kv_value(index, "k").as_deref(), Some("v"));
    }
}
