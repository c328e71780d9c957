//! Probable-delete (tombstone) ledger
//!
//! A write-ahead record of every object id that may become garbage if the
//! operation touching it never finishes. Records live as JSON values in one
//! well-known index:
//!
//! - a new object or fragment is keyed by its own id
//! - a superseded object is keyed `"{old}-{new}"`, so two overwrites racing on
//!   the same old object never share a record
//!
//! With key bucketing on, every key is prefixed by a size-class character
//! (the layout id as a hex digit). That only spreads ledger load.
//!
//! Lifecycle of a record:
//! 1. [`record_pending`](TombstoneLedger::record_pending) before the object is
//!    created or superseded
//! 2. [`mark_unreachable`](TombstoneLedger::mark_unreachable) once no durable
//!    index references the object (`force_delete = true`)
//! 3. [`retire`](TombstoneLedger::retire) after the object is gone from the
//!    backend
//!
//! A crash anywhere in between leaves the record for the reaper.

use crate::backend::{Backend, BackendError, IndexId};
use crate::config::GatewayConfig;
use crate::core::event_loop::EventLoop;
use crate::core::join::Payload;
use crate::core::oid::ObjectId;
use crate::error::Result;
use crate::metadata::{join_failure, BucketIndexes, FragmentDescriptor, ObjectMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// One ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneRecord {
    /// Ledger key, including any bucket prefix
    pub key: String,
    /// Object this record protects
    pub object_id: ObjectId,
    /// For a new object: the id it replaces (zero if none)
    pub old_object_id: ObjectId,
    /// First object of the logical object; differs from `object_id` for fragments
    pub primary_object_id: ObjectId,
    pub layout_id: u8,
    pub bucket: String,
    pub object_name: String,
    pub object_list_index: IndexId,
    pub extended_index: IndexId,
    /// Metadata version that referenced the object, if any
    #[serde(default)]
    pub version_id: Option<String>,
    pub force_delete: bool,
    #[serde(default)]
    pub fragment_index: Option<u32>,
    pub instance_id: String,
    pub created: DateTime<Utc>,
}

impl TombstoneRecord {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_index.is_some()
    }
}

/// One listed ledger entry; malformed values are surfaced, not dropped
pub type LedgerEntry = (String, Result<TombstoneRecord>);

/// Ledger client bound to one index
#[derive(Clone)]
pub struct TombstoneLedger {
    backend: Arc<dyn Backend>,
    index: IndexId,
    bucket_keys: bool,
    instance_id: String,
}

impl TombstoneLedger {
    pub fn new(backend: Arc<dyn Backend>, config: &GatewayConfig) -> Self {
        TombstoneLedger {
            backend,
            index: config.ledger.index_id,
            bucket_keys: config.ledger.bucket_keys,
            instance_id: config.instance.instance_id.clone(),
        }
    }

    pub fn index(&self) -> IndexId {
        self.index
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn prefix(&self, layout_id: u8) -> String {
        if !self.bucket_keys {
            return String::new();
        }
        char::from_digit(u32::from(layout_id) & 0xF, 16)
            .map(String::from)
            .unwrap_or_default()
    }

    /// Key for a new object or fragment
    pub fn key_for(&self, oid: ObjectId, layout_id: u8) -> String {
        format!("{}{}", self.prefix(layout_id), oid)
    }

    /// Key for an object superseded by `new`
    pub fn key_for_superseded(&self, old: ObjectId, new: ObjectId, layout_id: u8) -> String {
        format!("{}{}-{}", self.prefix(layout_id), old, new)
    }

    fn record(
        &self,
        key: String,
        indexes: &BucketIndexes,
        object_name: &str,
        object_id: ObjectId,
        layout_id: u8,
    ) -> TombstoneRecord {
        TombstoneRecord {
            key,
            object_id,
            old_object_id: ObjectId::ZERO,
            primary_object_id: object_id,
            layout_id,
            bucket: indexes.bucket.clone(),
            object_name: object_name.to_string(),
            object_list_index: indexes.object_list,
            extended_index: indexes.extended,
            version_id: None,
            force_delete: false,
            fragment_index: None,
            instance_id: self.instance_id.clone(),
            created: Utc::now(),
        }
    }

    /// Record for an object about to be created in place of `old`
    pub fn new_object_record(
        &self,
        indexes: &BucketIndexes,
        object_name: &str,
        new: ObjectId,
        old: ObjectId,
        layout_id: u8,
    ) -> TombstoneRecord {
        let mut record = self.record(self.key_for(new, layout_id), indexes, object_name, new, layout_id);
        record.old_object_id = old;
        record
    }

    /// Record for a live object that `new` is about to supersede
    pub fn superseded_record(
        &self,
        indexes: &BucketIndexes,
        object_name: &str,
        old: ObjectId,
        new: ObjectId,
        old_layout_id: u8,
        old_version_id: &str,
    ) -> TombstoneRecord {
        let mut record = self.record(
            self.key_for_superseded(old, new, old_layout_id),
            indexes,
            object_name,
            old,
            old_layout_id,
        );
        record.version_id = Some(old_version_id.to_string());
        record
    }

    /// Record for fragment `fragment_index` of the logical object `primary`
    pub fn fragment_record(
        &self,
        indexes: &BucketIndexes,
        object_name: &str,
        fragment: ObjectId,
        primary: ObjectId,
        layout_id: u8,
        fragment_index: u32,
    ) -> TombstoneRecord {
        let mut record = self.record(self.key_for(fragment, layout_id), indexes, object_name, fragment, layout_id);
        record.primary_object_id = primary;
        record.fragment_index = Some(fragment_index);
        record
    }

    /// Record for an object, or one of its fragments, about to be deleted
    pub fn deletion_record(
        &self,
        indexes: &BucketIndexes,
        meta: &ObjectMetadata,
        fragment: Option<&FragmentDescriptor>,
    ) -> TombstoneRecord {
        let (oid, layout_id) = fragment
            .map(|f| (f.object_id, f.layout_id))
            .unwrap_or((meta.object_id, meta.layout_id));
        let mut record = self.record(self.key_for(oid, layout_id), indexes, &meta.key, oid, layout_id);
        record.primary_object_id = meta.object_id;
        record.version_id = Some(meta.version_id.clone());
        record.fragment_index = fragment.map(|f| f.sequence_index);
        record
    }

    /// Durably write records before the mutations they protect
    ///
    /// Every put must succeed; a launch failure maps to ServiceUnavailable,
    /// anything else to InternalError.
    pub fn record_pending<F>(&self, lp: &EventLoop, records: &[TombstoneRecord], done: F)
    where
        F: FnOnce(Result<()>) + 'static,
    {
        self.put_all(lp, records, "record tombstones", done);
    }

    /// Re-write records with `force_delete` set
    pub fn mark_unreachable<F>(&self, lp: &EventLoop, records: &[TombstoneRecord], done: F)
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let flagged: Vec<TombstoneRecord> = records
            .iter()
            .cloned()
            .map(|mut r| {
                r.force_delete = true;
                r
            })
            .collect();
        self.put_all(lp, &flagged, "mark tombstones unreachable", done);
    }

    /// Delete records whose objects are gone; absent records count as retired
    pub fn retire<F>(&self, lp: &EventLoop, keys: Vec<String>, done: F)
    where
        F: FnOnce(Result<()>) + 'static,
    {
        if keys.is_empty() {
            lp.defer("retire tombstones", move || done(Ok(())));
            return;
        }
        debug!("Retiring {} tombstones", keys.len());
        let backend = self.backend.clone();
        let index = self.index;
        let mut pending = keys.into_iter();
        lp.launch_then(
            "retire tombstones",
            pending.len(),
            move |c| {
                if let Some(key) = pending.next() {
                    backend.kv_delete(index, key, c.into_op_callback());
                }
            },
            move |outcome| {
                let failed = outcome
                    .slots()
                    .iter()
                    .any(|s| matches!(&s.error, Some(e) if !e.is_not_found()));
                if failed {
                    done(Err(join_failure(&outcome, "retire tombstones")));
                } else {
                    done(Ok(()));
                }
            },
        );
    }

    /// Read one record
    pub fn get<F>(&self, lp: &EventLoop, key: String, done: F)
    where
        F: FnOnce(Result<Option<TombstoneRecord>>) + 'static,
    {
        let backend = self.backend.clone();
        let index = self.index;
        let mut key = Some(key);
        lp.launch_then(
            "get tombstone",
            1,
            move |c| {
                if let Some(key) = key.take() {
                    backend.kv_get(index, key, c.into_value_callback());
                }
            },
            move |outcome| {
                let result = match (outcome.value(0), outcome.error(0)) {
                    (Some(text), _) => TombstoneRecord::from_json(text).map(Some),
                    (None, Some(BackendError::NotFound)) => Ok(None),
                    (None, _) => Err(join_failure(&outcome, "get tombstone")),
                };
                done(result);
            },
        );
    }

    /// Read whatever records are stored under `keys`
    ///
    /// Absent keys are skipped. Malformed records are skipped with a warning;
    /// the reaper reports them on its own.
    pub fn get_existing<F>(&self, lp: &EventLoop, keys: Vec<String>, done: F)
    where
        F: FnOnce(Result<Vec<TombstoneRecord>>) + 'static,
    {
        if keys.is_empty() {
            lp.defer("read tombstones", move || done(Ok(Vec::new())));
            return;
        }
        let backend = self.backend.clone();
        let index = self.index;
        let mut pending = keys.into_iter();
        lp.launch_then(
            "read tombstones",
            pending.len(),
            move |c| {
                if let Some(key) = pending.next() {
                    backend.kv_get(index, key, c.into_value_callback());
                }
            },
            move |outcome| {
                let mut found = Vec::new();
                for i in 0..outcome.len() {
                    match (outcome.value(i), outcome.error(i)) {
                        (Some(text), _) => match TombstoneRecord::from_json(text) {
                            Ok(record) => found.push(record),
                            Err(e) => warn!("Skipping malformed tombstone in slot {}: {}", i, e),
                        },
                        (None, Some(BackendError::NotFound)) => {}
                        (None, _) => {
                            done(Err(join_failure(&outcome, "read tombstones")));
                            return;
                        }
                    }
                }
                done(Ok(found));
            },
        );
    }

    /// One page of records in key order, strictly after `after`
    pub fn list<F>(&self, lp: &EventLoop, after: Option<String>, limit: usize, done: F)
    where
        F: FnOnce(Result<Vec<LedgerEntry>>) + 'static,
    {
        let backend = self.backend.clone();
        let index = self.index;
        let mut after = Some(after);
        lp.launch_then(
            "list tombstones",
            1,
            move |c| {
                if let Some(after) = after.take() {
                    backend.kv_next(index, after, limit, c.into_list_callback());
                }
            },
            move |mut outcome| {
                let result = match (outcome.take_payload(0), outcome.error(0)) {
                    (Some(Payload::Entries(entries)), _) => Ok(entries
                        .into_iter()
                        .map(|(key, value)| {
                            let record = TombstoneRecord::from_json(&value);
                            if let Err(e) = &record {
                                warn!("Malformed tombstone {}: {}", key, e);
                            }
                            (key, record)
                        })
                        .collect()),
                    (_, Some(BackendError::NotFound)) => Ok(Vec::new()),
                    _ => Err(join_failure(&outcome, "list tombstones")),
                };
                done(result);
            },
        );
    }

    fn put_all<F>(&self, lp: &EventLoop, records: &[TombstoneRecord], what: &'static str, done: F)
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            match record.to_json() {
                Ok(json) => entries.push((record.key.clone(), json)),
                Err(err) => {
                    lp.defer(what, move || done(Err(err)));
                    return;
                }
            }
        }
        if entries.is_empty() {
            lp.defer(what, move || done(Ok(())));
            return;
        }

        debug!("{}: {} keys", what, entries.len());
        let backend = self.backend.clone();
        let index = self.index;
        let mut pending = entries.into_iter();
        lp.launch_then(
            what,
            pending.len(),
            move |c| {
                if let Some((key, value)) = pending.next() {
                    backend.kv_put(index, key, value, c.into_op_callback());
                }
            },
            move |outcome| {
                if outcome.all_succeeded() {
                    done(Ok(()));
                } else {
                    done(Err(join_failure(&outcome, what)));
                }
            },
        );
    }
}
