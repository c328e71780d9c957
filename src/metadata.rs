//! Object and extended metadata records
//!
//! Object metadata lives in the bucket's object-list index keyed by object
//! key. Fragment lists of objects written in fault mode live in the bucket's
//! extended index keyed by `"{key}|{version_id}"`, one entry per part number.
//! Both are stored as JSON.
//!
//! [`MetadataStore`] wraps the backend calls for these records; every call
//! completes through the event loop.

use crate::backend::{Backend, BackendError, IndexId};
use crate::core::event_loop::EventLoop;
use crate::core::join::JoinOutcome;
use crate::core::oid::{IdAllocator, ObjectId};
use crate::config::IdMode;
use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

/// Indexes owned by one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketIndexes {
    pub bucket: String,
    pub object_list: IndexId,
    pub extended: IndexId,
}

impl BucketIndexes {
    pub fn new(bucket: impl Into<String>, object_list: IndexId, extended: IndexId) -> Self {
        BucketIndexes {
            bucket: bucket.into(),
            object_list,
            extended,
        }
    }

    /// Deterministic index ids for a bucket name
    pub fn derive(bucket: &str) -> Self {
        let alloc = IdAllocator::new(IdMode::Deterministic, 0);
        BucketIndexes {
            bucket: bucket.to_string(),
            object_list: alloc.generate(&format!("{}/object_list_index", bucket)),
            extended: alloc.generate(&format!("{}/extended_metadata_index", bucket)),
        }
    }
}

/// One backend object holding a contiguous slice of a logical object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentDescriptor {
    pub object_id: ObjectId,
    pub layout_id: u8,
    pub byte_size: u64,
    pub sequence_index: u32,
}

/// Per-object metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub bucket: String,
    pub key: String,
    pub object_id: ObjectId,
    pub layout_id: u8,
    pub content_length: u64,
    pub md5: String,
    pub etag: String,
    pub version_id: String,
    #[serde(default)]
    pub fragmented: bool,
    #[serde(default)]
    pub fragment_count: u32,
    pub created: DateTime<Utc>,
}

impl ObjectMetadata {
    /// Fresh metadata with a new version id
    pub fn new(bucket: &str, key: &str, object_id: ObjectId, layout_id: u8) -> Self {
        ObjectMetadata {
            bucket: bucket.to_string(),
            key: key.to_string(),
            object_id,
            layout_id,
            content_length: 0,
            md5: String::new(),
            etag: String::new(),
            version_id: uuid::Uuid::new_v4().simple().to_string(),
            fragmented: false,
            fragment_count: 0,
            created: Utc::now(),
        }
    }

    /// Key of this version's extended metadata
    pub fn extended_key(&self) -> String {
        format!("{}|{}", self.key, self.version_id)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Fragment lists of one object version, keyed by part number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedMetadata {
    pub bucket: String,
    pub key: String,
    pub version_id: String,
    pub parts: BTreeMap<u32, Vec<FragmentDescriptor>>,
}

impl ExtendedMetadata {
    pub fn new(meta: &ObjectMetadata) -> Self {
        ExtendedMetadata {
            bucket: meta.bucket.clone(),
            key: meta.key.clone(),
            version_id: meta.version_id.clone(),
            parts: BTreeMap::new(),
        }
    }

    pub fn set_fragments(&mut self, part_number: u32, fragments: Vec<FragmentDescriptor>) {
        self.parts.insert(part_number, fragments);
    }

    pub fn fragments(&self, part_number: u32) -> &[FragmentDescriptor] {
        self.parts.get(&part_number).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every fragment across all parts
    pub fn all_fragments(&self) -> impl Iterator<Item = &FragmentDescriptor> {
        self.parts.values().flatten()
    }

    pub fn total_size(&self) -> u64 {
        self.all_fragments().map(|f| f.byte_size).sum()
    }

    /// Check that each part's sequence indices run 0..k
    pub fn check(&self) -> Result<()> {
        for (part, frags) in &self.parts {
            for (expected, frag) in frags.iter().enumerate() {
                if frag.sequence_index != expected as u32 {
                    return Err(GatewayError::Internal(format!(
                        "part {} fragment {} has sequence index {}",
                        part, expected, frag.sequence_index
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Map a failed join to the error class the caller should see
pub(crate) fn join_failure(outcome: &JoinOutcome, what: &str) -> GatewayError {
    if outcome.launch_failed() {
        return GatewayError::unavailable(format!("{}: backend call failed to launch", what));
    }
    match outcome.first_error() {
        Some(err) => GatewayError::Internal(format!("{}: {}", what, err)),
        None => GatewayError::Internal(format!("{}: incomplete", what)),
    }
}

/// Async accessors for object and extended metadata
#[derive(Clone)]
pub struct MetadataStore {
    backend: Arc<dyn Backend>,
}

impl MetadataStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        MetadataStore { backend }
    }

    /// Load object metadata; `Ok(None)` if the key has none
    pub fn load<F>(&self, lp: &EventLoop, indexes: &BucketIndexes, key: &str, done: F)
    where
        F: FnOnce(Result<Option<ObjectMetadata>>) + 'static,
    {
        self.get_json(lp, indexes.object_list, key.to_string(), "load metadata", done);
    }

    /// Load extended metadata; `Ok(None)` if absent
    pub fn load_extended<F>(&self, lp: &EventLoop, indexes: &BucketIndexes, meta: &ObjectMetadata, done: F)
    where
        F: FnOnce(Result<Option<ExtendedMetadata>>) + 'static,
    {
        self.get_json(lp, indexes.extended, meta.extended_key(), "load extended metadata", done);
    }

    /// Save metadata and, for fragmented objects, extended metadata
    ///
    /// The extended record goes first so the object-list entry never points
    /// at a fragment list that is not there yet. Both must be written for the
    /// save to count.
    pub fn save<F>(
        &self,
        lp: &Rc<EventLoop>,
        indexes: &BucketIndexes,
        meta: &ObjectMetadata,
        extended: Option<&ExtendedMetadata>,
        done: F,
    ) where
        F: FnOnce(Result<()>) + 'static,
    {
        let primary = match meta.to_json() {
            Ok(json) => (indexes.object_list, meta.key.clone(), json),
            Err(err) => {
                lp.defer("save metadata", move || done(Err(err)));
                return;
            }
        };
        let Some(ext) = extended else {
            self.put_one(lp, primary, "save metadata", done);
            return;
        };
        let ext_json = match ext.to_json() {
            Ok(json) => json,
            Err(err) => {
                lp.defer("save extended metadata", move || done(Err(err)));
                return;
            }
        };

        let store = self.clone();
        let loop_ref = lp.clone();
        self.put_one(
            lp,
            (indexes.extended, meta.extended_key(), ext_json),
            "save extended metadata",
            move |res| match res {
                Ok(()) => store.put_one(&loop_ref, primary, "save metadata", done),
                Err(err) => done(Err(err)),
            },
        );
    }

    fn put_one<F>(&self, lp: &EventLoop, entry: (IndexId, String, String), what: &'static str, done: F)
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let backend = self.backend.clone();
        let mut entry = Some(entry);
        lp.launch_then(
            what,
            1,
            move |c| {
                if let Some((index, key, value)) = entry.take() {
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

    /// Delete metadata keys (and any extended keys) as one join
    ///
    /// The raw outcome is handed back so callers can tell per-key results
    /// apart; slot `i` is `entries[i]`.
    pub fn remove<S, F>(&self, lp: &EventLoop, entries: Vec<(IndexId, String)>, on_success: S, on_failed: F)
    where
        S: FnOnce(JoinOutcome) + 'static,
        F: FnOnce(JoinOutcome) + 'static,
    {
        let backend = self.backend.clone();
        let mut pending = entries.into_iter();
        lp.launch(
            "remove metadata",
            pending.len(),
            move |c| {
                if let Some((index, key)) = pending.next() {
                    backend.kv_delete(index, key, c.into_op_callback());
                }
            },
            on_success,
            on_failed,
        );
    }

    fn get_json<T, F>(&self, lp: &EventLoop, index: IndexId, key: String, what: &'static str, done: F)
    where
        T: for<'de> Deserialize<'de> + 'static,
        F: FnOnce(Result<Option<T>>) + 'static,
    {
        let backend = self.backend.clone();
        let mut key = Some(key);
        lp.launch_then(
            what,
            1,
            move |c| {
                if let Some(key) = key.take() {
                    backend.kv_get(index, key, c.into_value_callback());
                }
            },
            move |outcome| {
                let result = match (outcome.value(0), outcome.error(0)) {
                    (Some(text), _) => serde_json::from_str::<T>(text)
                        .map(Some)
                        .map_err(GatewayError::from),
                    (None, Some(BackendError::NotFound)) => Ok(None),
                    (None, _) => Err(join_failure(&outcome, what)),
                };
                done(result);
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ObjectMetadata {
        ObjectMetadata::new("photos", "cat.jpg", ObjectId::from_parts(1, 2), 3)
    }

    #[test]
    fn test_metadata_json_round_trip() {
        let mut m = meta();
        m.content_length = 42;
        m.md5 = "abc".into();
        let back = ObjectMetadata::from_json(&m.to_json().unwrap()).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_extended_key_includes_version() {
        let m = meta();
        assert_eq!(m.extended_key(), format!("cat.jpg|{}", m.version_id));
    }

    #[test]
    fn test_extended_metadata_accounting() {
        let m = meta();
        let mut ext = ExtendedMetadata::new(&m);
        ext.set_fragments(
            1,
            vec![
                FragmentDescriptor {
                    object_id: ObjectId::from_parts(1, 2),
                    layout_id: 3,
                    byte_size: 100,
                    sequence_index: 0,
                },
                FragmentDescriptor {
                    object_id: ObjectId::from_parts(1, 3),
                    layout_id: 3,
                    byte_size: 50,
                    sequence_index: 1,
                },
            ],
        );
        assert_eq!(ext.total_size(), 150);
        assert_eq!(ext.fragments(1).len(), 2);
        assert!(ext.fragments(2).is_empty());
        assert!(ext.check().is_ok());

        ext.parts.get_mut(&1).unwrap()[1].sequence_index = 5;
        assert!(ext.check().is_err());
    }

    #[test]
    fn test_derived_indexes_are_stable_and_distinct() {
        let a = BucketIndexes::derive("photos");
        let b = BucketIndexes::derive("photos");
        let c = BucketIndexes::derive("videos");
        assert_eq!(a, b);
        assert_ne!(a.object_list, a.extended);
        assert_ne!(a.object_list, c.object_list);
    }
}
