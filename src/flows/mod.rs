//! Request flows
//!
//! Each request kind is a [`Pipeline`](crate::core::pipeline::Pipeline)
//! assembled from small steps by a builder: validate, look up, record
//! tombstones, mutate, save, respond, clean up. The host starts a flow,
//! drives the event loop, and reads a [`FlowOutcome`] once the pipeline is
//! terminal.

pub mod delete_multiple;
pub mod delete_object;
pub mod put_object;

pub use delete_multiple::{delete_objects_batch, DeleteObjects, KeyOutcome};
pub use delete_object::{delete_object, DeleteObject, DeleteRequest};
pub use put_object::{put_object, PutObject, PutRequest, PutStage};

use crate::backend::BackendError;
use crate::context::GatewayContext;
use crate::core::ledger::TombstoneRecord;
use crate::core::oid::ObjectId;
use crate::core::pipeline::Phase;
use crate::error::{ErrorClass, GatewayError, Result};
use crate::metadata::{BucketIndexes, ExtendedMetadata, ObjectMetadata};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::warn;

/// Longest object key accepted
pub const MAX_KEY_LENGTH: usize = 1024;

/// What the host needs to build a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowOutcome {
    pub request_id: String,
    pub phase: Phase,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub retry_after_secs: Option<u32>,
    pub etag: Option<String>,
    pub fragment_count: u32,
}

impl FlowOutcome {
    pub(crate) fn new(request_id: &str, error: Option<&GatewayError>) -> Self {
        FlowOutcome {
            request_id: request_id.to_string(),
            phase: if error.is_some() {
                Phase::RolledBack
            } else {
                Phase::Completed
            },
            error_class: error.map(|e| e.class()),
            error_message: error.map(|e| e.to_string()),
            retry_after_secs: error.and_then(|e| e.retry_after_secs()),
            etag: None,
            fragment_count: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.phase == Phase::Completed
    }
}

/// Slot written by a pipeline's completion hook
pub(crate) type OutcomeSlot = Rc<RefCell<Option<FlowOutcome>>>;

pub(crate) fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn check_key(bucket: &str, key: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(GatewayError::InvalidArgument("bucket name is empty".into()));
    }
    if key.is_empty() {
        return Err(GatewayError::InvalidArgument("object key is empty".into()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(GatewayError::InvalidArgument(format!(
            "object key is {} bytes, limit is {}",
            key.len(),
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

/// Delete backend objects as one join
///
/// `done` gets one entry per target: `Ok` if the object is gone (deleted now
/// or already absent), the backend error otherwise.
pub(crate) fn delete_objects<F>(ctx: &GatewayContext, targets: Vec<(ObjectId, u8)>, done: F)
where
    F: FnOnce(Vec<std::result::Result<(), BackendError>>) + 'static,
{
    if targets.is_empty() {
        ctx.lp.defer("delete objects", move || done(Vec::new()));
        return;
    }
    let backend = ctx.backend.clone();
    let mut pending = targets.into_iter();
    ctx.lp.launch_then(
        "delete objects",
        pending.len(),
        move |c| {
            if let Some((oid, layout_id)) = pending.next() {
                backend.delete_object(oid, layout_id, c.into_op_callback());
            }
        },
        move |outcome| {
            let results = (0..outcome.len())
                .map(|i| match outcome.error(i) {
                    None => Ok(()),
                    Some(err) if err.is_not_found() => Ok(()),
                    Some(err) => {
                        warn!("Object delete {} failed: {}", i, err);
                        Err(err.clone())
                    }
                })
                .collect();
            done(results);
        },
    );
}

/// Tombstones covering every backend object of one object version
pub(crate) fn deletion_records(
    ctx: &GatewayContext,
    indexes: &BucketIndexes,
    meta: &ObjectMetadata,
    extended: Option<&ExtendedMetadata>,
) -> Vec<TombstoneRecord> {
    let mut records = vec![ctx.ledger.deletion_record(indexes, meta, None)];
    if let Some(ext) = extended {
        records.extend(
            ext.all_fragments()
                .filter(|f| f.object_id != meta.object_id)
                .map(|f| ctx.ledger.deletion_record(indexes, meta, Some(f))),
        );
    }
    records
}
