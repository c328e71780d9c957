//! DeleteObject: remove one object and every fragment it owns
//!
//! ```text
//! validate -> fetch metadata (absent: done) -> record tombstones
//!   -> remove metadata -> mark unreachable -> delete objects -> retire
//! ```
//!
//! If the metadata cannot be removed the object is still live, so the only
//! rollback is retiring the tombstones written for it.

use super::{check_key, deletion_records, delete_objects, new_request_id, FlowOutcome, OutcomeSlot};
use crate::context::GatewayContext;
use crate::core::ledger::TombstoneRecord;
use crate::core::pipeline::{ClientConnection, Cx, Flow, Phase, Pipeline};
use crate::error::{GatewayError, Result};
use crate::metadata::{join_failure, BucketIndexes, ExtendedMetadata, ObjectMetadata};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub bucket: String,
    pub key: String,
}

impl DeleteRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        DeleteRequest {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteState {
    req: DeleteRequest,
    indexes: BucketIndexes,
    meta: Option<ObjectMetadata>,
    extended: Option<ExtendedMetadata>,
    records: Vec<TombstoneRecord>,
    metadata_removed: bool,
    gone: Vec<String>,
    records_retired: bool,
}

impl DeleteState {
    /// Metadata of the deleted object; `None` if there was nothing to delete
    pub fn metadata(&self) -> Option<&ObjectMetadata> {
        self.meta.as_ref()
    }

    pub fn metadata_removed(&self) -> bool {
        self.metadata_removed
    }
}

/// A DeleteObject request in flight
pub struct DeleteObject {
    request_id: String,
    pipeline: Pipeline<DeleteState>,
    outcome: OutcomeSlot,
}

impl DeleteObject {
    pub fn new(ctx: Rc<GatewayContext>, req: DeleteRequest, client: ClientConnection) -> Self {
        let request_id = new_request_id();
        let state = DeleteState {
            indexes: BucketIndexes::derive(&req.bucket),
            req,
            meta: None,
            extended: None,
            records: Vec::new(),
            metadata_removed: false,
            gone: Vec::new(),
            records_retired: false,
        };
        let pipeline = Pipeline::new(request_id.clone(), state, ctx.shutdown().clone(), client);
        let outcome: OutcomeSlot = Rc::new(RefCell::new(None));

        pipeline.add_step(|cx| match check_key(&cx.state.req.bucket, &cx.state.req.key) {
            Ok(()) => Flow::Next,
            Err(err) => Flow::Rollback(err),
        });
        let c = ctx.clone();
        pipeline.add_step(move |cx| fetch(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| protect(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| remove_metadata(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| mark_unreachable(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| delete_data(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| retire(&c, cx));

        let c = ctx.clone();
        pipeline.add_rollback_step(move |cx| rollback_retire(&c, cx));

        let slot = outcome.clone();
        let rid = request_id.clone();
        pipeline.on_complete(move |st, err| {
            let mut outcome = FlowOutcome::new(&rid, err);
            if let Some(meta) = &st.meta {
                outcome.etag = Some(meta.etag.clone());
                outcome.fragment_count = meta.fragment_count;
            }
            *slot.borrow_mut() = Some(outcome);
        });

        DeleteObject {
            request_id,
            pipeline,
            outcome,
        }
    }

    pub fn start(&self) {
        debug!("[{}] DeleteObject starting", self.request_id);
        self.pipeline.start();
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn phase(&self) -> Phase {
        self.pipeline.phase()
    }

    pub fn outcome(&self) -> Option<FlowOutcome> {
        self.outcome.borrow().clone()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&DeleteState) -> R) -> R {
        self.pipeline.with_state(f)
    }
}

/// Run one delete to completion on the context's event loop
pub fn delete_object(ctx: &Rc<GatewayContext>, req: DeleteRequest) -> Result<FlowOutcome> {
    let delete = DeleteObject::new(ctx.clone(), req, ClientConnection::new());
    delete.start();
    ctx.run_until_idle()?;
    delete
        .outcome()
        .ok_or_else(|| GatewayError::Internal("delete did not reach a terminal state".into()))
}

fn fetch(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteState>) -> Flow {
    let handle = cx.handle();
    let c = ctx.clone();
    let indexes = cx.state.indexes.clone();
    ctx.metadata
        .load(&ctx.lp, &cx.state.indexes, &cx.state.req.key, move |res| match res {
            Ok(None) => handle.resume_with(|cx| {
                debug!("[{}] {} does not exist", cx.request_id(), cx.state.req.key);
                Flow::Done
            }),
            Ok(Some(meta)) if meta.fragmented => {
                let current = meta.clone();
                c.metadata.load_extended(&c.lp, &indexes, &current, move |ext| {
                    handle.resume_with(move |cx| match ext {
                        Ok(ext) => {
                            cx.state.meta = Some(meta);
                            cx.state.extended = ext;
                            Flow::Next
                        }
                        Err(err) => Flow::Rollback(err),
                    })
                });
            }
            Ok(Some(meta)) => handle.resume_with(move |cx| {
                cx.state.meta = Some(meta);
                Flow::Next
            }),
            Err(err) => handle.rollback(err),
        });
    Flow::Suspend
}

fn protect(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteState>) -> Flow {
    let handle = cx.handle();
    let st = &mut *cx.state;
    let Some(meta) = &st.meta else {
        return Flow::Done;
    };
    st.records = deletion_records(ctx, &st.indexes, meta, st.extended.as_ref());
    ctx.ledger.record_pending(&ctx.lp, &st.records, move |res| match res {
        Ok(()) => handle.next(),
        Err(err) => handle.rollback(err),
    });
    Flow::Suspend
}

fn remove_metadata(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteState>) -> Flow {
    let st = &*cx.state;
    let Some(meta) = &st.meta else {
        return Flow::Done;
    };
    let mut entries = vec![(st.indexes.object_list, meta.key.clone())];
    if meta.fragmented {
        entries.push((st.indexes.extended, meta.extended_key()));
    }

    let on_success = cx.handle();
    let on_failed = cx.handle();
    ctx.metadata.remove(
        &ctx.lp,
        entries,
        move |outcome| {
            on_success.resume_with(|cx| {
                if outcome.succeeded(0) || outcome.error(0).is_some_and(|e| e.is_not_found()) {
                    metadata_gone(cx)
                } else {
                    Flow::Rollback(join_failure(&outcome, "remove metadata"))
                }
            })
        },
        move |outcome| {
            on_failed.resume_with(|cx| {
                // A concurrent delete got there first; the objects are still ours to clean.
                if outcome.error(0).is_some_and(|e| e.is_not_found()) {
                    metadata_gone(cx)
                } else {
                    Flow::Rollback(join_failure(&outcome, "remove metadata"))
                }
            })
        },
    );
    Flow::Suspend
}

fn metadata_gone(cx: &mut Cx<'_, DeleteState>) -> Flow {
    cx.state.metadata_removed = true;
    cx.mark_response_sent();
    info!("[{}] deleted {}/{}", cx.request_id(), cx.state.req.bucket, cx.state.req.key);
    Flow::Next
}

fn mark_unreachable(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteState>) -> Flow {
    let handle = cx.handle();
    let request_id = cx.request_id().to_string();
    ctx.ledger
        .mark_unreachable(&ctx.lp, &cx.state.records, move |res| {
            if let Err(err) = res {
                warn!("[{}] failed to mark deleted objects unreachable: {}", request_id, err);
            }
            handle.next();
        });
    Flow::Suspend
}

fn delete_data(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteState>) -> Flow {
    let targets = cx
        .state
        .records
        .iter()
        .map(|r| (r.object_id, r.layout_id))
        .collect();
    let handle = cx.handle();
    delete_objects(ctx, targets, move |results| {
        handle.resume_with(move |cx| {
            let st = &mut *cx.state;
            st.gone = st
                .records
                .iter()
                .zip(results)
                .filter(|(_, res)| res.is_ok())
                .map(|(r, _)| r.key.clone())
                .collect();
            Flow::Next
        })
    });
    Flow::Suspend
}

fn retire(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteState>) -> Flow {
    let st = &*cx.state;
    if st.gone.len() < st.records.len() {
        warn!(
            "[{}] {} objects left for the reaper",
            cx.request_id(),
            st.records.len() - st.gone.len()
        );
    }
    let handle = cx.handle();
    let request_id = cx.request_id().to_string();
    ctx.ledger.retire(&ctx.lp, st.gone.clone(), move |res| {
        if let Err(err) = res {
            warn!("[{}] failed to retire tombstones: {}", request_id, err);
        }
        handle.next();
    });
    Flow::Suspend
}

fn rollback_retire(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteState>) -> Flow {
    let st = &*cx.state;
    if st.metadata_removed || st.records_retired || st.records.is_empty() {
        return Flow::Next;
    }
    let keys = st.records.iter().map(|r| r.key.clone()).collect();
    let handle = cx.handle();
    ctx.ledger.retire(&ctx.lp, keys, move |res| {
        handle.resume_with(move |cx| match res {
            Ok(()) => {
                cx.state.records_retired = true;
                Flow::Next
            }
            Err(err) => Flow::Rollback(err),
        })
    });
    Flow::Suspend
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FaultPlan, InMemoryBackend};
    use crate::config::GatewayConfig;
    use crate::core::event_loop::ShutdownSignal;
    use crate::error::ErrorClass;
    use crate::flows::put_object::{put_object, PutRequest};
    use std::sync::Arc;

    fn setup() -> (Arc<InMemoryBackend>, Rc<GatewayContext>) {
        let backend = Arc::new(InMemoryBackend::new(2));
        let ctx = GatewayContext::new(GatewayConfig::default(), backend.clone(), ShutdownSignal::new()).unwrap();
        (backend, ctx)
    }

    #[test]
    fn test_delete_missing_key_is_success_without_mutations() {
        let (backend, ctx) = setup();
        let outcome = delete_object(&ctx, DeleteRequest::new("photos", "ghost")).unwrap();
        assert!(outcome.succeeded());
        assert_eq!(backend.mutations(), 0);
    }

    #[test]
    fn test_delete_removes_object_metadata_and_tombstones() {
        let (backend, ctx) = setup();
        put_object(&ctx, PutRequest::new("photos", "cat.jpg", vec![1u8; 5000])).unwrap();
        assert_eq!(backend.object_count(), 1);

        let outcome = delete_object(&ctx, DeleteRequest::new("photos", "cat.jpg")).unwrap();
        assert!(outcome.succeeded());
        assert_eq!(backend.object_count(), 0);
        let indexes = BucketIndexes::derive("photos");
        assert!(backend.kv_value(indexes.object_list, "cat.jpg").is_none());
        assert!(backend.kv_entries(ctx.ledger.index()).is_empty());
    }

    #[test]
    fn test_lookup_failure_leaves_object_alone() {
        let (backend, ctx) = setup();
        put_object(&ctx, PutRequest::new("photos", "keep", &b"data"[..])).unwrap();
        backend.set_faults(FaultPlan::new().fail_key("keep"));

        let outcome = delete_object(&ctx, DeleteRequest::new("photos", "keep")).unwrap();
        assert_eq!(outcome.error_class, Some(ErrorClass::InternalError));
        backend.clear_faults();

        assert_eq!(backend.object_count(), 1);
        assert!(backend.kv_entries(ctx.ledger.index()).is_empty());
    }
}
