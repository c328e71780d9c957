//! DeleteObjects: batch delete with per-key results
//!
//! Every backend round trip covers the whole batch as one join. A join
//! proceeds when at least one of its operations succeeded; the per-slot
//! status then decides each key's result:
//!
//! - lookup `NotFound`: [`KeyOutcome::NotFound`], nothing else happens
//! - metadata removal failed: [`KeyOutcome::Failed`], its tombstones are
//!   retired because the object is still live
//! - metadata removed: [`KeyOutcome::Deleted`], even if an object delete
//!   later fails (the reaper finishes those)

use super::{check_key, deletion_records, delete_objects, new_request_id, FlowOutcome, OutcomeSlot};
use crate::backend::{Backend, BackendError, IndexId};
use crate::context::GatewayContext;
use crate::core::join::JoinOutcome;
use crate::core::ledger::TombstoneRecord;
use crate::core::pipeline::{ClientConnection, Cx, Flow, Phase, Pipeline};
use crate::error::{ErrorClass, GatewayError, Result};
use crate::metadata::{BucketIndexes, ExtendedMetadata, ObjectMetadata};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Most keys one request may name
pub const MAX_DELETE_KEYS: usize = 1000;

/// Result for one key of a batch delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    Deleted,
    NotFound,
    Failed(ErrorClass),
}

#[derive(Debug, Clone)]
struct KeyState {
    key: String,
    meta: Option<ObjectMetadata>,
    extended: Option<ExtendedMetadata>,
    records: Vec<TombstoneRecord>,
    outcome: Option<KeyOutcome>,
}

impl KeyState {
    /// Found and not yet settled
    fn in_play(&self) -> bool {
        self.meta.is_some() && self.outcome.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct DeleteManyState {
    bucket: String,
    indexes: BucketIndexes,
    keys: Vec<KeyState>,
    removed: Vec<usize>,
    gone: Vec<String>,
    rollback_retired: bool,
}

impl DeleteManyState {
    /// Per-key results in request order
    pub fn results(&self) -> Vec<(String, KeyOutcome)> {
        self.keys
            .iter()
            .map(|k| (k.key.clone(), k.outcome.unwrap_or(KeyOutcome::Failed(ErrorClass::InternalError))))
            .collect()
    }
}

type ResultSlot = Rc<RefCell<Vec<(String, KeyOutcome)>>>;

/// A DeleteObjects request in flight
pub struct DeleteObjects {
    request_id: String,
    pipeline: Pipeline<DeleteManyState>,
    outcome: OutcomeSlot,
    results: ResultSlot,
}

impl DeleteObjects {
    pub fn new(ctx: Rc<GatewayContext>, bucket: &str, keys: Vec<String>, client: ClientConnection) -> Self {
        let request_id = new_request_id();
        let mut seen = HashSet::new();
        let keys = keys
            .into_iter()
            .filter(|k| seen.insert(k.clone()))
            .map(|key| KeyState {
                key,
                meta: None,
                extended: None,
                records: Vec::new(),
                outcome: None,
            })
            .collect();
        let state = DeleteManyState {
            bucket: bucket.to_string(),
            indexes: BucketIndexes::derive(bucket),
            keys,
            removed: Vec::new(),
            gone: Vec::new(),
            rollback_retired: false,
        };
        let pipeline = Pipeline::new(request_id.clone(), state, ctx.shutdown().clone(), client);
        let outcome: OutcomeSlot = Rc::new(RefCell::new(None));
        let results: ResultSlot = Rc::new(RefCell::new(Vec::new()));

        pipeline.add_step(validate);
        let c = ctx.clone();
        pipeline.add_step(move |cx| fetch_all(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| fetch_extended(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| protect(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| remove_metadata(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| retire_live(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| mark_unreachable(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| delete_data(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| retire_gone(&c, cx));

        let c = ctx.clone();
        pipeline.add_rollback_step(move |cx| rollback_retire(&c, cx));

        let slot = outcome.clone();
        let per_key = results.clone();
        let rid = request_id.clone();
        pipeline.on_complete(move |st, err| {
            if let Some(err) = err {
                let class = err.class();
                for key in st.keys.iter_mut().filter(|k| k.outcome.is_none()) {
                    key.outcome = Some(KeyOutcome::Failed(class));
                }
            }
            *per_key.borrow_mut() = st.results();
            *slot.borrow_mut() = Some(FlowOutcome::new(&rid, err));
        });

        DeleteObjects {
            request_id,
            pipeline,
            outcome,
            results,
        }
    }

    pub fn start(&self) {
        debug!("[{}] DeleteObjects starting", self.request_id);
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

    /// Per-key results; empty until the pipeline is terminal
    pub fn results(&self) -> Vec<(String, KeyOutcome)> {
        self.results.borrow().clone()
    }
}

/// Run one batch delete to completion on the context's event loop
pub fn delete_objects_batch(
    ctx: &Rc<GatewayContext>,
    bucket: &str,
    keys: Vec<String>,
) -> Result<(FlowOutcome, Vec<(String, KeyOutcome)>)> {
    let delete = DeleteObjects::new(ctx.clone(), bucket, keys, ClientConnection::new());
    delete.start();
    ctx.run_until_idle()?;
    let outcome = delete
        .outcome()
        .ok_or_else(|| GatewayError::Internal("batch delete did not reach a terminal state".into()))?;
    Ok((outcome, delete.results()))
}

fn validate(cx: &mut Cx<'_, DeleteManyState>) -> Flow {
    let st = &*cx.state;
    if st.keys.is_empty() {
        return Flow::Rollback(GatewayError::InvalidArgument("no keys to delete".into()));
    }
    if st.keys.len() > MAX_DELETE_KEYS {
        return Flow::Rollback(GatewayError::InvalidArgument(format!(
            "{} keys requested, limit is {}",
            st.keys.len(),
            MAX_DELETE_KEYS
        )));
    }
    for key in &st.keys {
        if let Err(err) = check_key(&st.bucket, &key.key) {
            return Flow::Rollback(err);
        }
    }
    Flow::Next
}

fn class_of(err: &BackendError) -> ErrorClass {
    GatewayError::Backend(err.clone()).class()
}

/// Launch one `kv_get` per key; slot `i` is `keys[i]`
fn get_all<S, F>(ctx: &GatewayContext, label: &str, index: IndexId, keys: Vec<String>, on_success: S, on_failed: F)
where
    S: FnOnce(JoinOutcome) + 'static,
    F: FnOnce(JoinOutcome) + 'static,
{
    let backend: Arc<dyn Backend> = ctx.backend.clone();
    let mut pending = keys.into_iter();
    ctx.lp.launch(
        label,
        pending.len(),
        move |c| {
            if let Some(key) = pending.next() {
                backend.kv_get(index, key, c.into_value_callback());
            }
        },
        on_success,
        on_failed,
    );
}

fn fetch_all(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteManyState>) -> Flow {
    let keys = cx.state.keys.iter().map(|k| k.key.clone()).collect();
    let on_success = cx.handle();
    let on_failed = cx.handle();
    get_all(
        ctx,
        "lookup keys",
        cx.state.indexes.object_list,
        keys,
        move |outcome| on_success.resume_with(|cx| apply_lookups(cx, &outcome)),
        move |outcome| on_failed.resume_with(|cx| apply_lookups(cx, &outcome)),
    );
    Flow::Suspend
}

fn apply_lookups(cx: &mut Cx<'_, DeleteManyState>, outcome: &JoinOutcome) -> Flow {
    for (i, key) in cx.state.keys.iter_mut().enumerate() {
        match (outcome.value(i), outcome.error(i)) {
            (Some(text), _) => match ObjectMetadata::from_json(text) {
                Ok(meta) => key.meta = Some(meta),
                Err(err) => {
                    warn!("Unreadable metadata for {}: {}", key.key, err);
                    key.outcome = Some(KeyOutcome::Failed(ErrorClass::InternalError));
                }
            },
            (None, Some(err)) if err.is_not_found() => key.outcome = Some(KeyOutcome::NotFound),
            (None, Some(err)) => key.outcome = Some(KeyOutcome::Failed(class_of(err))),
            (None, None) => key.outcome = Some(KeyOutcome::Failed(ErrorClass::InternalError)),
        }
    }
    let found = cx.state.keys.iter().filter(|k| k.in_play()).count();
    debug!("[{}] {} of {} keys exist", cx.request_id(), found, cx.state.keys.len());
    if found == 0 {
        Flow::Done
    } else {
        Flow::Next
    }
}

fn fetch_extended(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteManyState>) -> Flow {
    let wanted: Vec<usize> = cx
        .state
        .keys
        .iter()
        .enumerate()
        .filter(|(_, k)| k.in_play() && k.meta.as_ref().is_some_and(|m| m.fragmented))
        .map(|(i, _)| i)
        .collect();
    if wanted.is_empty() {
        return Flow::Next;
    }
    let ext_keys = wanted
        .iter()
        .filter_map(|&i| cx.state.keys[i].meta.as_ref().map(|m| m.extended_key()))
        .collect();
    let on_success = cx.handle();
    let on_failed = cx.handle();
    let wanted_failed = wanted.clone();
    get_all(
        ctx,
        "lookup fragment lists",
        cx.state.indexes.extended,
        ext_keys,
        move |outcome| on_success.resume_with(|cx| apply_extended(cx, &wanted, &outcome)),
        move |outcome| on_failed.resume_with(|cx| apply_extended(cx, &wanted_failed, &outcome)),
    );
    Flow::Suspend
}

fn apply_extended(cx: &mut Cx<'_, DeleteManyState>, wanted: &[usize], outcome: &JoinOutcome) -> Flow {
    for (slot, &i) in wanted.iter().enumerate() {
        let key = &mut cx.state.keys[i];
        match (outcome.value(slot), outcome.error(slot)) {
            (Some(text), _) => match ExtendedMetadata::from_json(text) {
                Ok(ext) => key.extended = Some(ext),
                Err(err) => {
                    warn!("Unreadable fragment list for {}: {}", key.key, err);
                    key.outcome = Some(KeyOutcome::Failed(ErrorClass::InternalError));
                }
            },
            (None, Some(err)) if err.is_not_found() => {
                warn!("{} is flagged fragmented but has no fragment list", key.key);
            }
            (None, Some(err)) => key.outcome = Some(KeyOutcome::Failed(class_of(err))),
            (None, None) => key.outcome = Some(KeyOutcome::Failed(ErrorClass::InternalError)),
        }
    }
    if cx.state.keys.iter().any(KeyState::in_play) {
        Flow::Next
    } else {
        Flow::Done
    }
}

fn protect(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteManyState>) -> Flow {
    let handle = cx.handle();
    let st = &mut *cx.state;
    let indexes = st.indexes.clone();
    let mut all = Vec::new();
    for key in st.keys.iter_mut().filter(|k| k.in_play()) {
        if let Some(meta) = &key.meta {
            key.records = deletion_records(ctx, &indexes, meta, key.extended.as_ref());
            all.extend(key.records.iter().cloned());
        }
    }
    ctx.ledger.record_pending(&ctx.lp, &all, move |res| match res {
        Ok(()) => handle.next(),
        Err(err) => handle.rollback(err),
    });
    Flow::Suspend
}

fn remove_metadata(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteManyState>) -> Flow {
    let st = &*cx.state;
    // (key index, is the object-list entry)
    let mut owners = Vec::new();
    let mut entries = Vec::new();
    for (i, key) in st.keys.iter().enumerate().filter(|(_, k)| k.in_play()) {
        if let Some(meta) = &key.meta {
            owners.push((i, true));
            entries.push((st.indexes.object_list, meta.key.clone()));
            if meta.fragmented {
                owners.push((i, false));
                entries.push((st.indexes.extended, meta.extended_key()));
            }
        }
    }

    let on_success = cx.handle();
    let on_failed = cx.handle();
    let owners_failed = owners.clone();
    ctx.metadata.remove(
        &ctx.lp,
        entries,
        move |outcome| on_success.resume_with(|cx| apply_removals(cx, &owners, &outcome)),
        move |outcome| on_failed.resume_with(|cx| apply_removals(cx, &owners_failed, &outcome)),
    );
    Flow::Suspend
}

fn apply_removals(cx: &mut Cx<'_, DeleteManyState>, owners: &[(usize, bool)], outcome: &JoinOutcome) -> Flow {
    let st = &mut *cx.state;
    for (slot, &(i, primary)) in owners.iter().enumerate() {
        if !primary {
            if let Some(err) = outcome.error(slot).filter(|e| !e.is_not_found()) {
                warn!("Fragment list of {} not removed: {}", st.keys[i].key, err);
            }
            continue;
        }
        match outcome.error(slot) {
            None => st.removed.push(i),
            Some(err) if err.is_not_found() => st.removed.push(i),
            Some(err) => st.keys[i].outcome = Some(KeyOutcome::Failed(class_of(err))),
        }
    }
    for &i in &st.removed {
        st.keys[i].outcome = Some(KeyOutcome::Deleted);
    }
    if st.removed.is_empty() {
        return Flow::Rollback(
            outcome
                .first_error()
                .cloned()
                .map(GatewayError::Backend)
                .unwrap_or_else(|| GatewayError::Internal("no metadata removed".into())),
        );
    }
    let removed = st.removed.len();
    cx.mark_response_sent();
    info!("[{}] removed metadata of {} keys", cx.request_id(), removed);
    Flow::Next
}

/// Retire tombstones of keys whose metadata survived
fn retire_live(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteManyState>) -> Flow {
    let st = &*cx.state;
    let keys: Vec<String> = st
        .keys
        .iter()
        .enumerate()
        .filter(|(i, k)| matches!(k.outcome, Some(KeyOutcome::Failed(_))) && !st.removed.contains(i))
        .flat_map(|(_, k)| k.records.iter().map(|r| r.key.clone()))
        .collect();
    if keys.is_empty() {
        return Flow::Next;
    }
    let handle = cx.handle();
    let request_id = cx.request_id().to_string();
    ctx.ledger.retire(&ctx.lp, keys, move |res| {
        if let Err(err) = res {
            warn!("[{}] failed to retire tombstones of live objects: {}", request_id, err);
        }
        handle.next();
    });
    Flow::Suspend
}

fn removed_records(st: &DeleteManyState) -> Vec<TombstoneRecord> {
    st.removed
        .iter()
        .flat_map(|&i| st.keys[i].records.iter().cloned())
        .collect()
}

fn mark_unreachable(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteManyState>) -> Flow {
    let records = removed_records(cx.state);
    let handle = cx.handle();
    let request_id = cx.request_id().to_string();
    ctx.ledger.mark_unreachable(&ctx.lp, &records, move |res| {
        if let Err(err) = res {
            warn!("[{}] failed to mark deleted objects unreachable: {}", request_id, err);
        }
        handle.next();
    });
    Flow::Suspend
}

fn delete_data(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteManyState>) -> Flow {
    let records = removed_records(cx.state);
    let targets = records.iter().map(|r| (r.object_id, r.layout_id)).collect();
    let handle = cx.handle();
    delete_objects(ctx, targets, move |results| {
        handle.resume_with(move |cx| {
            cx.state.gone = records
                .into_iter()
                .zip(results)
                .filter(|(_, res)| res.is_ok())
                .map(|(r, _)| r.key)
                .collect();
            Flow::Next
        })
    });
    Flow::Suspend
}

fn retire_gone(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteManyState>) -> Flow {
    let handle = cx.handle();
    let request_id = cx.request_id().to_string();
    ctx.ledger.retire(&ctx.lp, cx.state.gone.clone(), move |res| {
        if let Err(err) = res {
            warn!("[{}] failed to retire tombstones: {}", request_id, err);
        }
        handle.next();
    });
    Flow::Suspend
}

fn rollback_retire(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, DeleteManyState>) -> Flow {
    let st = &*cx.state;
    if st.rollback_retired {
        return Flow::Next;
    }
    let keys: Vec<String> = st
        .keys
        .iter()
        .enumerate()
        .filter(|(i, _)| !st.removed.contains(i))
        .flat_map(|(_, k)| k.records.iter().map(|r| r.key.clone()))
        .collect();
    if keys.is_empty() {
        return Flow::Next;
    }
    let handle = cx.handle();
    ctx.ledger.retire(&ctx.lp, keys, move |res| {
        handle.resume_with(move |cx| match res {
            Ok(()) => {
                cx.state.rollback_retired = true;
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
    use crate::backend::InMemoryBackend;
    use crate::config::GatewayConfig;
    use crate::core::event_loop::ShutdownSignal;
    use crate::flows::put_object::{put_object, PutRequest};

    fn setup() -> (Arc<InMemoryBackend>, Rc<GatewayContext>) {
        let backend = Arc::new(InMemoryBackend::new(3));
        let ctx = GatewayContext::new(GatewayConfig::default(), backend.clone(), ShutdownSignal::new()).unwrap();
        (backend, ctx)
    }

    #[test]
    fn test_empty_key_list_is_invalid() {
        let (_, ctx) = setup();
        let (outcome, results) = delete_objects_batch(&ctx, "photos", Vec::new()).unwrap();
        assert_eq!(outcome.error_class, Some(ErrorClass::InvalidArgument));
        assert!(results.is_empty());
    }

    #[test]
    fn test_all_missing_keys_complete_without_mutations() {
        let (backend, ctx) = setup();
        let keys = vec!["a".to_string(), "b".to_string()];
        let (outcome, results) = delete_objects_batch(&ctx, "photos", keys).unwrap();
        assert!(outcome.succeeded());
        assert!(results.iter().all(|(_, r)| *r == KeyOutcome::NotFound));
        assert_eq!(backend.mutations(), 0);
    }

    #[test]
    fn test_duplicate_keys_are_collapsed() {
        let (backend, ctx) = setup();
        put_object(&ctx, PutRequest::new("photos", "a", &b"x"[..])).unwrap();
        let keys = vec!["a".to_string(), "a".to_string()];
        let (outcome, results) = delete_objects_batch(&ctx, "photos", keys).unwrap();
        assert!(outcome.succeeded());
        assert_eq!(results, vec![("a".to_string(), KeyOutcome::Deleted)]);
        assert_eq!(backend.object_count(), 0);
    }
}
