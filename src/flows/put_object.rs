//! PutObject: create or overwrite one object
//!
//! ```text
//! validate -> fetch existing -> allocate id -> record tombstones -> create
//!   -> write (fault-mode aware) -> verify digest -> save metadata -> respond
//!   -> mark old unreachable -> retire new -> delete old -> retire old
//! ```
//!
//! Rollback (run in registration order): mark new ids unreachable, retire
//! the superseded-object tombstones, delete the new objects, retire the new
//! tombstones whose objects are confirmed gone. Every rollback step records
//! its progress in the state, so running the chain again mutates nothing.

use super::{check_key, delete_objects, new_request_id, FlowOutcome, OutcomeSlot};
use crate::backend::BackendError;
use crate::context::GatewayContext;
use crate::core::checksum::{content_md5_to_hex, ContentChecksums, ContentHasher};
use crate::core::event_loop::ShutdownSignal;
use crate::core::fragment::{FragmentedWriteController, WriteTarget};
use crate::core::layout::LayoutDescriptor;
use crate::core::ledger::TombstoneRecord;
use crate::core::oid::{CollisionRetry, ObjectId};
use crate::core::pipeline::{ClientConnection, Cx, Flow, Phase, Pipeline};
use crate::error::{GatewayError, Result};
use crate::metadata::{join_failure, BucketIndexes, ExtendedMetadata, FragmentDescriptor, ObjectMetadata};
use bytes::Bytes;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Part number fragments of a single-part upload are stored under
pub const SINGLE_PART: u32 = 1;

#[derive(Debug, Clone)]
pub struct PutRequest {
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    /// Content-MD5 header as sent (base64)
    pub content_md5: Option<String>,
}

impl PutRequest {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        PutRequest {
            bucket: bucket.into(),
            key: key.into(),
            body: body.into(),
            content_md5: None,
        }
    }

    pub fn with_content_md5(mut self, header: impl Into<String>) -> Self {
        self.content_md5 = Some(header.into());
        self
    }

    /// Seed for the object id
    pub fn uri(&self) -> String {
        format!("/{}/{}", self.bucket, self.key)
    }
}

/// How far the put got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStage {
    Empty,
    ValidationFailed,
    ProbableRecordFailed,
    NewOidCreated,
    WriteFailed,
    Md5ValidationFailed,
    MetadataSaveFailed,
    Completed,
}

#[derive(Debug, Clone, Default)]
struct RollbackProgress {
    marked: bool,
    old_retired: bool,
    /// Keys of new records whose objects are confirmed gone
    gone: Vec<String>,
    retired: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PutState {
    req: PutRequest,
    indexes: BucketIndexes,
    stage: PutStage,
    expected_md5: Option<String>,
    old: Option<ObjectMetadata>,
    old_extended: Option<ExtendedMetadata>,
    new_oid: ObjectId,
    layout: LayoutDescriptor,
    retry: CollisionRetry,
    new_record: Option<TombstoneRecord>,
    old_records: Vec<TombstoneRecord>,
    /// Records that already sat under our keys when we wrote ours
    displaced: Vec<TombstoneRecord>,
    fragment_records: Vec<TombstoneRecord>,
    fragments: Vec<FragmentDescriptor>,
    fragmented_at: Option<u64>,
    checksums: Option<ContentChecksums>,
    meta: Option<ObjectMetadata>,
    old_gone: Vec<String>,
    rollback: RollbackProgress,
}

impl PutState {
    fn new(ctx: &GatewayContext, req: PutRequest) -> Self {
        PutState {
            indexes: BucketIndexes::derive(&req.bucket),
            req,
            stage: PutStage::Empty,
            expected_md5: None,
            old: None,
            old_extended: None,
            new_oid: ObjectId::ZERO,
            layout: LayoutDescriptor::for_id(1),
            retry: ctx.allocator.retry_sequence(),
            new_record: None,
            old_records: Vec::new(),
            displaced: Vec::new(),
            fragment_records: Vec::new(),
            fragments: Vec::new(),
            fragmented_at: None,
            checksums: None,
            meta: None,
            old_gone: Vec::new(),
            rollback: RollbackProgress::default(),
        }
    }

    pub fn stage(&self) -> PutStage {
        self.stage
    }

    pub fn new_object_id(&self) -> ObjectId {
        self.new_oid
    }

    /// Object this put replaces, if any
    pub fn old_object_id(&self) -> Option<ObjectId> {
        self.old.as_ref().map(|m| m.object_id)
    }

    pub fn fragments(&self) -> &[FragmentDescriptor] {
        &self.fragments
    }

    /// Logical offset where the write went into fault mode
    pub fn fragmented_at(&self) -> Option<u64> {
        self.fragmented_at
    }

    pub fn checksums(&self) -> Option<&ContentChecksums> {
        self.checksums.as_ref()
    }

    /// Metadata saved by this put
    pub fn metadata(&self) -> Option<&ObjectMetadata> {
        self.meta.as_ref()
    }

    /// Tombstones protecting objects this put created
    fn new_records(&self) -> Vec<TombstoneRecord> {
        self.new_record
            .iter()
            .chain(self.fragment_records.iter())
            .cloned()
            .collect()
    }
}

/// A PutObject request in flight
pub struct PutObject {
    ctx: Rc<GatewayContext>,
    request_id: String,
    pipeline: Pipeline<PutState>,
    outcome: OutcomeSlot,
}

impl PutObject {
    pub fn new(ctx: Rc<GatewayContext>, req: PutRequest, client: ClientConnection) -> Self {
        let request_id = new_request_id();
        let state = PutState::new(&ctx, req);
        let pipeline = Pipeline::new(request_id.clone(), state, ctx.shutdown().clone(), client);
        let outcome: OutcomeSlot = Rc::new(RefCell::new(None));

        let c = ctx.clone();
        pipeline.add_step(validate);
        pipeline.add_step(move |cx| fetch_existing(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| allocate(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| protect(&c, cx, false));
        let c = ctx.clone();
        pipeline.add_step(move |cx| issue_create(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| write_data(&c, cx));
        pipeline.add_step(verify_digest);
        let c = ctx.clone();
        pipeline.add_step(move |cx| save_metadata(&c, cx));
        pipeline.add_step(respond);
        let c = ctx.clone();
        pipeline.add_step(move |cx| mark_old_unreachable(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| retire_new(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| delete_old(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| retire_old(&c, cx));
        let c = ctx.clone();
        pipeline.add_step(move |cx| remove_old_extended(&c, cx));
        add_rollback_chain(&ctx, &pipeline);

        let slot = outcome.clone();
        let rid = request_id.clone();
        pipeline.on_complete(move |st, err| {
            let mut outcome = FlowOutcome::new(&rid, err);
            if err.is_none() {
                outcome.etag = st.meta.as_ref().map(|m| m.etag.clone());
                outcome.fragment_count = st.fragments.len() as u32;
            }
            *slot.borrow_mut() = Some(outcome);
        });

        PutObject {
            ctx,
            request_id,
            pipeline,
            outcome,
        }
    }

    pub fn start(&self) {
        debug!("[{}] PutObject starting", self.request_id);
        self.pipeline.start();
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn phase(&self) -> Phase {
        self.pipeline.phase()
    }

    pub fn is_finished(&self) -> bool {
        self.pipeline.is_finished()
    }

    /// Final outcome; `None` until the pipeline is terminal
    pub fn outcome(&self) -> Option<FlowOutcome> {
        self.outcome.borrow().clone()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&PutState) -> R) -> R {
        self.pipeline.with_state(f)
    }

    /// Run the rollback chain again over a copy of the final state
    pub fn rerun_rollback(&self) -> Pipeline<PutState> {
        let state = self.pipeline.with_state(|s| s.clone());
        let replay = Pipeline::new(
            format!("{}-rerun", self.request_id),
            state,
            ShutdownSignal::new(),
            ClientConnection::new(),
        );
        add_rollback_chain(&self.ctx, &replay);
        replay.start_rollback(GatewayError::Internal("rollback rerun".into()));
        replay
    }
}

/// Run one put to completion on the context's event loop
pub fn put_object(ctx: &Rc<GatewayContext>, req: PutRequest) -> Result<FlowOutcome> {
    let put = PutObject::new(ctx.clone(), req, ClientConnection::new());
    put.start();
    ctx.run_until_idle()?;
    put.outcome()
        .ok_or_else(|| GatewayError::Internal("put did not reach a terminal state".into()))
}

fn add_rollback_chain(ctx: &Rc<GatewayContext>, pipeline: &Pipeline<PutState>) {
    let c = ctx.clone();
    pipeline.add_rollback_step(move |cx| rollback_mark_new(&c, cx));
    let c = ctx.clone();
    pipeline.add_rollback_step(move |cx| rollback_retire_old(&c, cx));
    let c = ctx.clone();
    pipeline.add_rollback_step(move |cx| rollback_delete_new(&c, cx));
    let c = ctx.clone();
    pipeline.add_rollback_step(move |cx| rollback_retire_new(&c, cx));
}

fn validate(cx: &mut Cx<'_, PutState>) -> Flow {
    let st = &mut *cx.state;
    let checked = check_key(&st.req.bucket, &st.req.key).and_then(|()| {
        st.req
            .content_md5
            .as_deref()
            .map(content_md5_to_hex)
            .transpose()
    });
    match checked {
        Ok(expected) => {
            st.expected_md5 = expected;
            Flow::Next
        }
        Err(err) => {
            st.stage = PutStage::ValidationFailed;
            Flow::Rollback(err)
        }
    }
}

fn fetch_existing(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    let handle = cx.handle();
    let c = ctx.clone();
    let indexes = cx.state.indexes.clone();
    ctx.metadata
        .load(&ctx.lp, &cx.state.indexes, &cx.state.req.key, move |res| match res {
            Ok(Some(meta)) if meta.fragmented => {
                let current = meta.clone();
                c.metadata.load_extended(&c.lp, &indexes, &current, move |ext| {
                    handle.resume_with(move |cx| match ext {
                        Ok(ext) => {
                            if ext.is_none() {
                                warn!(
                                    "[{}] {} is flagged fragmented but has no fragment list",
                                    cx.request_id(),
                                    meta.key
                                );
                            }
                            cx.state.old = Some(meta);
                            cx.state.old_extended = ext;
                            Flow::Next
                        }
                        Err(err) => Flow::Rollback(err),
                    })
                });
            }
            Ok(found) => handle.resume_with(move |cx| {
                cx.state.old = found;
                Flow::Next
            }),
            Err(err) => handle.rollback(err),
        });
    Flow::Suspend
}

fn allocate(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    let request_id = cx.request_id().to_string();
    let st = &mut *cx.state;
    st.layout = ctx.layouts.select(st.req.body.len() as u64);
    let seed = st.req.uri();
    let mut candidate = ctx.allocator.generate(&seed);
    // Deterministic ids map an overwrite to the id of the object it replaces.
    while st.old.as_ref().is_some_and(|m| m.object_id == candidate) {
        match st.retry.next_id(&ctx.allocator, &seed, candidate) {
            Ok(next) => candidate = next,
            Err(err) => return Flow::Rollback(err),
        }
    }
    st.new_oid = candidate;
    debug!(
        "[{}] {} -> {} (layout {})",
        request_id,
        seed,
        candidate,
        st.layout.layout_id
    );
    Flow::Next
}

fn superseded_records(ctx: &GatewayContext, st: &PutState) -> Vec<TombstoneRecord> {
    let Some(old) = &st.old else {
        return Vec::new();
    };
    let mut records = vec![ctx.ledger.superseded_record(
        &st.indexes,
        &st.req.key,
        old.object_id,
        st.new_oid,
        old.layout_id,
        &old.version_id,
    )];
    if let Some(ext) = &st.old_extended {
        for frag in ext.all_fragments().filter(|f| f.object_id != old.object_id) {
            let mut record = ctx.ledger.superseded_record(
                &st.indexes,
                &st.req.key,
                frag.object_id,
                st.new_oid,
                frag.layout_id,
                &old.version_id,
            );
            record.primary_object_id = old.object_id;
            record.fragment_index = Some(frag.sequence_index);
            records.push(record);
        }
    }
    records
}

/// Record tombstones for the new id and everything it supersedes
///
/// Whatever already sits under those keys is read first. With deterministic
/// ids it can belong to an earlier crashed put of this key, and it has to go
/// back if the candidate turns out to be taken.
///
/// With `create_next` set the create is issued as soon as the records are
/// durable; otherwise the pipeline moves on to its create step.
fn protect(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>, create_next: bool) -> Flow {
    let st = &mut *cx.state;
    let old_id = st.old.as_ref().map(|m| m.object_id).unwrap_or(ObjectId::ZERO);
    let new_record =
        ctx.ledger
            .new_object_record(&st.indexes, &st.req.key, st.new_oid, old_id, st.layout.layout_id);
    st.old_records = superseded_records(ctx, st);
    let mut records = vec![new_record.clone()];
    records.extend(st.old_records.iter().cloned());
    st.new_record = Some(new_record);
    let keys = records.iter().map(|r| r.key.clone()).collect();

    let handle = cx.handle();
    let c = ctx.clone();
    ctx.ledger.get_existing(&ctx.lp, keys, move |res| {
        handle.resume_with(move |cx| match res {
            Ok(found) => {
                cx.state.displaced = found;
                record_pending(&c, cx, records, create_next)
            }
            Err(err) => {
                cx.state.stage = PutStage::ProbableRecordFailed;
                Flow::Rollback(err)
            }
        })
    });
    Flow::Suspend
}

fn record_pending(
    ctx: &Rc<GatewayContext>,
    cx: &mut Cx<'_, PutState>,
    records: Vec<TombstoneRecord>,
    create_next: bool,
) -> Flow {
    let handle = cx.handle();
    let c = ctx.clone();
    ctx.ledger.record_pending(&ctx.lp, &records, move |res| {
        handle.resume_with(move |cx| match res {
            Ok(()) if create_next => issue_create(&c, cx),
            Ok(()) => Flow::Next,
            Err(err) => {
                cx.state.stage = PutStage::ProbableRecordFailed;
                Flow::Rollback(err)
            }
        })
    });
    Flow::Suspend
}

fn issue_create(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    let oid = cx.state.new_oid;
    let layout = cx.state.layout;
    let backend = ctx.backend.clone();
    let handle = cx.handle();
    let c = ctx.clone();
    ctx.lp.launch_then(
        "create object",
        1,
        move |op| backend.create_object(oid, layout, op.into_op_callback()),
        move |outcome| {
            handle.resume_with(|cx| {
                if outcome.all_succeeded() {
                    debug!("[{}] created {}", cx.request_id(), oid);
                    cx.state.stage = PutStage::NewOidCreated;
                    Flow::Next
                } else if outcome.error(0) == Some(&BackendError::AlreadyExists) {
                    verify_collision(&c, cx)
                } else {
                    Flow::Rollback(join_failure(&outcome, "create object"))
                }
            })
        },
    );
    Flow::Suspend
}

/// The candidate id exists; find out whether this key already owns it
fn verify_collision(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    info!(
        "[{}] object id {} already exists, checking owner",
        cx.request_id(),
        cx.state.new_oid
    );
    let handle = cx.handle();
    let c = ctx.clone();
    ctx.metadata
        .load(&ctx.lp, &cx.state.indexes, &cx.state.req.key, move |res| {
            handle.resume_with(move |cx| match res {
                Ok(current) => next_candidate(&c, cx, current),
                Err(err) => Flow::Rollback(err),
            })
        });
    Flow::Suspend
}

fn next_candidate(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>, current: Option<ObjectMetadata>) -> Flow {
    let request_id = cx.request_id().to_string();
    let st = &mut *cx.state;
    let candidate = st.new_oid;
    let owned = current.as_ref().is_some_and(|m| m.object_id == candidate);

    let mut ours: Vec<String> = st.old_records.drain(..).map(|r| r.key).collect();
    if let Some(record) = st.new_record.take() {
        if owned {
            // Live under this key now; the reaper's liveness check retires it.
            info!("[{}] {} is the live object for {}", request_id, candidate, st.req.key);
        } else {
            ours.push(record.key);
        }
    }
    if owned {
        if current.as_ref().is_some_and(|m| m.fragmented) {
            warn!(
                "[{}] superseding fragmented {} without its fragment list",
                request_id, candidate
            );
        }
        st.old = current;
        st.old_extended = None;
    }

    // Records we overwrote go back as they were; only keys nobody held before are retired.
    let restore: Vec<TombstoneRecord> = std::mem::take(&mut st.displaced)
        .into_iter()
        .filter(|r| ours.contains(&r.key))
        .collect();
    ours.retain(|key| !restore.iter().any(|r| &r.key == key));
    if !restore.is_empty() {
        info!(
            "[{}] {} was left by an earlier request; restoring {} tombstones",
            request_id,
            candidate,
            restore.len()
        );
    }

    let handle = cx.handle();
    let c = ctx.clone();
    let ledger = ctx.ledger.clone();
    ctx.ledger.record_pending(&ctx.lp, &restore, move |res| {
        if let Err(err) = res {
            warn!(
                "[{}] failed to restore tombstones displaced by {}: {}",
                request_id, candidate, err
            );
        }
        let lp = c.lp.clone();
        ledger.retire(&lp, ours, move |res| {
            if let Err(err) = res {
                warn!(
                    "[{}] failed to retire tombstones for colliding id {}: {}",
                    request_id, candidate, err
                );
            }
            handle.resume_with(|cx| {
                let st = &mut *cx.state;
                let seed = st.req.uri();
                let mut previous = candidate;
                loop {
                    match st.retry.next_id(&c.allocator, &seed, previous) {
                        Ok(next) if st.old.as_ref().is_some_and(|m| m.object_id == next) => previous = next,
                        Ok(next) => {
                            st.new_oid = next;
                            break;
                        }
                        Err(err) => return Flow::Rollback(err),
                    }
                }
                protect(&c, cx, true)
            })
        });
    });
    Flow::Suspend
}

fn write_data(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    let handle = cx.handle();
    let st = &mut *cx.state;
    if st.req.body.is_empty() {
        st.fragments = vec![FragmentDescriptor {
            object_id: st.new_oid,
            layout_id: st.layout.layout_id,
            byte_size: 0,
            sequence_index: 0,
        }];
        st.checksums = Some(ContentHasher::new().finish());
        return Flow::Next;
    }

    let target = WriteTarget {
        indexes: st.indexes.clone(),
        object_name: st.req.key.clone(),
        seed: st.req.uri(),
    };
    FragmentedWriteController::start(
        ctx.clone(),
        target,
        st.new_oid,
        st.layout,
        st.req.body.clone(),
        move |report| {
            handle.resume_with(move |cx| {
                let st = &mut *cx.state;
                st.fragments = report.fragments;
                st.fragment_records = report.fragment_records;
                st.fragmented_at = report.fragmented_at;
                match report.error {
                    Some(err) => {
                        st.stage = PutStage::WriteFailed;
                        Flow::Rollback(err)
                    }
                    None => {
                        st.checksums = report.checksums;
                        Flow::Next
                    }
                }
            })
        },
    );
    Flow::Suspend
}

fn verify_digest(cx: &mut Cx<'_, PutState>) -> Flow {
    let st = &mut *cx.state;
    let mismatch = match (&st.expected_md5, &st.checksums) {
        (Some(expected), Some(sums)) if !expected.eq_ignore_ascii_case(&sums.md5_hex) => {
            Some(GatewayError::BadDigest {
                expected: expected.clone(),
                computed: sums.md5_hex.clone(),
            })
        }
        _ => None,
    };
    match mismatch {
        Some(err) => {
            st.stage = PutStage::Md5ValidationFailed;
            Flow::Rollback(err)
        }
        None => Flow::Next,
    }
}

fn save_metadata(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    let handle = cx.handle();
    let st = &mut *cx.state;
    let Some(sums) = st.checksums.clone() else {
        return Flow::Rollback(GatewayError::Internal("write finished without checksums".into()));
    };

    let mut meta = ObjectMetadata::new(&st.req.bucket, &st.req.key, st.new_oid, st.layout.layout_id);
    meta.content_length = st.req.body.len() as u64;
    meta.md5 = sums.md5_hex;
    meta.etag = sums.etag;
    meta.fragment_count = st.fragments.len() as u32;
    meta.fragmented = st.fragmented_at.is_some();

    let extended = if meta.fragmented {
        let mut ext = ExtendedMetadata::new(&meta);
        ext.set_fragments(SINGLE_PART, st.fragments.clone());
        if let Err(err) = ext.check() {
            return Flow::Rollback(err);
        }
        if ext.total_size() != meta.content_length {
            return Flow::Rollback(GatewayError::Internal(format!(
                "fragments hold {} bytes, content length is {}",
                ext.total_size(),
                meta.content_length
            )));
        }
        Some(ext)
    } else {
        None
    };
    st.meta = Some(meta.clone());

    ctx.metadata
        .save(&ctx.lp, &st.indexes, &meta, extended.as_ref(), move |res| {
            handle.resume_with(move |cx| match res {
                Ok(()) => {
                    // The new object is now what readers see; nothing after this may undo it.
                    cx.state.stage = PutStage::Completed;
                    cx.mark_response_sent();
                    Flow::Next
                }
                Err(err) => {
                    cx.state.stage = PutStage::MetadataSaveFailed;
                    Flow::Rollback(err)
                }
            })
        });
    Flow::Suspend
}

fn respond(cx: &mut Cx<'_, PutState>) -> Flow {
    let st = &*cx.state;
    info!(
        "[{}] stored {}/{} as {} ({} bytes, {} fragments{})",
        cx.request_id(),
        st.req.bucket,
        st.req.key,
        st.new_oid,
        st.req.body.len(),
        st.fragments.len(),
        match &st.old {
            Some(old) => format!(", replaced {}", old.object_id),
            None => String::new(),
        }
    );
    Flow::Next
}

fn mark_old_unreachable(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    if cx.state.old_records.is_empty() {
        return Flow::Next;
    }
    let handle = cx.handle();
    let request_id = cx.request_id().to_string();
    ctx.ledger
        .mark_unreachable(&ctx.lp, &cx.state.old_records, move |res| {
            if let Err(err) = res {
                warn!("[{}] failed to mark superseded objects unreachable: {}", request_id, err);
            }
            handle.next();
        });
    Flow::Suspend
}

fn retire_new(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    let keys: Vec<String> = cx.state.new_records().into_iter().map(|r| r.key).collect();
    let handle = cx.handle();
    let request_id = cx.request_id().to_string();
    ctx.ledger.retire(&ctx.lp, keys, move |res| {
        if let Err(err) = res {
            warn!("[{}] failed to retire tombstones of the new object: {}", request_id, err);
        }
        handle.next();
    });
    Flow::Suspend
}

fn delete_old(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    if cx.state.old_records.is_empty() {
        return Flow::Next;
    }
    let targets = cx
        .state
        .old_records
        .iter()
        .map(|r| (r.object_id, r.layout_id))
        .collect();
    let handle = cx.handle();
    delete_objects(ctx, targets, move |results| {
        handle.resume_with(move |cx| {
            let request_id = cx.request_id().to_string();
            let st = &mut *cx.state;
            st.old_gone = st
                .old_records
                .iter()
                .zip(results)
                .filter(|(_, res)| res.is_ok())
                .map(|(r, _)| r.key.clone())
                .collect();
            if st.old_gone.len() < st.old_records.len() {
                warn!(
                    "[{}] {} superseded objects left for the reaper",
                    request_id,
                    st.old_records.len() - st.old_gone.len()
                );
            }
            Flow::Next
        })
    });
    Flow::Suspend
}

fn retire_old(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    if cx.state.old_gone.is_empty() {
        return Flow::Next;
    }
    let handle = cx.handle();
    let request_id = cx.request_id().to_string();
    ctx.ledger
        .retire(&ctx.lp, cx.state.old_gone.clone(), move |res| {
            if let Err(err) = res {
                warn!("[{}] failed to retire superseded tombstones: {}", request_id, err);
            }
            handle.next();
        });
    Flow::Suspend
}

fn remove_old_extended(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    let st = &*cx.state;
    let Some(old) = st.old.as_ref().filter(|m| m.fragmented) else {
        return Flow::Next;
    };
    let entries = vec![(st.indexes.extended, old.extended_key())];
    let done = cx.handle();
    let failed = cx.handle();
    ctx.metadata.remove(
        &ctx.lp,
        entries,
        move |_| done.next(),
        move |outcome| {
            if !outcome.error(0).is_some_and(|e| e.is_not_found()) {
                warn!("Failed to remove superseded fragment list: {:?}", outcome.first_error());
            }
            failed.next();
        },
    );
    Flow::Suspend
}

fn rollback_mark_new(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    let st = &*cx.state;
    if st.stage == PutStage::Completed || st.rollback.marked {
        return Flow::Next;
    }
    let records = st.new_records();
    if records.is_empty() {
        return Flow::Next;
    }
    let handle = cx.handle();
    ctx.ledger.mark_unreachable(&ctx.lp, &records, move |res| {
        handle.resume_with(move |cx| match res {
            Ok(()) => {
                cx.state.rollback.marked = true;
                Flow::Next
            }
            Err(err) => Flow::Rollback(err),
        })
    });
    Flow::Suspend
}

fn rollback_retire_old(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    let st = &*cx.state;
    if st.stage == PutStage::Completed || st.rollback.old_retired || st.old_records.is_empty() {
        return Flow::Next;
    }
    let keys = st.old_records.iter().map(|r| r.key.clone()).collect();
    let handle = cx.handle();
    ctx.ledger.retire(&ctx.lp, keys, move |res| {
        handle.resume_with(move |cx| match res {
            Ok(()) => {
                cx.state.rollback.old_retired = true;
                Flow::Next
            }
            Err(err) => Flow::Rollback(err),
        })
    });
    Flow::Suspend
}

fn rollback_delete_new(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    let st = &*cx.state;
    if st.stage == PutStage::Completed {
        return Flow::Next;
    }
    let pending: Vec<TombstoneRecord> = st
        .new_records()
        .into_iter()
        .filter(|r| !st.rollback.gone.contains(&r.key))
        .collect();
    if pending.is_empty() {
        return Flow::Next;
    }
    let targets = pending.iter().map(|r| (r.object_id, r.layout_id)).collect();
    let handle = cx.handle();
    delete_objects(ctx, targets, move |results| {
        handle.resume_with(move |cx| {
            let mut failed = 0;
            for (record, res) in pending.into_iter().zip(results) {
                match res {
                    Ok(()) => cx.state.rollback.gone.push(record.key),
                    Err(_) => failed += 1,
                }
            }
            if failed > 0 {
                Flow::Rollback(GatewayError::Internal(format!(
                    "{} new objects could not be deleted",
                    failed
                )))
            } else {
                Flow::Next
            }
        })
    });
    Flow::Suspend
}

fn rollback_retire_new(ctx: &Rc<GatewayContext>, cx: &mut Cx<'_, PutState>) -> Flow {
    let st = &*cx.state;
    let keys: Vec<String> = st
        .rollback
        .gone
        .iter()
        .filter(|k| !st.rollback.retired.contains(k))
        .cloned()
        .collect();
    if keys.is_empty() {
        return Flow::Next;
    }
    let handle = cx.handle();
    let retiring = keys.clone();
    ctx.ledger.retire(&ctx.lp, keys, move |res| {
        handle.resume_with(move |cx| match res {
            Ok(()) => {
                cx.state.rollback.retired.extend(retiring);
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
    use crate::core::checksum::md5_hex;
    use crate::error::ErrorClass;
    use base64::{engine::general_purpose, Engine as _};
    use std::sync::Arc;

    fn setup() -> (Arc<InMemoryBackend>, Rc<GatewayContext>) {
        let backend = Arc::new(InMemoryBackend::new(2));
        let ctx = GatewayContext::new(GatewayConfig::default(), backend.clone(), ShutdownSignal::new()).unwrap();
        (backend, ctx)
    }

    fn md5_header(data: &[u8]) -> String {
        general_purpose::STANDARD.encode(hex::decode(md5_hex(data)).unwrap())
    }

    #[test]
    fn test_invalid_key_is_rejected_before_backend_calls() {
        let (backend, ctx) = setup();
        let outcome = put_object(&ctx, PutRequest::new("photos", "", &b"x"[..])).unwrap();
        assert_eq!(outcome.error_class, Some(ErrorClass::InvalidArgument));
        assert_eq!(backend.mutations(), 0);
    }

    #[test]
    fn test_bad_content_md5_header() {
        let (_, ctx) = setup();
        let req = PutRequest::new("photos", "a", &b"x"[..]).with_content_md5("not base64!");
        let outcome = put_object(&ctx, req).unwrap();
        assert_eq!(outcome.error_class, Some(ErrorClass::InvalidArgument));
    }

    #[test]
    fn test_digest_match_and_mismatch() {
        let (backend, ctx) = setup();
        let body = b"hello world".to_vec();

        let req = PutRequest::new("photos", "ok", body.clone()).with_content_md5(md5_header(&body));
        let outcome = put_object(&ctx, req).unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.etag.as_deref(), Some(md5_hex(&body).as_str()));

        let before = backend.object_count();
        let req = PutRequest::new("photos", "bad", body.clone()).with_content_md5(md5_header(b"other"));
        let outcome = put_object(&ctx, req).unwrap();
        assert_eq!(outcome.error_class, Some(ErrorClass::InvalidArgument));
        assert_eq!(backend.object_count(), before);
        assert!(backend.kv_entries(ctx.ledger.index()).is_empty());
    }

    #[test]
    fn test_deterministic_overwrite_gets_a_fresh_id() {
        let (backend, ctx) = setup();
        put_object(&ctx, PutRequest::new("photos", "k", &b"one"[..])).unwrap();
        let first = ctx.allocator.generate("/photos/k");
        assert!(backend.object_exists(first));

        let put = PutObject::new(ctx.clone(), PutRequest::new("photos", "k", &b"two"[..]), ClientConnection::new());
        put.start();
        ctx.run_until_idle().unwrap();

        let (new_oid, old_oid) = put.with_state(|s| (s.new_object_id(), s.old_object_id()));
        assert_eq!(old_oid, Some(first));
        assert_ne!(new_oid, first);
        assert!(!backend.object_exists(first));
        assert_eq!(backend.object_data(new_oid).unwrap(), b"two");
    }

    #[test]
    fn test_write_failure_without_fragment_room_rolls_back() {
        let (backend, _) = setup();
        let config = GatewayConfig::default().with_max_fragments(1);
        let ctx = GatewayContext::new(config, backend.clone(), ShutdownSignal::new()).unwrap();
        backend.set_faults(FaultPlan::new().fail_writes([1]));

        let put = PutObject::new(ctx.clone(), PutRequest::new("photos", "k", vec![7u8; 100]), ClientConnection::new());
        put.start();
        ctx.run_until_idle().unwrap();

        let outcome = put.outcome().unwrap();
        assert_eq!(outcome.error_class, Some(ErrorClass::InternalError));
        assert_eq!(put.with_state(|s| s.stage()), PutStage::WriteFailed);
        assert_eq!(backend.object_count(), 0);
        assert!(backend.kv_entries(ctx.ledger.index()).is_empty());
    }
}
