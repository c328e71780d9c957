//! Fault-mode write controller
//!
//! Streams a request body into its backend object chunk by chunk. When the
//! current object keeps failing writes, the controller closes it as a
//! fragment holding exactly the bytes that did land, opens a new object (new
//! id, layout sized for the remaining bytes, tombstone written first) and
//! replays the unwritten tail there.
//!
//! ```text
//! Primary --(N consecutive failures)--> Fragmented --(tail written)--> Complete
//!    |                                       |
//!    +-------(fragment limit reached)--------+--------> Aborted
//! ```
//!
//! Checksums close at every fragment boundary as well as for the whole
//! object, so the ETag of a fragmented object matches a multipart upload of
//! the same slices.

use crate::backend::BackendError;
use crate::context::GatewayContext;
use crate::core::checksum::{ContentChecksums, ContentHasher};
use crate::core::layout::LayoutDescriptor;
use crate::core::ledger::TombstoneRecord;
use crate::core::oid::{CollisionRetry, ObjectId};
use crate::error::{GatewayError, Result};
use crate::metadata::{join_failure, BucketIndexes, FragmentDescriptor};
use bytes::Bytes;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePhase {
    Primary,
    Fragmented,
    Complete,
    Aborted,
}

/// Where the data belongs
#[derive(Debug, Clone)]
pub struct WriteTarget {
    pub indexes: BucketIndexes,
    pub object_name: String,
    /// Seed new fragment ids derive from (the object URI)
    pub seed: String,
}

/// Result of a controlled write
#[derive(Debug)]
pub struct WriteReport {
    pub phase: WritePhase,
    /// Every object the data went to, primary first
    pub fragments: Vec<FragmentDescriptor>,
    /// Tombstones written for fragments after the primary
    pub fragment_records: Vec<TombstoneRecord>,
    /// Present once the write completed
    pub checksums: Option<ContentChecksums>,
    pub bytes_written: u64,
    /// Logical offset at which fault mode was entered
    pub fragmented_at: Option<u64>,
    pub error: Option<GatewayError>,
}

impl WriteReport {
    pub fn is_fragmented(&self) -> bool {
        self.fragments.len() > 1
    }

    /// Fragment objects other than the primary
    pub fn extra_fragments(&self) -> &[FragmentDescriptor] {
        self.fragments.get(1..).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveFragment {
    oid: ObjectId,
    layout: LayoutDescriptor,
    index: u32,
    /// Logical offset of this fragment's first byte
    base_offset: u64,
    written: u64,
    failures: u32,
}

impl ActiveFragment {
    fn descriptor(&self) -> FragmentDescriptor {
        FragmentDescriptor {
            object_id: self.oid,
            layout_id: self.layout.layout_id,
            byte_size: self.written,
            sequence_index: self.index,
        }
    }
}

struct WriteJob {
    ctx: Rc<GatewayContext>,
    target: WriteTarget,
    body: Bytes,
    phase: WritePhase,
    closed: Vec<FragmentDescriptor>,
    active: ActiveFragment,
    cursor: u64,
    fragmented_at: Option<u64>,
    hasher: ContentHasher,
    records: Vec<TombstoneRecord>,
    /// Record found under the active fragment's key before ours replaced it
    displaced: Option<TombstoneRecord>,
    on_done: Option<Box<dyn FnOnce(WriteReport)>>,
}

type SharedJob = Rc<RefCell<WriteJob>>;

/// Entry point for controlled writes
pub struct FragmentedWriteController;

impl FragmentedWriteController {
    /// Write `body` starting at the already-created `primary` object
    ///
    /// `on_done` runs once, from the event loop, with the final report.
    pub fn start<F>(
        ctx: Rc<GatewayContext>,
        target: WriteTarget,
        primary: ObjectId,
        layout: LayoutDescriptor,
        body: Bytes,
        on_done: F,
    ) where
        F: FnOnce(WriteReport) + 'static,
    {
        debug!(
            "Writing {} bytes to {} (layout {})",
            body.len(),
            primary,
            layout.layout_id
        );
        let lp = ctx.lp.clone();
        let job = Rc::new(RefCell::new(WriteJob {
            ctx,
            target,
            body,
            phase: WritePhase::Primary,
            closed: Vec::new(),
            active: ActiveFragment {
                oid: primary,
                layout,
                index: 0,
                base_offset: 0,
                written: 0,
                failures: 0,
            },
            cursor: 0,
            fragmented_at: None,
            hasher: ContentHasher::new(),
            records: Vec::new(),
            displaced: None,
            on_done: Some(Box::new(on_done)),
        }));
        lp.defer("start write", move || write_next(&job));
    }
}

fn write_next(job: &SharedJob) {
    let (ctx, oid, offset, chunk) = {
        let j = job.borrow();
        let total = j.body.len() as u64;
        if j.cursor >= total {
            drop(j);
            finish(job, None);
            return;
        }
        let chunk_size = j.active.layout.unit_size * u64::from(j.ctx.config.write.payload_units);
        let start = j.cursor as usize;
        let end = (j.cursor + chunk_size).min(total) as usize;
        (
            j.ctx.clone(),
            j.active.oid,
            j.cursor - j.active.base_offset,
            j.body.slice(start..end),
        )
    };

    let backend = ctx.backend.clone();
    let mut data = Some(chunk.clone());
    let job = job.clone();
    ctx.lp.launch_then(
        "write data",
        1,
        move |c| {
            if let Some(data) = data.take() {
                backend.write_object(oid, offset, data, c.into_op_callback());
            }
        },
        move |outcome| {
            if outcome.all_succeeded() {
                chunk_written(&job, &chunk);
            } else {
                let err = outcome.first_error().cloned().unwrap_or(BackendError::Cancelled);
                chunk_failed(&job, err);
            }
        },
    );
}

fn chunk_written(job: &SharedJob, chunk: &Bytes) {
    {
        let mut j = job.borrow_mut();
        j.hasher.update(chunk);
        j.active.written += chunk.len() as u64;
        j.active.failures = 0;
        j.cursor += chunk.len() as u64;
    }
    write_next(job);
}

fn chunk_failed(job: &SharedJob, err: BackendError) {
    if matches!(err, BackendError::LaunchFailed(_)) {
        let oid = job.borrow().active.oid;
        let err = GatewayError::unavailable(format!("write to {} failed to launch: {}", oid, err));
        finish(job, Some(err));
        return;
    }
    let split = {
        let mut j = job.borrow_mut();
        j.active.failures += 1;
        warn!(
            "Write to {} at logical offset {} failed ({} in a row): {}",
            j.active.oid, j.cursor, j.active.failures, err
        );
        j.active.failures >= j.ctx.config.write.failures_before_fragment
    };
    if split {
        open_fragment(job);
    } else {
        write_next(job);
    }
}

fn open_fragment(job: &SharedJob) {
    let exhausted = {
        let mut j = job.borrow_mut();
        let max_fragments = j.ctx.config.write.max_fragments;
        let next_index = j.active.index + 1;
        if next_index >= max_fragments {
            Some(GatewayError::FragmentLimitExhausted {
                last_fragment: j.active.index,
                max_fragments,
            })
        } else {
            let closed = j.active.descriptor();
            j.closed.push(closed);
            j.hasher.close_fragment();

            if j.phase == WritePhase::Primary {
                info!(
                    "Entering fault mode for {}/{}: splitting into fragments",
                    j.target.indexes.bucket, j.target.object_name
                );
                j.phase = WritePhase::Fragmented;
                j.fragmented_at = Some(j.cursor);
            }

            let remaining = j.body.len() as u64 - j.cursor;
            let layout = j.ctx.layouts.select(remaining);
            let oid = j.ctx.allocator.generate(&fragment_seed(&j.target.seed, next_index));
            info!(
                "Opening fragment {} as {} at logical offset {} ({} bytes left)",
                next_index, oid, j.cursor, remaining
            );
            j.active = ActiveFragment {
                oid,
                layout,
                index: next_index,
                base_offset: j.cursor,
                written: 0,
                failures: 0,
            };
            None
        }
    };

    match exhausted {
        Some(err) => finish(job, Some(err)),
        None => {
            let retry = job.borrow().ctx.allocator.retry_sequence();
            protect_fragment(job, retry);
        }
    }
}

fn fragment_seed(seed: &str, index: u32) -> String {
    format!("{}#fragment{}", seed, index)
}

/// Write the tombstone for the active fragment, then create it
fn protect_fragment(job: &SharedJob, retry: CollisionRetry) {
    let (ctx, record) = {
        let mut j = job.borrow_mut();
        let record = j.ctx.ledger.fragment_record(
            &j.target.indexes,
            &j.target.object_name,
            j.active.oid,
            j.closed[0].object_id,
            j.active.layout.layout_id,
            j.active.index,
        );
        j.records.push(record.clone());
        (j.ctx.clone(), record)
    };

    let job = job.clone();
    let c = ctx.clone();
    ctx.ledger.get_existing(&ctx.lp, vec![record.key.clone()], move |res| match res {
        Ok(mut found) => {
            job.borrow_mut().displaced = found.pop();
            c.ledger.record_pending(&c.lp, &[record], move |res| match res {
                Ok(()) => create_fragment(&job, retry),
                Err(err) => finish(&job, Some(err)),
            });
        }
        Err(err) => finish(&job, Some(err)),
    });
}

fn create_fragment(job: &SharedJob, mut retry: CollisionRetry) {
    let (ctx, oid, layout) = {
        let j = job.borrow();
        (j.ctx.clone(), j.active.oid, j.active.layout)
    };
    let backend = ctx.backend.clone();
    let job = job.clone();
    ctx.lp.launch_then(
        "create fragment",
        1,
        move |c| backend.create_object(oid, layout, c.into_op_callback()),
        move |outcome| {
            if outcome.all_succeeded() {
                write_next(&job);
                return;
            }
            if outcome.error(0) != Some(&BackendError::AlreadyExists) {
                finish(&job, Some(join_failure(&outcome, "create fragment")));
                return;
            }

            // The id is taken. Put back the record we overwrote, or drop ours if the key was free.
            let (ctx, seed, stale_key, displaced) = {
                let mut j = job.borrow_mut();
                let seed = fragment_seed(&j.target.seed, j.active.index);
                let stale_key = j.ctx.ledger.key_for(oid, layout.layout_id);
                j.records.retain(|r| r.key != stale_key);
                let displaced = j.displaced.take();
                (j.ctx.clone(), seed, stale_key, displaced)
            };
            let next = match retry.next_id(&ctx.allocator, &seed, oid) {
                Ok(next) => next,
                Err(err) => {
                    finish(&job, Some(err));
                    return;
                }
            };
            job.borrow_mut().active.oid = next;
            let resume = move |res: Result<()>| {
                if let Err(err) = res {
                    warn!("Failed to settle tombstone of colliding fragment id {}: {}", oid, err);
                }
                protect_fragment(&job, retry);
            };
            match displaced {
                Some(record) => {
                    info!("Fragment id {} was left by an earlier request; restoring its tombstone", oid);
                    ctx.ledger.record_pending(&ctx.lp, &[record], resume);
                }
                None => ctx.ledger.retire(&ctx.lp, vec![stale_key], resume),
            }
        },
    );
}

fn finish(job: &SharedJob, error: Option<GatewayError>) {
    let (on_done, report) = {
        let mut j = job.borrow_mut();
        let mut fragments = std::mem::take(&mut j.closed);
        fragments.push(j.active.descriptor());

        let checksums = match error {
            None => Some(std::mem::take(&mut j.hasher).finish()),
            Some(_) => None,
        };
        j.phase = if error.is_none() {
            WritePhase::Complete
        } else {
            WritePhase::Aborted
        };

        if let Some(err) = &error {
            warn!(
                "Write of {}/{} aborted after {} bytes: {}",
                j.target.indexes.bucket, j.target.object_name, j.cursor, err
            );
        } else if fragments.len() > 1 {
            info!(
                "Wrote {}/{} as {} fragments",
                j.target.indexes.bucket,
                j.target.object_name,
                fragments.len()
            );
        }

        let report = WriteReport {
            phase: j.phase,
            fragments,
            fragment_records: std::mem::take(&mut j.records),
            checksums,
            bytes_written: j.cursor,
            fragmented_at: j.fragmented_at,
            error,
        };
        (j.on_done.take(), report)
    };
    if let Some(on_done) = on_done {
        on_done(report);
    }
}
