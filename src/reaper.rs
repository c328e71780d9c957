//! Background reaper
//!
//! Walks the tombstone ledger and settles every record some request left
//! behind: the object it protects is either still referenced (retire the
//! record) or garbage (delete the object, then retire the record).
//!
//! A pass runs on the context's event loop and blocks until the ledger has
//! been walked once. Records of instances that are still running are left
//! alone unless already flagged unreachable, since their owning request may
//! still be in flight.

use crate::context::GatewayContext;
use crate::core::event_loop::EventLoop;
use crate::core::ledger::{LedgerEntry, TombstoneRecord};
use crate::error::{GatewayError, Result};
use crate::flows::delete_objects;
use crate::metadata::{BucketIndexes, ObjectMetadata};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Ledger records fetched per page
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Counters for one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub examined: usize,
    /// Owned by an active instance, or malformed
    pub skipped: usize,
    /// Backend objects removed
    pub deleted: usize,
    /// Records removed from the ledger
    pub retired: usize,
    pub failed: usize,
}

enum Verdict {
    Live,
    Garbage,
}

pub struct Reaper {
    ctx: Rc<GatewayContext>,
    page_size: usize,
}

impl Reaper {
    pub fn new(ctx: Rc<GatewayContext>) -> Self {
        Reaper {
            ctx,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Walk the whole ledger once
    ///
    /// `active_instances` names gateway instances whose unflagged records
    /// must not be touched.
    pub fn run_pass(&self, active_instances: &HashSet<String>) -> Result<ReapReport> {
        let mut report = ReapReport::default();
        let mut after: Option<String> = None;
        loop {
            let page = self.fetch_page(after.clone())?;
            let full = page.len() >= self.page_size;
            after = page.last().map(|(key, _)| key.clone());

            for (key, record) in page {
                report.examined += 1;
                let record = match record {
                    Ok(record) => record,
                    Err(err) => {
                        warn!("Skipping malformed tombstone {}: {}", key, err);
                        report.skipped += 1;
                        continue;
                    }
                };
                if !record.force_delete && active_instances.contains(&record.instance_id) {
                    debug!("Skipping {}: instance {} is active", key, record.instance_id);
                    report.skipped += 1;
                    continue;
                }
                if let Err(err) = self.settle(&key, &record, &mut report) {
                    warn!("Failed to reap {}: {}", key, err);
                    report.failed += 1;
                }
            }

            if !full || after.is_none() {
                break;
            }
        }
        info!(
            "Reaper pass done: {} examined, {} skipped, {} deleted, {} retired, {} failed",
            report.examined, report.skipped, report.deleted, report.retired, report.failed
        );
        Ok(report)
    }

    fn fetch_page(&self, after: Option<String>) -> Result<Vec<LedgerEntry>> {
        let ctx = &self.ctx;
        let slot = Rc::new(RefCell::new(None));
        let out = slot.clone();
        ctx.ledger.list(&ctx.lp, after, self.page_size, move |res| {
            *out.borrow_mut() = Some(res);
        });
        drain(&ctx.lp, slot, "list tombstones")
    }

    fn settle(&self, key: &str, record: &TombstoneRecord, report: &mut ReapReport) -> Result<()> {
        match self.judge(record)? {
            Verdict::Live => {
                debug!("{} still referenced by {}/{}", record.object_id, record.bucket, record.object_name);
            }
            Verdict::Garbage => {
                self.delete(record)?;
                report.deleted += 1;
            }
        }
        self.retire(key)?;
        report.retired += 1;
        Ok(())
    }

    fn judge(&self, record: &TombstoneRecord) -> Result<Verdict> {
        if record.force_delete {
            return Ok(Verdict::Garbage);
        }
        let ctx = &self.ctx;
        let indexes = BucketIndexes::new(
            record.bucket.clone(),
            record.object_list_index,
            record.extended_index,
        );
        let slot: Rc<RefCell<Option<Result<Option<ObjectMetadata>>>>> = Rc::new(RefCell::new(None));
        let out = slot.clone();
        ctx.metadata.load(&ctx.lp, &indexes, &record.object_name, move |res| {
            *out.borrow_mut() = Some(res);
        });
        let live = drain(&ctx.lp, slot, "load metadata")?
            .is_some_and(|meta| meta.object_id == record.primary_object_id);
        Ok(if live { Verdict::Live } else { Verdict::Garbage })
    }

    fn delete(&self, record: &TombstoneRecord) -> Result<()> {
        let ctx = &self.ctx;
        let slot = Rc::new(RefCell::new(None));
        let out = slot.clone();
        delete_objects(ctx, vec![(record.object_id, record.layout_id)], move |results| {
            let result = results
                .into_iter()
                .next()
                .unwrap_or(Ok(()))
                .map_err(GatewayError::from);
            *out.borrow_mut() = Some(result);
        });
        drain(&ctx.lp, slot, "delete object")
    }

    fn retire(&self, key: &str) -> Result<()> {
        let ctx = &self.ctx;
        let slot = Rc::new(RefCell::new(None));
        let out = slot.clone();
        ctx.ledger.retire(&ctx.lp, vec![key.to_string()], move |res| {
            *out.borrow_mut() = Some(res);
        });
        drain(&ctx.lp, slot, "retire tombstone")
    }
}

/// Run the loop until `slot` is filled
fn drain<T>(lp: &EventLoop, slot: Rc<RefCell<Option<Result<T>>>>, what: &str) -> Result<T> {
    lp.run_until_idle()?;
    let taken = slot.borrow_mut().take();
    taken.unwrap_or_else(|| Err(GatewayError::Internal(format!("{} never completed", what))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::GatewayConfig;
    use crate::core::event_loop::ShutdownSignal;
    use crate::core::oid::ObjectId;
    use crate::flows::put_object::{put_object, PutRequest};
    use std::sync::Arc;

    fn setup() -> (Arc<InMemoryBackend>, Rc<GatewayContext>) {
        let backend = Arc::new(InMemoryBackend::new(2));
        let ctx = GatewayContext::new(GatewayConfig::default(), backend.clone(), ShutdownSignal::new()).unwrap();
        (backend, ctx)
    }

    fn write_record(ctx: &Rc<GatewayContext>, record: TombstoneRecord) {
        let done = Rc::new(RefCell::new(None));
        let out = done.clone();
        ctx.ledger.record_pending(&ctx.lp, &[record], move |res| {
            *out.borrow_mut() = Some(res);
        });
        ctx.run_until_idle().unwrap();
        done.borrow_mut().take().unwrap().unwrap();
    }

    #[test]
    fn test_empty_ledger_pass() {
        let (_, ctx) = setup();
        let report = Reaper::new(ctx).run_pass(&HashSet::new()).unwrap();
        assert_eq!(report, ReapReport::default());
    }

    #[test]
    fn test_orphan_is_deleted_and_live_object_kept() {
        let (backend, ctx) = setup();
        put_object(&ctx, PutRequest::new("photos", "live", &b"keep me"[..])).unwrap();
        let live_id = backend.object_ids()[0];

        let orphan = ObjectId::from_parts(7, 7);
        backend.seed_object(orphan, 0, b"lost");
        let indexes = BucketIndexes::derive("photos");
        let layout = ctx.layouts.select(4).layout_id;
        write_record(
            &ctx,
            ctx.ledger
                .new_object_record(&indexes, "gone", orphan, ObjectId::ZERO, layout),
        );
        write_record(
            &ctx,
            ctx.ledger
                .new_object_record(&indexes, "live", live_id, ObjectId::ZERO, layout),
        );

        let report = Reaper::new(ctx.clone()).run_pass(&HashSet::new()).unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.retired, 2);
        assert!(!backend.object_exists(orphan));
        assert!(backend.object_exists(live_id));
        assert!(backend.kv_entries(ctx.ledger.index()).is_empty());
    }

    #[test]
    fn test_active_instance_records_are_skipped() {
        let (backend, ctx) = setup();
        let orphan = ObjectId::from_parts(1, 2);
        backend.seed_object(orphan, 0, b"x");
        let indexes = BucketIndexes::derive("photos");
        write_record(
            &ctx,
            ctx.ledger.new_object_record(&indexes, "k", orphan, ObjectId::ZERO, 0),
        );

        let active: HashSet<String> = [ctx.ledger.instance_id().to_string()].into_iter().collect();
        let report = Reaper::new(ctx.clone()).run_pass(&active).unwrap();
        assert_eq!(report.skipped, 1);
        assert!(backend.object_exists(orphan));

        let report = Reaper::new(ctx).run_pass(&HashSet::new()).unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!backend.object_exists(orphan));
    }

    #[test]
    fn test_paging_visits_every_record() {
        let (backend, ctx) = setup();
        let indexes = BucketIndexes::derive("photos");
        for i in 0..7u64 {
            let oid = ObjectId::from_parts(i, i + 1);
            backend.seed_object(oid, 0, b"x");
            write_record(
                &ctx,
                ctx.ledger
                    .new_object_record(&indexes, &format!("k{}", i), oid, ObjectId::ZERO, 0),
            );
        }
        let report = Reaper::new(ctx).with_page_size(3).run_pass(&HashSet::new()).unwrap();
        assert_eq!(report.examined, 7);
        assert_eq!(report.deleted, 7);
        assert_eq!(backend.object_count(), 0);
    }
}
