//! Sync-coalescing engine
//!
//! Metadata commits are expensive because of the database sync behind them.
//! This engine batches them: each caller context owns two coalescing
//! contexts (one for keyval modifications, one for dataspace modifications),
//! and descriptors whose service routine succeeded wait on a sync queue
//! until a watermark fires. One database sync then releases the whole
//! batch to the completion queue, which bounds worst-case completion
//! latency at `high_watermark` operations.
//!
//! Per collection, three knobs steer the engine: `meta_sync_enabled`,
//! `high_watermark`, and `low_watermark`. A sync is never elided for a
//! descriptor that carried the sync-required flag while coalescing is
//! disabled for its collection.

use std::sync::{Arc, Mutex};

use crate::context::ContextTable;
use crate::context::MAX_CONTEXTS;
use crate::db::Db;
use crate::mgmt::Collection;
use crate::op::{OpResult, OpState, QueuedOp, SyncClass};

#[derive(Default)]
struct SyncContext {
    /// Outstanding operations carrying the sync-required flag
    sync_counter: usize,
    /// Outstanding operations without it
    non_sync_counter: usize,
    /// Operations waiting for the next batched sync
    coalesce_counter: usize,
    queue: Vec<Arc<QueuedOp>>,
}

pub struct SyncCoalescer {
    // [class][context]
    contexts: [Vec<Mutex<SyncContext>>; 2],
}

impl SyncCoalescer {
    pub fn new() -> SyncCoalescer {
        SyncCoalescer {
            contexts: [
                (0..MAX_CONTEXTS).map(|_| Mutex::new(SyncContext::default())).collect(),
                (0..MAX_CONTEXTS).map(|_| Mutex::new(SyncContext::default())).collect(),
            ],
        }
    }

    fn context(&self, class: SyncClass, context_id: usize) -> Option<&Mutex<SyncContext>> {
        self.contexts[class as usize].get(context_id)
    }

    /// Account a sync-affecting operation at post time.
    pub fn enqueue_accounting(&self, op: &QueuedOp) {
        let Some(class) = op.sync_class() else { return };
        let Some(ctx) = self.context(class, op.context_id) else { return };
        let mut ctx = ctx.lock().unwrap();
        if op.sync_required() {
            ctx.sync_counter += 1;
        } else {
            ctx.non_sync_counter += 1;
        }
        log::trace!(
            "coalesce enqueue {:?}: sync={} non_sync={}",
            class,
            ctx.sync_counter,
            ctx.non_sync_counter
        );
    }

    /// Release the post-time accounting when a worker claims the operation.
    pub fn dequeue_accounting(&self, op: &QueuedOp) {
        let Some(class) = op.sync_class() else { return };
        let Some(ctx) = self.context(class, op.context_id) else { return };
        let mut ctx = ctx.lock().unwrap();
        if op.sync_required() {
            ctx.sync_counter = ctx.sync_counter.saturating_sub(1);
        } else {
            ctx.non_sync_counter = ctx.non_sync_counter.saturating_sub(1);
        }
    }

    /// Hand a serviced descriptor to the coalescer. Non-sync-affecting
    /// operations and operations without the sync-required flag complete
    /// immediately; the rest either trigger a batched sync or join the
    /// sync queue. A failed sync is fatal for every operation whose commit
    /// it would have carried; those complete with the sync error.
    pub fn coalesce(&self, contexts: &ContextTable, op: Arc<QueuedOp>, result: OpResult) {
        let Some(class) = op.sync_class() else {
            contexts.complete(&op, result, OpState::Completed);
            return;
        };

        if !op.sync_required() {
            contexts.complete(&op, result, OpState::Completed);
            return;
        }

        let coll = match op.coll.as_ref() {
            Some(coll) => Arc::clone(coll),
            None => {
                contexts.complete(&op, result, OpState::Completed);
                return;
            }
        };
        let (meta_sync_enabled, high_watermark, low_watermark) = {
            let options = coll.options.lock().unwrap();
            (
                options.meta_sync_enabled,
                options.high_watermark,
                options.low_watermark,
            )
        };
        let db = class_db(&coll, class);
        let Some(sync_ctx) = self.context(class, op.context_id) else {
            contexts.complete(&op, result, OpState::Completed);
            return;
        };

        if !meta_sync_enabled {
            // complete right away, but still account toward a periodic sync
            contexts.complete(&op, result, OpState::Completed);

            let do_sync = {
                let mut ctx = sync_ctx.lock().unwrap();
                ctx.coalesce_counter += 1;
                if (high_watermark > 0 && ctx.coalesce_counter >= high_watermark)
                    || ctx.sync_counter < low_watermark
                {
                    ctx.coalesce_counter = 0;
                    true
                } else {
                    false
                }
            };
            if do_sync {
                log::debug!("coalesce {:?}: periodic sync (meta sync disabled)", class);
                if let Err(err) = db.sync() {
                    log::error!("periodic {:?} sync failed: {}", class, err);
                }
            }
            return;
        }

        let mut ctx = sync_ctx.lock().unwrap();
        if ctx.sync_counter < low_watermark
            || (high_watermark > 0 && ctx.coalesce_counter >= high_watermark)
        {
            log::debug!(
                "coalesce {:?}: watermark fired (coalesced={} pending={}), syncing",
                class,
                ctx.coalesce_counter,
                ctx.sync_counter
            );
            let sync_error = db.sync().err();

            let current = match &sync_error {
                Some(err) => OpResult::err(*err),
                None => result,
            };
            contexts.complete(&op, current, OpState::Completed);
            for ready in ctx.queue.drain(..) {
                let ready_result = match &sync_error {
                    Some(err) => OpResult::err(*err),
                    None => ready
                        .take_result()
                        .unwrap_or_else(|| OpResult::ok(Default::default())),
                };
                contexts.complete(&ready, ready_result, OpState::Completed);
            }
            ctx.coalesce_counter = 0;
        } else {
            log::trace!(
                "coalesce {:?}: queueing (coalesced={} pending={})",
                class,
                ctx.coalesce_counter,
                ctx.sync_counter
            );
            op.store_result(result);
            ctx.queue.push(op);
            ctx.coalesce_counter += 1;
        }
    }
}

impl Default for SyncCoalescer {
    fn default() -> Self {
        Self::new()
    }
}

fn class_db(coll: &Collection, class: SyncClass) -> &Db {
    match class {
        SyncClass::Keyval => &coll.keyval_db,
        SyncClass::Dspace => &coll.ds_db,
    }
}
