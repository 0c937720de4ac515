//! Caller contexts and completion retrieval
//!
//! A caller opens a context (a small integer) that owns a dedicated
//! completion queue and condition variable. Completed operations are pushed
//! onto their context's queue; `test` and its batch variants wait with a
//! timeout, then drain matching completions. An operation id is freed the
//! moment its completion is observed, so exactly one test call sees
//! `Complete` for any id; later calls resolve to nothing.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::StorageError;
use crate::op::registry::OpRegistry;
use crate::op::{OpId, OpResult, OpState, QueuedOp, NO_CONTEXT};
use crate::Result;

/// Maximum number of concurrently open contexts.
pub const MAX_CONTEXTS: usize = 16;

/// A retrieved completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: OpId,
    pub user_token: u64,
    pub state: OpResult,
}

/// Outcome of a single-operation test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Busy,
    Complete(Completion),
}

struct CompletionQueue {
    queue: Mutex<VecDeque<OpId>>,
    cond: Condvar,
}

impl CompletionQueue {
    fn new() -> Arc<CompletionQueue> {
        Arc::new(CompletionQueue {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        })
    }
}

/// The table of open contexts plus the completion entry points.
pub struct ContextTable {
    slots: Mutex<Vec<Option<Arc<CompletionQueue>>>>,
}

impl ContextTable {
    pub fn new() -> ContextTable {
        ContextTable {
            slots: Mutex::new((0..MAX_CONTEXTS).map(|_| None).collect()),
        }
    }

    /// Open a context; fails with `Busy` when all context slots are taken.
    pub fn open(&self) -> Result<usize> {
        let mut slots = self.slots.lock().unwrap();
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(CompletionQueue::new());
                return Ok(index);
            }
        }
        Err(StorageError::Busy)
    }

    pub fn close(&self, context_id: usize) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(context_id) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(StorageError::Invalid),
        }
    }

    fn get(&self, context_id: usize) -> Result<Arc<CompletionQueue>> {
        let slots = self.slots.lock().unwrap();
        slots
            .get(context_id)
            .and_then(|slot| slot.clone())
            .ok_or(StorageError::Invalid)
    }

    /// Move a serviced descriptor to its context's completion queue and
    /// signal waiters. `final_state` is `Completed` or `Canceled`.
    pub(crate) fn complete(&self, op: &QueuedOp, result: OpResult, final_state: OpState) {
        debug_assert!(matches!(final_state, OpState::Completed | OpState::Canceled));
        op.store_result(result);
        op.set_state(final_state);

        if op.context_id == NO_CONTEXT {
            return;
        }
        if let Ok(ctx) = self.get(op.context_id) {
            let mut queue = ctx.queue.lock().unwrap();
            queue.push_back(op.id());
            drop(queue);
            ctx.cond.notify_all();
        }
    }

    /// Wait for one specific operation. `Busy` on timeout.
    pub fn test(
        &self,
        registry: &OpRegistry,
        context_id: usize,
        id: OpId,
        timeout: Duration,
    ) -> Result<TestOutcome> {
        let ctx = self.get(context_id)?;
        let deadline = Instant::now() + timeout;
        let mut queue = ctx.queue.lock().unwrap();
        loop {
            if let Some(index) = queue.iter().position(|&qid| qid == id) {
                queue.remove(index);
                drop(queue);
                return Ok(TestOutcome::Complete(retire(registry, id)?));
            }
            // the id may already be unknown (freed by an earlier test)
            if registry.lookup(id).is_none() {
                return Err(StorageError::Invalid);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(TestOutcome::Busy);
            }
            let (guard, _timeout) = ctx.cond.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
        }
    }

    /// Drain up to `max` completions from a context.
    pub fn test_context(
        &self,
        registry: &OpRegistry,
        context_id: usize,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Completion>> {
        let ctx = self.get(context_id)?;
        let deadline = Instant::now() + timeout;
        let mut queue = ctx.queue.lock().unwrap();
        loop {
            if !queue.is_empty() {
                let take = queue.len().min(max);
                let ids: Vec<OpId> = queue.drain(..take).collect();
                drop(queue);
                return ids.into_iter().map(|id| retire(registry, id)).collect();
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let (guard, _timeout) = ctx.cond.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
        }
    }

    /// Test a specific id set; returns the completions found within the
    /// timeout (possibly empty).
    pub fn test_some(
        &self,
        registry: &OpRegistry,
        context_id: usize,
        ids: &[OpId],
        timeout: Duration,
    ) -> Result<Vec<Completion>> {
        let ctx = self.get(context_id)?;
        let deadline = Instant::now() + timeout;
        let mut queue = ctx.queue.lock().unwrap();
        loop {
            let matched: Vec<OpId> = queue
                .iter()
                .copied()
                .filter(|qid| ids.contains(qid))
                .collect();
            if !matched.is_empty() {
                queue.retain(|qid| !matched.contains(qid));
                drop(queue);
                return matched.into_iter().map(|id| retire(registry, id)).collect();
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let (guard, _timeout) = ctx.cond.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
        }
    }
}

impl Default for ContextTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Free a completed id and package its stored state.
fn retire(registry: &OpRegistry, id: OpId) -> Result<Completion> {
    let op = registry.unregister(id).ok_or(StorageError::Invalid)?;
    let state = op
        .take_result()
        .unwrap_or_else(|| OpResult::err(StorageError::CorruptState));
    Ok(Completion {
        id,
        user_token: op.user_token,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use crate::op::{OpOutput, OpPayload, QueueRole};
    use std::thread;

    fn completed_op(table: &ContextTable, registry: &OpRegistry, ctx: usize) -> OpId {
        let op = QueuedOp::new(
            None,
            Handle(1),
            ctx,
            77,
            QueueRole::MetaRead,
            false,
            OpPayload::DspaceVerify,
        );
        let id = registry.register(&op);
        table.complete(&op, OpResult::ok(OpOutput::Size(5)), OpState::Completed);
        id
    }

    #[test]
    fn test_open_close_exhaustion() {
        let table = ContextTable::new();
        let mut ids = Vec::new();
        for _ in 0..MAX_CONTEXTS {
            ids.push(table.open().unwrap());
        }
        assert_eq!(table.open().err(), Some(StorageError::Busy));
        table.close(ids[0]).unwrap();
        assert_eq!(table.open().unwrap(), ids[0]);
    }

    #[test]
    fn test_close_invalid() {
        let table = ContextTable::new();
        assert_eq!(table.close(3).err(), Some(StorageError::Invalid));
        assert_eq!(table.close(MAX_CONTEXTS + 1).err(), Some(StorageError::Invalid));
    }

    #[test]
    fn test_single_completion_observed_once() {
        let table = ContextTable::new();
        let registry = OpRegistry::new();
        let ctx = table.open().unwrap();
        let id = completed_op(&table, &registry, ctx);

        match table.test(&registry, ctx, id, Duration::from_millis(100)).unwrap() {
            TestOutcome::Complete(completion) => {
                assert_eq!(completion.id, id);
                assert_eq!(completion.user_token, 77);
                assert!(completion.state.is_ok());
            }
            TestOutcome::Busy => panic!("expected completion"),
        }

        // the id is post-free now
        assert_eq!(
            table.test(&registry, ctx, id, Duration::from_millis(10)).err(),
            Some(StorageError::Invalid)
        );
    }

    #[test]
    fn test_busy_on_timeout() {
        let table = ContextTable::new();
        let registry = OpRegistry::new();
        let ctx = table.open().unwrap();

        let op = QueuedOp::new(
            None,
            Handle(1),
            ctx,
            0,
            QueueRole::MetaRead,
            false,
            OpPayload::DspaceVerify,
        );
        let id = registry.register(&op);
        let outcome = table.test(&registry, ctx, id, Duration::from_millis(20)).unwrap();
        assert_eq!(outcome, TestOutcome::Busy);
    }

    #[test]
    fn test_wakes_on_completion_from_other_thread() {
        let table = Arc::new(ContextTable::new());
        let registry = Arc::new(OpRegistry::new());
        let ctx = table.open().unwrap();

        let op = QueuedOp::new(
            None,
            Handle(1),
            ctx,
            5,
            QueueRole::MetaRead,
            false,
            OpPayload::DspaceVerify,
        );
        let id = registry.register(&op);

        let table2 = Arc::clone(&table);
        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            table2.complete(&op, OpResult::ok(OpOutput::None), OpState::Completed);
        });

        let outcome = table.test(&registry, ctx, id, Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, TestOutcome::Complete(_)));
        signaller.join().unwrap();
    }

    #[test]
    fn test_context_drains_up_to_max() {
        let table = ContextTable::new();
        let registry = OpRegistry::new();
        let ctx = table.open().unwrap();
        for _ in 0..5 {
            completed_op(&table, &registry, ctx);
        }

        let batch = table
            .test_context(&registry, ctx, 3, Duration::from_millis(100))
            .unwrap();
        assert_eq!(batch.len(), 3);
        let rest = table
            .test_context(&registry, ctx, 10, Duration::from_millis(100))
            .unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn test_some_filters_ids() {
        let table = ContextTable::new();
        let registry = OpRegistry::new();
        let ctx = table.open().unwrap();
        let wanted = completed_op(&table, &registry, ctx);
        let other = completed_op(&table, &registry, ctx);

        let found = table
            .test_some(&registry, ctx, &[wanted], Duration::from_millis(100))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, wanted);

        // the unrelated completion is still retrievable
        let rest = table
            .test_some(&registry, ctx, &[other], Duration::from_millis(100))
            .unwrap();
        assert_eq!(rest.len(), 1);
    }
}
