//! Worker pool FIFO queues
//!
//! One queue per worker role. Producers lock, append, and signal one waiter;
//! workers block on the condition variable. `pop_eligible` lets a worker
//! skip descriptors whose target handle is already being serviced, which
//! keeps per-handle submission order while allowing unrelated handles to
//! proceed in parallel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::{OpId, OpState, QueuedOp};

pub struct OpQueue {
    name: &'static str,
    inner: Mutex<VecDeque<Arc<QueuedOp>>>,
    cond: Condvar,
}

impl OpQueue {
    pub fn new(name: &'static str) -> OpQueue {
        OpQueue {
            name,
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append a descriptor and wake one worker. The descriptor moves to the
    /// `Queued` state.
    pub fn push(&self, op: Arc<QueuedOp>) {
        op.set_state(OpState::Queued);
        let mut queue = self.inner.lock().unwrap();
        queue.push_back(op);
        drop(queue);
        self.cond.notify_one();
    }

    /// Block until an eligible descriptor is available or `running` goes
    /// false. FIFO order is preserved among eligible descriptors.
    pub fn pop_eligible<F>(&self, running: &AtomicBool, eligible: F) -> Option<Arc<QueuedOp>>
    where
        F: Fn(&QueuedOp) -> bool,
    {
        let mut queue = self.inner.lock().unwrap();
        loop {
            if !running.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(index) = queue.iter().position(|op| eligible(op)) {
                return queue.remove(index);
            }
            // the timeout bounds how long a shutdown or a handle release can
            // go unobserved
            let (guard, _timeout) = self
                .cond
                .wait_timeout(queue, Duration::from_millis(100))
                .unwrap();
            queue = guard;
        }
    }

    /// Like [`OpQueue::pop_eligible`] with every descriptor eligible, but
    /// gives up after `timeout`. The background file-removal worker uses
    /// this so it can alternate between queued deletions and directory
    /// sweeps.
    pub fn pop_timeout(
        &self,
        running: &AtomicBool,
        timeout: Duration,
    ) -> Option<Arc<QueuedOp>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut queue = self.inner.lock().unwrap();
        loop {
            if !running.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(op) = queue.pop_front() {
                return Some(op);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _timeout) = self.cond.wait_timeout(queue, deadline - now).unwrap();
            queue = guard;
        }
    }

    /// Remove a specific descriptor (cancel path). Returns it if it was
    /// still queued here.
    pub fn remove(&self, id: OpId) -> Option<Arc<QueuedOp>> {
        let mut queue = self.inner.lock().unwrap();
        let index = queue.iter().position(|op| op.id() == id)?;
        queue.remove(index)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiter; used on shutdown and when a busy handle is
    /// released.
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use crate::op::{OpPayload, QueueRole};
    use std::thread;

    fn op_for(handle: Handle) -> Arc<QueuedOp> {
        QueuedOp::new(
            None,
            handle,
            0,
            0,
            QueueRole::MetaWrite,
            false,
            OpPayload::DspaceVerify,
        )
    }

    #[test]
    fn test_fifo_order() {
        let queue = OpQueue::new("test");
        let running = AtomicBool::new(true);
        for i in 0..3 {
            queue.push(op_for(Handle(i)));
        }
        for i in 0..3 {
            let op = queue.pop_eligible(&running, |_| true).unwrap();
            assert_eq!(op.handle, Handle(i));
        }
    }

    #[test]
    fn test_push_sets_queued_state() {
        let queue = OpQueue::new("test");
        let op = op_for(Handle(1));
        queue.push(Arc::clone(&op));
        assert_eq!(op.state(), OpState::Queued);
    }

    #[test]
    fn test_eligibility_skips_busy_handle() {
        let queue = OpQueue::new("test");
        let running = AtomicBool::new(true);
        queue.push(op_for(Handle(1)));
        queue.push(op_for(Handle(2)));

        // handle 1 busy: the second descriptor is served first
        let op = queue.pop_eligible(&running, |op| op.handle != Handle(1)).unwrap();
        assert_eq!(op.handle, Handle(2));
        let op = queue.pop_eligible(&running, |_| true).unwrap();
        assert_eq!(op.handle, Handle(1));
    }

    #[test]
    fn test_shutdown_unblocks_pop() {
        let queue = Arc::new(OpQueue::new("test"));
        let running = Arc::new(AtomicBool::new(true));
        let queue2 = Arc::clone(&queue);
        let running2 = Arc::clone(&running);
        let waiter = thread::spawn(move || queue2.pop_eligible(&running2, |_| true));

        thread::sleep(Duration::from_millis(50));
        running.store(false, Ordering::SeqCst);
        queue.notify_all();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn test_remove_by_id() {
        let queue = OpQueue::new("test");
        let op = op_for(Handle(9));
        op.set_id(OpId(42));
        queue.push(Arc::clone(&op));

        assert!(queue.remove(OpId(41)).is_none());
        let removed = queue.remove(OpId(42)).unwrap();
        assert!(Arc::ptr_eq(&removed, &op));
        assert!(queue.is_empty());
    }
}
