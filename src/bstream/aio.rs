//! Kernel AIO bytestream engine
//!
//! Read/write lists are converted to control-block batches and submitted
//! through the kernel AIO interface. A process-wide cap bounds
//! simultaneously outstanding submissions: an attempt either takes an
//! in-flight slot and posts immediately, or joins a FIFO delay queue in the
//! `InternallyDelayed` state. Every batch completion frees a slot and, when
//! the delay queue is non-empty, resubmits its head before returning.
//!
//! Completions are drained by a dedicated reaper thread. When a batch
//! drains it either refills the control-block array from the converter and
//! resubmits, or runs the shared completion epilogue (size update, possible
//! in-place rewrite to a setattr, descriptor release).
//!
//! The syscall layer uses direct `libc::syscall` invocations rather than a
//! binding crate.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::EngineShared;
use crate::error::StorageError;
use crate::op::{OpPayload, OpState, QueuedOp};
use crate::Result;

use super::{listio_convert, IoKind, RwPhase, AIO_BATCH};

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

// kernel AIO syscall numbers for x86_64
const SYS_IO_SETUP: i64 = 206;
const SYS_IO_DESTROY: i64 = 207;
const SYS_IO_GETEVENTS: i64 = 208;
const SYS_IO_SUBMIT: i64 = 209;
const SYS_IO_CANCEL: i64 = 210;

/// Kernel AIO control block.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Iocb {
    data: u64,          // returned in the completion event
    key: u32,
    aio_rw_flags: u32,
    lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    buf: u64,
    nbytes: u64,
    offset: i64,
    aio_reserved2: u64,
    flags: u32,
    aio_resfd: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

unsafe fn io_setup(maxevents: libc::c_int, ctxp: *mut AioContext) -> libc::c_int {
    libc::syscall(SYS_IO_SETUP, maxevents as i64, ctxp) as libc::c_int
}

unsafe fn io_destroy(ctx: AioContext) -> libc::c_int {
    libc::syscall(SYS_IO_DESTROY, ctx) as libc::c_int
}

unsafe fn io_submit(ctx: AioContext, nr: libc::c_long, iocbpp: *mut *mut Iocb) -> libc::c_int {
    libc::syscall(SYS_IO_SUBMIT, ctx, nr, iocbpp) as libc::c_int
}

unsafe fn io_getevents(
    ctx: AioContext,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_int {
    libc::syscall(SYS_IO_GETEVENTS, ctx, min_nr, nr, events, timeout) as libc::c_int
}

unsafe fn io_cancel(ctx: AioContext, iocb: *mut Iocb, result: *mut IoEvent) -> libc::c_int {
    libc::syscall(SYS_IO_CANCEL, ctx, iocb, result) as libc::c_int
}

struct Inflight {
    in_progress: usize,
    peak: usize,
    ready: std::collections::VecDeque<Arc<QueuedOp>>,
}

/// The AIO submission and throttling engine.
pub struct AioEngine {
    ctx: AioContext,
    max_concurrent: usize,
    inflight: Mutex<Inflight>,
    running: AtomicBool,
}

impl AioEngine {
    pub fn new(max_concurrent: usize) -> Result<Arc<AioEngine>> {
        let mut ctx: AioContext = 0;
        let nr_events = (max_concurrent * AIO_BATCH).clamp(AIO_BATCH, 1024);
        let rc = unsafe { io_setup(nr_events as libc::c_int, &mut ctx) };
        if rc < 0 {
            log::error!("io_setup failed with nr_events={}", nr_events);
            return Err(StorageError::last_os_error());
        }
        Ok(Arc::new(AioEngine {
            ctx,
            max_concurrent: max_concurrent.max(1),
            inflight: Mutex::new(Inflight {
                in_progress: 0,
                peak: 0,
                ready: std::collections::VecDeque::new(),
            }),
            running: AtomicBool::new(true),
        }))
    }

    /// Current and high-water in-flight submission counts.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().unwrap().in_progress
    }

    pub fn peak_in_flight(&self) -> usize {
        self.inflight.lock().unwrap().peak
    }

    /// Begin servicing an rw-list descriptor: convert the first batch and
    /// post it, or park the descriptor on the delay queue.
    pub(crate) fn submit_rw(&self, shared: &EngineShared, op: Arc<QueuedOp>) {
        self.post_next_batch(shared, op, false);
    }

    /// Convert the next control-block batch for `op` and hand it to the
    /// throttle. Completes the descriptor directly when there is nothing
    /// left to post or the request is malformed.
    fn post_next_batch(&self, shared: &EngineShared, op: Arc<QueuedOp>, dec_first: bool) {
        let produced = {
            let mut payload = op.payload.lock().unwrap();
            let OpPayload::BstreamRwList(rw) = &mut *payload else {
                return;
            };
            let fd = match rw.open_ref.as_ref() {
                Some(open_ref) => open_ref.fd,
                None => {
                    rw.error = Some(StorageError::Invalid);
                    drop(payload);
                    if dec_first {
                        self.release_slot_and_start_delayed(shared);
                    }
                    super::finish_rw(shared, &op);
                    return;
                }
            };

            let mut transfers = Vec::with_capacity(AIO_BATCH);
            let done = listio_convert(&rw.mem, &rw.streams, &mut rw.state, AIO_BATCH, &mut transfers);
            if done {
                rw.all_converted = true;
            }
            if transfers.is_empty() {
                if !done {
                    // one side exhausted before the other: total length mismatch
                    rw.error = Some(StorageError::Invalid);
                }
                drop(payload);
                if dec_first {
                    self.release_slot_and_start_delayed(shared);
                }
                super::finish_rw(shared, &op);
                return;
            }

            let opcode = match rw.kind {
                IoKind::Read => IOCB_CMD_PREAD,
                IoKind::Write => IOCB_CMD_PWRITE,
            };
            rw.iocbs = transfers
                .iter()
                .map(|transfer| Iocb {
                    data: op.id().0,
                    key: 0,
                    aio_rw_flags: 0,
                    lio_opcode: opcode,
                    aio_reqprio: 0,
                    aio_fildes: fd as u32,
                    buf: transfer.buf as u64,
                    nbytes: transfer.len,
                    offset: transfer.offset as i64,
                    aio_reserved2: 0,
                    flags: 0,
                    aio_resfd: 0,
                })
                .collect();
            rw.outstanding = rw.iocbs.len();
            rw.phase = RwPhase::AwaitingCompletion;
            rw.iocbs.len()
        };

        log::trace!("rw-list {}: posting batch of {}", op.handle, produced);
        self.issue_or_delay(shared, op, dec_first);
    }

    /// Take an in-flight slot and submit, or append to the delay queue.
    fn issue_or_delay(&self, shared: &EngineShared, op: Arc<QueuedOp>, dec_first: bool) {
        let delayed = {
            let mut inflight = self.inflight.lock().unwrap();
            if dec_first {
                inflight.in_progress -= 1;
            }
            if inflight.in_progress < self.max_concurrent {
                inflight.in_progress += 1;
                inflight.peak = inflight.peak.max(inflight.in_progress);
                false
            } else {
                log::debug!(
                    "delaying I/O for handle {} ({} already in progress)",
                    op.handle,
                    inflight.in_progress
                );
                op.set_state(OpState::InternallyDelayed);
                inflight.ready.push_back(Arc::clone(&op));
                true
            }
        };

        if !delayed {
            if let Err(err) = self.kernel_submit(&op) {
                self.inflight.lock().unwrap().in_progress -= 1;
                log::error!("io_submit failed for handle {}: {}", op.handle, err);
                if let OpPayload::BstreamRwList(rw) = &mut *op.payload.lock().unwrap() {
                    rw.error = Some(err);
                }
                super::finish_rw(shared, &op);
            }
        }
    }

    /// Submit the descriptor's current batch to the kernel.
    fn kernel_submit(&self, op: &QueuedOp) -> Result<()> {
        let mut ptrs: Vec<*mut Iocb> = {
            let mut payload = op.payload.lock().unwrap();
            let OpPayload::BstreamRwList(rw) = &mut *payload else {
                return Err(StorageError::Invalid);
            };
            rw.iocbs.iter_mut().map(|iocb| iocb as *mut Iocb).collect()
        };
        let mut submitted = 0usize;
        while submitted < ptrs.len() {
            let remaining = (ptrs.len() - submitted) as libc::c_long;
            let rc = unsafe { io_submit(self.ctx, remaining, ptrs.as_mut_ptr().add(submitted)) };
            if rc < 0 {
                let err = StorageError::last_os_error();
                if err == StorageError::Interrupted {
                    continue;
                }
                return Err(err);
            }
            submitted += rc as usize;
        }
        Ok(())
    }

    /// One completion-reaping round; the reaper thread loops this until
    /// shutdown.
    pub(crate) fn reap(&self, shared: &EngineShared) {
        let mut events: [IoEvent; AIO_BATCH] = unsafe { MaybeUninit::zeroed().assume_init() };
        let mut timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 100_000_000,
        };
        let rc = unsafe {
            io_getevents(
                self.ctx,
                1,
                AIO_BATCH as libc::c_long,
                events.as_mut_ptr(),
                &mut timeout,
            )
        };
        if rc < 0 {
            let err = StorageError::last_os_error();
            if err != StorageError::Interrupted {
                log::warn!("io_getevents failed: {}", err);
            }
            return;
        }
        for event in events.iter().take(rc as usize) {
            self.handle_event(shared, event);
        }
    }

    fn handle_event(&self, shared: &EngineShared, event: &IoEvent) {
        let Some(op) = shared.registry.lookup(crate::op::OpId(event.data)) else {
            log::warn!("completion event for unknown operation {:#x}", event.data);
            return;
        };

        let batch_done = {
            let mut payload = op.payload.lock().unwrap();
            let OpPayload::BstreamRwList(rw) = &mut *payload else {
                return;
            };
            rw.outstanding = rw.outstanding.saturating_sub(1);
            if event.res < 0 {
                // first error wins; remaining transfers of the request are
                // not posted
                let err = StorageError::from_errno((-event.res) as i32);
                log::debug!("transfer error on handle {}: {}", op.handle, err);
                rw.error.get_or_insert(err);
            } else {
                rw.out_size += event.res as u64;
            }
            rw.outstanding == 0
        };

        if batch_done {
            self.batch_done(shared, op);
        }
    }

    /// All control blocks of the posted batch have completed: refill and
    /// resubmit, or finalize.
    fn batch_done(&self, shared: &EngineShared, op: Arc<QueuedOp>) {
        let (failed, all_converted) = {
            let payload = op.payload.lock().unwrap();
            let OpPayload::BstreamRwList(rw) = &*payload else {
                return;
            };
            (rw.error.is_some(), rw.all_converted)
        };

        if failed || all_converted {
            super::finish_rw(shared, &op);
            self.release_slot_and_start_delayed(shared);
        } else {
            // more of the request remains unconverted
            self.post_next_batch(shared, op, true);
        }
    }

    /// Free an in-flight slot and, if the delay queue is non-empty, submit
    /// its head.
    fn release_slot_and_start_delayed(&self, shared: &EngineShared) {
        let next = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight.in_progress -= 1;
            match inflight.ready.pop_front() {
                Some(op) => {
                    inflight.in_progress += 1;
                    inflight.peak = inflight.peak.max(inflight.in_progress);
                    op.set_state(OpState::InService);
                    Some(op)
                }
                None => None,
            }
        };

        if let Some(op) = next {
            log::debug!("starting delayed I/O operation for handle {}", op.handle);
            if let Err(err) = self.kernel_submit(&op) {
                self.inflight.lock().unwrap().in_progress -= 1;
                if let OpPayload::BstreamRwList(rw) = &mut *op.payload.lock().unwrap() {
                    rw.error = Some(err);
                }
                super::finish_rw(shared, &op);
            }
        }
    }

    /// Best-effort cancellation of a descriptor's posted batch. Regular
    /// file AIO usually cannot be canceled; completion then arrives through
    /// the normal notification path.
    pub(crate) fn cancel(&self, shared: &EngineShared, op: &Arc<QueuedOp>) {
        let mut canceled_events = Vec::new();
        {
            let mut payload = op.payload.lock().unwrap();
            let OpPayload::BstreamRwList(rw) = &mut *payload else {
                return;
            };
            for iocb in rw.iocbs.iter_mut() {
                let mut event: IoEvent = unsafe { MaybeUninit::zeroed().assume_init() };
                let rc = unsafe { io_cancel(self.ctx, iocb as *mut Iocb, &mut event) };
                if rc == 0 {
                    canceled_events.push(event);
                }
            }
        }
        if canceled_events.is_empty() {
            log::debug!("aio cancel: not cancelable for handle {}", op.handle);
        }
        // canceled control blocks do not reach the ring; account for them
        // here so the batch still drains
        for event in &canceled_events {
            self.handle_event(shared, event);
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Tear down the kernel context; call after the reaper has exited.
    pub(crate) fn destroy(&self) {
        unsafe {
            io_destroy(self.ctx);
        }
    }
}
