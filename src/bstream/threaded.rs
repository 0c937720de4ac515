//! Thread-pool bytestream engine
//!
//! Alternative to the kernel AIO path: an explicit pool of I/O threads and
//! a queue per handle. When a handle has queued requests and no active
//! batch, the next thread to wake claims it, opens the backing file once
//! for the batch, flattens the queued list requests into transfers sorted
//! by ascending stream offset, and publishes them as slices the whole pool
//! services.
//!
//! Direct I/O slicing: when the open mode enforces sector alignment, a
//! write whose bounds are unaligned performs a read-modify-write through a
//! per-thread aligned staging buffer, and a read reads the aligned superset
//! and copies out the requested range. Every slice is self-contained, so
//! many handles can be active at once.
//!
//! The per-handle descriptor reference is released only when the last slice
//! of the last queued request completes and the handle queue is empty; any
//! ftruncate deferred by a resize is applied at that point.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::config::DirectIoConfig;
use crate::engine::EngineShared;
use crate::error::StorageError;
use crate::handle::Handle;
use crate::op::{OpPayload, OpState, QueuedOp};
use crate::opencache::CacheRef;
use crate::util::buffer::AlignedBuffer;
use crate::CollId;

use super::{flatten_transfers, open_mode_for, IoKind, Transfer, SECTOR_SIZE, SLICE_CAP};

struct Slice {
    op: Arc<QueuedOp>,
    key: (CollId, Handle),
    transfer: Transfer,
    kind: IoKind,
    fd: RawFd,
    direct: bool,
}

struct HandleQueue {
    queued: VecDeque<Arc<QueuedOp>>,
    active: bool,
    pending: bool,
    open_ref: Option<CacheRef>,
    remaining_slices: usize,
    /// Applied when the handle drains; set by a resize against an active
    /// handle.
    pending_truncate: Option<u64>,
    /// Logical end of the data written by this batch.
    latest_write_end: u64,
    /// File length before the batch started (for direct-I/O tail trimming).
    prior_len: u64,
    direct: bool,
}

impl HandleQueue {
    fn new() -> HandleQueue {
        HandleQueue {
            queued: VecDeque::new(),
            active: false,
            pending: false,
            open_ref: None,
            remaining_slices: 0,
            pending_truncate: None,
            latest_write_end: 0,
            prior_len: 0,
            direct: false,
        }
    }
}

struct PoolState {
    handles: HashMap<(CollId, Handle), HandleQueue>,
    pending: VecDeque<(CollId, Handle)>,
    slices: VecDeque<Slice>,
}

/// Shared state of the thread-pool engine.
pub struct ThreadedEngine {
    cfg: DirectIoConfig,
    state: Mutex<PoolState>,
    cond: Condvar,
    running: AtomicBool,
}

impl ThreadedEngine {
    pub fn new(cfg: DirectIoConfig) -> Arc<ThreadedEngine> {
        Arc::new(ThreadedEngine {
            cfg,
            state: Mutex::new(PoolState {
                handles: HashMap::new(),
                pending: VecDeque::new(),
                slices: VecDeque::new(),
            }),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.cfg.threads.max(1)
    }

    /// Queue an rw-list descriptor on its handle.
    pub(crate) fn submit_rw(&self, op: Arc<QueuedOp>) {
        let key = (op.coll_id().unwrap_or(0), op.handle);
        op.set_state(OpState::InService);
        let mut state = self.state.lock().unwrap();
        let queue = state.handles.entry(key).or_insert_with(HandleQueue::new);
        queue.queued.push_back(op);
        if !queue.active && !queue.pending {
            queue.pending = true;
            state.pending.push_back(key);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// A resize against an active handle defers its ftruncate until the
    /// handle drains. Returns whether the truncate was deferred.
    pub(crate) fn defer_truncate(&self, coll_id: CollId, handle: Handle, size: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.handles.get_mut(&(coll_id, handle)) {
            Some(queue) if queue.active => {
                queue.pending_truncate = Some(size);
                true
            }
            _ => false,
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Body of one pool thread.
    pub(crate) fn worker_loop(self: &Arc<ThreadedEngine>, shared: &Arc<EngineShared>, thread_no: usize) {
        let staging_size = (SLICE_CAP + 2 * SECTOR_SIZE) as usize;
        let mut staging = AlignedBuffer::new(staging_size, SECTOR_SIZE as usize);
        log::debug!("bstream pool thread {} started", thread_no);

        let slices_per_wakeup = self.cfg.ops_per_queue.max(1);
        let mut state = self.state.lock().unwrap();
        while self.running.load(Ordering::SeqCst) {
            if !state.slices.is_empty() {
                // take a run of slices per wakeup to keep lock traffic down
                let take = state.slices.len().min(slices_per_wakeup);
                let batch: Vec<Slice> = state.slices.drain(..take).collect();
                drop(state);
                for slice in batch {
                    self.process_slice(shared, slice, &mut staging, thread_no);
                }
                state = self.state.lock().unwrap();
                continue;
            }
            if let Some(key) = state.pending.pop_front() {
                let ops = match state.handles.get_mut(&key) {
                    Some(queue) => {
                        queue.pending = false;
                        queue.active = true;
                        queue.queued.drain(..).collect::<Vec<_>>()
                    }
                    None => Vec::new(),
                };
                drop(state);
                self.activate_handle(shared, key, ops);
                state = self.state.lock().unwrap();
                continue;
            }
            let (guard, _timeout) = self
                .cond
                .wait_timeout(state, Duration::from_millis(self.cfg.timeout_ms.max(1)))
                .unwrap();
            state = guard;
        }
        log::debug!("bstream pool thread {} exiting", thread_no);
    }

    /// Claim a handle: open its file once, flatten the queued requests into
    /// sorted slices, and publish them to the pool.
    fn activate_handle(
        &self,
        shared: &Arc<EngineShared>,
        key: (CollId, Handle),
        ops: Vec<Arc<QueuedOp>>,
    ) {
        let (coll_id, handle) = key;
        if ops.is_empty() {
            self.deactivate(shared, key);
            return;
        }

        let Some(coll) = shared.collection_by_id(coll_id) else {
            for op in &ops {
                fail_rw(shared, op, StorageError::Invalid);
            }
            self.deactivate(shared, key);
            return;
        };

        let any_write = ops.iter().any(|op| {
            matches!(
                &*op.payload.lock().unwrap(),
                OpPayload::BstreamRwList(rw) if rw.kind == IoKind::Write
            )
        });
        let has_truncate = {
            let state = self.state.lock().unwrap();
            state
                .handles
                .get(&key)
                .map(|q| q.pending_truncate.is_some())
                .unwrap_or(false)
        };
        let kind = if any_write || has_truncate {
            IoKind::Write
        } else {
            IoKind::Read
        };
        let mode = open_mode_for(kind, self.cfg.direct);

        let open_ref = match shared.open_cache.get(&coll, handle, mode) {
            Ok(open_ref) => open_ref,
            Err(StorageError::NotFound) if kind == IoKind::Read => {
                // no bstream was ever written: every read lands past the end
                for op in &ops {
                    match validate_rw(op) {
                        Ok(()) => finish_absent_read(shared, op),
                        Err(err) => fail_rw(shared, op, err),
                    }
                }
                self.deactivate(shared, key);
                return;
            }
            Err(err) => {
                for op in &ops {
                    fail_rw(shared, op, err);
                }
                self.deactivate(shared, key);
                return;
            }
        };

        let prior_len = file_len(open_ref.fd).unwrap_or(0);
        let fd = open_ref.fd;

        let mut slices = Vec::new();
        let mut finished = Vec::new();
        for op in ops {
            let transfers = {
                let mut payload = op.payload.lock().unwrap();
                let OpPayload::BstreamRwList(rw) = &mut *payload else {
                    continue;
                };
                match flatten_transfers(&rw.mem, &rw.streams, SLICE_CAP) {
                    Ok(transfers) => {
                        rw.outstanding = transfers.len();
                        rw.all_converted = true;
                        Some((transfers, rw.kind))
                    }
                    Err(err) => {
                        rw.error = Some(err);
                        None
                    }
                }
            };
            match transfers {
                Some((transfers, op_kind)) if !transfers.is_empty() => {
                    for transfer in transfers {
                        slices.push(Slice {
                            op: Arc::clone(&op),
                            key,
                            transfer,
                            kind: op_kind,
                            fd,
                            direct: self.cfg.direct,
                        });
                    }
                }
                // empty requests and malformed lists complete right away
                _ => finished.push(op),
            }
        }

        slices.sort_by_key(|slice| slice.transfer.offset);
        let total = slices.len();
        log::debug!("bstream pool: handle {} batch of {} slice(s)", handle, total);

        {
            let mut state = self.state.lock().unwrap();
            let queue = state.handles.entry(key).or_insert_with(HandleQueue::new);
            queue.open_ref = Some(open_ref);
            queue.remaining_slices = total;
            queue.latest_write_end = 0;
            queue.prior_len = prior_len;
            queue.direct = self.cfg.direct;
            state.slices.extend(slices);
        }
        self.cond.notify_all();

        for op in finished {
            super::finish_rw(shared, &op);
        }
        if total == 0 {
            self.finish_batch_if_drained(shared, key);
        }
    }

    fn process_slice(
        &self,
        shared: &Arc<EngineShared>,
        slice: Slice,
        staging: &mut AlignedBuffer,
        thread_no: usize,
    ) {
        log::trace!(
            "slice on thread {}: {:?} fd {} offset {} len {}",
            thread_no,
            slice.kind,
            slice.fd,
            slice.transfer.offset,
            slice.transfer.len
        );
        let (bytes, error) = if slice.direct {
            direct_transfer(slice.fd, slice.kind, &slice.transfer, staging)
        } else {
            buffered_transfer(slice.fd, slice.kind, &slice.transfer)
        };

        let op_done = {
            let mut payload = slice.op.payload.lock().unwrap();
            if let OpPayload::BstreamRwList(rw) = &mut *payload {
                rw.outstanding = rw.outstanding.saturating_sub(1);
                rw.out_size += bytes;
                if let Some(err) = error {
                    rw.error.get_or_insert(err);
                }
                rw.outstanding == 0
            } else {
                false
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            if let Some(queue) = state.handles.get_mut(&slice.key) {
                queue.remaining_slices = queue.remaining_slices.saturating_sub(1);
                if slice.kind == IoKind::Write && bytes > 0 {
                    let end = slice.transfer.offset + bytes;
                    queue.latest_write_end = queue.latest_write_end.max(end);
                }
            }
        }

        // release the handle's descriptor before completing its last
        // operation, so a remove posted right after the completion never
        // observes a referenced cache entry
        self.finish_batch_if_drained(shared, slice.key);
        if op_done {
            super::finish_rw(shared, &slice.op);
        }
    }

    /// Close out a handle's batch once its slices have drained: apply any
    /// deferred truncate, release the descriptor, and requeue the handle if
    /// more requests arrived meanwhile.
    fn finish_batch_if_drained(&self, shared: &Arc<EngineShared>, key: (CollId, Handle)) {
        let (open_ref, truncate, trim_to, requeue) = {
            let mut state = self.state.lock().unwrap();
            let Some(queue) = state.handles.get_mut(&key) else {
                return;
            };
            if !queue.active || queue.remaining_slices != 0 {
                return;
            }
            let open_ref = queue.open_ref.take();
            let truncate = queue.pending_truncate.take();
            // with O_DIRECT, writes land sector-padded; trim the tail back
            // to the logical end when the batch extended the file
            let trim_to = if queue.direct && truncate.is_none() && queue.latest_write_end > 0 {
                Some(queue.latest_write_end.max(queue.prior_len))
            } else {
                None
            };
            queue.active = false;
            let requeue = if queue.queued.is_empty() {
                state.handles.remove(&key);
                false
            } else {
                let queue = state.handles.get_mut(&key).unwrap();
                queue.pending = true;
                state.pending.push_back(key);
                true
            };
            (open_ref, truncate, trim_to, requeue)
        };

        if let Some(open_ref) = open_ref {
            if let Some(size) = truncate {
                unsafe { libc::ftruncate(open_ref.fd, size as libc::off_t) };
            } else if let Some(target) = trim_to {
                if file_len(open_ref.fd).unwrap_or(0) > target {
                    unsafe { libc::ftruncate(open_ref.fd, target as libc::off_t) };
                }
            }
            shared.open_cache.put(open_ref);
        }
        if requeue {
            self.cond.notify_all();
        }
    }

    fn deactivate(&self, shared: &Arc<EngineShared>, key: (CollId, Handle)) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(queue) = state.handles.get_mut(&key) {
                queue.remaining_slices = 0;
            }
        }
        self.finish_batch_if_drained(shared, key);
    }
}

/// Record a pre-I/O failure on the descriptor and complete it.
fn fail_rw(shared: &EngineShared, op: &Arc<QueuedOp>, err: StorageError) {
    if let OpPayload::BstreamRwList(rw) = &mut *op.payload.lock().unwrap() {
        rw.error = Some(err);
    }
    super::finish_rw(shared, op);
}

/// Validate the list shape of a request that will not touch the disk.
fn validate_rw(op: &Arc<QueuedOp>) -> Result<(), StorageError> {
    let payload = op.payload.lock().unwrap();
    let OpPayload::BstreamRwList(rw) = &*payload else {
        return Err(StorageError::Invalid);
    };
    flatten_transfers(&rw.mem, &rw.streams, SLICE_CAP).map(|_| ())
}

/// Complete a read against a bstream that was never created: zero bytes,
/// success.
fn finish_absent_read(shared: &EngineShared, op: &Arc<QueuedOp>) {
    if let OpPayload::BstreamRwList(rw) = &mut *op.payload.lock().unwrap() {
        rw.all_converted = true;
        rw.outstanding = 0;
        rw.out_size = 0;
    }
    super::finish_rw(shared, op);
}

fn file_len(fd: RawFd) -> Option<u64> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    if rc == 0 {
        Some(stat.st_size as u64)
    } else {
        None
    }
}

/// Plain positional I/O, retrying short transfers.
fn buffered_transfer(fd: RawFd, kind: IoKind, transfer: &Transfer) -> (u64, Option<StorageError>) {
    let mut done = 0u64;
    while done < transfer.len {
        let rc = unsafe {
            match kind {
                IoKind::Read => libc::pread(
                    fd,
                    transfer.buf.add(done as usize) as *mut libc::c_void,
                    (transfer.len - done) as usize,
                    (transfer.offset + done) as libc::off_t,
                ),
                IoKind::Write => libc::pwrite(
                    fd,
                    transfer.buf.add(done as usize) as *const libc::c_void,
                    (transfer.len - done) as usize,
                    (transfer.offset + done) as libc::off_t,
                ),
            }
        };
        if rc < 0 {
            let err = StorageError::last_os_error();
            if err == StorageError::Interrupted {
                continue;
            }
            return (done, Some(err));
        }
        if rc == 0 {
            // end of file on a read; bytes short of the request are simply
            // not there
            break;
        }
        done += rc as u64;
    }
    (done, None)
}

/// Sector-aligned transfer through the staging buffer.
fn direct_transfer(
    fd: RawFd,
    kind: IoKind,
    transfer: &Transfer,
    staging: &mut AlignedBuffer,
) -> (u64, Option<StorageError>) {
    let phys_start = transfer.offset & !(SECTOR_SIZE - 1);
    let phys_end = (transfer.offset + transfer.len + SECTOR_SIZE - 1) & !(SECTOR_SIZE - 1);
    let phys_size = phys_end - phys_start;
    debug_assert!(phys_size as usize <= staging.size());
    let lead = (transfer.offset - phys_start) as usize;

    let staged = Transfer {
        buf: staging.as_mut_ptr(),
        len: phys_size,
        offset: phys_start,
    };

    match kind {
        IoKind::Write => {
            if lead != 0 || transfer.len != phys_size {
                // read-modify-write: fetch the aligned window, zero-filling
                // whatever lies past the end of file
                let (got, err) = buffered_transfer(fd, IoKind::Read, &staged);
                if let Some(err) = err {
                    return (0, Some(err));
                }
                if (got as usize) < phys_size as usize {
                    staging.as_mut_slice()[got as usize..phys_size as usize].fill(0);
                }
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    transfer.buf,
                    staging.as_mut_ptr().add(lead),
                    transfer.len as usize,
                );
            }
            let (written, err) = buffered_transfer(fd, IoKind::Write, &staged);
            if err.is_some() || written < phys_size {
                return (0, Some(err.unwrap_or(StorageError::Io)));
            }
            (transfer.len, None)
        }
        IoKind::Read => {
            let (got, err) = buffered_transfer(fd, IoKind::Read, &staged);
            if let Some(err) = err {
                return (0, Some(err));
            }
            let available = (got as usize).saturating_sub(lead).min(transfer.len as usize);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    staging.as_mut_ptr().add(lead),
                    transfer.buf,
                    available,
                );
            }
            (available as u64, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::io::AsRawFd;
    use tempfile::TempDir;

    fn scratch_file(dir: &TempDir, content: &[u8]) -> std::fs::File {
        let path = dir.path().join("scratch");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.write_all(content).unwrap();
        file
    }

    #[test]
    fn test_buffered_transfer_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = scratch_file(&dir, &[0u8; 8]);
        let fd = file.as_raw_fd();

        let mut data = b"hello".to_vec();
        let write = Transfer { buf: data.as_mut_ptr(), len: 5, offset: 2 };
        let (written, err) = buffered_transfer(fd, IoKind::Write, &write);
        assert_eq!((written, err), (5, None));

        let mut back = vec![0u8; 5];
        let read = Transfer { buf: back.as_mut_ptr(), len: 5, offset: 2 };
        let (got, err) = buffered_transfer(fd, IoKind::Read, &read);
        assert_eq!((got, err), (5, None));
        assert_eq!(back, b"hello");
    }

    #[test]
    fn test_buffered_read_past_eof_is_zero_bytes() {
        let dir = TempDir::new().unwrap();
        let file = scratch_file(&dir, b"abc");
        let fd = file.as_raw_fd();

        let mut buf = vec![0u8; 16];
        let read = Transfer { buf: buf.as_mut_ptr(), len: 16, offset: 100 };
        let (got, err) = buffered_transfer(fd, IoKind::Read, &read);
        assert_eq!((got, err), (0, None));
    }

    #[test]
    fn test_direct_transfer_unaligned_write_preserves_neighbors() {
        // staged RMW against a buffered fd: the alignment math is identical
        let dir = TempDir::new().unwrap();
        let mut file = scratch_file(&dir, &vec![0xAAu8; 2 * SECTOR_SIZE as usize]);
        let fd = file.as_raw_fd();
        let mut staging = AlignedBuffer::new((SLICE_CAP + 2 * SECTOR_SIZE) as usize, SECTOR_SIZE as usize);

        let mut data = vec![0xBBu8; 100];
        let write = Transfer { buf: data.as_mut_ptr(), len: 100, offset: 50 };
        let (written, err) = direct_transfer(fd, IoKind::Write, &write, &mut staging);
        assert_eq!((written, err), (100, None));

        let mut contents = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut contents).unwrap();
        assert!(contents[..50].iter().all(|&b| b == 0xAA));
        assert!(contents[50..150].iter().all(|&b| b == 0xBB));
        assert!(contents[150..2 * SECTOR_SIZE as usize].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_direct_transfer_read_copies_subrange() {
        let dir = TempDir::new().unwrap();
        let mut content = vec![0u8; SECTOR_SIZE as usize * 2];
        for (i, byte) in content.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let file = scratch_file(&dir, &content);
        let fd = file.as_raw_fd();
        let mut staging = AlignedBuffer::new((SLICE_CAP + 2 * SECTOR_SIZE) as usize, SECTOR_SIZE as usize);

        let mut out = vec![0u8; 300];
        let read = Transfer { buf: out.as_mut_ptr(), len: 300, offset: 1000 };
        let (got, err) = direct_transfer(fd, IoKind::Read, &read, &mut staging);
        assert_eq!((got, err), (300, None));
        assert_eq!(out, &content[1000..1300]);
    }

    #[test]
    fn test_direct_transfer_read_short_at_eof() {
        let dir = TempDir::new().unwrap();
        let file = scratch_file(&dir, &vec![7u8; 100]);
        let fd = file.as_raw_fd();
        let mut staging = AlignedBuffer::new((SLICE_CAP + 2 * SECTOR_SIZE) as usize, SECTOR_SIZE as usize);

        let mut out = vec![0u8; 80];
        let read = Transfer { buf: out.as_mut_ptr(), len: 80, offset: 60 };
        let (got, err) = direct_transfer(fd, IoKind::Read, &read, &mut staging);
        assert_eq!(err, None);
        assert_eq!(got, 40);
        assert!(out[..40].iter().all(|&b| b == 7));
    }
}
