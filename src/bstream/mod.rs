//! Bytestream engine
//!
//! Bytestream reads and writes arrive as list-I/O: independent arrays of
//! memory segments and file segments whose total lengths must match. This
//! module owns the pieces both bytestream engines share: the resumable
//! list-I/O converter, the rw-list descriptor payload and its phase
//! machine, and the completion epilogue that maintains the datafile size
//! attribute.
//!
//! The two engines live in submodules: [`aio`] drives kernel AIO with a
//! throttled batch pipeline; [`threaded`] drives an explicit worker pool
//! with per-handle queues and direct-I/O read-modify-write.

pub mod aio;
pub mod threaded;

use std::sync::Arc;

use crate::dspace::{self, TypeAttrs};
use crate::engine::EngineShared;
use crate::error::StorageError;
use crate::handle::Handle;
use crate::mgmt::Collection;
use crate::op::{OpOutput, OpPayload, OpResult, OpState, QueuedOp};
use crate::opencache::{CacheRef, OpenMode};
use crate::Result;

/// Control blocks emitted per conversion round.
pub(crate) const AIO_BATCH: usize = 64;

/// Largest single transfer handed to the thread pool; bigger transfers are
/// split so a slice always fits a pool thread's staging buffer.
pub(crate) const SLICE_CAP: u64 = 256 * 1024;

/// Device sector granule assumed for direct I/O alignment.
pub(crate) const SECTOR_SIZE: u64 = 4096;

/// A memory segment of a list-I/O request.
///
/// # Safety
///
/// The pointed-to region must stay valid and unaliased for the duration of
/// the operation, exactly as a buffer handed to the kernel must. The caller
/// owns the memory; the engine only borrows it until completion.
#[derive(Debug, Clone, Copy)]
pub struct MemSegment {
    pub ptr: *mut u8,
    pub len: u64,
}

// Safety: segments are caller-owned buffers whose lifetime contractually
// spans the operation; they cross thread boundaries only inside the engine
unsafe impl Send for MemSegment {}

impl MemSegment {
    pub fn new(ptr: *mut u8, len: u64) -> MemSegment {
        MemSegment { ptr, len }
    }

    /// Cover an entire mutable slice.
    pub fn from_slice(buf: &mut [u8]) -> MemSegment {
        MemSegment {
            ptr: buf.as_mut_ptr(),
            len: buf.len() as u64,
        }
    }
}

/// A file segment of a list-I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSegment {
    pub offset: u64,
    pub size: u64,
}

impl StreamSegment {
    pub fn new(offset: u64, size: u64) -> StreamSegment {
        StreamSegment { offset, size }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

impl IoKind {
    pub fn name(&self) -> &'static str {
        match self {
            IoKind::Read => "bstream-read-list",
            IoKind::Write => "bstream-write-list",
        }
    }
}

/// One contiguous transfer produced by the converter.
#[derive(Debug, Clone, Copy)]
pub struct Transfer {
    pub buf: *mut u8,
    pub len: u64,
    pub offset: u64,
}

unsafe impl Send for Transfer {}

/// Converter state: points at the first byte not yet covered by an emitted
/// transfer, so conversion is resumable across calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListIoState {
    pub mem_index: usize,
    pub mem_consumed: u64,
    pub stream_index: usize,
    pub stream_consumed: u64,
}

/// Convert list-I/O arrays into contiguous transfers, emitting at most
/// `max` per call. Each transfer's length is the smaller of what remains in
/// the current memory segment and the current stream segment; whichever
/// side runs out advances. Returns true when both sides are exhausted
/// exactly. A total-length mismatch shows up as a call that can make no
/// progress without being done, which the caller reports on the last call.
pub fn listio_convert(
    mem: &[MemSegment],
    streams: &[StreamSegment],
    state: &mut ListIoState,
    max: usize,
    out: &mut Vec<Transfer>,
) -> bool {
    loop {
        while state.mem_index < mem.len() && state.mem_consumed >= mem[state.mem_index].len {
            state.mem_index += 1;
            state.mem_consumed = 0;
        }
        while state.stream_index < streams.len()
            && state.stream_consumed >= streams[state.stream_index].size
        {
            state.stream_index += 1;
            state.stream_consumed = 0;
        }

        let mem_done = state.mem_index >= mem.len();
        let stream_done = state.stream_index >= streams.len();
        if mem_done && stream_done {
            return true;
        }
        if mem_done || stream_done || out.len() >= max {
            return false;
        }

        let mem_seg = &mem[state.mem_index];
        let stream_seg = &streams[state.stream_index];
        let len = (mem_seg.len - state.mem_consumed).min(stream_seg.size - state.stream_consumed);
        out.push(Transfer {
            buf: unsafe { mem_seg.ptr.add(state.mem_consumed as usize) },
            len,
            offset: stream_seg.offset + state.stream_consumed,
        });
        state.mem_consumed += len;
        state.stream_consumed += len;
    }
}

/// Fully convert a request into transfers no larger than `cap`, for the
/// thread-pool engine. A mem/stream total mismatch is an `Invalid` request.
pub(crate) fn flatten_transfers(
    mem: &[MemSegment],
    streams: &[StreamSegment],
    cap: u64,
) -> Result<Vec<Transfer>> {
    let mut state = ListIoState::default();
    let mut raw = Vec::new();
    let done = listio_convert(mem, streams, &mut state, usize::MAX, &mut raw);
    if !done {
        return Err(StorageError::Invalid);
    }
    let mut out = Vec::with_capacity(raw.len());
    for transfer in raw {
        let mut covered = 0;
        while covered < transfer.len {
            let len = (transfer.len - covered).min(cap);
            out.push(Transfer {
                buf: unsafe { transfer.buf.add(covered as usize) },
                len,
                offset: transfer.offset + covered,
            });
            covered += len;
        }
    }
    Ok(out)
}

/// Phases of a rw-list descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwPhase {
    /// Converting and posting control-block batches
    Submitting,
    /// A posted batch has transfers outstanding
    AwaitingCompletion,
    /// Batches done; updating the datafile size attribute
    WritingSize,
    Done,
}

/// Payload of a bytestream read/write list operation.
pub struct RwList {
    pub kind: IoKind,
    pub mem: Vec<MemSegment>,
    pub streams: Vec<StreamSegment>,
    pub state: ListIoState,
    pub phase: RwPhase,
    /// All list segments have been converted; nothing left to post.
    pub all_converted: bool,
    /// Bytes transferred so far.
    pub out_size: u64,
    /// First error observed across the request's transfers.
    pub error: Option<StorageError>,
    /// Transfers outstanding in the currently posted batch.
    pub outstanding: usize,
    /// Control blocks of the current batch (kernel AIO engine).
    pub iocbs: Vec<aio::Iocb>,
    /// Open-cache reference held for the duration of the request (kernel
    /// AIO engine; the thread pool references per handle batch instead).
    pub open_ref: Option<CacheRef>,
}

impl RwList {
    pub fn new(kind: IoKind, mem: Vec<MemSegment>, streams: Vec<StreamSegment>) -> RwList {
        RwList {
            kind,
            mem,
            streams,
            state: ListIoState::default(),
            phase: RwPhase::Submitting,
            all_converted: false,
            out_size: 0,
            error: None,
            outstanding: 0,
            iocbs: Vec::new(),
            open_ref: None,
        }
    }

    /// Largest stream end offset of the request.
    pub fn end_of_request(&self) -> u64 {
        self.streams.iter().map(StreamSegment::end).max().unwrap_or(0)
    }
}

/// Access mode an rw-list wants from the open cache.
pub(crate) fn open_mode_for(kind: IoKind, direct: bool) -> OpenMode {
    match (kind, direct) {
        (IoKind::Read, false) => OpenMode::BufferedRead,
        (IoKind::Write, false) => OpenMode::BufferedWrite,
        (IoKind::Read, true) => OpenMode::DirectRead,
        (IoKind::Write, true) => OpenMode::DirectWrite,
    }
}

/// Completion epilogue shared by both bytestream engines.
///
/// Releases the descriptor reference, and for writes performs the size
/// read-check-write under the collection's size-update mutex: when the end
/// of the request moved past the stored bytestream size, the new size is
/// written back, and if the operation carried the sync-required flag the
/// descriptor is rewritten in place as a dataspace setattr and handed to
/// the sync coalescer so the size update is committed before completion.
pub(crate) fn finish_rw(shared: &EngineShared, op: &Arc<QueuedOp>) {
    let (kind, bytes, error, eor, open_ref) = {
        let mut payload = op.payload.lock().unwrap();
        if let OpPayload::BstreamRwList(rw) = &mut *payload {
            rw.phase = RwPhase::WritingSize;
            (rw.kind, rw.out_size, rw.error, rw.end_of_request(), rw.open_ref.take())
        } else {
            // descriptor already rewritten; nothing to finish
            return;
        }
    };

    if let Some(cache_ref) = open_ref {
        shared.open_cache.put(cache_ref);
    }

    let output = OpOutput::Size(bytes);
    if let Some(error) = error {
        set_phase_done(op);
        shared
            .contexts
            .complete(op, OpResult::err_with(error, output), OpState::Completed);
        return;
    }

    if kind == IoKind::Read {
        set_phase_done(op);
        shared.contexts.complete(op, OpResult::ok(output), OpState::Completed);
        return;
    }

    let Some(coll) = op.coll.clone() else {
        set_phase_done(op);
        shared.contexts.complete(op, OpResult::ok(output), OpState::Completed);
        return;
    };

    match update_size(shared, &coll, op.handle, eor) {
        Ok(Some(attrs)) if op.sync_required() => {
            // rewrite the descriptor in place as a setattr so the coalescing
            // path syncs the size update before the caller sees completion
            log::debug!("rw-list {}: size update to {} needs sync", op.handle, eor);
            set_phase_done(op);
            *op.payload.lock().unwrap() = OpPayload::DspaceSetAttr { attrs };
            shared
                .coalescer
                .coalesce(&shared.contexts, Arc::clone(op), OpResult::ok(output));
        }
        Ok(_) => {
            set_phase_done(op);
            shared.contexts.complete(op, OpResult::ok(output), OpState::Completed);
        }
        Err(err) => {
            set_phase_done(op);
            shared
                .contexts
                .complete(op, OpResult::err_with(err, output), OpState::Completed);
        }
    }
}

fn set_phase_done(op: &QueuedOp) {
    if let OpPayload::BstreamRwList(rw) = &mut *op.payload.lock().unwrap() {
        rw.phase = RwPhase::Done;
    }
}

/// The size-update critical section: read the attribute record, and if the
/// request end moved past the stored size, write it back. Returns the new
/// record when the size changed.
fn update_size(
    shared: &EngineShared,
    coll: &Arc<Collection>,
    handle: Handle,
    end_of_request: u64,
) -> Result<Option<crate::dspace::DsAttributes>> {
    let _guard = coll.size_lock.lock().unwrap();
    let mut attrs = dspace::attr_get(coll, handle)?;
    match &mut attrs.type_attrs {
        TypeAttrs::Datafile { bstream_size } if end_of_request > *bstream_size => {
            *bstream_size = end_of_request;
            dspace::attr_set(coll, handle, &attrs)?;
            shared.attr_cache.insert(coll.coll_id, handle, attrs.clone());
            Ok(Some(attrs))
        }
        _ => Ok(None),
    }
}

/// Service routine for bstream flush: fsync the backing file through the
/// open cache.
pub(crate) fn flush(shared: &EngineShared, coll: &Collection, handle: Handle) -> Result<OpOutput> {
    let cache_ref = shared
        .open_cache
        .get(coll, handle, OpenMode::BufferedWrite)?;
    let rc = unsafe { libc::fdatasync(cache_ref.fd) };
    let result = if rc != 0 {
        Err(StorageError::last_os_error())
    } else {
        Ok(OpOutput::None)
    };
    shared.open_cache.put(cache_ref);
    result
}

/// Service routine for bstream resize: truncate the backing file (deferred
/// when the thread-pool engine has the handle active) and set the stored
/// size to exactly the requested value.
pub(crate) fn resize(
    shared: &EngineShared,
    coll: &Arc<Collection>,
    handle: Handle,
    size: u64,
) -> Result<OpOutput> {
    let deferred = shared
        .threaded
        .as_ref()
        .map(|pool| pool.defer_truncate(coll.coll_id, handle, size))
        .unwrap_or(false);

    if !deferred {
        let cache_ref = shared
            .open_cache
            .get(coll, handle, OpenMode::BufferedWrite)?;
        let rc = unsafe { libc::ftruncate(cache_ref.fd, size as libc::off_t) };
        let result = if rc != 0 {
            Err(StorageError::last_os_error())
        } else {
            Ok(())
        };
        shared.open_cache.put(cache_ref);
        result?;
    }

    let _guard = coll.size_lock.lock().unwrap();
    let mut attrs = dspace::attr_get(coll, handle)?;
    if let TypeAttrs::Datafile { bstream_size } = &mut attrs.type_attrs {
        *bstream_size = size;
        dspace::attr_set(coll, handle, &attrs)?;
        shared.attr_cache.insert(coll.coll_id, handle, attrs);
    }
    Ok(OpOutput::None)
}
