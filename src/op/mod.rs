//! Operation descriptors
//!
//! Every posted operation becomes a [`QueuedOp`]: an owned descriptor with a
//! small state machine, a type-specific payload, and a slot for the
//! completion result. Descriptors are referenced by [`OpId`]s, which pack an
//! arena slot index and a generation counter so that a stale id can never
//! resolve to a recycled descriptor.
//!
//! State machine:
//!
//! ```text
//! NotQueued -> Queued -> InService -> Completed
//!                     \-> InternallyDelayed -> (resubmitted)
//!                     \-> Canceled
//! ```
//!
//! Transitions are taken under the descriptor's state mutex. Only a worker
//! (or the AIO submitter) sets `InService`; only the sync coalescer or the
//! cancel path sets `Completed` / `Canceled`.

pub mod queue;
pub mod registry;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::bstream::RwList;
use crate::dspace::{DsAttributes, DsType, HandlePosition};
use crate::error::StorageError;
use crate::handle::Handle;
use crate::keyval::{KeyType, KvEntry, KvPosition};
use crate::mgmt::Collection;
use crate::CollId;

/// Context id used by internal operations that have no caller.
pub const NO_CONTEXT: usize = usize::MAX;

/// Opaque 64-bit operation id: generation in the high half, arena slot in
/// the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub u64);

impl OpId {
    pub(crate) fn pack(slot: u32, generation: u32) -> OpId {
        OpId(((generation as u64) << 32) | slot as u64)
    }

    pub(crate) fn slot(&self) -> u32 {
        self.0 as u32
    }

    pub(crate) fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Descriptor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    NotQueued,
    Queued,
    InService,
    /// Held on the AIO delay queue; will be resubmitted internally.
    InternallyDelayed,
    Completed,
    Canceled,
}

/// Worker pool roles; one FIFO queue each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    MetaRead = 0,
    MetaWrite = 1,
    Io = 2,
    BackgroundFileRemoval = 3,
}

impl QueueRole {
    pub const ALL: [QueueRole; 4] = [
        QueueRole::MetaRead,
        QueueRole::MetaWrite,
        QueueRole::Io,
        QueueRole::BackgroundFileRemoval,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            QueueRole::MetaRead => "meta-read",
            QueueRole::MetaWrite => "meta-write",
            QueueRole::Io => "io",
            QueueRole::BackgroundFileRemoval => "background-file-removal",
        }
    }
}

/// Which coalescing context an operation's commit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncClass {
    Keyval = 0,
    Dspace = 1,
}

/// Type-specific operation payload.
pub enum OpPayload {
    DspaceCreate { requested: Handle, ds_type: DsType },
    DspaceCreateList { requested: Vec<Handle>, ds_type: DsType },
    DspaceRemove,
    DspaceRemoveList { handles: Vec<Handle> },
    DspaceIterateHandles { position: HandlePosition, count: usize },
    DspaceVerify,
    DspaceGetAttr,
    DspaceGetAttrList { handles: Vec<Handle> },
    DspaceSetAttr { attrs: DsAttributes },
    KeyvalRead { key_type: KeyType, key: Vec<u8> },
    KeyvalWrite { key_type: KeyType, key: Vec<u8>, value: Vec<u8> },
    KeyvalRemove { key_type: KeyType, key: Vec<u8> },
    KeyvalIterate { key_type: KeyType, position: KvPosition, count: usize },
    KeyvalIterateKeys { key_type: KeyType, position: KvPosition, count: usize },
    KeyvalFlush,
    BstreamRwList(RwList),
    BstreamFlush,
    BstreamResize { size: u64 },
    /// Internal: a stranded file queued for asynchronous deletion.
    BackgroundRemoveFile { path: std::path::PathBuf },
}

impl OpPayload {
    pub fn name(&self) -> &'static str {
        match self {
            OpPayload::DspaceCreate { .. } => "dspace-create",
            OpPayload::DspaceCreateList { .. } => "dspace-create-list",
            OpPayload::DspaceRemove => "dspace-remove",
            OpPayload::DspaceRemoveList { .. } => "dspace-remove-list",
            OpPayload::DspaceIterateHandles { .. } => "dspace-iterate-handles",
            OpPayload::DspaceVerify => "dspace-verify",
            OpPayload::DspaceGetAttr => "dspace-getattr",
            OpPayload::DspaceGetAttrList { .. } => "dspace-getattr-list",
            OpPayload::DspaceSetAttr { .. } => "dspace-setattr",
            OpPayload::KeyvalRead { .. } => "keyval-read",
            OpPayload::KeyvalWrite { .. } => "keyval-write",
            OpPayload::KeyvalRemove { .. } => "keyval-remove",
            OpPayload::KeyvalIterate { .. } => "keyval-iterate",
            OpPayload::KeyvalIterateKeys { .. } => "keyval-iterate-keys",
            OpPayload::KeyvalFlush => "keyval-flush",
            OpPayload::BstreamRwList(rw) => rw.kind.name(),
            OpPayload::BstreamFlush => "bstream-flush",
            OpPayload::BstreamResize { .. } => "bstream-resize",
            OpPayload::BackgroundRemoveFile { .. } => "background-remove-file",
        }
    }

    /// Whether this operation's commit participates in sync coalescing.
    pub fn does_sync(&self) -> bool {
        self.sync_class().is_some()
    }

    pub fn sync_class(&self) -> Option<SyncClass> {
        match self {
            OpPayload::KeyvalWrite { .. }
            | OpPayload::KeyvalRemove { .. }
            | OpPayload::KeyvalFlush => Some(SyncClass::Keyval),
            OpPayload::DspaceCreate { .. }
            | OpPayload::DspaceCreateList { .. }
            | OpPayload::DspaceRemove
            | OpPayload::DspaceRemoveList { .. }
            | OpPayload::DspaceSetAttr { .. }
            | OpPayload::BstreamResize { .. } => Some(SyncClass::Dspace),
            _ => None,
        }
    }
}

/// Completion output, retrieved by the caller through the test surface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OpOutput {
    #[default]
    None,
    Handle(Handle),
    Handles(Vec<Handle>),
    /// Per-handle outcomes for batch removal.
    States(Vec<Option<StorageError>>),
    HandleBatch { handles: Vec<Handle>, position: HandlePosition },
    DsType(DsType),
    Attr(DsAttributes),
    AttrList(Vec<Result<DsAttributes, StorageError>>),
    Value(Vec<u8>),
    KvBatch { entries: Vec<KvEntry>, position: KvPosition },
    KvKeys { keys: Vec<Vec<u8>>, position: KvPosition },
    /// Bytes moved by a bytestream operation.
    Size(u64),
}

/// Completion state: error kind plus whatever output the operation
/// produced. A failed list-I/O still reports the bytes transferred before
/// the first error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpResult {
    pub error: Option<StorageError>,
    pub output: OpOutput,
}

impl OpResult {
    pub fn ok(output: OpOutput) -> OpResult {
        OpResult { error: None, output }
    }

    pub fn err(error: StorageError) -> OpResult {
        OpResult { error: Some(error), output: OpOutput::None }
    }

    pub fn err_with(error: StorageError, output: OpOutput) -> OpResult {
        OpResult { error: Some(error), output }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl From<Result<OpOutput, StorageError>> for OpResult {
    fn from(result: Result<OpOutput, StorageError>) -> OpResult {
        match result {
            Ok(output) => OpResult::ok(output),
            Err(error) => OpResult::err(error),
        }
    }
}

/// Result of posting an operation.
pub enum Posted {
    /// Operation queued; retrieve the result through `test`.
    Queued(OpId),
    /// Fast path serviced in the caller's thread; no op id exists.
    Immediate(OpOutput),
}

impl Posted {
    pub fn op_id(&self) -> Option<OpId> {
        match self {
            Posted::Queued(id) => Some(*id),
            Posted::Immediate(_) => None,
        }
    }
}

/// An in-flight operation descriptor.
pub struct QueuedOp {
    pub coll: Option<Arc<Collection>>,
    pub handle: Handle,
    pub context_id: usize,
    pub user_token: u64,
    pub role: QueueRole,
    /// Sync-required flag; the AIO size-update path sets it when it rewrites
    /// the descriptor into a setattr.
    pub sync_flag: AtomicBool,
    pub payload: Mutex<OpPayload>,
    id: AtomicU64,
    state: Mutex<OpState>,
    result: Mutex<Option<OpResult>>,
}

impl QueuedOp {
    pub fn new(
        coll: Option<Arc<Collection>>,
        handle: Handle,
        context_id: usize,
        user_token: u64,
        role: QueueRole,
        sync_flag: bool,
        payload: OpPayload,
    ) -> Arc<QueuedOp> {
        Arc::new(QueuedOp {
            coll,
            handle,
            context_id,
            user_token,
            role,
            sync_flag: AtomicBool::new(sync_flag),
            payload: Mutex::new(payload),
            id: AtomicU64::new(0),
            state: Mutex::new(OpState::NotQueued),
            result: Mutex::new(None),
        })
    }

    pub fn id(&self) -> OpId {
        OpId(self.id.load(Ordering::SeqCst))
    }

    pub(crate) fn set_id(&self, id: OpId) {
        self.id.store(id.0, Ordering::SeqCst);
    }

    pub fn state(&self) -> OpState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: OpState) {
        *self.state.lock().unwrap() = state;
    }

    /// Atomically claim a queued descriptor for service. Returns false if it
    /// is no longer in the `Queued` state.
    pub fn try_begin_service(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == OpState::Queued {
            *state = OpState::InService;
            true
        } else {
            false
        }
    }

    pub fn sync_required(&self) -> bool {
        self.sync_flag.load(Ordering::SeqCst)
    }

    pub fn set_sync_required(&self, value: bool) {
        self.sync_flag.store(value, Ordering::SeqCst);
    }

    pub fn does_sync(&self) -> bool {
        self.payload.lock().unwrap().does_sync()
    }

    pub fn sync_class(&self) -> Option<SyncClass> {
        self.payload.lock().unwrap().sync_class()
    }

    pub fn op_name(&self) -> &'static str {
        self.payload.lock().unwrap().name()
    }

    pub(crate) fn store_result(&self, result: OpResult) {
        *self.result.lock().unwrap() = Some(result);
    }

    pub(crate) fn take_result(&self) -> Option<OpResult> {
        self.result.lock().unwrap().take()
    }

    pub fn coll_id(&self) -> Option<CollId> {
        self.coll.as_ref().map(|c| c.coll_id)
    }
}
