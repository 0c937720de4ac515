//! Storage engine facade and worker pools
//!
//! [`StorageEngine`] owns every piece of engine state that the original
//! design kept process-global: the storage region, the registered
//! collections, the operation queues and registry, the caller contexts, the
//! sync coalescer, the open cache, and the attribute cache. Operations are
//! posted through it, serviced on its worker threads, and retrieved through
//! the test surface.
//!
//! A posted operation is serviced immediately (fast paths that do not touch
//! disk), moved onto one of the four operation queues, or handed to the
//! bytestream engine. Workers dequeue, run the service routine, and pass
//! the descriptor to the sync coalescer, which moves completed descriptors
//! onto the caller's completion queue.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::attrcache::AttrCache;
use crate::bstream::{self, aio::AioEngine, threaded::ThreadedEngine, IoKind, MemSegment, RwList, StreamSegment};
use crate::config::{BstreamEngineKind, CollectionSetInfo, FsStats, StorageConfig};
use crate::context::{Completion, ContextTable, TestOutcome};
use crate::dspace::{self, DsAttributes, DsType, HandlePosition};
use crate::error::StorageError;
use crate::handle::{Handle, HandleGenerator};
use crate::keyval::{self, KeyType, KvPosition};
use crate::mgmt::{self, Collection, Storage};
use crate::op::queue::OpQueue;
use crate::op::registry::OpRegistry;
use crate::op::{OpId, OpOutput, OpPayload, OpResult, OpState, Posted, QueueRole, QueuedOp, NO_CONTEXT};
use crate::opencache::OpenCache;
use crate::sync::SyncCoalescer;
use crate::{CollId, Result};

struct CollMap {
    by_id: HashMap<CollId, Arc<Collection>>,
    by_name: HashMap<String, CollId>,
}

/// Engine state shared with worker threads and the bytestream engines.
pub(crate) struct EngineShared {
    pub(crate) config: StorageConfig,
    pub(crate) storage: Storage,
    colls: Mutex<CollMap>,
    pub(crate) registry: OpRegistry,
    queues: [OpQueue; 4],
    pub(crate) contexts: ContextTable,
    pub(crate) coalescer: SyncCoalescer,
    pub(crate) open_cache: OpenCache,
    pub(crate) attr_cache: AttrCache,
    pub(crate) handle_gen: HandleGenerator,
    pub(crate) aio: Option<Arc<AioEngine>>,
    pub(crate) threaded: Option<Arc<ThreadedEngine>>,
    /// Handles whose service routine is currently running; preserves
    /// per-handle submission order across the worker pools.
    in_service: Mutex<HashSet<(CollId, Handle)>>,
    pub(crate) running: AtomicBool,
}

impl EngineShared {
    pub(crate) fn queue(&self, role: QueueRole) -> &OpQueue {
        &self.queues[role as usize]
    }

    pub(crate) fn collection_by_id(&self, coll_id: CollId) -> Option<Arc<Collection>> {
        self.colls.lock().unwrap().by_id.get(&coll_id).cloned()
    }

    fn registered_collections(&self) -> Vec<Arc<Collection>> {
        self.colls.lock().unwrap().by_id.values().cloned().collect()
    }

    /// Claim the operation's target handle for service. Ops against the
    /// null handle (batch and iteration ops) are never claimed.
    fn try_claim(&self, op: &QueuedOp) -> bool {
        let Some(coll_id) = op.coll_id() else { return true };
        if op.handle.is_null() {
            return true;
        }
        self.in_service.lock().unwrap().insert((coll_id, op.handle))
    }

    fn release_claim(&self, op: &QueuedOp) {
        let Some(coll_id) = op.coll_id() else { return };
        if op.handle.is_null() {
            return;
        }
        self.in_service.lock().unwrap().remove(&(coll_id, op.handle));
        // workers skipping this handle may now proceed
        for role in QueueRole::ALL {
            self.queue(role).notify_all();
        }
    }

    /// Run an operation's service routine. Called on a worker thread, or on
    /// the caller's thread for immediate completion.
    fn service(&self, op: &QueuedOp) -> std::result::Result<OpOutput, StorageError> {
        let coll = op.coll.clone().ok_or(StorageError::Invalid)?;
        log::trace!("servicing {} on handle {}", op.op_name(), op.handle);
        let payload = op.payload.lock().unwrap();
        match &*payload {
            OpPayload::DspaceCreate { requested, ds_type } => {
                dspace::create(&coll, &self.handle_gen, *requested, *ds_type).map(OpOutput::Handle)
            }
            OpPayload::DspaceCreateList { requested, ds_type } => {
                dspace::create_list(&coll, &self.handle_gen, requested, *ds_type)
                    .map(OpOutput::Handles)
            }
            OpPayload::DspaceRemove => dspace::remove(
                &coll,
                &self.attr_cache,
                &self.open_cache,
                op.handle,
                op.sync_required(),
            )
            .map(|_| OpOutput::None),
            OpPayload::DspaceRemoveList { handles } => dspace::remove_list(
                &coll,
                &self.attr_cache,
                &self.open_cache,
                handles,
                op.sync_required(),
            )
            .map(|states| OpOutput::States(states.into_iter().map(|s| s.err()).collect())),
            OpPayload::DspaceIterateHandles { position, count } => {
                dspace::iterate_handles(&coll, *position, *count)
                    .map(|(handles, position)| OpOutput::HandleBatch { handles, position })
            }
            OpPayload::DspaceVerify => dspace::verify(&coll, op.handle).map(OpOutput::DsType),
            OpPayload::DspaceGetAttr => {
                dspace::getattr(&coll, &self.attr_cache, op.handle).map(OpOutput::Attr)
            }
            OpPayload::DspaceGetAttrList { handles } => Ok(OpOutput::AttrList(
                dspace::getattr_list(&coll, &self.attr_cache, handles),
            )),
            OpPayload::DspaceSetAttr { attrs } => {
                dspace::setattr(&coll, &self.attr_cache, op.handle, attrs).map(|_| OpOutput::None)
            }
            OpPayload::KeyvalRead { key_type, key } => {
                keyval::read(&coll, op.handle, *key_type, key).map(OpOutput::Value)
            }
            OpPayload::KeyvalWrite { key_type, key, value } => {
                keyval::write(&coll, op.handle, *key_type, key, value).map(|_| OpOutput::None)
            }
            OpPayload::KeyvalRemove { key_type, key } => {
                keyval::remove_key(&coll, op.handle, *key_type, key).map(|_| OpOutput::None)
            }
            OpPayload::KeyvalIterate { key_type, position, count } => {
                keyval::iterate(&coll, op.handle, *key_type, position.clone(), *count)
                    .map(|(entries, position)| OpOutput::KvBatch { entries, position })
            }
            OpPayload::KeyvalIterateKeys { key_type, position, count } => {
                keyval::iterate_keys(&coll, op.handle, *key_type, position.clone(), *count)
                    .map(|(keys, position)| OpOutput::KvKeys { keys, position })
            }
            OpPayload::KeyvalFlush => keyval::flush(&coll).map(|_| OpOutput::None),
            OpPayload::BstreamFlush => bstream::flush(self, &coll, op.handle),
            OpPayload::BstreamResize { size } => bstream::resize(self, &coll, op.handle, *size),
            // rw lists are serviced by the bytestream engines, background
            // removals by the background worker
            OpPayload::BstreamRwList(_) | OpPayload::BackgroundRemoveFile { .. } => {
                Err(StorageError::Invalid)
            }
        }
    }

    /// Worker body for the meta-read, meta-write, and I/O pools.
    fn worker_loop(self: &Arc<Self>, role: QueueRole) {
        log::debug!("{} worker started", role.name());
        let queue = self.queue(role);
        while let Some(op) = queue.pop_eligible(&self.running, |candidate| self.try_claim(candidate))
        {
            self.coalescer.dequeue_accounting(&op);
            if !op.try_begin_service() {
                self.release_claim(&op);
                continue;
            }

            let result = self.service(&op);
            self.release_claim(&op);
            self.queue_strand_cleanup(&op, &result);

            if op.does_sync() {
                self.coalescer.coalesce(&self.contexts, op, result.into());
            } else {
                self.contexts.complete(&op, result.into(), OpState::Completed);
            }
        }
        log::debug!("{} worker exiting", role.name());
    }

    /// A create that collided with a resident bstream stranded the file;
    /// queue its deletion on the background worker.
    fn queue_strand_cleanup(&self, op: &QueuedOp, result: &std::result::Result<OpOutput, StorageError>) {
        let Some(coll) = op.coll.as_ref() else { return };
        let created: Vec<Handle> = match result {
            Ok(OpOutput::Handle(handle)) => vec![*handle],
            Ok(OpOutput::Handles(handles)) => handles.clone(),
            _ => return,
        };
        for handle in created {
            let path = coll.stranded_path(handle);
            if path.exists() {
                let cleanup = QueuedOp::new(
                    Some(Arc::clone(coll)),
                    handle,
                    NO_CONTEXT,
                    0,
                    QueueRole::BackgroundFileRemoval,
                    false,
                    OpPayload::BackgroundRemoveFile { path },
                );
                self.queue(QueueRole::BackgroundFileRemoval).push(cleanup);
            }
        }
    }

    /// Background file-removal worker: drains queued deletions and sweeps
    /// the stranded-bstream directories between them.
    fn background_loop(self: &Arc<Self>) {
        log::debug!("background file removal worker started");
        let queue = self.queue(QueueRole::BackgroundFileRemoval);
        while self.running.load(Ordering::SeqCst) {
            match queue.pop_timeout(&self.running, Duration::from_millis(1000)) {
                Some(op) => {
                    op.set_state(OpState::InService);
                    let path = {
                        let payload = op.payload.lock().unwrap();
                        match &*payload {
                            OpPayload::BackgroundRemoveFile { path } => Some(path.clone()),
                            _ => None,
                        }
                    };
                    if let Some(path) = path {
                        log::debug!("background removal: {}", path.display());
                        match std::fs::remove_file(&path) {
                            Ok(()) => {}
                            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                            Err(err) => {
                                log::warn!("failed to remove {}: {}", path.display(), err)
                            }
                        }
                    }
                    op.set_state(OpState::Completed);
                }
                None => {
                    for coll in self.registered_collections() {
                        if let Err(err) = coll.scavenge_stranded() {
                            log::warn!(
                                "stranded sweep failed for collection {:08x}: {}",
                                coll.coll_id,
                                err
                            );
                        }
                    }
                }
            }
        }
    }
}

/// The storage engine. One per process per storage region.
pub struct StorageEngine {
    shared: Arc<EngineShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    finalized: AtomicBool,
}

impl StorageEngine {
    /// Create the on-disk footprint of a new storage region.
    pub fn storage_create(config: &StorageConfig) -> Result<()> {
        Storage::create(&config.data_path, &config.meta_path)
    }

    /// Remove a storage region's on-disk footprint.
    pub fn storage_remove(config: &StorageConfig) -> Result<()> {
        Storage::remove(&config.data_path, &config.meta_path)
    }

    /// Open a storage region and start the worker pools.
    pub fn initialize(config: StorageConfig) -> Result<StorageEngine> {
        let storage = Storage::open(&config.data_path, &config.meta_path)?;

        let aio = match config.bstream_engine {
            BstreamEngineKind::Aio => Some(AioEngine::new(config.max_concurrent_io)?),
            BstreamEngineKind::Threaded => None,
        };
        let threaded = match config.bstream_engine {
            BstreamEngineKind::Threaded => Some(ThreadedEngine::new(config.directio.clone())),
            BstreamEngineKind::Aio => None,
        };

        let shared = Arc::new(EngineShared {
            open_cache: OpenCache::new(config.open_cache_size),
            storage,
            colls: Mutex::new(CollMap {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
            }),
            registry: OpRegistry::new(),
            queues: [
                OpQueue::new("meta-read"),
                OpQueue::new("meta-write"),
                OpQueue::new("io"),
                OpQueue::new("background-file-removal"),
            ],
            contexts: ContextTable::new(),
            coalescer: SyncCoalescer::new(),
            attr_cache: AttrCache::new(1024),
            handle_gen: HandleGenerator::new(),
            aio,
            threaded,
            in_service: Mutex::new(HashSet::new()),
            running: AtomicBool::new(true),
            config,
        });

        let mut threads = Vec::new();
        let spawn_workers = |threads: &mut Vec<JoinHandle<()>>, role: QueueRole, count: usize| {
            for _ in 0..count.max(1) {
                let shared = Arc::clone(&shared);
                threads.push(std::thread::spawn(move || shared.worker_loop(role)));
            }
        };
        spawn_workers(&mut threads, QueueRole::MetaRead, shared.config.workers.meta_read);
        spawn_workers(&mut threads, QueueRole::MetaWrite, shared.config.workers.meta_write);
        spawn_workers(&mut threads, QueueRole::Io, shared.config.workers.io);
        {
            let shared = Arc::clone(&shared);
            threads.push(std::thread::spawn(move || shared.background_loop()));
        }

        if let Some(aio) = shared.aio.clone() {
            let shared = Arc::clone(&shared);
            threads.push(std::thread::spawn(move || {
                while aio.running() {
                    aio.reap(&shared);
                }
            }));
        }
        if let Some(pool) = shared.threaded.clone() {
            for thread_no in 0..pool.thread_count() {
                let pool = Arc::clone(&pool);
                let shared = Arc::clone(&shared);
                threads.push(std::thread::spawn(move || pool.worker_loop(&shared, thread_no)));
            }
        }

        log::info!(
            "storage engine initialized: data={} meta={} bstream={:?}",
            shared.config.data_path.display(),
            shared.config.meta_path.display(),
            shared.config.bstream_engine
        );
        Ok(StorageEngine {
            shared,
            threads: Mutex::new(threads),
            finalized: AtomicBool::new(false),
        })
    }

    /// Stop the worker pools and release engine resources. Runs once;
    /// dropping the engine calls it implicitly.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.running.store(false, Ordering::SeqCst);
        for role in QueueRole::ALL {
            self.shared.queue(role).notify_all();
        }
        if let Some(aio) = &self.shared.aio {
            aio.stop();
        }
        if let Some(pool) = &self.shared.threaded {
            pool.stop();
        }
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for thread in threads {
            let _ = thread.join();
        }
        if let Some(aio) = &self.shared.aio {
            aio.destroy();
        }
        self.shared.open_cache.finalize();
        log::info!("storage engine finalized");
    }

    fn collection(&self, coll_id: CollId) -> Result<Arc<Collection>> {
        self.shared
            .collection_by_id(coll_id)
            .ok_or(StorageError::Invalid)
    }

    // ---- collection management -------------------------------------------

    pub fn collection_create(&self, name: &str, coll_id: CollId) -> Result<()> {
        self.shared.storage.collection_create(name, coll_id)
    }

    /// Look up a collection by name, registering it on first use. The
    /// stranded-bstream scavenge runs here.
    pub fn collection_lookup(&self, name: &str) -> Result<CollId> {
        let mut map = self.shared.colls.lock().unwrap();
        if let Some(&coll_id) = map.by_name.get(name) {
            return Ok(coll_id);
        }
        let coll = Arc::new(self.shared.storage.collection_open(name)?);
        if let Err(err) = coll.scavenge_stranded() {
            log::warn!("stranded scavenge failed at lookup: {}", err);
        }
        let coll_id = coll.coll_id;
        map.by_id.insert(coll_id, coll);
        map.by_name.insert(name.to_string(), coll_id);
        Ok(coll_id)
    }

    /// Deregister a collection from this engine without touching disk.
    pub fn collection_clear(&self, coll_id: CollId) -> Result<()> {
        let mut map = self.shared.colls.lock().unwrap();
        let coll = map.by_id.remove(&coll_id).ok_or(StorageError::Invalid)?;
        map.by_name.remove(&coll.name);
        Ok(())
    }

    /// Destroy a collection's on-disk footprint.
    pub fn collection_remove(&self, name: &str) -> Result<()> {
        {
            let mut map = self.shared.colls.lock().unwrap();
            if let Some(coll_id) = map.by_name.remove(name) {
                map.by_id.remove(&coll_id);
            }
        }
        self.shared.storage.collection_destroy(name)
    }

    pub fn collection_iterate(&self) -> Result<Vec<(String, CollId)>> {
        self.shared.storage.collection_iterate()
    }

    pub fn collection_setinfo(&self, coll_id: CollId, info: CollectionSetInfo) -> Result<()> {
        let coll = self.collection(coll_id)?;
        let mut options = coll.options.lock().unwrap();
        match info {
            CollectionSetInfo::HandleRanges(ranges) => options.handle_ranges = ranges,
            CollectionSetInfo::HandleTimeout(timeout) => options.handle_timeout = timeout,
            CollectionSetInfo::AttrCacheKeywords(keywords) => {
                options.attr_cache_keywords = keywords
            }
            CollectionSetInfo::AttrCacheSize(size) => {
                options.attr_cache_size = size;
                self.shared.attr_cache.set_capacity(size);
            }
            CollectionSetInfo::AttrCacheMaxNumElems(max) => {
                options.attr_cache_max_num_elems = max;
                self.shared.attr_cache.set_capacity(max);
            }
            CollectionSetInfo::AttrCacheInitialize => {}
            CollectionSetInfo::CoalescingHighWatermark(value) => options.high_watermark = value,
            CollectionSetInfo::CoalescingLowWatermark(value) => options.low_watermark = value,
            CollectionSetInfo::MetaSyncEnabled(value) => options.meta_sync_enabled = value,
            CollectionSetInfo::ImmediateCompletionEnabled(value) => {
                options.immediate_completion = value
            }
            CollectionSetInfo::DirectIoThreadNum(value) => options.directio_threads = Some(value),
            CollectionSetInfo::DirectIoOpsPerQueue(value) => {
                options.directio_ops_per_queue = Some(value)
            }
            CollectionSetInfo::DirectIoTimeout(value) => options.directio_timeout_ms = Some(value),
        }
        Ok(())
    }

    pub fn collection_getinfo(&self, coll_id: CollId) -> Result<FsStats> {
        let coll = self.collection(coll_id)?;
        mgmt::fs_stats(&coll)
    }

    // ---- contexts and completion -----------------------------------------

    pub fn open_context(&self) -> Result<usize> {
        self.shared.contexts.open()
    }

    pub fn close_context(&self, context_id: usize) -> Result<()> {
        self.shared.contexts.close(context_id)
    }

    pub fn test(&self, context_id: usize, id: OpId, timeout_ms: u64) -> Result<TestOutcome> {
        self.shared.contexts.test(
            &self.shared.registry,
            context_id,
            id,
            Duration::from_millis(timeout_ms),
        )
    }

    pub fn test_context(
        &self,
        context_id: usize,
        max: usize,
        timeout_ms: u64,
    ) -> Result<Vec<Completion>> {
        self.shared.contexts.test_context(
            &self.shared.registry,
            context_id,
            max,
            Duration::from_millis(timeout_ms),
        )
    }

    pub fn test_some(
        &self,
        context_id: usize,
        ids: &[OpId],
        timeout_ms: u64,
    ) -> Result<Vec<Completion>> {
        self.shared.contexts.test_some(
            &self.shared.registry,
            context_id,
            ids,
            Duration::from_millis(timeout_ms),
        )
    }

    /// Cancel an operation. Queued descriptors complete in the canceled
    /// state; an in-service bytestream operation gets a best-effort AIO
    /// cancel and completes through the normal notification path; anything
    /// else runs to completion.
    pub fn cancel(&self, id: OpId) -> Result<()> {
        let op = self.shared.registry.lookup(id).ok_or(StorageError::Invalid)?;
        match op.state() {
            OpState::Queued => {
                if let Some(removed) = self.shared.queue(op.role).remove(id) {
                    self.shared.coalescer.dequeue_accounting(&removed);
                    self.shared.contexts.complete(
                        &removed,
                        OpResult::err(StorageError::Canceled),
                        OpState::Canceled,
                    );
                    log::debug!("canceled queued operation {}", id);
                }
                Ok(())
            }
            OpState::InService | OpState::InternallyDelayed => {
                let is_rw = matches!(&*op.payload.lock().unwrap(), OpPayload::BstreamRwList(_));
                if is_rw {
                    if let Some(aio) = &self.shared.aio {
                        aio.cancel(&self.shared, &op);
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ---- posting ---------------------------------------------------------

    fn post(
        &self,
        coll: Arc<Collection>,
        handle: Handle,
        role: QueueRole,
        sync: bool,
        context_id: usize,
        user_token: u64,
        payload: OpPayload,
    ) -> Result<Posted> {
        let op = QueuedOp::new(
            Some(Arc::clone(&coll)),
            handle,
            context_id,
            user_token,
            role,
            sync,
            payload,
        );

        let immediate = role != QueueRole::Io
            && !sync
            && coll.options.lock().unwrap().immediate_completion;
        if immediate {
            let output = self.shared.service(&op)?;
            self.shared.queue_strand_cleanup(&op, &Ok(output.clone()));
            return Ok(Posted::Immediate(output));
        }

        let id = self.shared.registry.register(&op);
        self.shared.coalescer.enqueue_accounting(&op);
        self.shared.queue(role).push(op);
        Ok(Posted::Queued(id))
    }

    // ---- dataspace operations --------------------------------------------

    pub fn dspace_create(
        &self,
        coll_id: CollId,
        handle: Handle,
        ds_type: DsType,
        sync: bool,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            handle,
            QueueRole::MetaWrite,
            sync,
            context_id,
            user_token,
            OpPayload::DspaceCreate { requested: handle, ds_type },
        )
    }

    pub fn dspace_create_list(
        &self,
        coll_id: CollId,
        handles: &[Handle],
        ds_type: DsType,
        sync: bool,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            Handle::NULL,
            QueueRole::MetaWrite,
            sync,
            context_id,
            user_token,
            OpPayload::DspaceCreateList { requested: handles.to_vec(), ds_type },
        )
    }

    pub fn dspace_remove(
        &self,
        coll_id: CollId,
        handle: Handle,
        sync: bool,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            handle,
            QueueRole::MetaWrite,
            sync,
            context_id,
            user_token,
            OpPayload::DspaceRemove,
        )
    }

    pub fn dspace_remove_list(
        &self,
        coll_id: CollId,
        handles: &[Handle],
        sync: bool,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            Handle::NULL,
            QueueRole::MetaWrite,
            sync,
            context_id,
            user_token,
            OpPayload::DspaceRemoveList { handles: handles.to_vec() },
        )
    }

    pub fn dspace_iterate_handles(
        &self,
        coll_id: CollId,
        position: HandlePosition,
        count: usize,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            Handle::NULL,
            QueueRole::MetaRead,
            false,
            context_id,
            user_token,
            OpPayload::DspaceIterateHandles { position, count },
        )
    }

    pub fn dspace_verify(
        &self,
        coll_id: CollId,
        handle: Handle,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            handle,
            QueueRole::MetaRead,
            false,
            context_id,
            user_token,
            OpPayload::DspaceVerify,
        )
    }

    /// Attribute read. A cache hit short-circuits entirely, bypassing the
    /// queue.
    pub fn dspace_getattr(
        &self,
        coll_id: CollId,
        handle: Handle,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        if let Some(attrs) = self.shared.attr_cache.get(coll_id, handle) {
            log::trace!("getattr fast path hit on {}", handle);
            return Ok(Posted::Immediate(OpOutput::Attr(attrs)));
        }
        self.post(
            coll,
            handle,
            QueueRole::MetaRead,
            false,
            context_id,
            user_token,
            OpPayload::DspaceGetAttr,
        )
    }

    pub fn dspace_getattr_list(
        &self,
        coll_id: CollId,
        handles: &[Handle],
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            Handle::NULL,
            QueueRole::MetaRead,
            false,
            context_id,
            user_token,
            OpPayload::DspaceGetAttrList { handles: handles.to_vec() },
        )
    }

    pub fn dspace_setattr(
        &self,
        coll_id: CollId,
        handle: Handle,
        attrs: DsAttributes,
        sync: bool,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            handle,
            QueueRole::MetaWrite,
            sync,
            context_id,
            user_token,
            OpPayload::DspaceSetAttr { attrs },
        )
    }

    // ---- keyval operations -----------------------------------------------

    pub fn keyval_read(
        &self,
        coll_id: CollId,
        handle: Handle,
        key_type: KeyType,
        key: &[u8],
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            handle,
            QueueRole::MetaRead,
            false,
            context_id,
            user_token,
            OpPayload::KeyvalRead { key_type, key: key.to_vec() },
        )
    }

    pub fn keyval_write(
        &self,
        coll_id: CollId,
        handle: Handle,
        key_type: KeyType,
        key: &[u8],
        value: &[u8],
        sync: bool,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            handle,
            QueueRole::MetaWrite,
            sync,
            context_id,
            user_token,
            OpPayload::KeyvalWrite {
                key_type,
                key: key.to_vec(),
                value: value.to_vec(),
            },
        )
    }

    pub fn keyval_remove(
        &self,
        coll_id: CollId,
        handle: Handle,
        key_type: KeyType,
        key: &[u8],
        sync: bool,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            handle,
            QueueRole::MetaWrite,
            sync,
            context_id,
            user_token,
            OpPayload::KeyvalRemove { key_type, key: key.to_vec() },
        )
    }

    pub fn keyval_iterate(
        &self,
        coll_id: CollId,
        handle: Handle,
        key_type: KeyType,
        position: KvPosition,
        count: usize,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            handle,
            QueueRole::MetaRead,
            false,
            context_id,
            user_token,
            OpPayload::KeyvalIterate { key_type, position, count },
        )
    }

    pub fn keyval_iterate_keys(
        &self,
        coll_id: CollId,
        handle: Handle,
        key_type: KeyType,
        position: KvPosition,
        count: usize,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            handle,
            QueueRole::MetaRead,
            false,
            context_id,
            user_token,
            OpPayload::KeyvalIterateKeys { key_type, position, count },
        )
    }

    pub fn keyval_flush(
        &self,
        coll_id: CollId,
        sync: bool,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            Handle::NULL,
            QueueRole::MetaWrite,
            sync,
            context_id,
            user_token,
            OpPayload::KeyvalFlush,
        )
    }

    // ---- bytestream operations -------------------------------------------

    pub fn bstream_read_list(
        &self,
        coll_id: CollId,
        handle: Handle,
        mem: Vec<MemSegment>,
        streams: Vec<StreamSegment>,
        sync: bool,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        self.bstream_rw(coll_id, handle, IoKind::Read, mem, streams, sync, context_id, user_token)
    }

    pub fn bstream_write_list(
        &self,
        coll_id: CollId,
        handle: Handle,
        mem: Vec<MemSegment>,
        streams: Vec<StreamSegment>,
        sync: bool,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        self.bstream_rw(coll_id, handle, IoKind::Write, mem, streams, sync, context_id, user_token)
    }

    #[allow(clippy::too_many_arguments)]
    fn bstream_rw(
        &self,
        coll_id: CollId,
        handle: Handle,
        kind: IoKind,
        mem: Vec<MemSegment>,
        streams: Vec<StreamSegment>,
        sync: bool,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        let op = QueuedOp::new(
            Some(Arc::clone(&coll)),
            handle,
            context_id,
            user_token,
            QueueRole::Io,
            sync,
            OpPayload::BstreamRwList(RwList::new(kind, mem, streams)),
        );

        if kind == IoKind::Write {
            // the write is about to invalidate whatever size is cached
            self.shared.attr_cache.remove(coll_id, handle);
        }

        match (&self.shared.aio, &self.shared.threaded) {
            (Some(aio), _) => {
                let mode = bstream::open_mode_for(kind, false);
                let open_ref = match self.shared.open_cache.get(&coll, handle, mode) {
                    Ok(open_ref) => open_ref,
                    Err(StorageError::NotFound) if kind == IoKind::Read => {
                        // never written: the whole read lands past the end
                        return Ok(Posted::Immediate(OpOutput::Size(0)));
                    }
                    Err(err) => return Err(err),
                };
                if let OpPayload::BstreamRwList(rw) = &mut *op.payload.lock().unwrap() {
                    rw.open_ref = Some(open_ref);
                }
                op.set_state(OpState::InService);
                let id = self.shared.registry.register(&op);
                aio.submit_rw(&self.shared, op);
                Ok(Posted::Queued(id))
            }
            (None, Some(pool)) => {
                let id = self.shared.registry.register(&op);
                pool.submit_rw(op);
                Ok(Posted::Queued(id))
            }
            (None, None) => Err(StorageError::NotSupported),
        }
    }

    pub fn bstream_flush(
        &self,
        coll_id: CollId,
        handle: Handle,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            handle,
            QueueRole::Io,
            false,
            context_id,
            user_token,
            OpPayload::BstreamFlush,
        )
    }

    pub fn bstream_resize(
        &self,
        coll_id: CollId,
        handle: Handle,
        size: u64,
        sync: bool,
        context_id: usize,
        user_token: u64,
    ) -> Result<Posted> {
        let coll = self.collection(coll_id)?;
        self.post(
            coll,
            handle,
            QueueRole::Io,
            sync,
            context_id,
            user_token,
            OpPayload::BstreamResize { size },
        )
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// The process-default engine: a thin wrapper over a singleton constructed
/// at initialize, for callers that do not thread an engine value through.
pub mod default {
    use super::*;

    static ENGINE: RwLock<Option<Arc<StorageEngine>>> = RwLock::new(None);

    pub fn initialize(config: StorageConfig) -> Result<()> {
        let mut slot = ENGINE.write().unwrap();
        if slot.is_some() {
            return Err(StorageError::AlreadyExists);
        }
        *slot = Some(Arc::new(StorageEngine::initialize(config)?));
        Ok(())
    }

    pub fn engine() -> Result<Arc<StorageEngine>> {
        ENGINE
            .read()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(StorageError::Invalid)
    }

    pub fn finalize() -> Result<()> {
        let engine = ENGINE.write().unwrap().take().ok_or(StorageError::Invalid)?;
        engine.finalize();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::db::keyval_key;
    use tempfile::TempDir;

    const COLL: CollId = 1;
    const WAIT_MS: u64 = 10_000;

    fn fixture(kind: BstreamEngineKind) -> (TempDir, StorageEngine, usize) {
        fixture_with(kind, |_| {})
    }

    fn fixture_with(
        kind: BstreamEngineKind,
        tweak: impl FnOnce(&mut StorageConfig),
    ) -> (TempDir, StorageEngine, usize) {
        let dir = TempDir::new().unwrap();
        let mut config = StorageConfig::new(dir.path().join("data"), dir.path().join("meta"));
        config.bstream_engine = kind;
        config.workers = WorkerConfig { meta_read: 1, meta_write: 1, io: 1 };
        config.directio.threads = 2;
        config.directio.timeout_ms = 50;
        tweak(&mut config);
        StorageEngine::storage_create(&config).unwrap();
        let engine = StorageEngine::initialize(config).unwrap();
        engine.collection_create("fs0", COLL).unwrap();
        assert_eq!(engine.collection_lookup("fs0").unwrap(), COLL);
        let ctx = engine.open_context().unwrap();
        (dir, engine, ctx)
    }

    fn wait(engine: &StorageEngine, ctx: usize, posted: Posted) -> OpResult {
        match posted {
            Posted::Immediate(output) => OpResult::ok(output),
            Posted::Queued(id) => match engine.test(ctx, id, WAIT_MS).unwrap() {
                TestOutcome::Complete(completion) => completion.state,
                TestOutcome::Busy => panic!("operation {} did not complete in time", id),
            },
        }
    }

    fn expect_ok(result: OpResult) -> OpOutput {
        assert_eq!(result.error, None, "operation failed: {:?}", result.error);
        result.output
    }

    fn create_dataspace(
        engine: &StorageEngine,
        ctx: usize,
        handle: Handle,
        ds_type: DsType,
    ) -> Handle {
        let posted = engine
            .dspace_create(COLL, handle, ds_type, true, ctx, 0)
            .unwrap();
        match expect_ok(wait(engine, ctx, posted)) {
            OpOutput::Handle(created) => created,
            other => panic!("unexpected output {:?}", other),
        }
    }

    fn write_all(engine: &StorageEngine, ctx: usize, handle: Handle, data: &mut [u8], offset: u64) {
        let len = data.len() as u64;
        let posted = engine
            .bstream_write_list(
                COLL,
                handle,
                vec![MemSegment::from_slice(data)],
                vec![StreamSegment::new(offset, len)],
                true,
                ctx,
                0,
            )
            .unwrap();
        match expect_ok(wait(engine, ctx, posted)) {
            OpOutput::Size(done) => assert_eq!(done, len),
            other => panic!("unexpected output {:?}", other),
        }
    }

    fn read_into(
        engine: &StorageEngine,
        ctx: usize,
        handle: Handle,
        buf: &mut [u8],
        offset: u64,
    ) -> u64 {
        let len = buf.len() as u64;
        let posted = engine
            .bstream_read_list(
                COLL,
                handle,
                vec![MemSegment::from_slice(buf)],
                vec![StreamSegment::new(offset, len)],
                false,
                ctx,
                0,
            )
            .unwrap();
        match expect_ok(wait(engine, ctx, posted)) {
            OpOutput::Size(done) => done,
            other => panic!("unexpected output {:?}", other),
        }
    }

    fn getattr(engine: &StorageEngine, ctx: usize, handle: Handle) -> DsAttributes {
        let posted = engine.dspace_getattr(COLL, handle, ctx, 0).unwrap();
        match expect_ok(wait(engine, ctx, posted)) {
            OpOutput::Attr(attrs) => attrs,
            other => panic!("unexpected output {:?}", other),
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| b'A' + (i % 26) as u8).collect()
    }

    // -- end-to-end scenarios ---------------------------------------------

    fn run_create_write_read_back(kind: BstreamEngineKind) {
        let (_dir, engine, ctx) = fixture(kind);
        let handle = create_dataspace(&engine, ctx, Handle(1), DsType::Metafile);
        assert_eq!(handle, Handle(1));

        let mut data = pattern(1_048_576);
        write_all(&engine, ctx, handle, &mut data, 0);

        let mut back = vec![0u8; 1_048_576];
        let got = read_into(&engine, ctx, handle, &mut back, 0);
        assert_eq!(got, 1_048_576);
        assert_eq!(back, pattern(1_048_576));
    }

    #[test]
    fn test_create_write_read_back_aio() {
        run_create_write_read_back(BstreamEngineKind::Aio);
    }

    #[test]
    fn test_create_write_read_back_threaded() {
        run_create_write_read_back(BstreamEngineKind::Threaded);
    }

    #[test]
    fn test_scattered_write_gathers_on_read() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(3), DsType::Datafile);

        // two memory segments feeding three file segments
        let mut data = pattern(600);
        let mem = vec![
            MemSegment::new(data.as_mut_ptr(), 250),
            MemSegment::new(unsafe { data.as_mut_ptr().add(250) }, 350),
        ];
        let streams = vec![
            StreamSegment::new(0, 100),
            StreamSegment::new(1000, 200),
            StreamSegment::new(5000, 300),
        ];
        let posted = engine
            .bstream_write_list(COLL, handle, mem, streams, true, ctx, 0)
            .unwrap();
        assert_eq!(expect_ok(wait(&engine, ctx, posted)), OpOutput::Size(600));

        let mut piece = vec![0u8; 300];
        assert_eq!(read_into(&engine, ctx, handle, &mut piece, 5000), 300);
        assert_eq!(piece, &pattern(600)[300..600]);

        let attrs = getattr(&engine, ctx, handle);
        assert_eq!(attrs.bstream_size(), 5300);
    }

    #[test]
    fn test_double_create_already_exists() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        create_dataspace(&engine, ctx, Handle(7), DsType::Datafile);

        let posted = engine
            .dspace_create(COLL, Handle(7), DsType::Datafile, true, ctx, 0)
            .unwrap();
        let result = wait(&engine, ctx, posted);
        assert_eq!(result.error, Some(StorageError::AlreadyExists));
    }

    #[test]
    fn test_keyval_roundtrip() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(9), DsType::Directory);

        let posted = engine
            .keyval_write(COLL, handle, KeyType::DirEntry, b"file.txt", b"payload", true, ctx, 0)
            .unwrap();
        expect_ok(wait(&engine, ctx, posted));

        let posted = engine
            .keyval_read(COLL, handle, KeyType::DirEntry, b"file.txt", ctx, 0)
            .unwrap();
        assert_eq!(
            expect_ok(wait(&engine, ctx, posted)),
            OpOutput::Value(b"payload".to_vec())
        );

        let posted = engine
            .keyval_remove(COLL, handle, KeyType::DirEntry, b"file.txt", true, ctx, 0)
            .unwrap();
        expect_ok(wait(&engine, ctx, posted));

        let posted = engine
            .keyval_read(COLL, handle, KeyType::DirEntry, b"file.txt", ctx, 0)
            .unwrap();
        assert_eq!(wait(&engine, ctx, posted).error, Some(StorageError::NotFound));
    }

    #[test]
    fn test_keyval_iteration_in_order() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(11), DsType::Directory);

        for name in ["cc", "aa", "bb", "dd"] {
            let posted = engine
                .keyval_write(COLL, handle, KeyType::DirEntry, name.as_bytes(), b"h", false, ctx, 0)
                .unwrap();
            expect_ok(wait(&engine, ctx, posted));
        }

        // drain in two batches through the resumable position
        let posted = engine
            .keyval_iterate(COLL, handle, KeyType::DirEntry, KvPosition::Start, 3, ctx, 0)
            .unwrap();
        let (entries, position) = match expect_ok(wait(&engine, ctx, posted)) {
            OpOutput::KvBatch { entries, position } => (entries, position),
            other => panic!("unexpected output {:?}", other),
        };
        assert_eq!(
            entries.iter().map(|e| e.key.clone()).collect::<Vec<_>>(),
            vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()]
        );

        let posted = engine
            .keyval_iterate(COLL, handle, KeyType::DirEntry, position, 3, ctx, 0)
            .unwrap();
        match expect_ok(wait(&engine, ctx, posted)) {
            OpOutput::KvBatch { entries, position } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].key, b"dd");
                assert_eq!(position, KvPosition::End);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_iterate_handles_multiset() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let mut live: Vec<Handle> = Vec::new();
        for i in 1..=10u128 {
            live.push(create_dataspace(&engine, ctx, Handle(i * 3), DsType::Metafile));
        }
        for removed in [Handle(3), Handle(15), Handle(30)] {
            let posted = engine.dspace_remove(COLL, removed, true, ctx, 0).unwrap();
            expect_ok(wait(&engine, ctx, posted));
            live.retain(|&h| h != removed);
        }

        // walk in batches of 4, resuming from the returned position
        let mut seen = Vec::new();
        let mut position = HandlePosition::Start;
        loop {
            let posted = engine
                .dspace_iterate_handles(COLL, position, 4, ctx, 0)
                .unwrap();
            match expect_ok(wait(&engine, ctx, posted)) {
                OpOutput::HandleBatch { handles, position: next } => {
                    seen.extend(handles);
                    if next == HandlePosition::End {
                        break;
                    }
                    position = next;
                }
                other => panic!("unexpected output {:?}", other),
            }
        }
        seen.sort();
        live.sort();
        assert_eq!(seen, live);
    }

    #[test]
    fn test_iterate_at_end_returns_nothing() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        create_dataspace(&engine, ctx, Handle(5), DsType::Metafile);

        let posted = engine
            .dspace_iterate_handles(COLL, HandlePosition::End, 16, ctx, 0)
            .unwrap();
        match expect_ok(wait(&engine, ctx, posted)) {
            OpOutput::HandleBatch { handles, position } => {
                assert!(handles.is_empty());
                assert_eq!(position, HandlePosition::End);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    fn run_read_past_end(kind: BstreamEngineKind) {
        let (_dir, engine, ctx) = fixture(kind);
        let handle = create_dataspace(&engine, ctx, Handle(21), DsType::Datafile);
        let mut data = pattern(100);
        write_all(&engine, ctx, handle, &mut data, 0);

        let mut buf = vec![0u8; 64];
        assert_eq!(read_into(&engine, ctx, handle, &mut buf, 4096), 0);
    }

    #[test]
    fn test_read_past_end_aio() {
        run_read_past_end(BstreamEngineKind::Aio);
    }

    #[test]
    fn test_read_past_end_threaded() {
        run_read_past_end(BstreamEngineKind::Threaded);
    }

    #[test]
    fn test_read_of_never_written_bstream() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(23), DsType::Datafile);
        let mut buf = vec![0u8; 128];
        assert_eq!(read_into(&engine, ctx, handle, &mut buf, 0), 0);
    }

    #[test]
    fn test_sparse_write_and_hole_read() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(25), DsType::Datafile);

        let mut data = pattern(100);
        write_all(&engine, ctx, handle, &mut data, 8192);

        // the hole reads as zeroes
        let mut hole = vec![0xFFu8; 100];
        assert_eq!(read_into(&engine, ctx, handle, &mut hole, 0), 100);
        assert!(hole.iter().all(|&b| b == 0));

        let attrs = getattr(&engine, ctx, handle);
        assert_eq!(attrs.bstream_size(), 8292);
    }

    #[test]
    fn test_size_attr_covers_acknowledged_writes() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Aio);
        let handle = create_dataspace(&engine, ctx, Handle(27), DsType::Datafile);

        let mut first = pattern(100);
        write_all(&engine, ctx, handle, &mut first, 0);
        let mut second = pattern(100);
        write_all(&engine, ctx, handle, &mut second, 50);

        let attrs = getattr(&engine, ctx, handle);
        assert!(attrs.bstream_size() >= 150);
    }

    #[test]
    fn test_remove_without_bstream() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(31), DsType::Datafile);

        let posted = engine.dspace_remove(COLL, handle, true, ctx, 0).unwrap();
        expect_ok(wait(&engine, ctx, posted));

        let posted = engine.dspace_getattr(COLL, handle, ctx, 0).unwrap();
        assert_eq!(wait(&engine, ctx, posted).error, Some(StorageError::NotFound));
    }

    #[test]
    fn test_remove_purges_keyval_entries() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(33), DsType::Directory);
        for i in 0..5u8 {
            let posted = engine
                .keyval_write(COLL, handle, KeyType::DirEntry, &[i], b"x", false, ctx, 0)
                .unwrap();
            expect_ok(wait(&engine, ctx, posted));
        }

        let posted = engine.dspace_remove(COLL, handle, true, ctx, 0).unwrap();
        expect_ok(wait(&engine, ctx, posted));

        // no keyval entries survive the removal
        let coll = engine.collection(COLL).unwrap();
        assert_eq!(
            coll.keyval_db
                .get(&keyval_key(handle, KeyType::DirEntry.as_u8(), &[0]))
                .err(),
            Some(StorageError::NotFound)
        );
    }

    #[test]
    fn test_setattr_getattr_roundtrip() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(35), DsType::Metafile);

        let mut attrs = getattr(&engine, ctx, handle);
        attrs.owner = 1000;
        attrs.group = 2000;
        attrs.perms = 0o640;
        let posted = engine
            .dspace_setattr(COLL, handle, attrs.clone(), true, ctx, 0)
            .unwrap();
        expect_ok(wait(&engine, ctx, posted));

        let back = getattr(&engine, ctx, handle);
        assert_eq!(back, attrs);
    }

    #[test]
    fn test_verify_reports_type() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(37), DsType::Symlink);

        let posted = engine.dspace_verify(COLL, handle, ctx, 0).unwrap();
        assert_eq!(expect_ok(wait(&engine, ctx, posted)), OpOutput::DsType(DsType::Symlink));

        let posted = engine.dspace_verify(COLL, Handle(38), ctx, 0).unwrap();
        assert_eq!(wait(&engine, ctx, posted).error, Some(StorageError::NotFound));
    }

    #[test]
    fn test_create_list_rollback() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        create_dataspace(&engine, ctx, Handle(41), DsType::Metafile);

        // the middle handle collides; nothing from the batch may survive
        let batch = [Handle(40), Handle(41), Handle(42)];
        let posted = engine
            .dspace_create_list(COLL, &batch, DsType::Metafile, true, ctx, 0)
            .unwrap();
        let result = wait(&engine, ctx, posted);
        assert_eq!(result.error, Some(StorageError::AlreadyExists));

        for probe in [Handle(40), Handle(42)] {
            let posted = engine.dspace_verify(COLL, probe, ctx, 0).unwrap();
            assert_eq!(wait(&engine, ctx, posted).error, Some(StorageError::NotFound));
        }
        // the preexisting dataspace is untouched
        let posted = engine.dspace_verify(COLL, Handle(41), ctx, 0).unwrap();
        expect_ok(wait(&engine, ctx, posted));
    }

    #[test]
    fn test_remove_list_reports_per_handle_states() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let a = create_dataspace(&engine, ctx, Handle(43), DsType::Metafile);
        let b = create_dataspace(&engine, ctx, Handle(44), DsType::Metafile);

        let posted = engine
            .dspace_remove_list(COLL, &[a, Handle(999), b], true, ctx, 0)
            .unwrap();
        match expect_ok(wait(&engine, ctx, posted)) {
            OpOutput::States(states) => {
                assert_eq!(states.len(), 3);
                assert_eq!(states[0], None);
                assert_eq!(states[1], Some(StorageError::NotFound));
                assert_eq!(states[2], None);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_getattr_fast_path_after_seed() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(45), DsType::Metafile);

        // first read goes through the queue and seeds the cache
        let posted = engine.dspace_getattr(COLL, handle, ctx, 0).unwrap();
        assert!(matches!(posted, Posted::Queued(_)));
        expect_ok(wait(&engine, ctx, posted));

        // second read short-circuits
        let posted = engine.dspace_getattr(COLL, handle, ctx, 0).unwrap();
        assert!(matches!(posted, Posted::Immediate(OpOutput::Attr(_))));
    }

    #[test]
    fn test_immediate_completion_mode() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(47), DsType::Directory);

        engine
            .collection_setinfo(COLL, CollectionSetInfo::ImmediateCompletionEnabled(true))
            .unwrap();

        // non-sync metadata operations now service in the caller's thread
        let posted = engine
            .keyval_write(COLL, handle, KeyType::Attribute, b"k", b"v", false, ctx, 0)
            .unwrap();
        assert!(matches!(posted, Posted::Immediate(_)));

        let posted = engine
            .keyval_read(COLL, handle, KeyType::Attribute, b"k", ctx, 0)
            .unwrap();
        match posted {
            Posted::Immediate(OpOutput::Value(value)) => assert_eq!(value, b"v"),
            other => panic!("unexpected posting {:?}", other.op_id()),
        }

        // sync-required operations still queue
        let posted = engine
            .keyval_write(COLL, handle, KeyType::Attribute, b"k2", b"v2", true, ctx, 0)
            .unwrap();
        assert!(matches!(posted, Posted::Queued(_)));
        expect_ok(wait(&engine, ctx, posted));
    }

    #[test]
    fn test_watermark_coalescing_single_sync() {
        // high watermark 4, low watermark 1: five sync-required keyval
        // writes outstanding together must produce exactly one sync
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(49), DsType::Directory);
        engine
            .collection_setinfo(COLL, CollectionSetInfo::CoalescingHighWatermark(4))
            .unwrap();
        engine
            .collection_setinfo(COLL, CollectionSetInfo::CoalescingLowWatermark(1))
            .unwrap();
        engine
            .collection_setinfo(COLL, CollectionSetInfo::MetaSyncEnabled(true))
            .unwrap();

        let shared = &engine.shared;
        let coll = engine.collection(COLL).unwrap();
        let baseline = coll.keyval_db.sync_count();

        // drive the coalescer the way a worker would, with all five posted
        // before any is claimed
        let ops: Vec<Arc<QueuedOp>> = (0..5u8)
            .map(|i| {
                let op = QueuedOp::new(
                    Some(Arc::clone(&coll)),
                    handle,
                    ctx,
                    i as u64,
                    QueueRole::MetaWrite,
                    true,
                    OpPayload::KeyvalWrite {
                        key_type: KeyType::Attribute,
                        key: vec![i],
                        value: vec![i; 8],
                    },
                );
                shared.registry.register(&op);
                shared.coalescer.enqueue_accounting(&op);
                op
            })
            .collect();

        for op in &ops {
            shared.coalescer.dequeue_accounting(op);
            op.set_state(OpState::Queued);
            assert!(op.try_begin_service());
            let result = shared.service(op);
            shared.coalescer.coalesce(&shared.contexts, Arc::clone(op), result.into());
        }

        assert_eq!(coll.keyval_db.sync_count() - baseline, 1);

        // all five operations completed
        let completions = engine.test_context(ctx, 10, WAIT_MS).unwrap();
        assert_eq!(completions.len(), 5);
        assert!(completions.iter().all(|c| c.state.is_ok()));
    }

    #[test]
    fn test_aio_throttle_bounds_in_flight() {
        let (_dir, engine, ctx) = fixture_with(BstreamEngineKind::Aio, |config| {
            config.max_concurrent_io = 2;
        });

        let mut buffers: Vec<Vec<u8>> = Vec::new();
        let handles: Vec<Handle> = (1..=5u128).map(Handle).collect();
        for &handle in &handles {
            create_dataspace(&engine, ctx, handle, DsType::Datafile);
            let mut data = pattern(65_536);
            write_all(&engine, ctx, handle, &mut data, 0);
        }

        // five concurrent read lists against a cap of two
        let mut ids = Vec::new();
        for &handle in &handles {
            let mut buf = vec![0u8; 65_536];
            let posted = engine
                .bstream_read_list(
                    COLL,
                    handle,
                    vec![MemSegment::from_slice(&mut buf)],
                    vec![StreamSegment::new(0, 65_536)],
                    false,
                    ctx,
                    0,
                )
                .unwrap();
            buffers.push(buf);
            match posted {
                Posted::Queued(id) => ids.push(id),
                Posted::Immediate(output) => panic!("unexpected immediate {:?}", output),
            }
        }

        let mut remaining: std::collections::HashSet<OpId> = ids.iter().copied().collect();
        while !remaining.is_empty() {
            for completion in engine.test_some(ctx, &ids, WAIT_MS).unwrap() {
                assert_eq!(completion.state.output, OpOutput::Size(65_536));
                assert!(completion.state.is_ok());
                remaining.remove(&completion.id);
            }
        }

        let aio = engine.shared.aio.as_ref().unwrap();
        assert!(aio.peak_in_flight() >= 1);
        assert!(aio.peak_in_flight() <= 2);
        assert_eq!(aio.in_flight(), 0);

        for buf in &buffers {
            assert_eq!(buf.as_slice(), pattern(65_536).as_slice());
        }
    }

    #[test]
    fn test_open_cache_eviction_after_five_handles() {
        let (_dir, engine, ctx) = fixture_with(BstreamEngineKind::Threaded, |config| {
            config.open_cache_size = 4;
        });

        let handles: Vec<Handle> = (101..=105u128).map(Handle).collect();
        for &handle in &handles {
            create_dataspace(&engine, ctx, handle, DsType::Datafile);
            let mut data = pattern(512);
            write_all(&engine, ctx, handle, &mut data, 0);
        }

        // the pool holds four entries: the first handle fell off the LRU
        assert!(!engine.shared.open_cache.is_cached(COLL, handles[0]));
        assert!(engine.shared.open_cache.is_cached(COLL, handles[4]));

        // touching the first handle again opens a fresh descriptor
        let mut buf = vec![0u8; 512];
        assert_eq!(read_into(&engine, ctx, handles[0], &mut buf, 0), 512);
        assert_eq!(buf, pattern(512));
        assert!(engine.shared.open_cache.is_cached(COLL, handles[0]));
    }

    #[test]
    fn test_bstream_flush_and_resize() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(51), DsType::Datafile);
        let mut data = pattern(1000);
        write_all(&engine, ctx, handle, &mut data, 0);

        let posted = engine.bstream_flush(COLL, handle, ctx, 0).unwrap();
        expect_ok(wait(&engine, ctx, posted));

        let posted = engine.bstream_resize(COLL, handle, 400, true, ctx, 0).unwrap();
        expect_ok(wait(&engine, ctx, posted));

        let attrs = getattr(&engine, ctx, handle);
        assert_eq!(attrs.bstream_size(), 400);

        let mut buf = vec![0u8; 1000];
        assert_eq!(read_into(&engine, ctx, handle, &mut buf, 0), 400);
        assert_eq!(&buf[..400], &pattern(1000)[..400]);
    }

    #[test]
    fn test_cancel_queued_operation() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        let handle = create_dataspace(&engine, ctx, Handle(53), DsType::Directory);

        // hold the handle so the worker cannot claim the next operation
        assert!(engine
            .shared
            .in_service
            .lock()
            .unwrap()
            .insert((COLL, handle)));

        let posted = engine
            .keyval_write(COLL, handle, KeyType::Attribute, b"k", b"v", true, ctx, 0)
            .unwrap();
        let id = posted.op_id().unwrap();
        engine.cancel(id).unwrap();

        match engine.test(ctx, id, WAIT_MS).unwrap() {
            TestOutcome::Complete(completion) => {
                assert_eq!(completion.state.error, Some(StorageError::Canceled));
            }
            TestOutcome::Busy => panic!("canceled operation never completed"),
        }

        engine.shared.in_service.lock().unwrap().remove(&(COLL, handle));
        // canceling an unknown id is a post-free result
        assert_eq!(engine.cancel(id).err(), Some(StorageError::Invalid));
    }

    #[test]
    fn test_collection_getinfo_stats() {
        let (_dir, engine, _ctx) = fixture(BstreamEngineKind::Threaded);
        let stats = engine.collection_getinfo(COLL).unwrap();
        assert_eq!(stats.fs_id, COLL);
        assert!(stats.bytes_total > 0);
        assert!(stats.bytes_available <= stats.bytes_total);
    }

    #[test]
    fn test_storage_lifecycle_reopen() {
        let dir = TempDir::new().unwrap();
        let mut config = StorageConfig::new(dir.path().join("data"), dir.path().join("meta"));
        config.bstream_engine = BstreamEngineKind::Threaded;
        config.workers = WorkerConfig { meta_read: 1, meta_write: 1, io: 1 };
        config.directio.threads = 2;
        StorageEngine::storage_create(&config).unwrap();

        {
            let engine = StorageEngine::initialize(config.clone()).unwrap();
            let ctx = engine.open_context().unwrap();
            for (name, coll_id) in [("one", 11), ("two", 22), ("three", 33)] {
                engine.collection_create(name, coll_id).unwrap();
                engine.collection_lookup(name).unwrap();
                let posted = engine
                    .dspace_create(coll_id, Handle(coll_id as u128), DsType::Metafile, true, ctx, 0)
                    .unwrap();
                match wait_on(&engine, ctx, posted) {
                    OpOutput::Handle(created) => assert_eq!(created, Handle(coll_id as u128)),
                    other => panic!("unexpected output {:?}", other),
                }
            }
            engine.finalize();
        }

        let engine = StorageEngine::initialize(config).unwrap();
        let mut collections = engine.collection_iterate().unwrap();
        collections.sort();
        assert_eq!(
            collections,
            vec![
                ("one".to_string(), 11),
                ("three".to_string(), 33),
                ("two".to_string(), 22)
            ]
        );

        // the dataspaces survived the reopen
        let ctx = engine.open_context().unwrap();
        for (name, coll_id) in [("one", 11u32), ("two", 22), ("three", 33)] {
            assert_eq!(engine.collection_lookup(name).unwrap(), coll_id);
            let posted = engine
                .dspace_verify(coll_id, Handle(coll_id as u128), ctx, 0)
                .unwrap();
            assert_eq!(wait_on(&engine, ctx, posted), OpOutput::DsType(DsType::Metafile));
        }
    }

    fn wait_on(engine: &StorageEngine, ctx: usize, posted: Posted) -> OpOutput {
        expect_ok(wait(engine, ctx, posted))
    }

    #[test]
    fn test_unknown_collection_is_post_time_error() {
        let (_dir, engine, ctx) = fixture(BstreamEngineKind::Threaded);
        assert_eq!(
            engine
                .dspace_create(999, Handle::NULL, DsType::Metafile, false, ctx, 0)
                .err(),
            Some(StorageError::Invalid)
        );
    }

    #[test]
    fn test_default_engine_wrapper() {
        let dir = TempDir::new().unwrap();
        let mut config = StorageConfig::new(dir.path().join("data"), dir.path().join("meta"));
        config.bstream_engine = BstreamEngineKind::Threaded;
        config.workers = WorkerConfig { meta_read: 1, meta_write: 1, io: 1 };
        config.directio.threads = 1;
        StorageEngine::storage_create(&config).unwrap();

        default::initialize(config).unwrap();
        let engine = default::engine().unwrap();
        engine.collection_create("fs0", 4).unwrap();
        assert_eq!(engine.collection_lookup("fs0").unwrap(), 4);
        drop(engine);
        default::finalize().unwrap();
        assert!(default::engine().is_err());
    }
}
