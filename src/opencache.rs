//! Open cache
//!
//! An LRU cache of open file descriptors keyed by (collection, handle,
//! access mode), amortizing `open(2)` across repeated I/O on the same
//! bstream under a hard cap of simultaneously open descriptors.
//!
//! The cache is a fixed-size preallocated pool threaded onto three lists:
//! `free` (never filled in), `unused` (still open, refcount zero), and
//! `used` (refcount positive). A `get` that misses takes a free entry,
//! evicts the LRU-oldest unused entry, or, with the pool exhausted and
//! every entry referenced, opens an uncached descriptor that `put` closes
//! immediately. One pool mutex protects list membership and entry metadata;
//! the descriptor itself is used by I/O syscalls after the mutex is
//! released.

use std::collections::VecDeque;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Mutex;

use crate::error::StorageError;
use crate::handle::Handle;
use crate::mgmt::Collection;
use crate::{CollId, Result};

/// Access mode for a cached descriptor. Write modes create the backing file
/// if it is absent; direct modes open with O_DIRECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    BufferedRead,
    BufferedWrite,
    DirectRead,
    DirectWrite,
}

impl OpenMode {
    pub fn creates(&self) -> bool {
        matches!(self, OpenMode::BufferedWrite | OpenMode::DirectWrite)
    }

    pub fn direct(&self) -> bool {
        matches!(self, OpenMode::DirectRead | OpenMode::DirectWrite)
    }

    fn open_flags(&self) -> libc::c_int {
        let mut flags = libc::O_RDWR;
        if self.direct() {
            flags |= libc::O_DIRECT;
        }
        flags
    }
}

/// A checked-out descriptor. Must be returned with [`OpenCache::put`];
/// uncached fallback references close on return.
#[derive(Debug)]
pub struct CacheRef {
    pub fd: RawFd,
    slot: Option<usize>,
}

struct Entry {
    ref_ct: i32,
    coll_id: CollId,
    handle: Handle,
    mode: OpenMode,
    fd: RawFd,
}

impl Entry {
    fn unfilled() -> Entry {
        Entry {
            ref_ct: -1,
            coll_id: 0,
            handle: Handle::NULL,
            mode: OpenMode::BufferedRead,
            fd: -1,
        }
    }
}

struct Pool {
    entries: Vec<Entry>,
    /// Most recently touched at the front
    used: VecDeque<usize>,
    /// LRU-oldest at the front; `put` appends at the back
    unused: VecDeque<usize>,
    free: VecDeque<usize>,
}

pub struct OpenCache {
    pool: Mutex<Pool>,
}

impl OpenCache {
    pub fn new(size: usize) -> OpenCache {
        if size == 0 {
            log::warn!("open cache disabled; every reference opens a fresh descriptor");
        }
        OpenCache {
            pool: Mutex::new(Pool {
                entries: (0..size).map(|_| Entry::unfilled()).collect(),
                used: VecDeque::new(),
                unused: VecDeque::new(),
                free: (0..size).collect(),
            }),
        }
    }

    /// Return a descriptor valid for `mode` against the handle's bstream.
    pub fn get(&self, coll: &Collection, handle: Handle, mode: OpenMode) -> Result<CacheRef> {
        let mut pool = self.pool.lock().unwrap();

        // reuse an already-open reference when the mode matches
        if let Some(index) = find_entry(&pool, &pool.used, coll.coll_id, handle, mode)
            .or_else(|| find_entry(&pool, &pool.unused, coll.coll_id, handle, mode))
        {
            log::trace!("open cache hit: handle {} mode {:?}", handle, mode);
            let entry = &mut pool.entries[index];
            if entry.fd < 0 {
                entry.fd = open_fd(&coll.bstream_path(handle), mode)?;
            }
            let fd = entry.fd;
            entry.ref_ct += 1;
            pool.used.retain(|&i| i != index);
            pool.unused.retain(|&i| i != index);
            pool.used.push_front(index);
            return Ok(CacheRef { fd, slot: Some(index) });
        }

        // miss: free entry first, then evict from the unused list
        let slot = if let Some(index) = pool.free.pop_front() {
            Some(index)
        } else if let Some(index) = pool.unused.pop_front() {
            let entry = &mut pool.entries[index];
            log::trace!(
                "open cache evict: handle {} mode {:?}",
                entry.handle,
                entry.mode
            );
            if entry.fd > -1 {
                unsafe { libc::close(entry.fd) };
                entry.fd = -1;
            }
            Some(index)
        } else {
            None
        };

        if let Some(index) = slot {
            let fd = match open_fd(&coll.bstream_path(handle), mode) {
                Ok(fd) => fd,
                Err(err) => {
                    pool.entries[index] = Entry::unfilled();
                    pool.free.push_back(index);
                    return Err(err);
                }
            };
            pool.entries[index] = Entry {
                ref_ct: 1,
                coll_id: coll.coll_id,
                handle,
                mode,
                fd,
            };
            pool.used.push_front(index);
            debug_assert!(
                find_entry(&pool, &pool.used, coll.coll_id, handle, mode) == Some(index)
            );
            return Ok(CacheRef { fd, slot: Some(index) });
        }

        // pool exhausted and everything referenced: hand out an uncached
        // descriptor that put() will close
        log::trace!("open cache exhausted: uncached descriptor for handle {}", handle);
        drop(pool);
        let fd = open_fd(&coll.bstream_path(handle), mode)?;
        Ok(CacheRef { fd, slot: None })
    }

    /// Return a reference. Cached entries whose refcount reaches zero move
    /// to the tail of the unused list; uncached descriptors close here.
    pub fn put(&self, cache_ref: CacheRef) {
        match cache_ref.slot {
            Some(index) => {
                let mut pool = self.pool.lock().unwrap();
                let entry = &mut pool.entries[index];
                entry.ref_ct -= 1;
                debug_assert!(entry.ref_ct >= 0);
                if entry.ref_ct == 0 {
                    pool.used.retain(|&i| i != index);
                    pool.unused.push_back(index);
                }
            }
            None => {
                if cache_ref.fd > -1 {
                    unsafe { libc::close(cache_ref.fd) };
                }
            }
        }
    }

    /// Drop any cached entries for the handle and unlink its backing file.
    /// `NotFound` on the unlink is not an error. A referenced entry is a
    /// programming error: removal while I/O holds a descriptor is never
    /// legal.
    pub fn remove(&self, coll: &Collection, handle: Handle) -> Result<()> {
        let mut pool = self.pool.lock().unwrap();

        let referenced = pool.used.iter().any(|&i| {
            let entry = &pool.entries[i];
            entry.coll_id == coll.coll_id && entry.handle == handle
        });
        assert!(
            !referenced,
            "open cache: removing handle {handle} while references are held"
        );

        let matching: Vec<usize> = pool
            .unused
            .iter()
            .copied()
            .filter(|&i| {
                let entry = &pool.entries[i];
                entry.coll_id == coll.coll_id && entry.handle == handle
            })
            .collect();
        for index in matching {
            let entry = &mut pool.entries[index];
            if entry.fd > -1 {
                unsafe { libc::close(entry.fd) };
            }
            *entry = Entry::unfilled();
            pool.unused.retain(|&i| i != index);
            pool.free.push_back(index);
        }

        let path = coll.bstream_path(handle);
        drop(pool);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether the handle currently has a cached descriptor (any mode).
    /// Used by eviction tests.
    pub fn is_cached(&self, coll_id: CollId, handle: Handle) -> bool {
        let pool = self.pool.lock().unwrap();
        pool.used
            .iter()
            .chain(pool.unused.iter())
            .any(|&i| pool.entries[i].coll_id == coll_id && pool.entries[i].handle == handle)
    }

    /// Close every cached descriptor. Called at engine finalize.
    pub fn finalize(&self) {
        let mut pool = self.pool.lock().unwrap();
        for entry in pool.entries.iter_mut() {
            if entry.fd > -1 {
                unsafe { libc::close(entry.fd) };
                entry.fd = -1;
            }
        }
    }
}

fn find_entry(
    pool: &Pool,
    list: &VecDeque<usize>,
    coll_id: CollId,
    handle: Handle,
    mode: OpenMode,
) -> Option<usize> {
    list.iter().copied().find(|&i| {
        let entry = &pool.entries[i];
        entry.coll_id == coll_id && entry.handle == handle && entry.mode == mode
    })
}

/// Open the bstream file, creating it on the write modes when absent.
fn open_fd(path: &Path, mode: OpenMode) -> Result<RawFd> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| StorageError::Invalid)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), mode.open_flags(), 0) };
    if fd >= 0 {
        return Ok(fd);
    }
    let err = StorageError::last_os_error();
    if err == StorageError::NotFound && mode.creates() {
        let flags = mode.open_flags() | libc::O_CREAT | libc::O_EXCL;
        let fd = unsafe { libc::open(c_path.as_ptr(), flags, 0o644 as libc::mode_t as libc::c_uint) };
        if fd >= 0 {
            return Ok(fd);
        }
        return Err(StorageError::last_os_error());
    }
    Err(err)
}
