//! Dataspace engine
//!
//! A dataspace is the persistent unit of storage identified by a handle. Its
//! attribute record lives in the collection's dataspace database; datafile
//! dataspaces additionally own a backing bstream file. This module holds the
//! attribute record types and the service routines behind the dataspace
//! operation family: create (single and batch with rollback), remove (single
//! and batch), resumable handle iteration, verify, and attribute access.
//!
//! Removal order matters for crash behavior: the dataspace record goes
//! first, then the attribute cache entry, then a best-effort bstream unlink
//! through the open cache, then a cursor sweep of the keyval database, and
//! finally a keyval sync when the operation demanded one. A failure after
//! the record is removed leaves a stranded bstream or keyval tail that the
//! startup scavenge collects.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::attrcache::AttrCache;
use crate::db::{Cursor, CursorDirection};
use crate::error::StorageError;
use crate::handle::{Handle, HandleGenerator};
use crate::keyval::{self, KeyvalVisitor};
use crate::mgmt::Collection;
use crate::opencache::OpenCache;
use crate::Result;

/// Dataspace type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsType {
    Metafile,
    Datafile,
    Directory,
    Dirdata,
    Symlink,
}

/// Type-specific attribute payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeAttrs {
    Metafile { dfile_count: u32, dist_size: u64 },
    Datafile { bstream_size: u64 },
    Directory { dirent_count: u64 },
    Dirdata { count: u64 },
    Symlink { target_len: u32 },
}

impl TypeAttrs {
    pub fn ds_type(&self) -> DsType {
        match self {
            TypeAttrs::Metafile { .. } => DsType::Metafile,
            TypeAttrs::Datafile { .. } => DsType::Datafile,
            TypeAttrs::Directory { .. } => DsType::Directory,
            TypeAttrs::Dirdata { .. } => DsType::Dirdata,
            TypeAttrs::Symlink { .. } => DsType::Symlink,
        }
    }

    fn new_for(ds_type: DsType) -> TypeAttrs {
        match ds_type {
            DsType::Metafile => TypeAttrs::Metafile { dfile_count: 0, dist_size: 0 },
            DsType::Datafile => TypeAttrs::Datafile { bstream_size: 0 },
            DsType::Directory => TypeAttrs::Directory { dirent_count: 0 },
            DsType::Dirdata => TypeAttrs::Dirdata { count: 0 },
            DsType::Symlink => TypeAttrs::Symlink { target_len: 0 },
        }
    }
}

/// Dataspace attribute record as stored in the dataspace database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsAttributes {
    pub owner: u32,
    pub group: u32,
    pub perms: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub type_attrs: TypeAttrs,
}

impl DsAttributes {
    pub fn new(owner: u32, group: u32, perms: u32, type_attrs: TypeAttrs) -> DsAttributes {
        let now = chrono::Utc::now().timestamp();
        DsAttributes {
            owner,
            group,
            perms,
            atime: now,
            mtime: now,
            ctime: now,
            type_attrs,
        }
    }

    pub fn ds_type(&self) -> DsType {
        self.type_attrs.ds_type()
    }

    /// Bytestream size for datafile records; zero otherwise.
    pub fn bstream_size(&self) -> u64 {
        match self.type_attrs {
            TypeAttrs::Datafile { bstream_size } => bstream_size,
            _ => 0,
        }
    }
}

/// Opaque iteration position for `iterate_handles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlePosition {
    Start,
    End,
    /// The first not-yet-returned handle; resumption repositions the cursor
    /// at the first record at least this large.
    At(u128),
}

/// Read an attribute record straight from the dataspace database.
pub(crate) fn attr_get(coll: &Collection, handle: Handle) -> Result<DsAttributes> {
    let raw = coll.ds_db.get(&handle.to_bytes())?;
    Ok(bincode::deserialize(&raw)?)
}

/// Write an attribute record straight to the dataspace database.
pub(crate) fn attr_set(coll: &Collection, handle: Handle, attrs: &DsAttributes) -> Result<()> {
    coll.ds_db.put(&handle.to_bytes(), &bincode::serialize(attrs)?)
}

/// Insert the initial record for a new dataspace. The no-overwrite policy is
/// what detects duplicate handles. If a bstream file is already resident for
/// the handle (a leftover from an interrupted removal), it is moved to the
/// stranded directory before the record is stored.
fn create_store_handle(coll: &Collection, ds_type: DsType, handle: Handle) -> Result<()> {
    let attrs = DsAttributes::new(0, 0, 0o644, TypeAttrs::new_for(ds_type));
    coll.ds_db
        .put_unless_exists(&handle.to_bytes(), &bincode::serialize(&attrs)?)?;

    // the record is new, so a resident bstream is a leftover from an
    // interrupted removal; move it aside for the background sweeper
    let bstream = coll.bstream_path(handle);
    if bstream.exists() {
        log::warn!(
            "collection {:08x}: handle {} collides with a resident bstream, stranding it",
            coll.coll_id,
            handle
        );
        if let Err(err) = std::fs::rename(&bstream, coll.stranded_path(handle)) {
            let _ = coll.ds_db.del(&handle.to_bytes());
            return Err(err.into());
        }
    }
    Ok(())
}

/// Create a dataspace, minting a handle when the caller passed the null
/// handle.
pub(crate) fn create(
    coll: &Collection,
    generator: &HandleGenerator,
    requested: Handle,
    ds_type: DsType,
) -> Result<Handle> {
    let handle = if requested.is_null() {
        generator.generate()
    } else {
        requested
    };
    log::debug!(
        "dspace create: collection {:08x} handle {} type {:?}",
        coll.coll_id,
        handle,
        ds_type
    );
    create_store_handle(coll, ds_type, handle)?;
    Ok(handle)
}

/// Atomic batch create: on any failure, every record inserted by this call
/// is deleted before the original error is returned.
pub(crate) fn create_list(
    coll: &Collection,
    generator: &HandleGenerator,
    requested: &[Handle],
    ds_type: DsType,
) -> Result<Vec<Handle>> {
    let mut created: Vec<Handle> = Vec::with_capacity(requested.len());
    for &wanted in requested {
        let handle = if wanted.is_null() {
            generator.generate()
        } else {
            wanted
        };
        if let Err(err) = create_store_handle(coll, ds_type, handle) {
            for rollback in &created {
                let _ = coll.ds_db.del(&rollback.to_bytes());
            }
            return Err(err);
        }
        created.push(handle);
    }
    Ok(created)
}

/// Cursor sweep that deletes every keyval entry it is shown; handed to the
/// keyval iteration helper during dataspace removal.
struct RemoveSweep;

impl KeyvalVisitor for RemoveSweep {
    fn visit(&mut self, cursor: &mut Cursor<'_>, _key_type: u8, _key: &[u8], _value: &[u8]) -> Result<()> {
        cursor.del()
    }
}

/// Remove one dataspace: record, cached attributes, bstream, keyval tail.
pub(crate) fn remove_one(
    coll: &Arc<Collection>,
    attr_cache: &AttrCache,
    open_cache: &OpenCache,
    handle: Handle,
) -> Result<()> {
    coll.ds_db.del(&handle.to_bytes())?;
    log::debug!(
        "dspace remove: collection {:08x} handle {}",
        coll.coll_id,
        handle
    );

    attr_cache.remove(coll.coll_id, handle);

    // best effort; the bstream may never have been created
    if let Err(err) = open_cache.remove(coll, handle) {
        log::warn!(
            "bstream removal for handle {} failed: {} (continuing)",
            handle,
            err
        );
    }

    match keyval::iterate_visit(&coll.keyval_db, handle, &mut RemoveSweep) {
        Ok(_) | Err(StorageError::NotFound) => Ok(()),
        Err(err) => Err(err),
    }
}

/// `remove`, plus the keyval sync the operation's flags demand.
pub(crate) fn remove(
    coll: &Arc<Collection>,
    attr_cache: &AttrCache,
    open_cache: &OpenCache,
    handle: Handle,
    sync_flag: bool,
) -> Result<()> {
    remove_one(coll, attr_cache, open_cache, handle)?;
    if sync_flag {
        coll.keyval_db.sync()?;
    }
    Ok(())
}

/// Batch removal. The per-handle outcome array is reported to the caller;
/// an error against one handle does not stop the rest.
pub(crate) fn remove_list(
    coll: &Arc<Collection>,
    attr_cache: &AttrCache,
    open_cache: &OpenCache,
    handles: &[Handle],
    sync_flag: bool,
) -> Result<Vec<Result<()>>> {
    let states = handles
        .iter()
        .map(|&handle| remove_one(coll, attr_cache, open_cache, handle))
        .collect();
    if sync_flag {
        coll.keyval_db.sync()?;
    }
    Ok(states)
}

/// Enumerate handles, resumable via an opaque position.
pub(crate) fn iterate_handles(
    coll: &Collection,
    position: HandlePosition,
    count: usize,
) -> Result<(Vec<Handle>, HandlePosition)> {
    let mut handles = Vec::new();
    if count == 0 {
        return Ok((handles, position));
    }
    let start = match position {
        HandlePosition::End => return Ok((handles, HandlePosition::End)),
        HandlePosition::Start => CursorDirection::First,
        HandlePosition::At(raw) => {
            CursorDirection::SetRange(Handle(raw).to_bytes().to_vec())
        }
    };

    let mut cursor = coll.ds_db.cursor(false);
    let mut direction = start;
    while handles.len() < count {
        match cursor.get(direction) {
            Ok((key, _value)) => {
                let mut bytes = [0u8; 16];
                if key.len() != 16 {
                    return Err(StorageError::CorruptState);
                }
                bytes.copy_from_slice(&key);
                handles.push(Handle::from_bytes(bytes));
            }
            Err(StorageError::NotFound) => return Ok((handles, HandlePosition::End)),
            Err(err) => return Err(err),
        }
        direction = CursorDirection::Next;
    }

    // peek at the next record to form the resumption position
    match cursor.get(CursorDirection::Next) {
        Ok((key, _value)) => {
            let mut bytes = [0u8; 16];
            if key.len() != 16 {
                return Err(StorageError::CorruptState);
            }
            bytes.copy_from_slice(&key);
            Ok((handles, HandlePosition::At(Handle::from_bytes(bytes).0)))
        }
        Err(StorageError::NotFound) => Ok((handles, HandlePosition::End)),
        Err(err) => Err(err),
    }
}

/// Check existence and report the dataspace type.
pub(crate) fn verify(coll: &Collection, handle: Handle) -> Result<DsType> {
    Ok(attr_get(coll, handle)?.ds_type())
}

/// On-disk attribute read; every hit seeds the attribute cache.
pub(crate) fn getattr(
    coll: &Collection,
    attr_cache: &AttrCache,
    handle: Handle,
) -> Result<DsAttributes> {
    let attrs = attr_get(coll, handle)?;
    attr_cache.insert(coll.coll_id, handle, attrs.clone());
    Ok(attrs)
}

pub(crate) fn getattr_list(
    coll: &Collection,
    attr_cache: &AttrCache,
    handles: &[Handle],
) -> Vec<Result<DsAttributes>> {
    handles
        .iter()
        .map(|&handle| getattr(coll, attr_cache, handle))
        .collect()
}

/// Write attributes through to disk, then refresh the cache. The target
/// dataspace must exist.
pub(crate) fn setattr(
    coll: &Collection,
    attr_cache: &AttrCache,
    handle: Handle,
    attrs: &DsAttributes,
) -> Result<()> {
    attr_get(coll, handle)?;
    attr_set(coll, handle, attrs)?;
    attr_cache.insert(coll.coll_id, handle, attrs.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_record_roundtrip() {
        let attrs = DsAttributes::new(10, 20, 0o755, TypeAttrs::Datafile { bstream_size: 4096 });
        let raw = bincode::serialize(&attrs).unwrap();
        let back: DsAttributes = bincode::deserialize(&raw).unwrap();
        assert_eq!(back, attrs);
        assert_eq!(back.ds_type(), DsType::Datafile);
        assert_eq!(back.bstream_size(), 4096);
    }

    #[test]
    fn test_type_attrs_defaults() {
        assert_eq!(
            TypeAttrs::new_for(DsType::Datafile),
            TypeAttrs::Datafile { bstream_size: 0 }
        );
        assert_eq!(TypeAttrs::new_for(DsType::Symlink).ds_type(), DsType::Symlink);
    }

    #[test]
    fn test_non_datafile_has_zero_bstream_size() {
        let attrs = DsAttributes::new(0, 0, 0o644, TypeAttrs::Directory { dirent_count: 9 });
        assert_eq!(attrs.bstream_size(), 0);
    }
}
