//! Embedded database abstraction
//!
//! A uniform get/put/del/sync/cursor interface over an ordered key/value
//! store. Each database is opened with a comparison tag that fixes how its
//! keys are laid out; keys are encoded so that the store's byte-lexical
//! ordering realizes the tag's comparator:
//!
//! - `ByteLex`: raw caller bytes (storage attributes, collections)
//! - `DspaceAttr`: the fixed-width big-endian handle prefix, so records sort
//!   by handle
//! - `Keyval`: `handle bytes || key type byte || key bytes`, handle most
//!   significant
//!
//! Cursor reads support `First`, `Next`, and `SetRange` (position at the
//! first key at least as large as the given one), which is what the
//! resumable iteration paths need.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StorageError;
use crate::handle::Handle;
use crate::Result;

/// Key layout tag. Remembered by each database so that cursor operations
/// interpret keys consistently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareTag {
    ByteLex,
    DspaceAttr,
    Keyval,
}

/// Cursor positioning directive.
#[derive(Debug, Clone)]
pub enum CursorDirection {
    /// Position at the first record.
    First,
    /// Advance past the record the cursor currently stands on.
    Next,
    /// Position at the first record whose key is >= the given key.
    SetRange(Vec<u8>),
}

/// An ordered key/value database.
pub struct Db {
    tree: sled::Db,
    tag: CompareTag,
    path: PathBuf,
    sync_count: AtomicU64,
}

impl Db {
    /// Open a database at `path`. With `create` false, a missing database is
    /// `NotFound` rather than implicitly created.
    pub fn open(path: &Path, tag: CompareTag, create: bool) -> Result<Db> {
        if !create && !path.exists() {
            return Err(StorageError::NotFound);
        }
        let tree = sled::Config::new().path(path).open()?;
        Ok(Db {
            tree,
            tag,
            path: path.to_path_buf(),
            sync_count: AtomicU64::new(0),
        })
    }

    pub fn tag(&self) -> CompareTag {
        self.tag
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        match self.tree.get(key)? {
            Some(value) => Ok(value.to_vec()),
            None => Err(StorageError::NotFound),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    /// Insert under a no-overwrite policy; used only by initial record
    /// creation.
    pub fn put_unless_exists(&self, key: &[u8], value: &[u8]) -> Result<()> {
        match self
            .tree
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(StorageError::AlreadyExists),
        }
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        match self.tree.remove(key)? {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound),
        }
    }

    /// Force all committed writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.tree.flush()?;
        self.sync_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Number of syncs issued against this database. Watermark coalescing is
    /// validated against this counter.
    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::SeqCst)
    }

    /// Open a cursor. `write` permits `del` through the cursor.
    pub fn cursor(&self, write: bool) -> Cursor<'_> {
        Cursor {
            db: self,
            write,
            pos: None,
        }
    }
}

/// A database cursor. Positioning is explicit: the first `get` must use
/// `First` or `SetRange`, after which `Next` walks forward in key order.
pub struct Cursor<'a> {
    db: &'a Db,
    write: bool,
    pos: Option<Vec<u8>>,
}

impl<'a> Cursor<'a> {
    /// Read the record selected by `direction`. Returns `NotFound` when the
    /// cursor runs off the end of the database.
    pub fn get(&mut self, direction: CursorDirection) -> Result<(Vec<u8>, Vec<u8>)> {
        let found = match direction {
            CursorDirection::First => self.db.tree.first()?,
            CursorDirection::SetRange(key) => self.db.tree.range(key..).next().transpose()?,
            CursorDirection::Next => match &self.pos {
                Some(pos) => {
                    use std::ops::Bound;
                    self.db
                        .tree
                        .range::<&[u8], _>((Bound::Excluded(pos.as_slice()), Bound::Unbounded))
                        .next()
                        .transpose()?
                }
                // an unpositioned cursor starts at the first record
                None => self.db.tree.first()?,
            },
        };
        match found {
            Some((key, value)) => {
                self.pos = Some(key.to_vec());
                Ok((key.to_vec(), value.to_vec()))
            }
            None => Err(StorageError::NotFound),
        }
    }

    /// Delete the record the cursor currently stands on.
    pub fn del(&mut self) -> Result<()> {
        if !self.write {
            return Err(StorageError::Invalid);
        }
        match &self.pos {
            Some(key) => {
                self.db.tree.remove(key.as_slice())?;
                Ok(())
            }
            None => Err(StorageError::Invalid),
        }
    }
}

/// Encode a keyval record key: handle most significant, then the key type
/// byte, then the caller's key bytes.
pub fn keyval_key(handle: Handle, key_type: u8, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(17 + key.len());
    out.extend_from_slice(&handle.to_bytes());
    out.push(key_type);
    out.extend_from_slice(key);
    out
}

/// Split an encoded keyval key back into its components.
pub fn split_keyval_key(raw: &[u8]) -> Result<(Handle, u8, &[u8])> {
    if raw.len() < 17 {
        return Err(StorageError::CorruptState);
    }
    let mut handle_bytes = [0u8; 16];
    handle_bytes.copy_from_slice(&raw[..16]);
    Ok((Handle::from_bytes(handle_bytes), raw[16], &raw[17..]))
}
