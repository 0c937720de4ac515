//! Keyval engine
//!
//! Extended-attribute style reads and writes plus directory-entry iteration.
//! Records are keyed by `(handle, key type, key bytes)` with the handle most
//! significant, so one cursor range walk visits everything a dataspace owns.
//!
//! The bulk sweep performed during dataspace removal is expressed through
//! the [`KeyvalVisitor`] capability: the dataspace engine supplies the
//! visitor, this module drives the cursor, and neither needs to know the
//! other's context.

use crate::db::{keyval_key, split_keyval_key, Cursor, CursorDirection, Db};
use crate::error::StorageError;
use crate::handle::Handle;
use crate::mgmt::Collection;
use crate::Result;

/// Key classes stored in the keyval database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    /// Extended attributes and internal metadata keys
    Attribute = b'a',
    /// Directory entries (name -> handle)
    DirEntry = b'd',
}

impl KeyType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Opaque iteration position for keyval iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvPosition {
    Start,
    End,
    /// Key bytes of the first not-yet-returned entry.
    At(Vec<u8>),
}

/// A returned keyval entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

pub(crate) fn read(coll: &Collection, handle: Handle, key_type: KeyType, key: &[u8]) -> Result<Vec<u8>> {
    coll.keyval_db.get(&keyval_key(handle, key_type.as_u8(), key))
}

pub(crate) fn write(
    coll: &Collection,
    handle: Handle,
    key_type: KeyType,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    coll.keyval_db.put(&keyval_key(handle, key_type.as_u8(), key), value)
}

pub(crate) fn remove_key(coll: &Collection, handle: Handle, key_type: KeyType, key: &[u8]) -> Result<()> {
    coll.keyval_db.del(&keyval_key(handle, key_type.as_u8(), key))
}

pub(crate) fn flush(coll: &Collection) -> Result<()> {
    coll.keyval_db.sync()
}

/// Ordered iteration over one dataspace's entries of one key class.
///
/// Returns up to `count` entries and the position to resume from, or
/// `KvPosition::End` once the class is exhausted.
pub(crate) fn iterate(
    coll: &Collection,
    handle: Handle,
    key_type: KeyType,
    position: KvPosition,
    count: usize,
) -> Result<(Vec<KvEntry>, KvPosition)> {
    let mut entries = Vec::new();
    if count == 0 {
        return Ok((entries, position));
    }
    let start_key = match position {
        KvPosition::End => return Ok((entries, KvPosition::End)),
        KvPosition::Start => keyval_key(handle, key_type.as_u8(), b""),
        KvPosition::At(key) => keyval_key(handle, key_type.as_u8(), &key),
    };

    let mut cursor = coll.keyval_db.cursor(false);
    let mut direction = CursorDirection::SetRange(start_key);
    while entries.len() < count {
        match cursor.get(direction) {
            Ok((raw_key, value)) => {
                let (entry_handle, entry_type, key) = split_keyval_key(&raw_key)?;
                if entry_handle != handle || entry_type != key_type.as_u8() {
                    return Ok((entries, KvPosition::End));
                }
                entries.push(KvEntry {
                    key: key.to_vec(),
                    value,
                });
            }
            Err(StorageError::NotFound) => return Ok((entries, KvPosition::End)),
            Err(err) => return Err(err),
        }
        direction = CursorDirection::Next;
    }

    match cursor.get(CursorDirection::Next) {
        Ok((raw_key, _value)) => {
            let (entry_handle, entry_type, key) = split_keyval_key(&raw_key)?;
            if entry_handle != handle || entry_type != key_type.as_u8() {
                Ok((entries, KvPosition::End))
            } else {
                Ok((entries, KvPosition::At(key.to_vec())))
            }
        }
        Err(StorageError::NotFound) => Ok((entries, KvPosition::End)),
        Err(err) => Err(err),
    }
}

/// Key-only variant of [`iterate`].
pub(crate) fn iterate_keys(
    coll: &Collection,
    handle: Handle,
    key_type: KeyType,
    position: KvPosition,
    count: usize,
) -> Result<(Vec<Vec<u8>>, KvPosition)> {
    let (entries, next) = iterate(coll, handle, key_type, position, count)?;
    Ok((entries.into_iter().map(|e| e.key).collect(), next))
}

/// Capability consumed by [`iterate_visit`]. The visitor may delete the
/// current record through the cursor it is handed.
pub trait KeyvalVisitor {
    fn visit(&mut self, cursor: &mut Cursor<'_>, key_type: u8, key: &[u8], value: &[u8]) -> Result<()>;
}

/// Walk every entry belonging to `handle`, across all key classes, showing
/// each to the visitor. Returns the number of entries visited.
pub(crate) fn iterate_visit(
    db: &Db,
    handle: Handle,
    visitor: &mut dyn KeyvalVisitor,
) -> Result<usize> {
    let mut cursor = db.cursor(true);
    let mut direction = CursorDirection::SetRange(handle.to_bytes().to_vec());
    let mut visited = 0;
    loop {
        match cursor.get(direction) {
            Ok((raw_key, value)) => {
                let (entry_handle, key_type, key) = split_keyval_key(&raw_key)?;
                if entry_handle != handle {
                    return Ok(visited);
                }
                visitor.visit(&mut cursor, key_type, key, &value)?;
                visited += 1;
            }
            Err(StorageError::NotFound) => return Ok(visited),
            Err(err) => return Err(err),
        }
        direction = CursorDirection::Next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CompareTag;
    use tempfile::TempDir;

    fn keyval_db(dir: &TempDir) -> Db {
        Db::open(&dir.path().join("keyval.db"), CompareTag::Keyval, true).unwrap()
    }

    #[test]
    fn test_visit_only_matching_handle() {
        let dir = TempDir::new().unwrap();
        let db = keyval_db(&dir);

        for i in 0..4u8 {
            db.put(&keyval_key(Handle(1), b'a', &[i]), &[i]).unwrap();
        }
        db.put(&keyval_key(Handle(2), b'a', b"other"), b"x").unwrap();

        struct Counter(usize);
        impl KeyvalVisitor for Counter {
            fn visit(&mut self, _c: &mut Cursor<'_>, _t: u8, _k: &[u8], _v: &[u8]) -> Result<()> {
                self.0 += 1;
                Ok(())
            }
        }
        let mut counter = Counter(0);
        let visited = iterate_visit(&db, Handle(1), &mut counter).unwrap();
        assert_eq!(visited, 4);
        assert_eq!(counter.0, 4);
    }

    #[test]
    fn test_visit_can_delete_while_iterating() {
        let dir = TempDir::new().unwrap();
        let db = keyval_db(&dir);

        for i in 0..8u8 {
            db.put(&keyval_key(Handle(5), b'd', &[i]), &[i]).unwrap();
        }
        db.put(&keyval_key(Handle(9), b'd', b"keep"), b"y").unwrap();

        struct Sweep;
        impl KeyvalVisitor for Sweep {
            fn visit(&mut self, cursor: &mut Cursor<'_>, _t: u8, _k: &[u8], _v: &[u8]) -> Result<()> {
                cursor.del()
            }
        }
        assert_eq!(iterate_visit(&db, Handle(5), &mut Sweep).unwrap(), 8);

        // the other handle's entry survived
        assert!(db.get(&keyval_key(Handle(9), b'd', b"keep")).is_ok());
        // handle 5 is empty now
        assert_eq!(iterate_visit(&db, Handle(5), &mut Sweep).unwrap(), 0);
    }
}
