//! Storage region and collection lifecycle
//!
//! On-disk layout, relative to the region's data path `D` and metadata
//! path `M`:
//!
//! ```text
//! M/storage_attributes.db
//! M/collections.db
//! M/<08x:coll_id>/collection_attributes.db
//! M/<08x:coll_id>/dataspace_attributes.db
//! M/<08x:coll_id>/keyval.db
//! D/<08x:coll_id>/bstreams/<08x:bucket>/<decimal:handle>.bstream
//! D/<08x:coll_id>/stranded-bstreams/<decimal:handle>
//! ```
//!
//! where the bucket is the low-order bits of the handle. The collection
//! attributes database stores a dotted-triple format version under a
//! distinguished key; a collection created under a different major or minor
//! refuses to open, while patch-level differences are accepted.
//!
//! The stranded-bstreams directory collects files whose dataspace records
//! disappeared. Collection lookup scavenges it, and a duplicate-handle
//! collision during create moves the resident file there.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::{CollectionOptions, FsStats};
use crate::db::{CompareTag, Cursor, CursorDirection, Db};
use crate::error::StorageError;
use crate::handle::Handle;
use crate::{CollId, Result, STORAGE_FORMAT_VERSION};

/// Fixed number of bstream bucket directories per collection.
pub const BSTREAM_NUM_BUCKETS: u32 = 1024;

const VERSION_KEY: &[u8] = b"storage-format-version";
const STORAGE_ATTRIBUTES_KEY: &[u8] = b"storage-attributes";

fn storage_attrib_db_path(meta_path: &Path) -> PathBuf {
    meta_path.join("storage_attributes.db")
}

fn collections_db_path(meta_path: &Path) -> PathBuf {
    meta_path.join("collections.db")
}

fn coll_dir(root: &Path, coll_id: CollId) -> PathBuf {
    root.join(format!("{:08x}", coll_id))
}

fn coll_attrib_db_path(meta_path: &Path, coll_id: CollId) -> PathBuf {
    coll_dir(meta_path, coll_id).join("collection_attributes.db")
}

fn ds_attrib_db_path(meta_path: &Path, coll_id: CollId) -> PathBuf {
    coll_dir(meta_path, coll_id).join("dataspace_attributes.db")
}

fn keyval_db_path(meta_path: &Path, coll_id: CollId) -> PathBuf {
    coll_dir(meta_path, coll_id).join("keyval.db")
}

fn bstream_dir(data_path: &Path, coll_id: CollId) -> PathBuf {
    coll_dir(data_path, coll_id).join("bstreams")
}

fn bucket_dir(data_path: &Path, coll_id: CollId, bucket: u32) -> PathBuf {
    bstream_dir(data_path, coll_id).join(format!("{:08x}", bucket))
}

fn stranded_dir(data_path: &Path, coll_id: CollId) -> PathBuf {
    coll_dir(data_path, coll_id).join("stranded-bstreams")
}

/// Record stored in the storage attributes database at region creation.
#[derive(Debug, Serialize, Deserialize)]
struct StorageAttributes {
    version: String,
    created_at: i64,
}

/// Record stored per collection in the collections database.
#[derive(Debug, Serialize, Deserialize)]
struct CollectionDbEntry {
    coll_id: CollId,
}

/// An opened storage region.
pub struct Storage {
    pub data_path: PathBuf,
    pub meta_path: PathBuf,
    pub sto_attr_db: Db,
    pub coll_db: Db,
}

impl Storage {
    /// Create the on-disk footprint of a new storage region. Fails with
    /// `AlreadyExists` if one is already present at the metadata path.
    pub fn create(data_path: &Path, meta_path: &Path) -> Result<()> {
        if storage_attrib_db_path(meta_path).exists() {
            return Err(StorageError::AlreadyExists);
        }
        fs::create_dir_all(data_path)?;
        fs::create_dir_all(meta_path)?;

        let sto_attr_db = Db::open(&storage_attrib_db_path(meta_path), CompareTag::ByteLex, true)?;
        let attrs = StorageAttributes {
            version: STORAGE_FORMAT_VERSION.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        sto_attr_db.put(STORAGE_ATTRIBUTES_KEY, &bincode::serialize(&attrs)?)?;
        sto_attr_db.sync()?;

        let coll_db = Db::open(&collections_db_path(meta_path), CompareTag::ByteLex, true)?;
        coll_db.sync()?;
        log::info!(
            "created storage region: data={} meta={}",
            data_path.display(),
            meta_path.display()
        );
        Ok(())
    }

    /// Remove the entire on-disk footprint of a storage region.
    pub fn remove(data_path: &Path, meta_path: &Path) -> Result<()> {
        if !storage_attrib_db_path(meta_path).exists() {
            return Err(StorageError::NotFound);
        }
        fs::remove_dir_all(meta_path)?;
        fs::remove_dir_all(data_path)?;
        Ok(())
    }

    /// Open an existing storage region; at most once per process.
    pub fn open(data_path: &Path, meta_path: &Path) -> Result<Storage> {
        let sto_attr_db = Db::open(&storage_attrib_db_path(meta_path), CompareTag::ByteLex, false)?;
        let coll_db = Db::open(&collections_db_path(meta_path), CompareTag::ByteLex, false)?;
        Ok(Storage {
            data_path: data_path.to_path_buf(),
            meta_path: meta_path.to_path_buf(),
            sto_attr_db,
            coll_db,
        })
    }

    /// Create a collection and its directory tree, databases, and version
    /// record.
    pub fn collection_create(&self, name: &str, coll_id: CollId) -> Result<()> {
        if self.coll_db.get(name.as_bytes()).is_ok() {
            return Err(StorageError::AlreadyExists);
        }

        fs::create_dir_all(coll_dir(&self.meta_path, coll_id))?;
        fs::create_dir_all(coll_dir(&self.data_path, coll_id))?;

        let coll_attr_db = Db::open(&coll_attrib_db_path(&self.meta_path, coll_id), CompareTag::ByteLex, true)?;
        coll_attr_db.put(VERSION_KEY, STORAGE_FORMAT_VERSION.as_bytes())?;
        coll_attr_db.sync()?;

        let ds_db = Db::open(&ds_attrib_db_path(&self.meta_path, coll_id), CompareTag::DspaceAttr, true)?;
        ds_db.sync()?;
        let keyval_db = Db::open(&keyval_db_path(&self.meta_path, coll_id), CompareTag::Keyval, true)?;
        keyval_db.sync()?;

        fs::create_dir_all(bstream_dir(&self.data_path, coll_id))?;
        (0..BSTREAM_NUM_BUCKETS)
            .into_par_iter()
            .try_for_each(|bucket| fs::create_dir_all(bucket_dir(&self.data_path, coll_id, bucket)))?;
        fs::create_dir_all(stranded_dir(&self.data_path, coll_id))?;

        let entry = CollectionDbEntry { coll_id };
        self.coll_db.put(name.as_bytes(), &bincode::serialize(&entry)?)?;
        self.coll_db.sync()?;
        log::info!("created collection {:?} with id {:08x}", name, coll_id);
        Ok(())
    }

    /// Open a collection by name. The format version gate runs here.
    pub fn collection_open(&self, name: &str) -> Result<Collection> {
        let raw = self.coll_db.get(name.as_bytes())?;
        let entry: CollectionDbEntry = bincode::deserialize(&raw)?;
        let coll_id = entry.coll_id;

        let coll_attr_db = Db::open(&coll_attrib_db_path(&self.meta_path, coll_id), CompareTag::ByteLex, false)?;
        let stored_version = String::from_utf8(coll_attr_db.get(VERSION_KEY)?)
            .map_err(|_| StorageError::CorruptState)?;
        check_version(&stored_version)?;

        let ds_db = Db::open(&ds_attrib_db_path(&self.meta_path, coll_id), CompareTag::DspaceAttr, false)?;
        let keyval_db = Db::open(&keyval_db_path(&self.meta_path, coll_id), CompareTag::Keyval, false)?;

        log::debug!(
            "collection lookup: {:?} id {:08x} version {}",
            name,
            coll_id,
            stored_version
        );
        Ok(Collection {
            coll_id,
            name: name.to_string(),
            coll_attr_db,
            ds_db,
            keyval_db,
            data_path: self.data_path.clone(),
            options: Mutex::new(CollectionOptions::default()),
            size_lock: Mutex::new(()),
        })
    }

    /// Destroy a collection's on-disk footprint and deregister it from the
    /// collections database.
    pub fn collection_destroy(&self, name: &str) -> Result<()> {
        let raw = self.coll_db.get(name.as_bytes())?;
        let entry: CollectionDbEntry = bincode::deserialize(&raw)?;
        fs::remove_dir_all(coll_dir(&self.meta_path, entry.coll_id))?;
        fs::remove_dir_all(coll_dir(&self.data_path, entry.coll_id))?;
        self.coll_db.del(name.as_bytes())?;
        self.coll_db.sync()?;
        Ok(())
    }

    /// Enumerate (name, id) for every collection in the region.
    pub fn collection_iterate(&self) -> Result<Vec<(String, CollId)>> {
        let mut out = Vec::new();
        let mut cursor: Cursor<'_> = self.coll_db.cursor(false);
        let mut direction = CursorDirection::First;
        loop {
            match cursor.get(direction) {
                Ok((key, value)) => {
                    let name = String::from_utf8(key).map_err(|_| StorageError::CorruptState)?;
                    let entry: CollectionDbEntry = bincode::deserialize(&value)?;
                    out.push((name, entry.coll_id));
                }
                Err(StorageError::NotFound) => return Ok(out),
                Err(err) => return Err(err),
            }
            direction = CursorDirection::Next;
        }
    }
}

/// A registered (looked-up) collection.
pub struct Collection {
    pub coll_id: CollId,
    pub name: String,
    pub coll_attr_db: Db,
    pub ds_db: Db,
    pub keyval_db: Db,
    data_path: PathBuf,
    pub options: Mutex<CollectionOptions>,
    /// Serializes the read-modify-write of the datafile size attribute.
    pub size_lock: Mutex<()>,
}

impl Collection {
    pub fn bstream_path(&self, handle: Handle) -> PathBuf {
        let bucket = handle.bucket(BSTREAM_NUM_BUCKETS);
        bucket_dir(&self.data_path, self.coll_id, bucket).join(format!("{}.bstream", handle.0))
    }

    pub fn stranded_path(&self, handle: Handle) -> PathBuf {
        stranded_dir(&self.data_path, self.coll_id).join(format!("{}", handle.0))
    }

    pub fn stranded_dir(&self) -> PathBuf {
        stranded_dir(&self.data_path, self.coll_id)
    }

    pub fn data_dir(&self) -> PathBuf {
        coll_dir(&self.data_path, self.coll_id)
    }

    /// Delete every file in the stranded-bstreams directory. Runs at
    /// lookup; the directory holds leftovers of interrupted removals.
    pub fn scavenge_stranded(&self) -> Result<usize> {
        let dir = self.stranded_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            return Ok(0);
        }
        let entries: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        let removed = entries.len();
        entries
            .into_par_iter()
            .try_for_each(|path| match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err),
            })?;
        if removed > 0 {
            log::info!(
                "collection {:08x}: scavenged {} stranded bstream(s)",
                self.coll_id,
                removed
            );
        }
        Ok(removed)
    }
}

/// Major and minor must match this implementation; patch is ignored.
fn check_version(stored: &str) -> Result<()> {
    let parse = |s: &str| -> Option<(u32, u32)> {
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let _patch: u32 = parts.next()?.parse().ok()?;
        Some((major, minor))
    };
    let stored_mm = parse(stored).ok_or(StorageError::CorruptState)?;
    let ours = parse(STORAGE_FORMAT_VERSION).ok_or(StorageError::CorruptState)?;
    if stored_mm != ours {
        log::error!(
            "storage format version mismatch: collection has {}, this build understands {}",
            stored,
            STORAGE_FORMAT_VERSION
        );
        return Err(StorageError::IncompatibleVersion);
    }
    Ok(())
}

/// Filesystem statistics for the directory holding a collection's data.
pub fn fs_stats(coll: &Collection) -> Result<FsStats> {
    let path = coll.data_dir();
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| StorageError::Invalid)?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return Err(StorageError::last_os_error());
    }
    Ok(FsStats {
        fs_id: coll.coll_id,
        bytes_total: stats.f_frsize as u64 * stats.f_blocks as u64,
        bytes_available: stats.f_frsize as u64 * stats.f_bavail as u64,
    })
}
