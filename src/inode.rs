//! The metadata document (spec.md §3) and the inode allocator (C2).
//!
//! `Inode` is `i64`, not `u64`: BSON has no unsigned 64-bit integer type, so
//! a real driver-backed store can only ever round-trip a signed one. The
//! cast to `fuse_backend_rs`'s `u64` inode type happens at the two crossing
//! points, [Inode::to_fuse] and [Inode::from_fuse].

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use serde::{Deserialize, Serialize};

use crate::backend::{Error, MetadataStore, Result};

pub type Inode = i64;

/// The filesystem root. Its own parent, per spec.md §3.
pub const ROOT_INODE: Inode = 1;

pub const MODE_MASK_OTHER: u32 = libc::S_IRWXU | libc::S_IRGRP | libc::S_IXGRP | libc::S_IROTH | libc::S_IXOTH;

pub fn to_fuse_ino(inode: Inode) -> u64 {
    inode as u64
}

pub fn from_fuse_ino(ino: u64) -> Inode {
    ino as i64
}

/// Wraps an opaque byte string as BSON `Binary`, never `String` — POSIX
/// names are bytes, and the migration in bootstrap.rs exists specifically
/// because older documents got this wrong.
pub fn binary(bytes: impl Into<Vec<u8>>) -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes: bytes.into(),
    }
}

/// One metadata document: a directory entry or a regular file entry
/// (spec.md §3). `childs` is only meaningful for directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDoc {
    #[serde(rename = "_id")]
    pub inode: Inode,
    pub parent_inode: Inode,
    pub filename: Binary,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime_ns: i64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
    #[serde(default)]
    pub childs: Vec<(Binary, Inode)>,
}

impl EntryDoc {
    pub fn new_root(uid: u32, gid: u32, now_ns: i64) -> Self {
        EntryDoc {
            inode: ROOT_INODE,
            parent_inode: ROOT_INODE,
            filename: binary(b"/".to_vec()),
            mode: libc::S_IFDIR | MODE_MASK_OTHER,
            uid,
            gid,
            atime_ns: now_ns,
            mtime_ns: now_ns,
            ctime_ns: now_ns,
            childs: Vec::new(),
        }
    }

    pub fn new_child(
        inode: Inode,
        parent_inode: Inode,
        filename: Vec<u8>,
        mode: u32,
        uid: u32,
        gid: u32,
        now_ns: i64,
    ) -> Self {
        EntryDoc {
            inode,
            parent_inode,
            filename: binary(filename),
            mode,
            uid,
            gid,
            atime_ns: now_ns,
            mtime_ns: now_ns,
            ctime_ns: now_ns,
            childs: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn to_document(&self) -> Result<Document> {
        bson::to_document(self).map_err(|e| Error::Storage(e.to_string()))
    }

    pub fn from_document(doc: Document) -> Result<Self> {
        bson::from_document(doc).map_err(|e| Error::Storage(e.to_string()))
    }
}

pub fn id_filter(inode: Inode) -> Document {
    doc! {"_id": inode}
}

/// Allocates monotonically increasing inodes off the reserved `next_inode`
/// document (spec.md §3, §4.2), via an atomic `$inc`/find-and-update so
/// concurrent `create`/`mkdir` calls never race on the same value.
pub struct InodeAllocator<M> {
    metadata: M,
}

const NEXT_INODE_ID: &str = "next_inode";

impl<M: MetadataStore> InodeAllocator<M> {
    pub fn new(metadata: M) -> Self {
        Self { metadata }
    }

    /// Creates the `next_inode` document if absent. Idempotent: a
    /// duplicate-key failure (another mount, or a rerun) is swallowed.
    pub async fn ensure_document(&self) -> Result<()> {
        let doc = doc! {"_id": NEXT_INODE_ID, "value": ROOT_INODE + 1};
        match self.metadata.insert_one(doc).await {
            Ok(()) | Err(Error::DuplicateKey) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Atomically increments and returns the pre-image's `value`, which
    /// becomes the newly allocated inode.
    pub async fn alloc(&self) -> Result<Inode> {
        let filter = doc! {"_id": NEXT_INODE_ID};
        let update = doc! {"$inc": {"value": 1i64}};
        let pre_image = self
            .metadata
            .find_one_and_update(filter, update)
            .await?
            .ok_or_else(|| Error::Storage("next_inode document missing".to_string()))?;
        pre_image
            .get_i64("value")
            .map_err(|e| Error::Storage(e.to_string()))
    }
}

/// `(name, inode)` pair as stored in BSON, used when building `$addToSet`
/// / `$pull` update documents against a directory's `childs` array.
pub fn child_entry(name: &[u8], inode: Inode) -> Bson {
    Bson::Array(vec![Bson::Binary(binary(name.to_vec())), Bson::Int64(inode)])
}
