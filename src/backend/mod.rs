//! The narrow interface this crate needs from a document database plus a
//! chunked object store living inside it. Everything above this module talks
//! to these two traits only — never to `mongodb` or `bson` directly outside
//! of [mongo] and the inode/bootstrap code that builds queries.

pub mod memory;
pub mod mongo;
mod naive_seeker;

use std::io;

use async_trait::async_trait;
use bson::Document;

/// Errors a backend can surface. Deliberately narrow: everything that isn't
/// a duplicate key is a generic storage failure, matching the distinction
/// the operations core actually needs to make (see `errors.rs`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("duplicate key")]
    DuplicateKey,
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::DuplicateKey => io::Error::from_raw_os_error(libc::EEXIST),
            Error::Storage(msg) => io::Error::new(io::ErrorKind::Other, msg),
        }
    }
}

/// CRUD plus atomic find-and-update over the metadata collection, and
/// creation of the one index this system relies on for correctness.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn find_one(&self, filter: Document) -> Result<Option<Document>>;

    /// Fails with [Error::DuplicateKey] if `doc` collides with the unique
    /// index on `(parent_inode, filename)`, or with whatever other unique
    /// constraint bootstrap has established.
    async fn insert_one(&self, doc: Document) -> Result<()>;

    async fn update_one(&self, filter: Document, update: Document) -> Result<()>;

    async fn delete_one(&self, filter: Document) -> Result<()>;

    /// Atomically applies `update` to the document matched by `filter` and
    /// returns the document as it looked *before* the update (the
    /// pre-image). Used for inode allocation, where the pre-image's
    /// `value` is the inode handed back to the caller.
    async fn find_one_and_update(&self, filter: Document, update: Document) -> Result<Option<Document>>;

    async fn create_unique_index(&self, fields: &[&str]) -> Result<()>;
}

/// The chunked object store: one record per regular-file inode, addressed
/// by that inode's id.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Begins a new chunked object for `id`, stamping `filename` as its
    /// full visible path. The returned writer must be `close()`d to make
    /// the object visible and its length queryable.
    async fn new_file(&self, id: i64, filename: Vec<u8>) -> Result<Box<dyn ChunkWriter>>;

    /// Opens an existing chunked object for reading. `None` if no object
    /// exists for `id` (this is not an error — callers decide what that
    /// means for their operation).
    async fn open(&self, id: i64) -> Result<Option<Box<dyn ChunkReader>>>;

    /// Rewrites the `filename` field of an already-closed chunked object,
    /// used by `rename` to keep it in sync with the visible path.
    async fn set_filename(&self, id: i64, filename: Vec<u8>) -> Result<()>;

    /// Removes the chunked object for `id`, if any. Deleting a
    /// non-existent object is not an error.
    async fn delete(&self, id: i64) -> Result<()>;

    /// The byte length of the chunked object, or `None` if it doesn't
    /// exist (yet, or ever).
    async fn length(&self, id: i64) -> Result<Option<u64>>;
}

/// A [tokio::io::AsyncWrite] that must be `close()`d to finalize the
/// object and learn how many bytes were written so far via `position()`.
#[async_trait]
pub trait ChunkWriter: tokio::io::AsyncWrite + Send + Unpin {
    async fn close(&mut self) -> Result<()>;

    /// Number of bytes written so far — also the only legal offset for
    /// the next `write()`, per the append-once discipline.
    fn position(&self) -> u64;
}

/// A [tokio::io::AsyncRead] that also allows seeking, for serving `read`
/// at arbitrary offsets within an already-sealed object.
pub trait ChunkReader: tokio::io::AsyncRead + tokio::io::AsyncSeek + Send + Unpin {}

impl<T> ChunkReader for T where T: tokio::io::AsyncRead + tokio::io::AsyncSeek + Send + Unpin {}

/// Forwarding impl so bootstrap and the inode allocator can be handed a
/// plain `&M` instead of requiring the caller to clone an owned store just
/// to satisfy the trait bound.
#[async_trait]
impl<T: MetadataStore + ?Sized> MetadataStore for &T {
    async fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        (**self).find_one(filter).await
    }

    async fn insert_one(&self, doc: Document) -> Result<()> {
        (**self).insert_one(doc).await
    }

    async fn update_one(&self, filter: Document, update: Document) -> Result<()> {
        (**self).update_one(filter, update).await
    }

    async fn delete_one(&self, filter: Document) -> Result<()> {
        (**self).delete_one(filter).await
    }

    async fn find_one_and_update(&self, filter: Document, update: Document) -> Result<Option<Document>> {
        (**self).find_one_and_update(filter, update).await
    }

    async fn create_unique_index(&self, fields: &[&str]) -> Result<()> {
        (**self).create_unique_index(fields).await
    }
}
