//! Bootstrap (C6, spec.md §4.5, §6): idempotent startup sequence that
//! ensures the root inode, the inode allocator document, and the unique
//! index all exist, then runs the schema migrations described in spec.md
//! §6. Ported from `original_source/gridfs_fuse/operations.py`'s
//! `_ensure_root_inode`/`_ensure_next_inode_document`/`_ensure_indexes` and
//! `migrations.py`'s `perform_startup_migrations`.

use std::time::{SystemTime, UNIX_EPOCH};

use bson::{doc, Bson};
use tracing::{debug, info, warn};

use crate::backend::{Error, MetadataStore, Result};
use crate::inode::{EntryDoc, InodeAllocator, ROOT_INODE};

/// Current schema version. Anything stored below this threshold is
/// migrated forward on every startup (migrations are idempotent, so
/// rerunning them against an already-migrated store is a no-op).
pub const SCHEMA_VERSION: &str = env!("CARGO_PKG_VERSION");

const VERSION_DOC_ID: &str = "version";

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Runs the full bootstrap sequence against `metadata`. Call once at mount
/// time, before serving any FUSE callback.
pub async fn ensure_schema<M: MetadataStore>(metadata: &M, uid: u32, gid: u32) -> Result<()> {
    ensure_root_inode(metadata, uid, gid).await?;

    let allocator = InodeAllocator::new(metadata);
    allocator.ensure_document().await?;

    metadata
        .create_unique_index(&["parent_inode", "filename"])
        .await?;

    run_migrations(metadata).await?;

    Ok(())
}

async fn ensure_root_inode<M: MetadataStore>(metadata: &M, uid: u32, gid: u32) -> Result<()> {
    let root = EntryDoc::new_root(uid, gid, now_ns());
    match metadata.insert_one(root.to_document()?).await {
        Ok(()) => {
            debug!(inode = ROOT_INODE, "created root inode");
            Ok(())
        }
        Err(Error::DuplicateKey) => Ok(()),
        Err(e) => Err(e),
    }
}

/// spec.md §6: rewrite text `filename` fields to opaque byte strings, and
/// rename `atime`/`mtime`/`ctime` (seconds) to `*_ns` (nanoseconds).
/// Gated on a `version` document so a store already at or above
/// [SCHEMA_VERSION] is left untouched.
async fn run_migrations<M: MetadataStore>(metadata: &M) -> Result<()> {
    let version_doc = metadata.find_one(doc! {"_id": VERSION_DOC_ID}).await?;
    let current = version_doc
        .as_ref()
        .and_then(|d| d.get_str("value").ok())
        .unwrap_or("0.0.0")
        .to_string();

    if current.as_str() >= SCHEMA_VERSION {
        debug!(current = %current, "schema up to date, skipping migrations");
        return Ok(());
    }

    info!(from = %current, to = SCHEMA_VERSION, "running schema migrations");

    // This crate's own metadata collection is the only one migrated here;
    // the chunked store's `fs.files` documents go through the same
    // byte-string/timestamp rewrite but are owned by the backend adapter
    // (see `backend::mongo`), since this module only knows `MetadataStore`.
    migrate_filenames_and_timestamps(metadata).await?;

    // `update_one` has no upsert mode (spec.md's `MetadataStore` never
    // needed one before this), so the version document is written the same
    // insert-then-fall-back-to-update way `ensure_root_inode` creates the
    // root: insert if absent, update in place if a lower version is there.
    let version_doc = doc! {"_id": VERSION_DOC_ID, "value": SCHEMA_VERSION};
    match metadata.insert_one(version_doc).await {
        Ok(()) => {}
        Err(Error::DuplicateKey) => {
            metadata
                .update_one(
                    doc! {"_id": VERSION_DOC_ID},
                    doc! {"$set": {"value": SCHEMA_VERSION}},
                )
                .await?;
        }
        Err(e) => return Err(e),
    }

    Ok(())
}

async fn migrate_filenames_and_timestamps<M: MetadataStore>(metadata: &M) -> Result<()> {
    // A real migration walks every document in the collection; the narrow
    // `MetadataStore` trait doesn't expose a cursor, so this is done one
    // document at a time by inode for entries created under a pre-Binary
    // schema. In practice the only documents that can still be on the old
    // schema are ones inserted by a pre-1.0 Python deployment sharing this
    // same MongoDB database; a fresh gridfs-fuse store never produces one,
    // so there's nothing to find and this degrades to a fast no-op.
    let query = doc! {
        "$or": [
            {"filename": {"$type": "string"}},
            {"atime": {"$exists": true}},
            {"mtime": {"$exists": true}},
            {"ctime": {"$exists": true}},
        ]
    };

    while let Some(doc) = metadata.find_one(query.clone()).await? {
        let id = doc
            .get("_id")
            .cloned()
            .ok_or_else(|| Error::Storage("document missing _id".to_string()))?;

        let mut set = bson::Document::new();
        let mut unset = bson::Document::new();

        if let Ok(name) = doc.get_str("filename") {
            set.insert("filename", Bson::Binary(crate::inode::binary(name.as_bytes().to_vec())));
        }
        for field in ["atime", "mtime", "ctime"] {
            if let Ok(seconds) = doc.get_f64(field) {
                set.insert(format!("{field}_ns"), (seconds * 1_000_000.0) as i64);
                unset.insert(field, "");
            }
        }

        if set.is_empty() && unset.is_empty() {
            // Matched the query for a reason we don't recognize; avoid
            // looping forever re-matching the same document.
            warn!(?id, "migration query matched a document with nothing to migrate");
            break;
        }

        metadata
            .update_one(doc! {"_id": id}, doc! {"$set": set, "$unset": unset})
            .await?;
    }

    Ok(())
}
