//! Operations Core (C5, spec.md §4.3): the `FileSystem` implementation
//! itself. Every callback here is a direct translation of
//! `original_source/gridfs_fuse/operations.py`'s `Operations` class onto
//! `fuse_backend_rs::api::filesystem::FileSystem`, in the shape
//! `tvix_castore::fs::TvixStoreFs` uses to bridge the same sync trait
//! boundary onto an async backend (`tokio_handle.block_on(spawn(..))`).
//!
//! The Operations Core itself is stateless (spec.md §3's Ownership clause):
//! every call re-reads whatever it needs from `metadata`/`chunks`. The only
//! process-resident state is the handle table.

mod attr;
pub mod fuse;
pub mod handles;

#[cfg(test)]
mod tests;

use std::ffi::CStr;
use std::future::Future;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuse_backend_rs::abi::fuse_abi::stat64;
use fuse_backend_rs::api::filesystem::{
    Context, DirEntry, Entry, FileSystem, FsOptions, OpenOptions, SetattrValid,
};
use tracing::{debug, instrument, warn};

use crate::backend::{ChunkStore, Error as BackendError, MetadataStore};
use crate::inode::{child_entry, from_fuse_ino, id_filter, to_fuse_ino, EntryDoc, Inode};
use crate::path::full_path;

use self::attr::gen_attr;
use self::handles::{Handle, HandleTable};

const ENTRY_TIMEOUT: Duration = Duration::from_secs(10);

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// The FUSE-facing filesystem. Generic over the two backend traits so
/// `backend::memory::Memory{Metadata,Chunk}Store` and
/// `backend::mongo::Mongo{Metadata,Chunk}Store` can both drive it without a
/// vtable hop on every call — the only instance that needs to exist at once
/// is whichever backend the CLI selected.
pub struct GridFsFuse<M, C> {
    metadata: M,
    chunks: C,
    handles: HandleTable,
    tokio_handle: tokio::runtime::Handle,
}

impl<M, C> GridFsFuse<M, C>
where
    M: MetadataStore + Clone + 'static,
    C: ChunkStore + Clone + 'static,
{
    pub fn new(metadata: M, chunks: C, tokio_handle: tokio::runtime::Handle) -> Self {
        Self {
            metadata,
            chunks,
            handles: HandleTable::new(),
            tokio_handle,
        }
    }

    /// Bridges an async backend call into this trait's synchronous
    /// callback boundary, exactly as `TvixStoreFs` does for its blob- and
    /// directory-service calls: spawn onto the runtime, then block the
    /// calling (FUSE worker) thread until it completes.
    fn block_on<F>(&self, fut: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tokio_handle.block_on(self.tokio_handle.spawn(fut)).unwrap()
    }

    fn fetch_entry(&self, inode: Inode) -> io::Result<EntryDoc> {
        let metadata = self.metadata.clone();
        let doc = self
            .block_on(async move { metadata.find_one(id_filter(inode)).await })
            .map_err(io::Error::from)?;
        match doc {
            Some(doc) => EntryDoc::from_document(doc).map_err(io::Error::from),
            None => Err(errno(libc::ENOENT)),
        }
    }

    fn resolve_size(&self, entry: &EntryDoc) -> io::Result<u64> {
        if entry.is_dir() {
            return Ok(4096);
        }
        if let Some(position) = self.handles.write_position_for(entry.inode) {
            return Ok(position);
        }
        let chunks = self.chunks.clone();
        let inode = entry.inode;
        let length = self
            .block_on(async move { chunks.length(inode).await })
            .map_err(io::Error::from)?;
        Ok(length.unwrap_or(0))
    }

    fn entry_reply(&self, entry: &EntryDoc) -> io::Result<Entry> {
        let size = self.resolve_size(entry)?;
        Ok(Entry {
            inode: to_fuse_ino(entry.inode),
            attr: gen_attr(entry, size).into(),
            attr_timeout: ENTRY_TIMEOUT,
            entry_timeout: ENTRY_TIMEOUT,
            ..Default::default()
        })
    }

    fn lookup_child(&self, parent: &EntryDoc, name: &[u8]) -> Option<Inode> {
        parent
            .childs
            .iter()
            .find(|(n, _)| n.bytes == name)
            .map(|(_, inode)| *inode)
    }

    fn full_path_of(&self, entry: &EntryDoc) -> io::Result<Vec<u8>> {
        let metadata = self.metadata.clone();
        let entry = entry.clone();
        self.block_on(async move { full_path(&metadata, &entry).await })
            .map_err(io::Error::from)
    }

    /// insert-then-link: spec.md §4.3's create ordering. The unique index
    /// on `(parent_inode, filename)` is the atomicity boundary — only on
    /// its success does the parent's `childs` get updated.
    fn create_entry(
        &self,
        parent_inode: Inode,
        name: &[u8],
        mode: u32,
        ctx: &Context,
    ) -> io::Result<EntryDoc> {
        let metadata = self.metadata.clone();
        let name = name.to_vec();
        let uid = ctx.uid;
        let gid = ctx.gid;
        self.block_on(async move {
            let allocator = crate::inode::InodeAllocator::new(metadata.clone());
            let inode = allocator.alloc().await?;
            let entry = EntryDoc::new_child(inode, parent_inode, name.clone(), mode, uid, gid, now_ns());
            metadata.insert_one(entry.to_document()?).await?;
            metadata
                .update_one(
                    id_filter(parent_inode),
                    bson::doc! {"$addToSet": {"childs": child_entry(&name, inode)}},
                )
                .await?;
            Ok::<_, BackendError>(entry)
        })
        .map_err(|e| match e {
            BackendError::DuplicateKey => errno(libc::EEXIST),
            other => io::Error::from(other),
        })
    }

    /// unlink-then-delete: the reverse of `create_entry`'s ordering, per
    /// spec.md §4.3.
    fn delete_entry(&self, parent: &EntryDoc, name: &[u8], inode: Inode) -> io::Result<()> {
        let metadata = self.metadata.clone();
        let chunks = self.chunks.clone();
        let parent_inode = parent.inode;
        let name = name.to_vec();
        self.block_on(async move {
            metadata
                .update_one(
                    id_filter(parent_inode),
                    bson::doc! {"$pull": {"childs": child_entry(&name, inode)}},
                )
                .await?;
            metadata.delete_one(id_filter(inode)).await?;
            chunks.delete(inode).await?;
            Ok::<_, BackendError>(())
        })
        .map_err(io::Error::from)
    }
}

impl<M, C> FileSystem for GridFsFuse<M, C>
where
    M: MetadataStore + Clone + 'static,
    C: ChunkStore + Clone + 'static,
{
    type Inode = u64;
    type Handle = Handle;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        let parent_entry = self.fetch_entry(from_fuse_ino(parent))?;
        let inode = self
            .lookup_child(&parent_entry, name.to_bytes())
            .ok_or_else(|| errno(libc::ENOENT))?;
        let entry = self.fetch_entry(inode)?;
        self.entry_reply(&entry)
    }

    fn forget(&self, _ctx: &Context, _inode: Self::Inode, _count: u64) {
        // No inode-resident cache exists to invalidate — the operations
        // core is stateless (spec.md §3) — so there's nothing to do here.
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Option<Self::Handle>,
    ) -> io::Result<(stat64, Duration)> {
        // `ROOT_ID` and `ROOT_INODE` are both 1, so `from_fuse_ino` already
        // maps the kernel's root lookups onto the real root `EntryDoc`.
        let entry = self.fetch_entry(from_fuse_ino(inode))?;
        let size = self.resolve_size(&entry)?;
        Ok((gen_attr(&entry, size).into(), ENTRY_TIMEOUT))
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn setattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        attr: stat64,
        _handle: Option<Self::Handle>,
        valid: SetattrValid,
    ) -> io::Result<(stat64, Duration)> {
        if valid.contains(SetattrValid::SIZE) {
            return Err(errno(libc::EINVAL));
        }
        // fuse_backend_rs's SetattrValid has no RDEV bit — the kernel never
        // routes device-node attribute changes through setattr for a
        // filesystem that never advertises mknod support. Carried here only
        // because the original contract names it explicitly (spec.md
        // §4.3); in practice this branch is unreachable.
        if attr.rdev != 0 && !valid.contains(SetattrValid::MODE) {
            return Err(errno(libc::ENOSYS));
        }

        let mut entry = self.fetch_entry(from_fuse_ino(inode))?;

        if valid.contains(SetattrValid::MODE) {
            entry.mode = attr.mode;
        }
        if valid.contains(SetattrValid::UID) {
            entry.uid = attr.uid;
        }
        if valid.contains(SetattrValid::GID) {
            entry.gid = attr.gid;
        }
        if valid.contains(SetattrValid::ATIME) {
            entry.atime_ns = attr.atime * 1_000_000_000 + attr.atimensec as i64;
        }
        if valid.contains(SetattrValid::MTIME) {
            entry.mtime_ns = attr.mtime * 1_000_000_000 + attr.mtimensec as i64;
        }
        entry.ctime_ns = now_ns();

        let metadata = self.metadata.clone();
        let doc = entry.to_document().map_err(io::Error::from)?;
        let filter = id_filter(entry.inode);
        self.block_on(async move { metadata.update_one(filter, bson::doc! {"$set": doc}).await })
            .map_err(io::Error::from)?;

        let size = self.resolve_size(&entry)?;
        Ok((gen_attr(&entry, size).into(), ENTRY_TIMEOUT))
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let dir = self.fetch_entry(from_fuse_ino(inode))?;
        if !dir.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }

        let mut childs: Vec<(Vec<u8>, Inode)> = dir
            .childs
            .iter()
            .map(|(name, inode)| (name.bytes.clone(), *inode))
            .collect();
        childs.sort_by_key(|(_, inode)| *inode);

        for (name, child_inode) in childs {
            if child_inode as u64 <= offset {
                continue;
            }
            let child = match self.fetch_entry(child_inode) {
                Ok(c) => c,
                Err(_) => {
                    // Vanished mid-iteration — silently skipped per
                    // spec.md §4.3.
                    debug!(inode = child_inode, "readdir: child metadata vanished, skipping");
                    continue;
                }
            };
            let ty = if child.is_dir() { libc::S_IFDIR } else { libc::S_IFREG };
            let written = add_entry(DirEntry {
                ino: to_fuse_ino(child_inode),
                offset: child_inode as u64,
                type_: ty as u32,
                name: &name,
            })?;
            if written == 0 {
                break;
            }
        }

        Ok(())
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn mkdir(
        &self,
        ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        mode: u32,
        _umask: u32,
    ) -> io::Result<Entry> {
        let entry = self.create_entry(
            from_fuse_ino(parent),
            name.to_bytes(),
            libc::S_IFDIR | (mode & !libc::S_IFMT),
            ctx,
        )?;
        self.entry_reply(&entry)
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn create(
        &self,
        ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        mode: u32,
        _flags: u32,
        _umask: u32,
    ) -> io::Result<(Entry, Option<Self::Handle>, OpenOptions)> {
        let entry = self.create_entry(
            from_fuse_ino(parent),
            name.to_bytes(),
            libc::S_IFREG | (mode & !libc::S_IFMT),
            ctx,
        )?;

        let full_path = self.full_path_of(&entry)?;
        let chunks = self.chunks.clone();
        let inode = entry.inode;
        let writer = self
            .block_on(async move { chunks.new_file(inode, full_path).await })
            .map_err(io::Error::from)?;
        let handle = self.handles.insert_write(inode, writer);

        let reply = self.entry_reply(&entry)?;
        Ok((reply, Some(handle), OpenOptions::empty()))
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.flags = flags))]
    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        // Write (or read-write) opens are only legal through the handle
        // `create` hands back; a *second* open with a write flag always
        // fails, matching the chunked store's finalize-on-close semantics
        // (spec.md §4.3's append-once write discipline).
        if flags & (libc::O_WRONLY | libc::O_RDWR) as u32 != 0 {
            return Err(errno(libc::EACCES));
        }

        let inode = from_fuse_ino(inode);
        let chunks = self.chunks.clone();
        let reader = self
            .block_on(async move { chunks.open(inode).await })
            .map_err(io::Error::from)?;
        let reader = match reader {
            Some(r) => r,
            None => {
                warn!(inode, "open: chunked object missing");
                return Err(errno(libc::EIO));
            }
        };
        let handle = self.handles.insert_read(inode, reader);
        Ok((Some(handle), OpenOptions::empty()))
    }

    #[instrument(skip_all, fields(rq.handle = %handle, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        _ctx: &Context,
        _inode: Self::Inode,
        handle: Self::Handle,
        w: &mut dyn fuse_backend_rs::api::filesystem::ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let session = self.handles.get_read(handle).ok_or_else(|| errno(libc::EINVAL))?;
        let buf = self.block_on(async move {
            use tokio::io::{AsyncReadExt, AsyncSeekExt};
            let mut session = session.lock().await;
            session.reader.seek(io::SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0;
            loop {
                let n = session.reader.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
                if filled == buf.len() {
                    break;
                }
            }
            buf.truncate(filled);
            Ok::<_, io::Error>(buf)
        })
        .map_err(io::Error::from)?;

        w.write(&buf)
    }

    #[instrument(skip_all, fields(rq.handle = %handle, rq.offset = offset))]
    fn write(
        &self,
        _ctx: &Context,
        _inode: Self::Inode,
        handle: Self::Handle,
        r: &mut dyn fuse_backend_rs::api::filesystem::ZeroCopyReader,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<usize> {
        let session = self.handles.get_write(handle).ok_or_else(|| errno(libc::EINVAL))?;

        let mut buf = vec![0u8; size as usize];
        let n = r.read(&mut buf)?;
        buf.truncate(n);

        self.block_on(async move {
            use tokio::io::AsyncWriteExt;
            let mut session = session.lock().await;
            if offset != session.writer.position() {
                return Err(errno(libc::EINVAL));
            }
            session.writer.write_all(&buf).await?;
            Ok::<_, io::Error>(())
        })?;

        Ok(n)
    }

    #[instrument(skip_all, fields(rq.handle = %handle))]
    fn release(
        &self,
        _ctx: &Context,
        _inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        // `HandleTable::release` never fails observably (spec.md §4.3);
        // backend errors while finalizing a write are logged internally.
        // This borrows `self.handles`, so it's driven directly on the
        // runtime handle rather than through `Self::block_on`, which
        // requires `'static` futures.
        self.tokio_handle.block_on(self.handles.release(handle));
        Ok(())
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn unlink(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let parent_entry = self.fetch_entry(from_fuse_ino(parent))?;
        let inode = self
            .lookup_child(&parent_entry, name.to_bytes())
            .ok_or_else(|| errno(libc::ENOENT))?;
        let child = self.fetch_entry(inode)?;
        if child.is_dir() {
            return Err(errno(libc::EISDIR));
        }
        self.delete_entry(&parent_entry, name.to_bytes(), inode)
    }

    #[instrument(skip_all, fields(rq.parent = parent, rq.name = ?name))]
    fn rmdir(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        let parent_entry = self.fetch_entry(from_fuse_ino(parent))?;
        let inode = self
            .lookup_child(&parent_entry, name.to_bytes())
            .ok_or_else(|| errno(libc::ENOENT))?;
        let child = self.fetch_entry(inode)?;
        if !child.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }
        if !child.childs.is_empty() {
            return Err(errno(libc::ENOTEMPTY));
        }
        self.delete_entry(&parent_entry, name.to_bytes(), inode)
    }

    #[instrument(skip_all, fields(rq.oldparent = olddir, rq.oldname = ?oldname, rq.newparent = newdir, rq.newname = ?newname))]
    fn rename(
        &self,
        _ctx: &Context,
        olddir: Self::Inode,
        oldname: &CStr,
        newdir: Self::Inode,
        newname: &CStr,
        _flags: u32,
    ) -> io::Result<()> {
        let old_parent = self.fetch_entry(from_fuse_ino(olddir))?;
        let source_inode = self
            .lookup_child(&old_parent, oldname.to_bytes())
            .ok_or_else(|| errno(libc::ENOENT))?;
        let source = self.fetch_entry(source_inode)?;

        let new_parent = self.fetch_entry(from_fuse_ino(newdir))?;

        if let Some(target_inode) = self.lookup_child(&new_parent, newname.to_bytes()) {
            // Rename-over-existing-directory is forbidden outright: a
            // directory source renamed onto any existing target could
            // otherwise silently destroy an arbitrarily large subtree with
            // no `ENOTEMPTY` safety net (spec.md §9's Open Question,
            // resolved in DESIGN.md).
            if source.is_dir() {
                return Err(errno(libc::EEXIST));
            }
            let target = self.fetch_entry(target_inode)?;
            if target.is_dir() {
                return Err(errno(libc::EISDIR));
            }
            self.delete_entry(&new_parent, newname.to_bytes(), target_inode)?;
        }

        let metadata = self.metadata.clone();
        let chunks = self.chunks.clone();
        let old_parent_inode = old_parent.inode;
        let new_parent_inode = new_parent.inode;
        let old_name = oldname.to_bytes().to_vec();
        let new_name = newname.to_bytes().to_vec();
        let mut moved = source.clone();
        moved.parent_inode = new_parent_inode;
        moved.filename = crate::inode::binary(new_name.clone());

        let full_path = self.full_path_of(&moved)?;

        self.block_on(async move {
            metadata
                .update_one(
                    id_filter(source_inode),
                    bson::doc! {"$set": {
                        "parent_inode": new_parent_inode,
                        "filename": bson::Bson::Binary(crate::inode::binary(new_name.clone())),
                    }},
                )
                .await?;
            metadata
                .update_one(
                    id_filter(old_parent_inode),
                    bson::doc! {"$pull": {"childs": child_entry(&old_name, source_inode)}},
                )
                .await?;
            metadata
                .update_one(
                    id_filter(new_parent_inode),
                    bson::doc! {"$addToSet": {"childs": child_entry(&new_name, source_inode)}},
                )
                .await?;
            chunks.set_filename(source_inode, full_path).await?;
            Ok::<_, BackendError>(())
        })
        .map_err(io::Error::from)
    }
}
