//! Builds [Attr] (and, via `Into`, the `stat64` FUSE wants) from an
//! [EntryDoc] plus a resolved size. Mirrors spec.md §4.3's
//! `getattr`/`_gen_attr` contract: directories report a constant 4096,
//! regular files report either the active writer's position or the chunked
//! object's length (see [crate::fs::GridFsFuse::resolve_size]).
//!
//! There's no static placeholder attr for the root inode, unlike
//! tvix-castore's `ROOT_FILE_ATTR` — the root is a real, mutable `EntryDoc`
//! document here (spec.md §3), so its attrs always come from [gen_attr]
//! like any other inode.

use fuse_backend_rs::abi::fuse_abi::Attr;

use crate::inode::{to_fuse_ino, EntryDoc};

const BLOCK_SIZE: u64 = 512;

pub fn gen_attr(entry: &EntryDoc, size: u64) -> Attr {
    Attr {
        ino: to_fuse_ino(entry.inode),
        size,
        blksize: BLOCK_SIZE as u32,
        blocks: size / BLOCK_SIZE + 1,
        mode: entry.mode,
        atime: (entry.atime_ns / 1_000_000_000) as _,
        mtime: (entry.mtime_ns / 1_000_000_000) as _,
        ctime: (entry.ctime_ns / 1_000_000_000) as _,
        atimensec: (entry.atime_ns % 1_000_000_000) as _,
        mtimensec: (entry.mtime_ns % 1_000_000_000) as _,
        ctimensec: (entry.ctime_ns % 1_000_000_000) as _,
        nlink: 1,
        uid: entry.uid,
        gid: entry.gid,
        rdev: 0,
        flags: 0,
        #[cfg(target_os = "macos")]
        crtime: 0,
        #[cfg(target_os = "macos")]
        crtimensec: 0,
        #[cfg(target_os = "macos")]
        padding: 0,
    }
}
