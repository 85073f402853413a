//! Exercises [GridFsFuse] directly through the [FileSystem] trait, against
//! the in-memory backend, the way tvix-castore's own `fs::tests` module
//! exercises `TvixStoreFs` — except a real kernel FUSE mount needs
//! `/dev/fuse`, which isn't guaranteed to be available wherever this crate
//! is built, so these call the trait methods straight from a plain thread
//! backed by a real `tokio::runtime::Runtime`, exactly the way a FUSE worker
//! thread would.

use std::ffi::CString;

use fuse_backend_rs::api::filesystem::{
    Context, FileSystem, SetattrValid, ROOT_ID,
};

use crate::backend::memory::{MemoryChunkStore, MemoryMetadataStore};
use crate::bootstrap::ensure_schema;

use super::GridFsFuse;

type Fs = GridFsFuse<MemoryMetadataStore, MemoryChunkStore>;

fn ctx() -> Context {
    Context {
        uid: 1000,
        gid: 1000,
        ..Default::default()
    }
}

fn name(s: &str) -> CString {
    CString::new(s).unwrap()
}

fn new_fs() -> (Fs, tokio::runtime::Runtime) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let metadata = MemoryMetadataStore::default();
    let chunks = MemoryChunkStore::default();
    rt.block_on(ensure_schema(&metadata, 1000, 1000)).unwrap();
    let fs = GridFsFuse::new(metadata, chunks, rt.handle().clone());
    (fs, rt)
}

#[test]
fn root_getattr() {
    let (fs, _rt) = new_fs();
    let (attr, _timeout) = fs.getattr(&ctx(), ROOT_ID, None).unwrap();
    assert_eq!(attr.st_ino, ROOT_ID);
    assert!(attr.st_mode & libc::S_IFDIR != 0);
}

#[test]
fn create_write_read_roundtrip() {
    let (fs, _rt) = new_fs();

    let (entry, handle, _opts) = fs
        .create(&ctx(), ROOT_ID, &name("hello.txt"), 0o644, 0, 0)
        .expect("create must succeed");
    let handle = handle.expect("create must hand back a write handle");

    let data = b"hello, gridfs";
    let mut reader = VecReader(std::io::Cursor::new(data.to_vec()));
    let written = fs
        .write(&ctx(), entry.inode, handle, &mut reader, data.len() as u32, 0, None, false, 0, 0)
        .expect("write must succeed");
    assert_eq!(written, data.len());

    fs.release(&ctx(), entry.inode, 0, handle, true, false, None)
        .expect("release must succeed");

    let (read_handle, _opts) = fs
        .open(&ctx(), entry.inode, libc::O_RDONLY as u32, 0)
        .expect("open must succeed");
    let read_handle = read_handle.expect("open must hand back a read handle");

    let mut out = Vec::new();
    let mut writer = VecWriter(&mut out);
    let n = fs
        .read(&ctx(), entry.inode, read_handle, &mut writer, data.len() as u32, 0, None, 0)
        .expect("read must succeed");
    assert_eq!(n, data.len());
    assert_eq!(out, data);
}

#[test]
fn write_at_wrong_offset_is_rejected() {
    let (fs, _rt) = new_fs();

    let (entry, handle, _opts) = fs
        .create(&ctx(), ROOT_ID, &name("f"), 0o644, 0, 0)
        .unwrap();
    let handle = handle.unwrap();

    let mut reader = VecReader(std::io::Cursor::new(b"xyz".to_vec()));
    let err = fs
        .write(&ctx(), entry.inode, handle, &mut reader, 3, 5, None, false, 0, 0)
        .expect_err("write at a non-contiguous offset must fail");
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}

#[test]
fn create_duplicate_name_fails_with_eexist() {
    let (fs, _rt) = new_fs();

    let (_entry, handle, _) = fs.create(&ctx(), ROOT_ID, &name("dup"), 0o644, 0, 0).unwrap();
    fs.release(&ctx(), ROOT_ID, 0, handle.unwrap(), true, false, None).unwrap();

    let err = fs
        .create(&ctx(), ROOT_ID, &name("dup"), 0o644, 0, 0)
        .expect_err("creating the same name twice must fail");
    assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
}

#[test]
fn mkdir_lookup_and_readdir() {
    let (fs, _rt) = new_fs();

    let dir = fs.mkdir(&ctx(), ROOT_ID, &name("d"), 0o755, 0).unwrap();
    assert!(dir.attr.st_mode & libc::S_IFDIR != 0);

    let looked_up = fs.lookup(&ctx(), ROOT_ID, &name("d")).unwrap();
    assert_eq!(looked_up.inode, dir.inode);

    let (_file_entry, handle, _) = fs
        .create(&ctx(), dir.inode, &name("inside"), 0o644, 0, 0)
        .unwrap();
    fs.release(&ctx(), dir.inode, 0, handle.unwrap(), true, false, None)
        .unwrap();

    let mut seen = Vec::new();
    fs.readdir(&ctx(), dir.inode, 0, 4096, 0, &mut |entry| {
        seen.push(String::from_utf8(entry.name.to_vec()).unwrap());
        Ok(1)
    })
    .unwrap();
    assert_eq!(seen, vec!["inside".to_string()]);
}

#[test]
fn lookup_missing_name_is_enoent() {
    let (fs, _rt) = new_fs();
    let err = fs.lookup(&ctx(), ROOT_ID, &name("nope")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
}

#[test]
fn rmdir_non_empty_is_enotempty() {
    let (fs, _rt) = new_fs();
    let dir = fs.mkdir(&ctx(), ROOT_ID, &name("d"), 0o755, 0).unwrap();
    let (_entry, handle, _) = fs.create(&ctx(), dir.inode, &name("f"), 0o644, 0, 0).unwrap();
    fs.release(&ctx(), dir.inode, 0, handle.unwrap(), true, false, None).unwrap();

    let err = fs.rmdir(&ctx(), ROOT_ID, &name("d")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOTEMPTY));
}

#[test]
fn unlink_removes_entry_and_data() {
    let (fs, _rt) = new_fs();
    let (entry, handle, _) = fs.create(&ctx(), ROOT_ID, &name("gone"), 0o644, 0, 0).unwrap();
    fs.release(&ctx(), ROOT_ID, 0, handle.unwrap(), true, false, None).unwrap();

    fs.unlink(&ctx(), ROOT_ID, &name("gone")).unwrap();

    let err = fs.lookup(&ctx(), ROOT_ID, &name("gone")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

    let open_err = fs.open(&ctx(), entry.inode, libc::O_RDONLY as u32, 0).unwrap_err();
    assert_eq!(open_err.raw_os_error(), Some(libc::EIO));
}

#[test]
fn unlink_on_directory_is_eisdir() {
    let (fs, _rt) = new_fs();
    fs.mkdir(&ctx(), ROOT_ID, &name("d"), 0o755, 0).unwrap();
    let err = fs.unlink(&ctx(), ROOT_ID, &name("d")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EISDIR));
}

#[test]
fn rename_moves_entry_between_directories() {
    let (fs, _rt) = new_fs();
    let src_dir = fs.mkdir(&ctx(), ROOT_ID, &name("src"), 0o755, 0).unwrap();
    let dst_dir = fs.mkdir(&ctx(), ROOT_ID, &name("dst"), 0o755, 0).unwrap();

    let (entry, handle, _) = fs
        .create(&ctx(), src_dir.inode, &name("f"), 0o644, 0, 0)
        .unwrap();
    fs.release(&ctx(), src_dir.inode, 0, handle.unwrap(), true, false, None)
        .unwrap();

    fs.rename(&ctx(), src_dir.inode, &name("f"), dst_dir.inode, &name("g"), 0)
        .unwrap();

    assert!(fs.lookup(&ctx(), src_dir.inode, &name("f")).is_err());
    let moved = fs.lookup(&ctx(), dst_dir.inode, &name("g")).unwrap();
    assert_eq!(moved.inode, entry.inode);
}

#[test]
fn rename_onto_existing_directory_is_rejected() {
    let (fs, _rt) = new_fs();
    let a = fs.mkdir(&ctx(), ROOT_ID, &name("a"), 0o755, 0).unwrap();
    fs.mkdir(&ctx(), ROOT_ID, &name("b"), 0o755, 0).unwrap();

    let err = fs
        .rename(&ctx(), ROOT_ID, &name("a"), ROOT_ID, &name("b"), 0)
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
    // the source directory must still be reachable under its old name
    assert_eq!(fs.lookup(&ctx(), ROOT_ID, &name("a")).unwrap().inode, a.inode);
}

#[test]
fn setattr_rejects_size_changes() {
    let (fs, _rt) = new_fs();
    let (entry, handle, _) = fs.create(&ctx(), ROOT_ID, &name("f"), 0o644, 0, 0).unwrap();
    fs.release(&ctx(), ROOT_ID, 0, handle.unwrap(), true, false, None).unwrap();

    let mut attr: fuse_backend_rs::abi::fuse_abi::stat64 = unsafe { std::mem::zeroed() };
    attr.st_size = 0;
    let err = fs
        .setattr(&ctx(), entry.inode, attr, None, SetattrValid::SIZE)
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}

/// Minimal [fuse_backend_rs::api::filesystem::ZeroCopyWriter] over a `Vec`,
/// standing in for the kernel-backed writer `read()` gets handed in
/// production.
struct VecWriter<'a>(&'a mut Vec<u8>);

impl<'a> std::io::Write for VecWriter<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> fuse_backend_rs::api::filesystem::ZeroCopyWriter for VecWriter<'a> {
    fn write_from(
        &mut self,
        f: &mut dyn std::io::Read,
        count: usize,
        _off: u64,
    ) -> std::io::Result<usize> {
        let mut buf = vec![0u8; count];
        let n = f.read(&mut buf)?;
        self.0.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// Minimal [fuse_backend_rs::api::filesystem::ZeroCopyReader] over an
/// in-memory buffer, standing in for the kernel-backed reader `write()`
/// gets handed in production.
struct VecReader(std::io::Cursor<Vec<u8>>);

impl std::io::Read for VecReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::Read::read(&mut self.0, buf)
    }
}

impl fuse_backend_rs::api::filesystem::ZeroCopyReader for VecReader {
    fn read_to(
        &mut self,
        f: &mut dyn std::io::Write,
        count: usize,
        _off: u64,
    ) -> std::io::Result<usize> {
        let mut buf = vec![0u8; count];
        let n = std::io::Read::read(&mut self.0, &mut buf)?;
        f.write_all(&buf[..n])?;
        Ok(n)
    }
}
