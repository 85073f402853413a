//! Exposes a GridFS-style chunked object store in MongoDB as a POSIX
//! filesystem via FUSE. See the module docs on [backend], [inode], [path],
//! [bootstrap] and [fs] for how the pieces fit together; the two binaries in
//! `src/bin` are thin CLI wrappers around [bootstrap::ensure_schema] and
//! [fs::GridFsFuse].

pub mod backend;
pub mod bootstrap;
pub mod errors;
pub mod fs;
pub mod inode;
pub mod path;

pub use errors::Error;
