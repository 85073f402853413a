//! File Handle Table (C3, spec.md §4.2): allocates 16-bit handles and maps
//! each to a live read or write session. Allocation is a rolling-cursor
//! linear probe with wraparound, ported from
//! `original_source/gridfs_fuse/operations.py`'s `FileDescriptorFactory`.
//! The two session maps are disjoint, as spec.md requires, and guarded by a
//! single lock that is never held across a backend call — only the map
//! mutation itself is serialized; the session objects themselves are
//! wrapped in their own `tokio::sync::Mutex` so concurrent `read`/`write`
//! calls on distinct handles don't contend.
//!
//! The 16-bit range is an allocation-policy detail internal to this table
//! (`HandleId`); the FUSE-facing handle ([Handle]) is the `u64` the
//! `fuse_backend_rs::api::filesystem::FileSystem` trait requires (it bounds
//! `Handle: From<u64> + Into<u64>`, since the server decodes `fh` straight
//! off the wire). [Handle] just widens/narrows at that boundary — every
//! value it ever carries still comes from [HandleTable]'s `u16` allocator.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::{ChunkReader, ChunkWriter};
use crate::inode::Inode;

/// The allocator's native handle value (spec.md §4.2: a 16-bit handle).
type HandleId = u16;

/// The `FileSystem` trait's associated `Handle` type. A thin `u64` wrapper
/// so it satisfies `From<u64> + Into<u64>`, which `u16` alone cannot
/// (`u16: From<u64>` doesn't exist, only `TryFrom`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl From<u64> for Handle {
    fn from(v: u64) -> Self {
        Handle(v)
    }
}

impl From<Handle> for u64 {
    fn from(h: Handle) -> Self {
        h.0
    }
}

impl From<HandleId> for Handle {
    fn from(id: HandleId) -> Self {
        Handle(id as u64)
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Handle {
    /// Narrows back to the allocator's native id. Safe: every `Handle` this
    /// table hands out was widened from a `HandleId` in the first place, so
    /// the kernel only ever echoes back values already in range.
    fn as_id(self) -> HandleId {
        self.0 as HandleId
    }
}

pub struct WriteSession {
    pub inode: Inode,
    pub writer: Box<dyn ChunkWriter>,
}

pub struct ReadSession {
    pub inode: Inode,
    pub reader: Box<dyn ChunkReader>,
}

#[derive(Default)]
struct Cursor {
    next: HandleId,
}

#[derive(Default)]
pub struct HandleTable {
    reads: Mutex<HashMap<HandleId, Arc<AsyncMutex<ReadSession>>>>,
    writes: Mutex<HashMap<HandleId, Arc<AsyncMutex<WriteSession>>>>,
    cursor: Mutex<Cursor>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(&self, h: HandleId) -> bool {
        self.reads.lock().contains_key(&h) || self.writes.lock().contains_key(&h)
    }

    /// Next free handle via linear probe from the rolling cursor, wrapping
    /// around at 2^16. When the live set is empty the cursor resets to 1,
    /// matching the original's behavior exactly.
    fn next_handle(&self) -> HandleId {
        let mut cursor = self.cursor.lock();
        loop {
            if cursor.next == 0 {
                cursor.next = 1;
            }
            let candidate = cursor.next;
            cursor.next = cursor.next.wrapping_add(1);
            if !self.is_live(candidate) {
                return candidate;
            }
        }
    }

    pub fn insert_read(&self, inode: Inode, reader: Box<dyn ChunkReader>) -> Handle {
        let handle = self.next_handle();
        self.reads.lock().insert(
            handle,
            Arc::new(AsyncMutex::new(ReadSession { inode, reader })),
        );
        handle.into()
    }

    pub fn insert_write(&self, inode: Inode, writer: Box<dyn ChunkWriter>) -> Handle {
        let handle = self.next_handle();
        self.writes.lock().insert(
            handle,
            Arc::new(AsyncMutex::new(WriteSession { inode, writer })),
        );
        handle.into()
    }

    pub fn get_read(&self, handle: Handle) -> Option<Arc<AsyncMutex<ReadSession>>> {
        self.reads.lock().get(&handle.as_id()).cloned()
    }

    pub fn get_write(&self, handle: Handle) -> Option<Arc<AsyncMutex<WriteSession>>> {
        self.writes.lock().get(&handle.as_id()).cloned()
    }

    /// True if any write handle is currently open on `inode` — used by
    /// `getattr`'s in-flight size resolution (spec.md §4.3) and by `open`'s
    /// append-once enforcement.
    pub fn write_position_for(&self, inode: Inode) -> Option<u64> {
        let writes = self.writes.lock();
        for session in writes.values() {
            if let Ok(guard) = session.try_lock() {
                if guard.inode == inode {
                    return Some(guard.writer.position());
                }
            }
        }
        None
    }

    /// Closes and removes the session for `handle`, finalizing a write's
    /// chunked object if it was a write handle. Never fails observably
    /// (spec.md §4.3's contract for `release`): backend errors during
    /// close are logged, not propagated.
    pub async fn release(&self, handle: Handle) {
        let id = handle.as_id();
        if let Some(session) = self.writes.lock().remove(&id) {
            let mut guard = session.lock().await;
            if let Err(e) = guard.writer.close().await {
                tracing::warn!(%handle, error = %e, "failed to finalize chunked object on release");
            }
        }
        self.reads.lock().remove(&id);
        if self.reads.lock().is_empty() && self.writes.lock().is_empty() {
            self.cursor.lock().next = 1;
        }
    }
}
