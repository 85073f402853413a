use std::{io, path::Path, sync::Arc, thread};

use fuse_backend_rs::{api::filesystem::FileSystem, transport::FuseSession};
use tracing::error;

struct FuseServer<FS>
where
    FS: FileSystem + Sync + Send,
{
    server: Arc<fuse_backend_rs::api::server::Server<Arc<FS>>>,
    channel: fuse_backend_rs::transport::FuseChannel,
}

impl<FS> FuseServer<FS>
where
    FS: FileSystem + Sync + Send,
{
    fn start(&mut self) -> io::Result<()> {
        loop {
            if let Some((reader, writer)) = self
                .channel
                .get_request()
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?
            {
                if let Err(e) = self
                    .server
                    .handle_message(reader, writer.into(), None, None)
                {
                    match e {
                        // This indicates the session has been shut down.
                        fuse_backend_rs::Error::EncodeMessage(e)
                            if e.raw_os_error() == Some(libc::EBADFD) =>
                        {
                            break;
                        }
                        error => {
                            error!(?error, "failed to handle fuse request");
                            continue;
                        }
                    }
                }
            } else {
                break;
            }
        }
        Ok(())
    }
}

/// Owns the FUSE session and the worker threads pumping requests off of it.
///
/// Unmounting (explicitly, or implicitly via `Drop`) tears the session down
/// and joins every worker thread.
pub struct FuseDaemon {
    session: FuseSession,
    threads: Vec<thread::JoinHandle<()>>,
}

impl FuseDaemon {
    /// Mounts `fs` at `mountpoint` and starts `threads` worker threads
    /// servicing requests off of it.
    ///
    /// Only `threads == 1` is exercised by this system's CLI surface — the
    /// write-handle bookkeeping in the operations core assumes a single
    /// caller delivers callbacks at a time — but the constructor itself
    /// stays general, matching how the underlying FUSE session type already
    /// supports multiple worker threads.
    pub fn new<FS, P>(
        fs: FS,
        mountpoint: P,
        threads: usize,
        allow_other: bool,
    ) -> Result<Self, io::Error>
    where
        FS: FileSystem + Sync + Send + 'static,
        P: AsRef<Path>,
    {
        let server = Arc::new(fuse_backend_rs::api::server::Server::new(Arc::new(fs)));

        // Unlike tvix-store (read-only), gridfs-fuse's whole point is
        // create/mkdir/write/unlink/rename/setattr, so the mount must not be
        // read-only — `MS_RDONLY` would make the kernel reject every
        // mutating syscall with `EROFS` before it ever reaches a callback.
        let mut session = FuseSession::new(mountpoint.as_ref(), "gridfs_fuse", "", false)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        // spec.md §6 wants `default_permissions` on every mount (the kernel
        // does the POSIX mode checking this crate doesn't). `FuseSession`
        // exposes `set_allow_other` but no `set_default_permissions` or
        // general option passthrough, so this is a known, documented gap
        // (DESIGN.md) rather than a silently dropped option.
        session.set_allow_other(allow_other);
        session
            .mount()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let mut join_handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let mut server = FuseServer {
                server: server.clone(),
                channel: session
                    .new_channel()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?,
            };
            let join_handle = thread::Builder::new()
                .name("fuse_server".to_string())
                .spawn(move || {
                    let _ = server.start();
                })?;
            join_handles.push(join_handle);
        }

        Ok(FuseDaemon {
            session,
            threads: join_handles,
        })
    }

    pub fn unmount(&mut self) -> Result<(), io::Error> {
        self.session
            .umount()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        for thread in self.threads.drain(..) {
            thread.join().map_err(|_| {
                io::Error::new(io::ErrorKind::Other, "failed to join fuse server thread")
            })?;
        }

        Ok(())
    }
}

impl Drop for FuseDaemon {
    fn drop(&mut self) {
        if let Err(error) = self.unmount() {
            error!(?error, "failed to unmount gridfs-fuse filesystem")
        }
    }
}
