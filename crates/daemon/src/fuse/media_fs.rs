//! fuser `Filesystem` adapter over [`MountRoot`]
//!
//! Metadata callbacks are answered inline. `open` and `read` may block on
//! source I/O, so they run on the tokio blocking pool and reply from there.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, Request, TimeOrNow,
};
use libc::c_int;
use tokio::runtime::Handle;

use crate::fs::{FsResult, MountRoot, NodeAttr, NodeKind};
use crate::permissions::Caller;

const BLOCK_SIZE: u32 = 4096;

pub struct MediaFs {
    root: Arc<MountRoot>,
    runtime: Handle,
    ttl: Duration,
}

impl MediaFs {
    pub fn new(root: Arc<MountRoot>, runtime: Handle, ttl: Duration) -> Self {
        Self { root, runtime, ttl }
    }

    fn file_attr(attr: &NodeAttr) -> FileAttr {
        let kind = match attr.kind {
            NodeKind::Directory => FileType::Directory,
            NodeKind::File => FileType::RegularFile,
        };
        FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: attr.mtime,
            mtime: attr.mtime,
            ctime: attr.mtime,
            crtime: attr.mtime,
            kind,
            perm: (attr.perms.mode & 0o7777) as u16,
            nlink: attr.nlink,
            uid: attr.perms.uid,
            gid: attr.perms.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

/// Errno for a mutation that must not succeed on a read-only mount
fn rejected(result: FsResult<()>) -> c_int {
    match result {
        Ok(()) => libc::EROFS,
        Err(e) => e.errno(),
    }
}

impl Filesystem for MediaFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        self.root.kernel().mark_ready();
        tracing::info!("FUSE session initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("FUSE session destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.root.lookup(parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &Self::file_attr(&attr), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.root.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.root.getattr(ino) {
            Ok(attr) => reply.attr(&self.ttl, &Self::file_attr(&attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        crtime: Option<SystemTime>,
        chgtime: Option<SystemTime>,
        bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // ctime accompanies chown/chmod on some kernels and is not a change of its own
        let other_fields = size.is_some()
            || atime.is_some()
            || mtime.is_some()
            || crtime.is_some()
            || chgtime.is_some()
            || bkuptime.is_some()
            || flags.is_some();
        let caller = Caller::new(req.uid(), req.gid());

        match self.root.setattr(ino, caller, uid, gid, mode, other_fields) {
            Ok(attr) => reply.attr(&self.ttl, &Self::file_attr(&attr)),
            Err(e) => {
                tracing::debug!(ino, error = %e, "setattr rejected");
                reply.error(e.errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.root.readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let kind = match entry.kind {
                NodeKind::Directory => FileType::Directory,
                NodeKind::File => FileType::RegularFile,
            };
            if reply.add(entry.ino, (i + 1) as i64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let root = self.root.clone();
        self.runtime.spawn_blocking(move || match root.open(ino, flags) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.errno()),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let root = self.root.clone();
        self.runtime.spawn_blocking(
            move || match root.read(ino, offset as u64, size as usize) {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.errno()),
            },
        );
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(rejected(self.root.mkdir(parent, &name.to_string_lossy())));
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        reply.error(rejected(self.root.rmdir(parent, &name.to_string_lossy())));
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        reply.error(rejected(self.root.unlink(parent, &name.to_string_lossy())));
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(rejected(self.root.create(parent, &name.to_string_lossy())));
    }
}
