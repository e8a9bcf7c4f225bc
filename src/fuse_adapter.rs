use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use libc::c_int;
use log::debug;
use log::error;
use log::warn;

use fuser::consts::FOPEN_DIRECT_IO;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyBmap, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow,
};

use crate::base::{check_access, ErrorCode, FileKind, UserContext};
use crate::storage::{InodeAttributes, InodeTable, BLOCK_SIZE};

const FMODE_EXEC: i32 = 0x20;

// Cap on directory entries returned by a single readdir reply
const READDIR_ENTRIES_PER_RESPONSE: usize = 255;

struct FileHandleAttributes {
    read: bool,
    write: bool,
}

/// Readdir cursor scoped to one opendir handle: the last name yielded to the
/// kernel, resumed at the next present name in directory order.
struct DirHandle {
    resume_after: Option<String>,
    position: i64,
}

pub struct MemFUSE {
    store: Mutex<InodeTable>,
    next_file_handle: AtomicU64,
    file_handles: Mutex<HashMap<u64, FileHandleAttributes>>,
    dir_handles: Mutex<HashMap<u64, DirHandle>>,
    direct_io: bool,
}

impl MemFUSE {
    pub fn new(
        total_blocks: u64,
        total_inodes: u64,
        uid: u32,
        gid: u32,
        direct_io: bool,
    ) -> MemFUSE {
        MemFUSE {
            store: Mutex::new(InodeTable::new(total_blocks, total_inodes, uid, gid)),
            next_file_handle: AtomicU64::new(1),
            file_handles: Mutex::new(HashMap::new()),
            dir_handles: Mutex::new(HashMap::new()),
            direct_io,
        }
    }

    fn store(&self) -> std::sync::MutexGuard<'_, InodeTable> {
        self.store.lock().expect("inode table lock is poisoned")
    }

    fn allocate_file_handle(&self, read: bool, write: bool) -> u64 {
        let handle = self.next_file_handle.fetch_add(1, Ordering::SeqCst);
        let mut handles = self
            .file_handles
            .lock()
            .expect("file_handles lock is poisoned");
        handles.insert(handle, FileHandleAttributes { read, write });

        handle
    }

    fn deallocate_file_handle(&self, handle: u64) {
        let mut handles = self
            .file_handles
            .lock()
            .expect("file_handles lock is poisoned");
        handles.remove(&handle);
    }

    fn check_read(&self, handle: u64) -> bool {
        let handles = self
            .file_handles
            .lock()
            .expect("file_handles lock is poisoned");
        if let Some(value) = handles.get(&handle).map(|x| x.read) {
            value
        } else {
            error!("Undefined file handle: {}", handle);
            false
        }
    }

    fn check_write(&self, handle: u64) -> bool {
        let handles = self
            .file_handles
            .lock()
            .expect("file_handles lock is poisoned");
        if let Some(value) = handles.get(&handle).map(|x| x.write) {
            value
        } else {
            error!("Undefined file handle: {}", handle);
            false
        }
    }

    fn allocate_dir_handle(&self) -> u64 {
        let handle = self.next_file_handle.fetch_add(1, Ordering::SeqCst);
        let mut handles = self
            .dir_handles
            .lock()
            .expect("dir_handles lock is poisoned");
        handles.insert(
            handle,
            DirHandle {
                resume_after: None,
                position: 0,
            },
        );

        handle
    }

    fn deallocate_dir_handle(&self, handle: u64) {
        let mut handles = self
            .dir_handles
            .lock()
            .expect("dir_handles lock is poisoned");
        handles.remove(&handle);
    }
}

fn into_fuse_error(error: ErrorCode) -> c_int {
    match error {
        ErrorCode::DoesNotExist => libc::ENOENT,
        ErrorCode::InodeDoesNotExist => libc::ENOENT,
        ErrorCode::NotDirectory => libc::ENOTDIR,
        ErrorCode::IsDirectory => libc::EISDIR,
        ErrorCode::AlreadyExists => libc::EEXIST,
        ErrorCode::NotEmpty => libc::ENOTEMPTY,
        ErrorCode::InvalidArgument => libc::EINVAL,
        ErrorCode::NameTooLong => libc::ENAMETOOLONG,
        ErrorCode::FileTooLarge => libc::EFBIG,
        ErrorCode::OutOfSpace => libc::ENOSPC,
        ErrorCode::AccessDenied => libc::EACCES,
        ErrorCode::OperationNotPermitted => libc::EPERM,
        ErrorCode::MissingXattrKey => libc::ENODATA,
    }
}

// t_mode type is u16 on MacOS, but u32 on Linux
#[allow(clippy::unnecessary_cast)]
fn as_file_kind(mut mode: u32) -> Option<FileKind> {
    mode &= libc::S_IFMT as u32;

    if mode == libc::S_IFREG as u32 {
        Some(FileKind::File)
    } else if mode == libc::S_IFDIR as u32 {
        Some(FileKind::Directory)
    } else {
        None
    }
}

fn as_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::Special => FileType::CharDevice,
    }
}

fn to_fuse_attr(attrs: &InodeAttributes) -> FileAttr {
    FileAttr {
        ino: attrs.inode,
        size: attrs.size,
        blocks: attrs.blocks(),
        atime: attrs.last_accessed,
        mtime: attrs.last_modified,
        ctime: attrs.last_metadata_changed,
        crtime: attrs.creation_time,
        kind: as_file_type(attrs.kind),
        perm: attrs.mode,
        nlink: attrs.hardlinks,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: attrs.rdev,
        blksize: BLOCK_SIZE as u32,
        flags: 0,
    }
}

impl Filesystem for MemFUSE {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.store().destroy();
    }

    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = if let Some(value) = name.to_str() {
            value
        } else {
            error!("Path component is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let result = self
            .store()
            .lookup(parent, name, UserContext::new(req.uid(), req.gid()));
        match result {
            Ok(attrs) => reply.entry(&Duration::new(0, 0), &to_fuse_attr(&attrs), 0),
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.store().forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        debug!("getattr() called with {:?}", ino);
        let result = self.store().getattr(ino, fh.is_some());
        match result {
            Ok(attrs) => reply.attr(&Duration::new(0, 0), &to_fuse_attr(&attrs)),
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if let Some(mode) = mode {
            debug!("chmod() called with {:?}, {:o}", ino, mode);
            let result = self
                .store()
                .chmod(ino, mode, UserContext::new(req.uid(), req.gid()));
            if let Err(error_code) = result {
                reply.error(into_fuse_error(error_code));
                return;
            }
        }

        if uid.is_some() || gid.is_some() {
            debug!("chown() called with {:?} {:?} {:?}", ino, uid, gid);
            if let Some(gid) = gid {
                // Non-root users can only change gid to a group they're in
                if req.uid() != 0 && !get_groups(req.pid()).contains(&gid) {
                    reply.error(libc::EPERM);
                    return;
                }
            }
            let result = self
                .store()
                .chown(ino, uid, gid, UserContext::new(req.uid(), req.gid()));
            if let Err(error_code) = result {
                reply.error(into_fuse_error(error_code));
                return;
            }
        }

        if let Some(size) = size {
            debug!("truncate() called with {:?} {}", ino, size);
            let result = if let Some(handle) = fh {
                // A file handle opened for writing keeps its truncate
                // permission even if the file has since been chmod'ed
                if self.check_write(handle) {
                    self.store().truncate(ino, size, UserContext::new(0, 0), true)
                } else {
                    reply.error(libc::EACCES);
                    return;
                }
            } else {
                self.store()
                    .truncate(ino, size, UserContext::new(req.uid(), req.gid()), false)
            };
            if let Err(error_code) = result {
                reply.error(into_fuse_error(error_code));
                return;
            }
        }

        if atime.is_some() || mtime.is_some() {
            debug!("utimens() called with {:?}, {:?}, {:?}", ino, atime, mtime);
            let result = self
                .store()
                .utimens(ino, atime, mtime, UserContext::new(req.uid(), req.gid()));
            if let Err(error_code) = result {
                reply.error(into_fuse_error(error_code));
                return;
            }
        }

        if let Some(ctime) = ctime {
            let result = self.store().update_metadata_changed_time(ino, ctime);
            if let Err(error_code) = result {
                reply.error(into_fuse_error(error_code));
                return;
            }
        }

        let result = self.store().getattr(ino, fh.is_some());
        match result {
            Ok(attrs) => reply.attr(&Duration::new(0, 0), &to_fuse_attr(&attrs)),
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink() called on {:?}", ino);
        let result = self.store().readlink(ino);
        match result {
            Ok(target) => reply.data(&target),
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = if let Some(value) = name.to_str() {
            value
        } else {
            error!("Path component is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let Some(kind) = as_file_kind(mode) else {
            warn!(
                "mknod() implementation is incomplete. Only supports regular files and directories. Got {:o}",
                mode
            );
            reply.error(libc::ENOENT);
            return;
        };
        let result = self.store().create_node(
            parent,
            name,
            kind,
            (mode & 0o7777) as u16,
            UserContext::new(req.uid(), req.gid()),
            rdev,
        );
        match result {
            Ok(attrs) => reply.entry(&Duration::new(0, 0), &to_fuse_attr(&attrs), 0),
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir() called with {:?} {:?} {:o}", parent, name, mode);
        let name = if let Some(value) = name.to_str() {
            value
        } else {
            error!("Path component is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let result = self.store().create_node(
            parent,
            name,
            FileKind::Directory,
            (mode & 0o7777) as u16,
            UserContext::new(req.uid(), req.gid()),
            0,
        );
        match result {
            Ok(attrs) => reply.entry(&Duration::new(0, 0), &to_fuse_attr(&attrs), 0),
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink() called with {:?} {:?}", parent, name);
        let name = if let Some(value) = name.to_str() {
            value
        } else {
            error!("Path component is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let result = self.store().unlink(parent, name);
        if let Err(error_code) = result {
            reply.error(into_fuse_error(error_code));
        } else {
            reply.ok();
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir() called with {:?} {:?}", parent, name);
        let name = if let Some(value) = name.to_str() {
            value
        } else {
            error!("Path component is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let result = self.store().rmdir(parent, name);
        if let Err(error_code) = result {
            reply.error(into_fuse_error(error_code));
        } else {
            reply.ok();
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink() called with {:?} {:?} {:?}", parent, link_name, target);
        let name = if let Some(value) = link_name.to_str() {
            value
        } else {
            error!("Path component is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let target = if let Some(value) = target.to_str() {
            value
        } else {
            error!("Link target is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let result = self
            .store()
            .symlink(parent, name, target, UserContext::new(req.uid(), req.gid()));
        match result {
            Ok(attrs) => reply.entry(&Duration::new(0, 0), &to_fuse_attr(&attrs), 0),
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = if let Some(value) = name.to_str() {
            value
        } else {
            error!("Path component is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let newname = if let Some(value) = newname.to_str() {
            value
        } else {
            error!("Path component is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let result = self.store().rename(parent, name, newparent, newname);
        if let Err(error_code) = result {
            reply.error(into_fuse_error(error_code));
        } else {
            reply.ok();
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link() called for {}, {}, {:?}", ino, newparent, newname);
        let newname = if let Some(value) = newname.to_str() {
            value
        } else {
            error!("Path component is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let result = self.store().hardlink(ino, newparent, newname);
        match result {
            Ok(attrs) => reply.entry(&Duration::new(0, 0), &to_fuse_attr(&attrs), 0),
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open() called for {:?}", ino);
        let (access_mask, read, write) = match flags & libc::O_ACCMODE {
            libc::O_RDONLY => {
                // Behavior is undefined, but most filesystems return EACCES
                if flags & libc::O_TRUNC != 0 {
                    reply.error(libc::EACCES);
                    return;
                }
                if flags & FMODE_EXEC != 0 {
                    // Open is from internal exec syscall
                    (libc::X_OK, true, false)
                } else {
                    (libc::R_OK, true, false)
                }
            }
            libc::O_WRONLY => (libc::W_OK, false, true),
            libc::O_RDWR => (libc::R_OK | libc::W_OK, true, true),
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };

        let result = self.store().getattr(ino, false);
        match result {
            Ok(attrs) => {
                if attrs.kind == FileKind::Directory {
                    reply.error(libc::EISDIR);
                    return;
                }
                if check_access(
                    attrs.uid,
                    attrs.gid,
                    attrs.mode,
                    req.uid(),
                    req.gid(),
                    access_mask,
                ) {
                    let flags = if self.direct_io { FOPEN_DIRECT_IO } else { 0 };
                    reply.opened(self.allocate_file_handle(read, write), flags);
                } else {
                    reply.error(libc::EACCES);
                }
            }
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read() called on {:?}", ino);
        if !self.check_read(fh) {
            reply.error(libc::EACCES);
            return;
        }
        let offset = match u64::try_from(offset) {
            Ok(value) => value,
            Err(_) => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        let result = self.store().read(ino, offset, size);
        match result {
            Ok(data) => reply.data(&data),
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write() called with {:?}", ino);
        if !self.check_write(fh) {
            reply.error(libc::EACCES);
            return;
        }
        let offset = match u64::try_from(offset) {
            Ok(value) => value,
            Err(_) => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        let result = self.store().write(ino, offset, data);
        match result {
            Ok(written) => reply.written(written),
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush() called on {:?}", ino);
        let result = self.store().getattr(ino, true);
        if let Err(error_code) = result {
            reply.error(into_fuse_error(error_code));
        } else {
            reply.ok();
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release() called on {:?} {}", ino, fh);
        self.deallocate_file_handle(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        debug!("fsync() called with {:?}", ino);
        // Nothing is backed by durable storage
        let result = self.store().getattr(ino, true);
        if let Err(error_code) = result {
            reply.error(into_fuse_error(error_code));
        } else {
            reply.ok();
        }
    }

    fn opendir(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("opendir() called on {:?}", ino);
        let access_mask = match flags & libc::O_ACCMODE {
            libc::O_RDONLY => {
                // Behavior is undefined, but most filesystems return EACCES
                if flags & libc::O_TRUNC != 0 {
                    reply.error(libc::EACCES);
                    return;
                }
                libc::R_OK
            }
            libc::O_WRONLY => libc::W_OK,
            libc::O_RDWR => libc::R_OK | libc::W_OK,
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };

        let result = self.store().getattr(ino, false);
        match result {
            Ok(attrs) => {
                if attrs.kind != FileKind::Directory {
                    reply.error(libc::ENOTDIR);
                    return;
                }
                if check_access(
                    attrs.uid,
                    attrs.gid,
                    attrs.mode,
                    req.uid(),
                    req.gid(),
                    access_mask,
                ) {
                    reply.opened(self.allocate_dir_handle(), 0);
                } else {
                    reply.error(libc::EACCES);
                }
            }
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir() called with {:?}", ino);
        let mut handles = self
            .dir_handles
            .lock()
            .expect("dir_handles lock is poisoned");
        let Some(handle) = handles.get_mut(&fh) else {
            error!("Undefined directory handle: {}", fh);
            reply.error(libc::EBADF);
            return;
        };
        if offset == 0 {
            handle.resume_after = None;
            handle.position = 0;
        }

        let batch = self.store.lock().expect("inode table lock is poisoned").directory_entries_after(
            ino,
            handle.resume_after.as_deref(),
            READDIR_ENTRIES_PER_RESPONSE,
        );
        match batch {
            Ok(entries) => {
                for (child, kind, name) in entries {
                    handle.position += 1;
                    let buffer_full = reply.add(child, handle.position, as_file_type(kind), &name);
                    if buffer_full {
                        // The unsent entry stays ahead of the cursor; the
                        // kernel retries it with a larger buffer
                        handle.position -= 1;
                        break;
                    }
                    handle.resume_after = Some(name);
                }
                reply.ok();
            }
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir() called on {:?} {}", ino, fh);
        self.deallocate_dir_handle(fh);
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        debug!("fsyncdir() called with {:?}", ino);
        let result = self.store().getattr(ino, false);
        match result {
            Ok(attrs) => {
                if attrs.kind != FileKind::Directory {
                    reply.error(libc::ENOTDIR);
                } else {
                    reply.ok();
                }
            }
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        debug!("statfs()");
        let stats = self.store().statfs();
        reply.statfs(
            stats.total_blocks,
            stats.free_blocks,
            stats.free_blocks,
            stats.total_inodes,
            stats.free_inodes,
            stats.block_size,
            stats.max_name_length,
            stats.block_size,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr() called with {:?} {:?} {:?}", ino, name, value);
        let name = if let Some(value) = name.to_str() {
            value
        } else {
            error!("Key is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let result = self.store().set_xattr(ino, name, value, flags);
        if let Err(error_code) = result {
            reply.error(into_fuse_error(error_code));
        } else {
            reply.ok();
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr() called with {:?} {:?}", ino, name);
        let name = if let Some(value) = name.to_str() {
            value
        } else {
            error!("Key is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let result = self.store().get_xattr(ino, name);
        match result {
            Ok(data) => {
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if data.len() <= size as usize {
                    reply.data(&data);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr() called with {:?}", ino);
        let result = self.store().list_xattrs(ino).map(|xattrs| {
            let mut bytes = vec![];
            // Convert to concatenated null-terminated strings
            for attr in xattrs {
                bytes.extend(attr.as_bytes());
                bytes.push(0);
            }
            bytes
        });
        match result {
            Ok(data) => {
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if data.len() <= size as usize {
                    reply.data(&data);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr() called with {:?} {:?}", ino, name);
        let name = if let Some(value) = name.to_str() {
            value
        } else {
            error!("Key is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let result = self.store().remove_xattr(ino, name);
        if let Err(error_code) = result {
            reply.error(into_fuse_error(error_code));
        } else {
            reply.ok();
        }
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access() called with {:?} {:?}", ino, mask);
        let result = self
            .store()
            .access(ino, mask, UserContext::new(req.uid(), req.gid()));
        if let Err(error_code) = result {
            reply.error(into_fuse_error(error_code));
        } else {
            reply.ok();
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create() called with {:?} {:?}", parent, name);
        let name = if let Some(value) = name.to_str() {
            value
        } else {
            error!("Path component is not UTF-8");
            reply.error(libc::EINVAL);
            return;
        };
        let (read, write) = match flags & libc::O_ACCMODE {
            libc::O_RDONLY => (true, false),
            libc::O_WRONLY => (false, true),
            libc::O_RDWR => (true, true),
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        let result = self.store().create_node(
            parent,
            name,
            FileKind::File,
            (mode & 0o7777) as u16,
            UserContext::new(req.uid(), req.gid()),
            0,
        );
        match result {
            Ok(attrs) => {
                let flags = if self.direct_io { FOPEN_DIRECT_IO } else { 0 };
                reply.created(
                    &Duration::new(0, 0),
                    &to_fuse_attr(&attrs),
                    0,
                    self.allocate_file_handle(read, write),
                    flags,
                );
            }
            Err(error_code) => reply.error(into_fuse_error(error_code)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn getlk(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        _typ: i32,
        _pid: u32,
        reply: ReplyLock,
    ) {
        reply.error(libc::ENOSYS);
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        _start: u64,
        _end: u64,
        _typ: i32,
        _pid: u32,
        _sleep: bool,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn bmap(&mut self, _req: &Request, _ino: u64, _blocksize: u32, _idx: u64, reply: ReplyBmap) {
        reply.error(libc::ENOSYS);
    }
}

fn get_groups(pid: u32) -> Vec<u32> {
    let path = format!("/proc/{pid}/task/{pid}/status");
    let Ok(file) = File::open(path) else {
        return vec![];
    };
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else {
            break;
        };
        if line.starts_with("Groups:") {
            return line["Groups: ".len()..]
                .split(' ')
                .filter(|x| !x.trim().is_empty())
                .filter_map(|x| x.parse::<u32>().ok())
                .collect();
        }
    }

    vec![]
}
