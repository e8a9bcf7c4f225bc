use std::collections::{BTreeMap, VecDeque};
use std::time::SystemTime;

use fuser::TimeOrNow;

use crate::base::{check_access, ErrorCode, FileKind, UserContext};
use crate::storage::inode::{
    blocks_for, directory_base_size, directory_entry_size, DirectoryEntries, FileBlocks, Inode,
    InodeAttributes, InodeBody,
};
use crate::storage::{BLOCK_SIZE, MAX_FILE_SIZE, MAX_NAME_LENGTH, ROOT_INODE};

#[derive(Clone, Debug)]
pub struct FilesystemStats {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub block_size: u32,
    pub max_name_length: u32,
}

/// The process-wide inode table. Slot `i` holds the inode numbered `i` or a
/// tombstone whose number sits in the `deleted` queue awaiting reuse. Inode 0
/// is a reserved slot that never resolves; inode 1 is the root directory.
pub struct InodeTable {
    slots: Vec<Option<Inode>>,
    deleted: VecDeque<u64>,
    total_blocks: u64,
    free_blocks: u64,
    total_inodes: u64,
    free_inodes: u64,
}

impl InodeTable {
    pub fn new(total_blocks: u64, total_inodes: u64, uid: u32, gid: u32) -> InodeTable {
        assert!(
            total_blocks >= 1 && total_inodes >= 2,
            "filesystem capacity too small for the root directory"
        );
        let mut table = InodeTable {
            slots: vec![],
            deleted: VecDeque::new(),
            total_blocks,
            free_blocks: total_blocks,
            total_inodes,
            free_inodes: total_inodes,
        };
        let now = SystemTime::now();
        table.register(InodeBody::Special, FileKind::Special, 0, 0, uid, gid, 0, now);
        let root = table.register(
            InodeBody::Directory(DirectoryEntries::new()),
            FileKind::Directory,
            0o777,
            3,
            uid,
            gid,
            0,
            now,
        );
        assert_eq!(root, ROOT_INODE);
        table.insert_child(ROOT_INODE, ".".to_string(), ROOT_INODE, now);
        table.insert_child(ROOT_INODE, "..".to_string(), ROOT_INODE, now);
        table
    }

    pub fn lookup(
        &mut self,
        parent: u64,
        name: &str,
        context: UserContext,
    ) -> Result<InodeAttributes, ErrorCode> {
        validate_name(name)?;
        let parent_inode = self.resolve(parent)?;
        let entries = match &parent_inode.body {
            InodeBody::Directory(entries) => entries,
            _ => return Err(ErrorCode::NotDirectory),
        };
        let parent_attrs = &parent_inode.attrs;
        if !check_access(
            parent_attrs.uid,
            parent_attrs.gid,
            parent_attrs.mode,
            context.uid(),
            context.gid(),
            libc::X_OK,
        ) {
            return Err(ErrorCode::AccessDenied);
        }
        let child = entries.get(name).ok_or(ErrorCode::DoesNotExist)?;
        match self.inode_mut(child) {
            Some(inode) if inode.attrs.hardlinks > 0 => {
                inode.nlookup += 1;
                Ok(inode.attrs.clone())
            }
            _ => Err(ErrorCode::DoesNotExist),
        }
    }

    pub fn getattr(&self, ino: u64, via_handle: bool) -> Result<InodeAttributes, ErrorCode> {
        let inode = if via_handle {
            self.resolve_open(ino)?
        } else {
            self.resolve(ino)?
        };
        Ok(inode.attrs.clone())
    }

    // t_mode type is u16 on MacOS, but u32 on Linux
    #[allow(clippy::unnecessary_cast)]
    pub fn chmod(&mut self, ino: u64, mut mode: u32, context: UserContext) -> Result<(), ErrorCode> {
        let inode = self.resolve_mut(ino)?;
        if context.uid() != 0 && inode.attrs.uid != context.uid() {
            return Err(ErrorCode::OperationNotPermitted);
        }
        // suid/sgid not supported
        mode &= !(libc::S_ISUID | libc::S_ISGID) as u32;
        inode.attrs.mode = mode as u16;
        inode.attrs.last_metadata_changed = SystemTime::now();
        Ok(())
    }

    pub fn chown(
        &mut self,
        ino: u64,
        uid: Option<u32>,
        gid: Option<u32>,
        context: UserContext,
    ) -> Result<(), ErrorCode> {
        let inode = self.resolve_mut(ino)?;

        // Only root can change uid
        if let Some(uid) = uid {
            if context.uid() != 0
                // but no-op changes by the owner are not an error
                && !(uid == inode.attrs.uid && context.uid() == inode.attrs.uid)
            {
                return Err(ErrorCode::OperationNotPermitted);
            }
        }
        // Only owner may change the group
        if gid.is_some() && context.uid() != 0 && context.uid() != inode.attrs.uid {
            return Err(ErrorCode::OperationNotPermitted);
        }

        if let Some(uid) = uid {
            inode.attrs.uid = uid;
        }
        if let Some(gid) = gid {
            inode.attrs.gid = gid;
        }
        if uid.is_some() || gid.is_some() {
            inode.attrs.last_metadata_changed = SystemTime::now();
        }
        Ok(())
    }

    pub fn utimens(
        &mut self,
        ino: u64,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        context: UserContext,
    ) -> Result<(), ErrorCode> {
        let inode = self.resolve_mut(ino)?;
        // Non-owners are only allowed to change atime & mtime to the current
        // time: http://man7.org/linux/man-pages/man2/utimensat.2.html
        let specific = |time: Option<TimeOrNow>| matches!(time, Some(TimeOrNow::SpecificTime(_)));
        if inode.attrs.uid != context.uid()
            && context.uid() != 0
            && (specific(atime) || specific(mtime))
        {
            return Err(ErrorCode::OperationNotPermitted);
        }
        if inode.attrs.uid != context.uid()
            && !check_access(
                inode.attrs.uid,
                inode.attrs.gid,
                inode.attrs.mode,
                context.uid(),
                context.gid(),
                libc::W_OK,
            )
        {
            return Err(ErrorCode::AccessDenied);
        }

        let now = SystemTime::now();
        if let Some(atime) = atime {
            inode.attrs.last_accessed = match atime {
                TimeOrNow::SpecificTime(time) => time,
                TimeOrNow::Now => now,
            };
        }
        if let Some(mtime) = mtime {
            inode.attrs.last_modified = match mtime {
                TimeOrNow::SpecificTime(time) => time,
                TimeOrNow::Now => now,
            };
        }
        inode.attrs.last_metadata_changed = now;
        Ok(())
    }

    pub fn update_metadata_changed_time(
        &mut self,
        ino: u64,
        time: SystemTime,
    ) -> Result<(), ErrorCode> {
        let inode = self.resolve_mut(ino)?;
        inode.attrs.last_metadata_changed = time;
        Ok(())
    }

    pub fn truncate(
        &mut self,
        ino: u64,
        new_size: u64,
        context: UserContext,
        via_handle: bool,
    ) -> Result<(), ErrorCode> {
        if new_size > MAX_FILE_SIZE {
            return Err(ErrorCode::FileTooLarge);
        }
        {
            let inode = if via_handle {
                self.resolve_open(ino)?
            } else {
                self.resolve(ino)?
            };
            match &inode.body {
                InodeBody::File(_) => {}
                InodeBody::Directory(_) => return Err(ErrorCode::IsDirectory),
                _ => return Err(ErrorCode::InvalidArgument),
            }
            if !check_access(
                inode.attrs.uid,
                inode.attrs.gid,
                inode.attrs.mode,
                context.uid(),
                context.gid(),
                libc::W_OK,
            ) {
                return Err(ErrorCode::AccessDenied);
            }
            let old_blocks = inode.attrs.blocks();
            let new_blocks = blocks_for(new_size);
            if new_blocks > old_blocks && new_blocks - old_blocks > self.free_blocks {
                return Err(ErrorCode::OutOfSpace);
            }
        }

        let now = SystemTime::now();
        let inode = if via_handle {
            self.resolve_open_mut(ino)?
        } else {
            self.resolve_mut(ino)?
        };
        let old_blocks = inode.attrs.blocks();
        if let InodeBody::File(file) = &mut inode.body {
            file.truncate(new_size);
        }
        inode.attrs.size = new_size;
        inode.attrs.last_modified = now;
        inode.attrs.last_metadata_changed = now;
        let new_blocks = inode.attrs.blocks();
        if new_blocks >= old_blocks {
            self.free_blocks -= new_blocks - old_blocks;
        } else {
            self.free_blocks += old_blocks - new_blocks;
        }
        Ok(())
    }

    pub fn readlink(&self, ino: u64) -> Result<Vec<u8>, ErrorCode> {
        let inode = self.resolve(ino)?;
        match &inode.body {
            InodeBody::Symlink { target } => Ok(target.clone().into_bytes()),
            _ => Err(ErrorCode::InvalidArgument),
        }
    }

    /// Creates a regular file or directory under `parent`. Directories are
    /// born holding `.` and `..` and raise the parent's link count.
    pub fn create_node(
        &mut self,
        parent: u64,
        name: &str,
        kind: FileKind,
        mode: u16,
        context: UserContext,
        rdev: u32,
    ) -> Result<InodeAttributes, ErrorCode> {
        validate_name(name)?;
        let parent_dir = self.directory_of(parent)?;
        if parent_dir.get(name).is_some() {
            return Err(ErrorCode::AlreadyExists);
        }
        let initial_size = match kind {
            FileKind::File => 0,
            FileKind::Directory => {
                directory_base_size() + directory_entry_size(".") + directory_entry_size("..")
            }
            _ => return Err(ErrorCode::DoesNotExist),
        };
        if self.free_inodes == 0 {
            return Err(ErrorCode::OutOfSpace);
        }
        if blocks_for(initial_size) + self.grow_cost(parent, name) > self.free_blocks {
            return Err(ErrorCode::OutOfSpace);
        }

        let now = SystemTime::now();
        let (body, nlink) = match kind {
            FileKind::File => (InodeBody::File(FileBlocks::new()), 1),
            // A directory holds a link on itself through `.`
            FileKind::Directory => (InodeBody::Directory(DirectoryEntries::new()), 2),
            _ => unreachable!(),
        };
        let ino = self.register(body, kind, mode, nlink, context.uid(), context.gid(), rdev, now);
        if kind == FileKind::Directory {
            self.insert_child(ino, ".".to_string(), ino, now);
            self.insert_child(ino, "..".to_string(), parent, now);
            // The child's `..` holds a link on the parent
            self.inode_mut(parent).unwrap().attrs.hardlinks += 1;
        }
        self.insert_child(parent, name.to_string(), ino, now);

        let inode = self.inode_mut(ino).unwrap();
        inode.nlookup += 1;
        Ok(inode.attrs.clone())
    }

    pub fn symlink(
        &mut self,
        parent: u64,
        name: &str,
        target: &str,
        context: UserContext,
    ) -> Result<InodeAttributes, ErrorCode> {
        validate_name(name)?;
        let parent_dir = self.directory_of(parent)?;
        if parent_dir.get(name).is_some() {
            return Err(ErrorCode::AlreadyExists);
        }
        if self.free_inodes == 0 {
            return Err(ErrorCode::OutOfSpace);
        }
        if blocks_for(target.len() as u64) + self.grow_cost(parent, name) > self.free_blocks {
            return Err(ErrorCode::OutOfSpace);
        }

        let now = SystemTime::now();
        let ino = self.register(
            InodeBody::Symlink {
                target: target.to_string(),
            },
            FileKind::Symlink,
            0o777,
            1,
            context.uid(),
            context.gid(),
            0,
            now,
        );
        self.insert_child(parent, name.to_string(), ino, now);

        let inode = self.inode_mut(ino).unwrap();
        inode.nlookup += 1;
        Ok(inode.attrs.clone())
    }

    pub fn hardlink(
        &mut self,
        ino: u64,
        new_parent: u64,
        new_name: &str,
    ) -> Result<InodeAttributes, ErrorCode> {
        validate_name(new_name)?;
        if self.resolve(ino)?.attrs.kind == FileKind::Directory {
            return Err(ErrorCode::OperationNotPermitted);
        }
        let parent_dir = self.directory_of(new_parent)?;
        if parent_dir.get(new_name).is_some() {
            return Err(ErrorCode::AlreadyExists);
        }
        if self.grow_cost(new_parent, new_name) > self.free_blocks {
            return Err(ErrorCode::OutOfSpace);
        }

        let now = SystemTime::now();
        self.insert_child(new_parent, new_name.to_string(), ino, now);
        let inode = self.inode_mut(ino).unwrap();
        inode.attrs.hardlinks += 1;
        inode.attrs.last_metadata_changed = now;
        inode.nlookup += 1;
        Ok(inode.attrs.clone())
    }

    pub fn unlink(&mut self, parent: u64, name: &str) -> Result<(), ErrorCode> {
        validate_name(name)?;
        let parent_dir = self.directory_of(parent)?;
        let child = parent_dir.get(name).ok_or(ErrorCode::DoesNotExist)?;
        if self.resolve(child)?.attrs.kind == FileKind::Directory {
            return Err(ErrorCode::IsDirectory);
        }

        let now = SystemTime::now();
        self.remove_child(parent, name, now);
        let inode = self.inode_mut(child).unwrap();
        inode.attrs.hardlinks -= 1;
        inode.attrs.last_metadata_changed = now;
        // Storage is reclaimed once the kernel drops its last reference
        Ok(())
    }

    pub fn rmdir(&mut self, parent: u64, name: &str) -> Result<(), ErrorCode> {
        validate_name(name)?;
        let parent_dir = self.directory_of(parent)?;
        let child = parent_dir.get(name).ok_or(ErrorCode::DoesNotExist)?;
        // Removing `.` is invalid
        if child == parent {
            return Err(ErrorCode::InvalidArgument);
        }
        let child_inode = self.resolve(child)?;
        match &child_inode.body {
            InodeBody::Directory(entries) => {
                // A non-empty directory cannot go; this also protects `..`
                if entries.has_real_entries() {
                    return Err(ErrorCode::NotEmpty);
                }
            }
            _ => return Err(ErrorCode::NotDirectory),
        }

        let now = SystemTime::now();
        self.remove_child(parent, name, now);
        self.inode_mut(parent).unwrap().attrs.hardlinks -= 1;
        let inode = self.inode_mut(child).unwrap();
        // Drive the removed directory's count to zero so forget can release it
        inode.attrs.hardlinks = 0;
        inode.attrs.last_metadata_changed = now;
        Ok(())
    }

    pub fn rename(
        &mut self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<(), ErrorCode> {
        validate_name(name)?;
        validate_name(new_name)?;
        if name == "." || name == ".." || new_name == "." || new_name == ".." {
            return Err(ErrorCode::InvalidArgument);
        }
        let src_ino = self
            .directory_of(parent)?
            .get(name)
            .ok_or(ErrorCode::DoesNotExist)?;
        let existing = self.directory_of(new_parent)?.get(new_name);
        if parent == new_parent && name == new_name {
            return Ok(());
        }
        if existing == Some(src_ino) {
            // Both names are hard links to the same inode; rename is a no-op
            return Ok(());
        }
        let src_kind = self.resolve(src_ino)?.attrs.kind;

        if src_kind == FileKind::Directory {
            // Moving a directory below itself would disconnect the subtree
            let mut current = new_parent;
            loop {
                if current == src_ino {
                    return Err(ErrorCode::InvalidArgument);
                }
                if current == ROOT_INODE {
                    break;
                }
                current = self
                    .directory_of(current)?
                    .get("..")
                    .ok_or(ErrorCode::InvalidArgument)?;
            }
        }

        if let Some(dst_ino) = existing {
            let dst = self.resolve(dst_ino)?;
            let dst_is_dir = dst.attrs.kind == FileKind::Directory;
            if src_kind == FileKind::Directory && !dst_is_dir {
                return Err(ErrorCode::NotDirectory);
            }
            if src_kind != FileKind::Directory && dst_is_dir {
                return Err(ErrorCode::IsDirectory);
            }
            if let InodeBody::Directory(entries) = &dst.body {
                if entries.has_real_entries() {
                    return Err(ErrorCode::NotEmpty);
                }
            }
        } else if self.grow_cost(new_parent, new_name) > self.free_blocks {
            return Err(ErrorCode::OutOfSpace);
        }

        // All checks passed; nothing below fails
        let now = SystemTime::now();
        if let Some(dst_ino) = existing {
            let dst = self.inode_mut(dst_ino).unwrap();
            let dst_is_dir = dst.attrs.kind == FileKind::Directory;
            if dst_is_dir {
                dst.attrs.hardlinks = 0;
            } else {
                dst.attrs.hardlinks -= 1;
            }
            dst.attrs.last_metadata_changed = now;
            if dst_is_dir {
                // The overwritten directory's `..` no longer pins the parent
                self.inode_mut(new_parent).unwrap().attrs.hardlinks -= 1;
            }
            let np = self.inode_mut(new_parent).unwrap();
            if let InodeBody::Directory(entries) = &mut np.body {
                entries.insert(new_name.to_string(), src_ino);
            }
            np.attrs.last_modified = now;
            np.attrs.last_metadata_changed = now;
        } else {
            self.insert_child(new_parent, new_name.to_string(), src_ino, now);
        }
        self.remove_child(parent, name, now);

        if src_kind == FileKind::Directory && parent != new_parent {
            let src = self.inode_mut(src_ino).unwrap();
            if let InodeBody::Directory(entries) = &mut src.body {
                entries.insert("..".to_string(), new_parent);
            }
            self.inode_mut(parent).unwrap().attrs.hardlinks -= 1;
            self.inode_mut(new_parent).unwrap().attrs.hardlinks += 1;
        }
        self.inode_mut(src_ino).unwrap().attrs.last_metadata_changed = now;
        Ok(())
    }

    pub fn read(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>, ErrorCode> {
        let inode = self.resolve_open(ino)?;
        match &inode.body {
            InodeBody::File(file) => Ok(file.read(inode.attrs.size, offset, size)),
            InodeBody::Directory(_) => Err(ErrorCode::IsDirectory),
            _ => Err(ErrorCode::InvalidArgument),
        }
    }

    pub fn write(&mut self, ino: u64, offset: u64, data: &[u8]) -> Result<u32, ErrorCode> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(ErrorCode::FileTooLarge)?;
        if end > MAX_FILE_SIZE {
            return Err(ErrorCode::FileTooLarge);
        }
        let grown = {
            let inode = self.resolve_open(ino)?;
            match &inode.body {
                InodeBody::File(_) => {}
                InodeBody::Directory(_) => return Err(ErrorCode::IsDirectory),
                _ => return Err(ErrorCode::InvalidArgument),
            }
            let grown = blocks_for(inode.attrs.size.max(end)).saturating_sub(inode.attrs.blocks());
            if grown > self.free_blocks {
                return Err(ErrorCode::OutOfSpace);
            }
            grown
        };

        let now = SystemTime::now();
        let inode = self.resolve_open_mut(ino)?;
        if let InodeBody::File(file) = &mut inode.body {
            file.write(offset, data);
        }
        inode.attrs.size = inode.attrs.size.max(end);
        inode.attrs.last_modified = now;
        inode.attrs.last_metadata_changed = now;
        self.free_blocks -= grown;
        Ok(data.len() as u32)
    }

    pub fn set_xattr(
        &mut self,
        ino: u64,
        key: &str,
        value: &[u8],
        flags: i32,
    ) -> Result<(), ErrorCode> {
        let inode = self.resolve_mut(ino)?;
        let exists = inode.xattrs.contains_key(key);
        if exists && flags & libc::XATTR_CREATE != 0 {
            return Err(ErrorCode::AlreadyExists);
        }
        if !exists && flags & libc::XATTR_REPLACE != 0 {
            return Err(ErrorCode::MissingXattrKey);
        }
        inode.xattrs.insert(key.to_string(), value.to_vec());
        inode.attrs.last_metadata_changed = SystemTime::now();
        Ok(())
    }

    pub fn get_xattr(&self, ino: u64, key: &str) -> Result<Vec<u8>, ErrorCode> {
        let inode = self.resolve(ino)?;
        inode
            .xattrs
            .get(key)
            .cloned()
            .ok_or(ErrorCode::MissingXattrKey)
    }

    pub fn list_xattrs(&self, ino: u64) -> Result<Vec<String>, ErrorCode> {
        let inode = self.resolve(ino)?;
        Ok(inode.xattrs.keys().cloned().collect())
    }

    pub fn remove_xattr(&mut self, ino: u64, key: &str) -> Result<(), ErrorCode> {
        let inode = self.resolve_mut(ino)?;
        if inode.xattrs.remove(key).is_none() {
            return Err(ErrorCode::MissingXattrKey);
        }
        inode.attrs.last_metadata_changed = SystemTime::now();
        Ok(())
    }

    pub fn access(&self, ino: u64, mask: i32, context: UserContext) -> Result<(), ErrorCode> {
        let attrs = &self.resolve(ino)?.attrs;
        if check_access(
            attrs.uid,
            attrs.gid,
            attrs.mode,
            context.uid(),
            context.gid(),
            mask,
        ) {
            Ok(())
        } else {
            Err(ErrorCode::AccessDenied)
        }
    }

    /// Returns up to `limit` directory entries in name order, resuming after
    /// the cursor name. Entries inserted or removed behind the cursor do not
    /// disturb what has already been yielded.
    pub fn directory_entries_after(
        &self,
        ino: u64,
        resume_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(u64, FileKind, String)>, ErrorCode> {
        let entries = self.directory_of(ino)?;
        let mut result = Vec::new();
        for (name, child) in entries.iter_after(resume_after) {
            if result.len() >= limit {
                break;
            }
            let Some(child_inode) = self.inode(child) else {
                continue;
            };
            result.push((child, child_inode.attrs.kind, name.clone()));
        }
        Ok(result)
    }

    pub fn statfs(&self) -> FilesystemStats {
        FilesystemStats {
            total_blocks: self.total_blocks,
            free_blocks: self.free_blocks,
            total_inodes: self.total_inodes,
            free_inodes: self.free_inodes,
            block_size: BLOCK_SIZE as u32,
            max_name_length: MAX_NAME_LENGTH,
        }
    }

    /// Drains kernel references. Accepted even for inodes that no longer
    /// resolve: the kernel may flush references after the last unlink, and
    /// this is the only path that releases storage.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        let Some(inode) = self.inode_mut(ino) else {
            return;
        };
        inode.nlookup = inode.nlookup.saturating_sub(nlookup);
        if inode.nlookup == 0 && inode.attrs.hardlinks == 0 {
            let freed = inode.attrs.blocks();
            self.slots[ino as usize] = None;
            self.deleted.push_back(ino);
            self.free_blocks += freed;
            self.free_inodes += 1;
        }
    }

    pub fn destroy(&mut self) {
        self.slots.clear();
        self.deleted.clear();
        self.free_blocks = self.total_blocks;
        self.free_inodes = self.total_inodes;
    }

    fn inode(&self, ino: u64) -> Option<&Inode> {
        self.slots.get(ino as usize).and_then(|slot| slot.as_ref())
    }

    fn inode_mut(&mut self, ino: u64) -> Option<&mut Inode> {
        self.slots
            .get_mut(ino as usize)
            .and_then(|slot| slot.as_mut())
    }

    fn resolve(&self, ino: u64) -> Result<&Inode, ErrorCode> {
        match self.inode(ino) {
            Some(inode) if inode.attrs.hardlinks > 0 => Ok(inode),
            _ => Err(ErrorCode::InodeDoesNotExist),
        }
    }

    fn resolve_mut(&mut self, ino: u64) -> Result<&mut Inode, ErrorCode> {
        match self.inode_mut(ino) {
            Some(inode) if inode.attrs.hardlinks > 0 => Ok(inode),
            _ => Err(ErrorCode::InodeDoesNotExist),
        }
    }

    // An unlinked inode stays usable through already-open handles until the
    // kernel sends its final forget.
    fn resolve_open(&self, ino: u64) -> Result<&Inode, ErrorCode> {
        match self.inode(ino) {
            Some(inode) if inode.attrs.hardlinks > 0 || inode.nlookup > 0 => Ok(inode),
            _ => Err(ErrorCode::InodeDoesNotExist),
        }
    }

    fn resolve_open_mut(&mut self, ino: u64) -> Result<&mut Inode, ErrorCode> {
        match self.inode_mut(ino) {
            Some(inode) if inode.attrs.hardlinks > 0 || inode.nlookup > 0 => Ok(inode),
            _ => Err(ErrorCode::InodeDoesNotExist),
        }
    }

    fn directory_of(&self, ino: u64) -> Result<&DirectoryEntries, ErrorCode> {
        match &self.resolve(ino)?.body {
            InodeBody::Directory(entries) => Ok(entries),
            _ => Err(ErrorCode::NotDirectory),
        }
    }

    // Blocks the directory would additionally occupy after gaining `name`.
    // Callers have already resolved `dir_ino` as a live directory.
    fn grow_cost(&self, dir_ino: u64, name: &str) -> u64 {
        let attrs = &self.inode(dir_ino).unwrap().attrs;
        blocks_for(attrs.size + directory_entry_size(name)) - attrs.blocks()
    }

    fn insert_child(&mut self, dir_ino: u64, name: String, child: u64, now: SystemTime) {
        let entry_size = directory_entry_size(&name);
        let inode = self.inode_mut(dir_ino).unwrap();
        let old_blocks = inode.attrs.blocks();
        if let InodeBody::Directory(entries) = &mut inode.body {
            entries.insert(name, child);
        }
        inode.attrs.size += entry_size;
        inode.attrs.last_modified = now;
        inode.attrs.last_metadata_changed = now;
        let grown = inode.attrs.blocks() - old_blocks;
        self.free_blocks -= grown;
    }

    fn remove_child(&mut self, dir_ino: u64, name: &str, now: SystemTime) -> Option<u64> {
        let entry_size = directory_entry_size(name);
        let inode = self.inode_mut(dir_ino).unwrap();
        let old_blocks = inode.attrs.blocks();
        let removed = if let InodeBody::Directory(entries) = &mut inode.body {
            entries.remove(name)
        } else {
            None
        };
        if removed.is_some() {
            inode.attrs.size = inode.attrs.size.saturating_sub(entry_size);
            inode.attrs.last_modified = now;
            inode.attrs.last_metadata_changed = now;
            let freed = old_blocks - inode.attrs.blocks();
            self.free_blocks += freed;
        }
        removed
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        body: InodeBody,
        kind: FileKind,
        mode: u16,
        nlink: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
        now: SystemTime,
    ) -> u64 {
        // Reuse a tombstoned slot before growing the table
        let ino = match self.deleted.pop_front() {
            Some(reclaimed) => reclaimed,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u64
            }
        };
        let size = match &body {
            InodeBody::Symlink { target } => target.len() as u64,
            InodeBody::Directory(_) => directory_base_size(),
            _ => 0,
        };
        let attrs = InodeAttributes {
            inode: ino,
            size,
            last_accessed: now,
            last_modified: now,
            last_metadata_changed: now,
            creation_time: now,
            kind,
            mode,
            hardlinks: nlink,
            uid,
            gid,
            rdev,
        };
        self.slots[ino as usize] = Some(Inode {
            attrs,
            nlookup: 0,
            xattrs: BTreeMap::new(),
            body,
        });
        self.free_inodes -= 1;
        self.free_blocks -= blocks_for(size);
        ino
    }
}

fn validate_name(name: &str) -> Result<(), ErrorCode> {
    if name.len() > MAX_NAME_LENGTH as usize {
        return Err(ErrorCode::NameTooLong);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> UserContext {
        UserContext::new(1000, 1000)
    }

    fn test_table() -> InodeTable {
        InodeTable::new(1024, 64, 1000, 1000)
    }

    fn hardlinks(table: &InodeTable, ino: u64) -> u32 {
        table.inode(ino).unwrap().attrs.hardlinks
    }

    #[test]
    fn root_is_initialized() {
        let table = test_table();
        let root = table.getattr(ROOT_INODE, false).unwrap();
        assert_eq!(root.kind, FileKind::Directory);
        assert_eq!(root.mode, 0o777);
        assert_eq!(root.hardlinks, 3);
        assert_eq!(table.directory_of(ROOT_INODE).unwrap().get("."), Some(ROOT_INODE));
        assert_eq!(table.directory_of(ROOT_INODE).unwrap().get(".."), Some(ROOT_INODE));
    }

    #[test]
    fn reserved_slot_zero_never_resolves() {
        let table = test_table();
        assert_eq!(
            table.getattr(0, false).unwrap_err(),
            ErrorCode::InodeDoesNotExist
        );
    }

    #[test]
    fn create_write_read_unlink_rmdir() {
        let mut table = test_table();
        let dir = table
            .create_node(ROOT_INODE, "a", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        let file = table
            .create_node(dir.inode, "f", FileKind::File, 0o644, context(), 0)
            .unwrap();
        assert_eq!(table.write(file.inode, 0, b"hello").unwrap(), 5);
        assert_eq!(table.read(file.inode, 0, 5).unwrap(), b"hello");

        table.unlink(dir.inode, "f").unwrap();
        assert_eq!(
            table.lookup(dir.inode, "f", context()).unwrap_err(),
            ErrorCode::DoesNotExist
        );
        table.forget(file.inode, 1);

        table.rmdir(ROOT_INODE, "a").unwrap();
        assert_eq!(
            table.lookup(ROOT_INODE, "a", context()).unwrap_err(),
            ErrorCode::DoesNotExist
        );
        table.forget(dir.inode, 1);
    }

    #[test]
    fn unlinked_file_stays_readable_until_forgotten() {
        let mut table = test_table();
        let initial_free = table.statfs().free_blocks;
        let file = table
            .create_node(ROOT_INODE, "f", FileKind::File, 0o644, context(), 0)
            .unwrap();
        table.write(file.inode, 0, b"X").unwrap();
        table.unlink(ROOT_INODE, "f").unwrap();

        // The kernel still holds a dentry reference; open handles keep working
        assert_eq!(table.read(file.inode, 0, 1).unwrap(), b"X");
        assert_eq!(table.write(file.inode, 1, b"Y").unwrap(), 1);
        // but the inode no longer resolves by name-surface operations
        assert_eq!(
            table.getattr(file.inode, false).unwrap_err(),
            ErrorCode::InodeDoesNotExist
        );
        assert_eq!(table.getattr(file.inode, true).unwrap().size, 2);

        table.forget(file.inode, 1);
        assert_eq!(
            table.read(file.inode, 0, 1).unwrap_err(),
            ErrorCode::InodeDoesNotExist
        );
        assert_eq!(table.statfs().free_blocks, initial_free);
    }

    #[test]
    fn rename_overwrites_existing_target() {
        let mut table = test_table();
        let a = table
            .create_node(ROOT_INODE, "a", FileKind::File, 0o644, context(), 0)
            .unwrap();
        let b = table
            .create_node(ROOT_INODE, "b", FileKind::File, 0o644, context(), 0)
            .unwrap();
        table.write(a.inode, 0, b"A").unwrap();

        table.rename(ROOT_INODE, "a", ROOT_INODE, "b").unwrap();
        assert_eq!(
            table.lookup(ROOT_INODE, "a", context()).unwrap_err(),
            ErrorCode::DoesNotExist
        );
        let renamed = table.lookup(ROOT_INODE, "b", context()).unwrap();
        assert_eq!(renamed.inode, a.inode);
        assert_eq!(table.read(a.inode, 0, 1).unwrap(), b"A");

        // The overwritten inode lost its last link and releases on forget
        assert_eq!(hardlinks(&table, b.inode), 0);
        table.forget(b.inode, 1);
        assert!(table.inode(b.inode).is_none());
    }

    #[test]
    fn rename_to_same_entry_is_a_noop() {
        let mut table = test_table();
        let a = table
            .create_node(ROOT_INODE, "a", FileKind::File, 0o644, context(), 0)
            .unwrap();
        table.rename(ROOT_INODE, "a", ROOT_INODE, "a").unwrap();
        assert_eq!(table.lookup(ROOT_INODE, "a", context()).unwrap().inode, a.inode);

        // Hard links to the same inode are also left alone
        table.hardlink(a.inode, ROOT_INODE, "b").unwrap();
        table.rename(ROOT_INODE, "a", ROOT_INODE, "b").unwrap();
        assert_eq!(table.lookup(ROOT_INODE, "a", context()).unwrap().inode, a.inode);
        assert_eq!(table.lookup(ROOT_INODE, "b", context()).unwrap().inode, a.inode);
    }

    #[test]
    fn rename_directory_between_parents_moves_the_link() {
        let mut table = test_table();
        let d1 = table
            .create_node(ROOT_INODE, "d1", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        let d2 = table
            .create_node(ROOT_INODE, "d2", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        let child = table
            .create_node(d1.inode, "c", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        assert_eq!(hardlinks(&table, d1.inode), 3);

        table.rename(d1.inode, "c", d2.inode, "c").unwrap();
        assert_eq!(hardlinks(&table, d1.inode), 2);
        assert_eq!(hardlinks(&table, d2.inode), 3);
        assert_eq!(
            table.directory_of(child.inode).unwrap().get(".."),
            Some(d2.inode)
        );
        assert_eq!(table.lookup(d2.inode, "c", context()).unwrap().inode, child.inode);
    }

    #[test]
    fn rename_into_own_subtree_is_rejected() {
        let mut table = test_table();
        let a = table
            .create_node(ROOT_INODE, "a", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        let b = table
            .create_node(a.inode, "b", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        assert_eq!(
            table.rename(ROOT_INODE, "a", b.inode, "c").unwrap_err(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            table.rename(ROOT_INODE, "a", a.inode, "c").unwrap_err(),
            ErrorCode::InvalidArgument
        );
        // Moving it elsewhere still works
        table.rename(a.inode, "b", ROOT_INODE, "b").unwrap();
        assert_eq!(table.lookup(ROOT_INODE, "b", context()).unwrap().inode, b.inode);
    }

    #[test]
    fn rename_type_mismatches() {
        let mut table = test_table();
        let _dir = table
            .create_node(ROOT_INODE, "d", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        let _file = table
            .create_node(ROOT_INODE, "f", FileKind::File, 0o644, context(), 0)
            .unwrap();
        assert_eq!(
            table.rename(ROOT_INODE, "d", ROOT_INODE, "f").unwrap_err(),
            ErrorCode::NotDirectory
        );
        assert_eq!(
            table.rename(ROOT_INODE, "f", ROOT_INODE, "d").unwrap_err(),
            ErrorCode::IsDirectory
        );
    }

    #[test]
    fn rename_over_non_empty_directory_is_rejected() {
        let mut table = test_table();
        let src = table
            .create_node(ROOT_INODE, "src", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        let dst = table
            .create_node(ROOT_INODE, "dst", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        table
            .create_node(dst.inode, "x", FileKind::File, 0o644, context(), 0)
            .unwrap();
        assert_eq!(
            table.rename(ROOT_INODE, "src", ROOT_INODE, "dst").unwrap_err(),
            ErrorCode::NotEmpty
        );
        table.unlink(dst.inode, "x").unwrap();
        table.rename(ROOT_INODE, "src", ROOT_INODE, "dst").unwrap();
        assert_eq!(hardlinks(&table, dst.inode), 0);
        assert_eq!(table.lookup(ROOT_INODE, "dst", context()).unwrap().inode, src.inode);
        // Root lost the overwritten subdirectory but kept the moved one
        assert_eq!(hardlinks(&table, ROOT_INODE), 4);
    }

    #[test]
    fn rmdir_refuses_non_empty_directories() {
        let mut table = test_table();
        let dir = table
            .create_node(ROOT_INODE, "d", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        table
            .create_node(dir.inode, "x", FileKind::File, 0o644, context(), 0)
            .unwrap();
        assert_eq!(
            table.rmdir(ROOT_INODE, "d").unwrap_err(),
            ErrorCode::NotEmpty
        );
        table.unlink(dir.inode, "x").unwrap();
        table.rmdir(ROOT_INODE, "d").unwrap();
    }

    #[test]
    fn rmdir_dot_is_invalid() {
        let mut table = test_table();
        let dir = table
            .create_node(ROOT_INODE, "d", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        assert_eq!(
            table.rmdir(dir.inode, ".").unwrap_err(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn directory_link_counts_follow_subdirectories() {
        let mut table = test_table();
        assert_eq!(hardlinks(&table, ROOT_INODE), 3);
        let dir = table
            .create_node(ROOT_INODE, "d", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        assert_eq!(hardlinks(&table, ROOT_INODE), 4);
        assert_eq!(hardlinks(&table, dir.inode), 2);
        let sub = table
            .create_node(dir.inode, "s", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        assert_eq!(hardlinks(&table, dir.inode), 3);
        table.rmdir(dir.inode, "s").unwrap();
        assert_eq!(hardlinks(&table, dir.inode), 2);
        table.forget(sub.inode, 1);
        table.rmdir(ROOT_INODE, "d").unwrap();
        assert_eq!(hardlinks(&table, ROOT_INODE), 3);
    }

    #[test]
    fn hardlinked_file_survives_unlink_of_either_name() {
        let mut table = test_table();
        let a = table
            .create_node(ROOT_INODE, "a", FileKind::File, 0o644, context(), 0)
            .unwrap();
        table.write(a.inode, 0, b"Z").unwrap();
        let linked = table.hardlink(a.inode, ROOT_INODE, "b").unwrap();
        assert_eq!(linked.inode, a.inode);
        assert_eq!(linked.hardlinks, 2);
        assert_eq!(table.lookup(ROOT_INODE, "b", context()).unwrap().hardlinks, 2);

        table.unlink(ROOT_INODE, "a").unwrap();
        assert_eq!(table.read(a.inode, 0, 1).unwrap(), b"Z");
        assert_eq!(table.getattr(a.inode, false).unwrap().hardlinks, 1);
    }

    #[test]
    fn hardlink_to_directory_is_rejected() {
        let mut table = test_table();
        let dir = table
            .create_node(ROOT_INODE, "d", FileKind::Directory, 0o755, context(), 0)
            .unwrap();
        assert_eq!(
            table.hardlink(dir.inode, ROOT_INODE, "d2").unwrap_err(),
            ErrorCode::OperationNotPermitted
        );
    }

    #[test]
    fn symlink_round_trip() {
        let mut table = test_table();
        let link = table
            .symlink(ROOT_INODE, "s", "/tmp/x", context())
            .unwrap();
        assert_eq!(link.kind, FileKind::Symlink);
        assert_eq!(link.size, 6);
        assert_eq!(link.mode, 0o777);
        assert_eq!(table.readlink(link.inode).unwrap(), b"/tmp/x");
        assert_eq!(
            table.readlink(ROOT_INODE).unwrap_err(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn slots_are_reclaimed_in_fifo_order() {
        let mut table = test_table();
        let first = table
            .create_node(ROOT_INODE, "f1", FileKind::File, 0o644, context(), 0)
            .unwrap();
        let second = table
            .create_node(ROOT_INODE, "f2", FileKind::File, 0o644, context(), 0)
            .unwrap();
        table.unlink(ROOT_INODE, "f1").unwrap();
        table.unlink(ROOT_INODE, "f2").unwrap();
        table.forget(first.inode, 1);
        table.forget(second.inode, 1);

        // Stale numbers stay dead until the slot is reoccupied
        assert_eq!(
            table.getattr(first.inode, false).unwrap_err(),
            ErrorCode::InodeDoesNotExist
        );

        let reused = table
            .create_node(ROOT_INODE, "g1", FileKind::File, 0o644, context(), 0)
            .unwrap();
        assert_eq!(reused.inode, first.inode);
        let reused = table
            .create_node(ROOT_INODE, "g2", FileKind::File, 0o644, context(), 0)
            .unwrap();
        assert_eq!(reused.inode, second.inode);
    }

    #[test]
    fn block_accounting_round_trips() {
        let mut table = test_table();
        let initial = table.statfs().free_blocks;
        let file = table
            .create_node(ROOT_INODE, "f", FileKind::File, 0o644, context(), 0)
            .unwrap();
        table
            .write(file.inode, 0, &vec![7u8; 3 * BLOCK_SIZE as usize])
            .unwrap();
        assert_eq!(table.statfs().free_blocks, initial - 3);

        table
            .truncate(file.inode, BLOCK_SIZE, context(), false)
            .unwrap();
        assert_eq!(table.statfs().free_blocks, initial - 1);

        table.unlink(ROOT_INODE, "f").unwrap();
        table.forget(file.inode, 1);
        assert_eq!(table.statfs().free_blocks, initial);
    }

    #[test]
    fn write_fails_with_no_space_before_mutating() {
        let mut table = InodeTable::new(2, 8, 1000, 1000);
        let file = table
            .create_node(ROOT_INODE, "f", FileKind::File, 0o644, context(), 0)
            .unwrap();
        // Root occupies one block; only one remains
        assert_eq!(
            table
                .write(file.inode, 0, &vec![1u8; 2 * BLOCK_SIZE as usize])
                .unwrap_err(),
            ErrorCode::OutOfSpace
        );
        assert_eq!(table.getattr(file.inode, false).unwrap().size, 0);
        table
            .write(file.inode, 0, &vec![1u8; BLOCK_SIZE as usize])
            .unwrap();
    }

    #[test]
    fn registration_fails_when_inodes_run_out() {
        let mut table = InodeTable::new(64, 3, 1000, 1000);
        table
            .create_node(ROOT_INODE, "a", FileKind::File, 0o644, context(), 0)
            .unwrap();
        assert_eq!(
            table
                .create_node(ROOT_INODE, "b", FileKind::File, 0o644, context(), 0)
                .unwrap_err(),
            ErrorCode::OutOfSpace
        );
        assert_eq!(
            table.lookup(ROOT_INODE, "b", context()).unwrap_err(),
            ErrorCode::DoesNotExist
        );
    }

    #[test]
    fn mknod_of_unsupported_kinds_is_rejected() {
        let mut table = test_table();
        assert_eq!(
            table
                .create_node(ROOT_INODE, "c", FileKind::Special, 0o644, context(), 0)
                .unwrap_err(),
            ErrorCode::DoesNotExist
        );
        assert_eq!(
            table
                .create_node(ROOT_INODE, "s", FileKind::Symlink, 0o644, context(), 0)
                .unwrap_err(),
            ErrorCode::DoesNotExist
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut table = test_table();
        table
            .create_node(ROOT_INODE, "f", FileKind::File, 0o644, context(), 0)
            .unwrap();
        assert_eq!(
            table
                .create_node(ROOT_INODE, "f", FileKind::File, 0o644, context(), 0)
                .unwrap_err(),
            ErrorCode::AlreadyExists
        );
        assert_eq!(
            table.symlink(ROOT_INODE, "f", "/x", context()).unwrap_err(),
            ErrorCode::AlreadyExists
        );
    }

    #[test]
    fn names_longer_than_the_limit_are_rejected() {
        let mut table = test_table();
        let long = "x".repeat(MAX_NAME_LENGTH as usize + 1);
        assert_eq!(
            table.lookup(ROOT_INODE, &long, context()).unwrap_err(),
            ErrorCode::NameTooLong
        );
        assert_eq!(
            table
                .create_node(ROOT_INODE, &long, FileKind::File, 0o644, context(), 0)
                .unwrap_err(),
            ErrorCode::NameTooLong
        );
    }

    #[test]
    fn write_to_directory_is_rejected() {
        let mut table = test_table();
        assert_eq!(
            table.write(ROOT_INODE, 0, b"x").unwrap_err(),
            ErrorCode::IsDirectory
        );
        assert_eq!(
            table.read(ROOT_INODE, 0, 1).unwrap_err(),
            ErrorCode::IsDirectory
        );
    }

    #[test]
    fn readdir_pages_through_a_large_directory() {
        let mut table = InodeTable::new(16384, 4096, 1000, 1000);
        let mut expected = vec![".".to_string(), "..".to_string()];
        for i in 0..1000 {
            let name = format!("f{i:04}");
            table
                .create_node(ROOT_INODE, &name, FileKind::File, 0o644, context(), 0)
                .unwrap();
            expected.push(name);
        }
        expected.sort();

        let mut seen = vec![];
        let mut cursor: Option<String> = None;
        let mut calls = 0;
        loop {
            let page = table
                .directory_entries_after(ROOT_INODE, cursor.as_deref(), 50)
                .unwrap();
            calls += 1;
            if page.is_empty() {
                break;
            }
            cursor = Some(page.last().unwrap().2.clone());
            seen.extend(page.into_iter().map(|(_, _, name)| name));
        }
        assert_eq!(seen, expected);
        assert!(calls <= 1002 / 50 + 2);
    }

    #[test]
    fn readdir_cursor_survives_concurrent_mutation() {
        let mut table = test_table();
        for name in ["b", "d", "f"] {
            table
                .create_node(ROOT_INODE, name, FileKind::File, 0o644, context(), 0)
                .unwrap();
        }
        let first = table
            .directory_entries_after(ROOT_INODE, None, 3)
            .unwrap();
        let names: Vec<&str> = first.iter().map(|(_, _, name)| name.as_str()).collect();
        assert_eq!(names, [".", "..", "b"]);

        // Mutations behind and ahead of the cursor don't disturb resumption
        table.unlink(ROOT_INODE, "b").unwrap();
        table
            .create_node(ROOT_INODE, "a", FileKind::File, 0o644, context(), 0)
            .unwrap();
        table
            .create_node(ROOT_INODE, "e", FileKind::File, 0o644, context(), 0)
            .unwrap();
        let rest = table
            .directory_entries_after(ROOT_INODE, Some("b"), 10)
            .unwrap();
        let names: Vec<&str> = rest.iter().map(|(_, _, name)| name.as_str()).collect();
        assert_eq!(names, ["d", "e", "f"]);
    }

    #[test]
    fn xattr_flag_matrix() {
        let mut table = test_table();
        let file = table
            .create_node(ROOT_INODE, "f", FileKind::File, 0o644, context(), 0)
            .unwrap();
        assert_eq!(
            table
                .set_xattr(file.inode, "user.a", b"1", libc::XATTR_REPLACE)
                .unwrap_err(),
            ErrorCode::MissingXattrKey
        );
        table.set_xattr(file.inode, "user.a", b"1", 0).unwrap();
        assert_eq!(
            table
                .set_xattr(file.inode, "user.a", b"2", libc::XATTR_CREATE)
                .unwrap_err(),
            ErrorCode::AlreadyExists
        );
        table
            .set_xattr(file.inode, "user.a", b"2", libc::XATTR_REPLACE)
            .unwrap();
        assert_eq!(table.get_xattr(file.inode, "user.a").unwrap(), b"2");

        table.set_xattr(file.inode, "user.b", b"3", 0).unwrap();
        assert_eq!(
            table.list_xattrs(file.inode).unwrap(),
            vec!["user.a".to_string(), "user.b".to_string()]
        );

        table.remove_xattr(file.inode, "user.a").unwrap();
        assert_eq!(
            table.remove_xattr(file.inode, "user.a").unwrap_err(),
            ErrorCode::MissingXattrKey
        );
        assert_eq!(
            table.get_xattr(file.inode, "user.a").unwrap_err(),
            ErrorCode::MissingXattrKey
        );
    }

    #[test]
    fn access_checks_mode_bits() {
        let mut table = test_table();
        let file = table
            .create_node(ROOT_INODE, "f", FileKind::File, 0o640, context(), 0)
            .unwrap();
        table.access(file.inode, libc::R_OK, context()).unwrap();
        assert_eq!(
            table
                .access(file.inode, libc::R_OK, UserContext::new(2000, 2000))
                .unwrap_err(),
            ErrorCode::AccessDenied
        );
        // F_OK only requires existence
        table
            .access(file.inode, libc::F_OK, UserContext::new(2000, 2000))
            .unwrap();
    }

    #[test]
    fn chmod_is_restricted_to_the_owner() {
        let mut table = test_table();
        let file = table
            .create_node(ROOT_INODE, "f", FileKind::File, 0o644, context(), 0)
            .unwrap();
        assert_eq!(
            table
                .chmod(file.inode, 0o600, UserContext::new(2000, 2000))
                .unwrap_err(),
            ErrorCode::OperationNotPermitted
        );
        table.chmod(file.inode, 0o600, context()).unwrap();
        assert_eq!(table.getattr(file.inode, false).unwrap().mode, 0o600);
        // root can always chmod
        table.chmod(file.inode, 0o644, UserContext::new(0, 0)).unwrap();
    }

    #[test]
    fn truncate_extends_with_zeros() {
        let mut table = test_table();
        let file = table
            .create_node(ROOT_INODE, "f", FileKind::File, 0o644, context(), 0)
            .unwrap();
        table.write(file.inode, 0, b"abc").unwrap();
        table.truncate(file.inode, 10, context(), false).unwrap();
        let data = table.read(file.inode, 0, 10).unwrap();
        assert_eq!(&data[..3], b"abc");
        assert_eq!(&data[3..], &[0u8; 7][..]);
    }

    #[test]
    fn lookup_bumps_the_kernel_reference_count() {
        let mut table = test_table();
        let file = table
            .create_node(ROOT_INODE, "f", FileKind::File, 0o644, context(), 0)
            .unwrap();
        assert_eq!(table.inode(file.inode).unwrap().nlookup, 1);
        table.lookup(ROOT_INODE, "f", context()).unwrap();
        table.lookup(ROOT_INODE, "f", context()).unwrap();
        assert_eq!(table.inode(file.inode).unwrap().nlookup, 3);

        table.unlink(ROOT_INODE, "f").unwrap();
        table.forget(file.inode, 2);
        // Still referenced; the slot survives
        assert!(table.inode(file.inode).is_some());
        table.forget(file.inode, 1);
        assert!(table.inode(file.inode).is_none());
    }

    #[test]
    fn destroy_releases_everything() {
        let mut table = test_table();
        let file = table
            .create_node(ROOT_INODE, "f", FileKind::File, 0o644, context(), 0)
            .unwrap();
        table
            .write(file.inode, 0, &vec![1u8; BLOCK_SIZE as usize])
            .unwrap();
        table.destroy();
        let stats = table.statfs();
        assert_eq!(stats.free_blocks, stats.total_blocks);
        assert_eq!(stats.free_inodes, stats.total_inodes);
    }
}
