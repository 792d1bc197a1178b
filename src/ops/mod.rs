use log::warn;

use crate::consts::{BlockNo, InodeNo, BLOCK_SIZE, MAX_NAME_LEN, SECTORS_PER_BLOCK};
use crate::device::BlockDevice;
use crate::structure::blockmap;
use crate::structure::inode::Inode;
use crate::structure::Volume;
use crate::util::error::{FsError, FsResult};
use crate::util::mode::{
    ModeBits, ModeBitsHelper, PERMISSIONS_MASK, SET_GID, SET_UID, TYPE_DIRECTORY, TYPE_MASK,
    TYPE_SYMLINK,
};
use crate::util::time::now;

pub mod access;
pub mod directory;
pub mod path;

use access::{check_access, sticky_allows_delete, Credentials, EXEC, READ, WRITE};

/// Attributes returned by `getattr`/`readdir`.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub inode: InodeNo,
    pub mode: ModeBits,
    pub links_count: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub blocks: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl FileStat {
    fn from_inode(inode_num: InodeNo, inode: &Inode) -> FileStat {
        FileStat {
            inode: inode_num,
            mode: inode.mode,
            links_count: inode.links_count,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            blocks: inode.blocks,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks: u32,
    pub free_blocks: u32,
    pub inodes: u32,
    pub free_inodes: u32,
    pub name_max: u32,
}

/// How `utimens` sets one timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetTime {
    Now,
    At(u32),
    Omit,
}

/// The operation layer: one path-addressed entry point per filesystem
/// operation, each running to completion against the volume and flushing
/// the superblock and GDT when it mutated them.
pub struct SpanFs<D: BlockDevice> {
    pub volume: Volume<D>,
}

impl<D: BlockDevice> SpanFs<D> {
    pub fn mount(device: D) -> FsResult<SpanFs<D>> {
        Ok(SpanFs { volume: Volume::mount(device)? })
    }

    fn resolve(&self, caller: &Credentials, path: &str, follow_last: bool) -> FsResult<InodeNo> {
        path::resolve(&self.volume, caller, path, follow_last)
    }

    /// Parent directory of `path`, checked to be a directory the caller may
    /// modify, plus the validated final name.
    fn locate_parent(
        &self,
        caller: &Credentials,
        path: &str,
    ) -> FsResult<(InodeNo, Inode, String)> {
        let (dirname, basename) = path::split_parent(path);
        if basename.is_empty() || basename == "." || basename == ".." || basename == "/" {
            return Err(FsError::InvalidArgument);
        }
        if basename.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        let parent_num = self.resolve(caller, &dirname, true)?;
        let parent = self.volume.read_inode(parent_num)?;
        if !parent.is_directory() {
            return Err(FsError::NotDirectory);
        }
        check_access(caller, &parent, WRITE | EXEC)?;
        Ok((parent_num, parent, basename))
    }

    fn ensure_absent(&self, caller: &Credentials, path: &str) -> FsResult<()> {
        match self.resolve(caller, path, false) {
            Ok(_) => Err(FsError::Exists),
            Err(FsError::NoEntry) => Ok(()),
            Err(error) => Err(error),
        }
    }

    pub fn getattr(&self, caller: &Credentials, path: &str) -> FsResult<FileStat> {
        let inode_num = self.resolve(caller, path, false)?;
        let inode = self.volume.read_inode(inode_num)?;
        Ok(FileStat::from_inode(inode_num, &inode))
    }

    pub fn readdir(&self, caller: &Credentials, path: &str) -> FsResult<Vec<directory::DirEntry>> {
        let inode_num = self.resolve(caller, path, true)?;
        let inode = self.volume.read_inode(inode_num)?;
        if !inode.is_directory() {
            return Err(FsError::NotDirectory);
        }
        check_access(caller, &inode, READ | EXEC)?;
        directory::entries(&self.volume, &inode)
    }

    pub fn mknod(&mut self, caller: &Credentials, path: &str, mode: ModeBits) -> FsResult<()> {
        if !mode.is_regular() && !mode.is_fifo() {
            return Err(FsError::Permission);
        }
        let (parent_num, mut parent, name) = self.locate_parent(caller, path)?;
        self.ensure_absent(caller, path)?;

        let inode_num = self.volume.alloc_inode(mode)?;
        let timestamp = now();
        let inode = Inode {
            mode,
            uid: caller.uid as u16,
            gid: caller.gid as u16,
            links_count: 1,
            atime: timestamp,
            ctime: timestamp,
            mtime: timestamp,
            ..Inode::default()
        };
        if let Err(error) = self.volume.write_inode(inode_num, &inode) {
            self.volume.free_inode(inode_num, mode);
            return Err(error);
        }

        if let Err(error) = directory::add_entry(
            &mut self.volume,
            &mut parent,
            parent_num,
            name.as_bytes(),
            inode_num,
            mode.file_type_nibble(),
        ) {
            self.discard_new_inode(inode_num, inode);
            return Err(error);
        }
        self.volume.flush_metadata()?;
        Ok(())
    }

    pub fn mkdir(&mut self, caller: &Credentials, path: &str, mode: ModeBits) -> FsResult<()> {
        let mode = TYPE_DIRECTORY | (mode & PERMISSIONS_MASK);
        let (parent_num, mut parent, name) = self.locate_parent(caller, path)?;
        self.ensure_absent(caller, path)?;

        let inode_num = self.volume.alloc_inode(mode)?;
        let data_block = match self.volume.alloc_block(self.volume.preferred_group(inode_num)) {
            Ok(block) => block,
            Err(error) => {
                self.volume.free_inode(inode_num, mode);
                return Err(error);
            }
        };

        let buffer = directory::new_dir_block(inode_num, parent_num, mode.file_type_nibble());
        if let Err(error) = self.volume.write_block(data_block, &buffer) {
            self.volume.free_block(data_block);
            self.volume.free_inode(inode_num, mode);
            return Err(error);
        }

        let timestamp = now();
        let mut inode = Inode {
            mode,
            uid: caller.uid as u16,
            gid: caller.gid as u16,
            links_count: 2, // `.` plus the entry in the parent
            size: BLOCK_SIZE as u32,
            blocks: SECTORS_PER_BLOCK,
            atime: timestamp,
            ctime: timestamp,
            mtime: timestamp,
            ..Inode::default()
        };
        inode.block[0] = data_block;
        if let Err(error) = self.volume.write_inode(inode_num, &inode) {
            self.volume.free_block(data_block);
            self.volume.free_inode(inode_num, mode);
            return Err(error);
        }

        if let Err(error) = directory::add_entry(
            &mut self.volume,
            &mut parent,
            parent_num,
            name.as_bytes(),
            inode_num,
            mode.file_type_nibble(),
        ) {
            self.volume.free_block(data_block);
            self.discard_new_inode(inode_num, inode);
            return Err(error);
        }

        // the new `..` entry references the parent
        parent.links_count += 1;
        parent.mtime = now();
        parent.ctime = parent.mtime;
        if self.volume.write_inode(parent_num, &parent).is_err() {
            warn!("mkdir: failed to persist parent link count for inode {}", parent_num);
        }
        self.volume.flush_metadata()?;
        Ok(())
    }

    /// Shared rollback for creation paths that already wrote the new inode:
    /// mark it deleted, then return it to the allocator.
    fn discard_new_inode(&mut self, inode_num: InodeNo, mut inode: Inode) {
        inode.links_count = 0;
        inode.dtime = now();
        if self.volume.write_inode(inode_num, &inode).is_err() {
            warn!("failed to mark discarded inode {} as deleted", inode_num);
        }
        self.volume.free_inode(inode_num, inode.mode);
    }

    pub fn unlink(&mut self, caller: &Credentials, path: &str) -> FsResult<()> {
        let (parent_num, mut parent, name) = self.locate_parent(caller, path)?;
        let target_num = self.resolve(caller, path, false)?;
        let mut target = self.volume.read_inode(target_num)?;

        if !sticky_allows_delete(caller, &parent, &target) {
            return Err(FsError::AccessDenied);
        }
        if target.is_directory() {
            return Err(FsError::IsDirectory);
        }

        directory::remove_entry(&mut self.volume, &mut parent, parent_num, name.as_bytes())?;

        target.links_count -= 1;
        target.ctime = now();
        if target.links_count == 0 {
            // fast symlinks keep their target inline; there are no blocks to
            // release for them
            if !target.is_fast_symlink() {
                blockmap::free_all(&mut self.volume, &mut target);
            }
            target.size = 0;
            target.dtime = now();
            if self.volume.write_inode(target_num, &target).is_err() {
                warn!("unlink: failed to persist freed inode {}", target_num);
            }
            self.volume.free_inode(target_num, target.mode);
        } else {
            self.volume.write_inode(target_num, &target)?;
        }
        self.volume.flush_metadata()?;
        Ok(())
    }

    pub fn rmdir(&mut self, caller: &Credentials, path: &str) -> FsResult<()> {
        let (parent_num, mut parent, name) = self.locate_parent(caller, path)?;
        let target_num = self.resolve(caller, path, false)?;
        let mut target = self.volume.read_inode(target_num)?;

        if !sticky_allows_delete(caller, &parent, &target) {
            return Err(FsError::AccessDenied);
        }
        if !target.is_directory() {
            return Err(FsError::NotDirectory);
        }
        if !directory::is_empty(&self.volume, &target)? {
            return Err(FsError::NotEmpty);
        }

        directory::remove_entry(&mut self.volume, &mut parent, parent_num, name.as_bytes())?;

        // the removed directory's `..` no longer references the parent
        parent.links_count -= 1;
        parent.mtime = now();
        parent.ctime = parent.mtime;
        if self.volume.write_inode(parent_num, &parent).is_err() {
            warn!("rmdir: failed to persist parent link count for inode {}", parent_num);
        }

        blockmap::free_all(&mut self.volume, &mut target);
        let mode = target.mode;
        target.links_count = 0;
        target.size = 0;
        target.dtime = now();
        if self.volume.write_inode(target_num, &target).is_err() {
            warn!("rmdir: failed to persist freed inode {}", target_num);
        }
        self.volume.free_inode(target_num, mode);
        self.volume.flush_metadata()?;
        Ok(())
    }

    pub fn read(
        &mut self,
        caller: &Credentials,
        path: &str,
        size: usize,
        offset: u64,
    ) -> FsResult<Vec<u8>> {
        let inode_num = self.resolve(caller, path, true)?;
        let mut inode = self.volume.read_inode(inode_num)?;
        if inode.is_directory() {
            return Err(FsError::IsDirectory);
        }
        check_access(caller, &inode, READ)?;

        let file_size = inode.size as u64;
        if offset >= file_size {
            return Ok(Vec::new());
        }
        let size = size.min((file_size - offset) as usize);
        let mut data = Vec::with_capacity(size);

        while data.len() < size {
            let position = offset + data.len() as u64;
            let lbn = (position / BLOCK_SIZE as u64) as u32;
            let offset_in_block = (position % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - offset_in_block).min(size - data.len());

            let block = blockmap::map_block(&self.volume, &inode, lbn)?;
            if block == 0 {
                // a hole reads as zeros
                data.resize(data.len() + chunk, 0);
                continue;
            }
            let buffer = self.volume.read_block(block)?;
            data.extend_from_slice(&buffer[offset_in_block..offset_in_block + chunk]);
        }

        inode.atime = now();
        if self.volume.write_inode(inode_num, &inode).is_err() {
            warn!("read: failed to update atime of inode {}", inode_num);
        }
        Ok(data)
    }

    /// Returns the number of bytes persisted; on an I/O failure after
    /// partial progress, the bytes already written are kept and reported.
    pub fn write(
        &mut self,
        caller: &Credentials,
        path: &str,
        data: &[u8],
        offset: u64,
    ) -> FsResult<usize> {
        let inode_num = self.resolve(caller, path, true)?;
        let mut inode = self.volume.read_inode(inode_num)?;
        if inode.is_directory() {
            return Err(FsError::IsDirectory);
        }
        check_access(caller, &inode, WRITE)?;
        if offset + data.len() as u64 > u32::MAX as u64 {
            return Err(FsError::TooLarge);
        }

        let mut written = 0;
        let mut failure = None;
        while written < data.len() {
            let position = offset + written as u64;
            let lbn = (position / BLOCK_SIZE as u64) as u32;
            let offset_in_block = (position % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - offset_in_block).min(data.len() - written);

            let (block, newly_allocated) =
                match blockmap::alloc_for_write(&mut self.volume, &mut inode, inode_num, lbn, false) {
                    Ok(result) => result,
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                };

            let partial = offset_in_block != 0 || chunk < BLOCK_SIZE;
            let mut buffer = if partial && !newly_allocated {
                match self.volume.read_block(block) {
                    Ok(buffer) => buffer,
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            } else {
                // a fresh leaf has no observable prior content
                vec![0u8; BLOCK_SIZE]
            };
            buffer[offset_in_block..offset_in_block + chunk]
                .copy_from_slice(&data[written..written + chunk]);
            if let Err(error) = self.volume.write_block(block, &buffer) {
                failure = Some(error);
                break;
            }
            written += chunk;
        }

        let end = offset + written as u64;
        if end > inode.size as u64 {
            inode.size = end as u32;
        }
        inode.mtime = now();
        inode.ctime = inode.mtime;
        self.volume.write_inode(inode_num, &inode)?;
        self.volume.flush_metadata()?;

        match failure {
            Some(error) if written == 0 => Err(error),
            _ => Ok(written),
        }
    }

    pub fn truncate(&mut self, caller: &Credentials, path: &str, new_size: u64) -> FsResult<()> {
        let inode_num = self.resolve(caller, path, true)?;
        let mut inode = self.volume.read_inode(inode_num)?;
        if inode.is_directory() {
            return Err(FsError::IsDirectory);
        }
        check_access(caller, &inode, WRITE)?;
        if new_size > u32::MAX as u64 {
            return Err(FsError::TooLarge);
        }
        let new_size = new_size as u32;

        let old_size = inode.size;
        if new_size == old_size {
            inode.ctime = now();
            self.volume.write_inode(inode_num, &inode)?;
            return Ok(());
        }

        inode.size = new_size;
        if new_size == 0 {
            blockmap::free_all(&mut self.volume, &mut inode);
        } else if new_size < old_size {
            let old_blocks = old_size.div_ceil(BLOCK_SIZE as u32);
            let new_blocks = new_size.div_ceil(BLOCK_SIZE as u32);
            if new_blocks < old_blocks {
                blockmap::release_range(&mut self.volume, &mut inode, new_blocks, old_blocks);
            }
        }
        // growing leaves a sparse tail; blocks appear on first write

        inode.mtime = now();
        inode.ctime = inode.mtime;
        self.volume.write_inode(inode_num, &inode)?;
        if new_size < old_size {
            self.volume.flush_metadata()?;
        }
        Ok(())
    }

    pub fn chmod(&mut self, caller: &Credentials, path: &str, mode: ModeBits) -> FsResult<()> {
        let inode_num = self.resolve(caller, path, true)?;
        let mut inode = self.volume.read_inode(inode_num)?;
        if caller.uid != 0 && caller.uid != inode.uid as u32 {
            return Err(FsError::Permission);
        }
        inode.mode = (inode.mode & TYPE_MASK) | (mode & PERMISSIONS_MASK);
        inode.ctime = now();
        self.volume.write_inode(inode_num, &inode)
    }

    pub fn chown(
        &mut self,
        caller: &Credentials,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<()> {
        let inode_num = self.resolve(caller, path, false)?;
        let mut inode = self.volume.read_inode(inode_num)?;

        let uid_changing = uid.is_some_and(|uid| uid != inode.uid as u32);
        let gid_changing = gid.is_some_and(|gid| gid != inode.gid as u32);
        if caller.uid != 0 {
            if uid_changing {
                return Err(FsError::Permission);
            }
            if let Some(new_gid) = gid.filter(|_| gid_changing) {
                if caller.uid != inode.uid as u32 {
                    return Err(FsError::Permission);
                }
                if new_gid != caller.gid && !caller.groups.contains(&new_gid) {
                    return Err(FsError::Permission);
                }
            }
        }

        if !uid_changing && !gid_changing {
            return Ok(());
        }
        if let Some(uid) = uid {
            inode.uid = uid as u16;
        }
        if let Some(gid) = gid {
            inode.gid = gid as u16;
        }
        if caller.uid != 0 {
            inode.mode &= !(SET_UID | SET_GID);
        }
        inode.ctime = now();
        self.volume.write_inode(inode_num, &inode)
    }

    pub fn utimens(
        &mut self,
        caller: &Credentials,
        path: &str,
        atime: SetTime,
        mtime: SetTime,
    ) -> FsResult<()> {
        let inode_num = self.resolve(caller, path, true)?;
        let mut inode = self.volume.read_inode(inode_num)?;

        // Explicit timestamps are owner-only, and so is the no-change form
        // with both fields omitted; only a plain touch-to-now falls back to
        // write permission.
        let owner_only = matches!(atime, SetTime::At(_))
            || matches!(mtime, SetTime::At(_))
            || (atime == SetTime::Omit && mtime == SetTime::Omit);
        if owner_only {
            if caller.uid != 0 && caller.uid != inode.uid as u32 {
                return Err(FsError::Permission);
            }
        } else {
            check_access(caller, &inode, WRITE)?;
        }

        let current = now();
        match atime {
            SetTime::Now => inode.atime = current,
            SetTime::At(seconds) => inode.atime = seconds,
            SetTime::Omit => {}
        }
        match mtime {
            SetTime::Now => inode.mtime = current,
            SetTime::At(seconds) => inode.mtime = seconds,
            SetTime::Omit => {}
        }
        inode.ctime = current;
        self.volume.write_inode(inode_num, &inode)
    }

    pub fn symlink(&mut self, caller: &Credentials, target: &str, link_path: &str) -> FsResult<()> {
        if target.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let (parent_num, mut parent, name) = self.locate_parent(caller, link_path)?;
        self.ensure_absent(caller, link_path)?;

        let mode = TYPE_SYMLINK | 0o777;
        let inode_num = self.volume.alloc_inode(mode)?;
        let timestamp = now();
        let mut inode = Inode {
            mode,
            uid: caller.uid as u16,
            gid: caller.gid as u16,
            links_count: 1,
            size: target.len() as u32,
            atime: timestamp,
            ctime: timestamp,
            mtime: timestamp,
            ..Inode::default()
        };

        if target.len() < inode.block.len() * 4 {
            // fast symlink: the target rides inline in the pointer array
            inode.set_inline_target(target.as_bytes());
        } else {
            if target.len() >= BLOCK_SIZE {
                self.volume.free_inode(inode_num, mode);
                return Err(FsError::NameTooLong);
            }
            let data_block = match self.volume.alloc_block(self.volume.preferred_group(inode_num)) {
                Ok(block) => block,
                Err(error) => {
                    self.volume.free_inode(inode_num, mode);
                    return Err(error);
                }
            };
            let mut buffer = vec![0u8; BLOCK_SIZE];
            buffer[..target.len()].copy_from_slice(target.as_bytes());
            if let Err(error) = self.volume.write_block(data_block, &buffer) {
                self.volume.free_block(data_block);
                self.volume.free_inode(inode_num, mode);
                return Err(error);
            }
            inode.block[0] = data_block;
            inode.blocks = SECTORS_PER_BLOCK;
        }

        if let Err(error) = self.volume.write_inode(inode_num, &inode) {
            if inode.blocks > 0 {
                self.volume.free_block(inode.block[0]);
            }
            self.volume.free_inode(inode_num, mode);
            return Err(error);
        }

        if let Err(error) = directory::add_entry(
            &mut self.volume,
            &mut parent,
            parent_num,
            name.as_bytes(),
            inode_num,
            mode.file_type_nibble(),
        ) {
            if inode.blocks > 0 {
                self.volume.free_block(inode.block[0]);
            }
            self.discard_new_inode(inode_num, inode);
            return Err(error);
        }
        self.volume.flush_metadata()?;
        Ok(())
    }

    pub fn readlink(&mut self, caller: &Credentials, path: &str) -> FsResult<Vec<u8>> {
        let inode_num = self.resolve(caller, path, false)?;
        let mut inode = self.volume.read_inode(inode_num)?;
        let target = path::read_link_target(&self.volume, &inode)?;
        inode.atime = now();
        if self.volume.write_inode(inode_num, &inode).is_err() {
            warn!("readlink: failed to update atime of inode {}", inode_num);
        }
        Ok(target)
    }

    pub fn link(&mut self, caller: &Credentials, old_path: &str, new_path: &str) -> FsResult<()> {
        let target_num = self.resolve(caller, old_path, true)?;
        let mut target = self.volume.read_inode(target_num)?;
        if target.is_directory() {
            return Err(FsError::Permission);
        }

        let (parent_num, mut parent, name) = self.locate_parent(caller, new_path)?;
        self.ensure_absent(caller, new_path)?;

        directory::add_entry(
            &mut self.volume,
            &mut parent,
            parent_num,
            name.as_bytes(),
            target_num,
            target.mode.file_type_nibble(),
        )?;

        target.links_count += 1;
        target.ctime = now();
        if let Err(error) = self.volume.write_inode(target_num, &target) {
            // undo the entry we just created
            let _ = directory::remove_entry(&mut self.volume, &mut parent, parent_num, name.as_bytes());
            return Err(error);
        }
        self.volume.flush_metadata()?;
        Ok(())
    }

    pub fn statfs(&self) -> StatFs {
        StatFs {
            block_size: BLOCK_SIZE as u32,
            blocks: self.volume.superblock.blocks_count,
            free_blocks: self.volume.superblock.free_blocks_count,
            inodes: self.volume.superblock.inodes_count,
            free_inodes: self.volume.superblock.free_inodes_count,
            name_max: MAX_NAME_LEN as u32,
        }
    }

    pub fn access(&self, caller: &Credentials, path: &str, mask: u8) -> FsResult<()> {
        let inode_num = self.resolve(caller, path, true)?;
        let inode = self.volume.read_inode(inode_num)?;
        if mask == 0 {
            return Ok(()); // existence only
        }
        check_access(caller, &inode, mask)
    }

    /// Physical block behind a file's logical block, exposed for the
    /// consistency checks in the test suite.
    pub fn map_block(&self, caller: &Credentials, path: &str, lbn: u32) -> FsResult<BlockNo> {
        let inode_num = self.resolve(caller, path, true)?;
        let inode = self.volume.read_inode(inode_num)?;
        blockmap::map_block(&self.volume, &inode, lbn)
    }
}
