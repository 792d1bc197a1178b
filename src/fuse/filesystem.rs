use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use log::debug;

use crate::consts::{InodeNo, BLOCK_SIZE, MAX_NAME_LEN};
use crate::device::BlockDevice;
use crate::ops::access::Credentials;
use crate::ops::{FileStat, SetTime, SpanFs};
use crate::util::error::{FsError, FsResult};
use crate::util::mode::{ModeBits, ModeBitsHelper};
use crate::util::time::to_system_time;

const TTL: Duration = Duration::new(1, 0);

/// Adapter between the inode-addressed FUSE protocol and the path-addressed
/// operation layer. The kernel only ever asks about inodes it has previously
/// looked up, so a map from inode number to the path it was resolved under
/// is enough to reconstruct the operation's path argument.
pub struct SpanFuse<D: BlockDevice> {
    fs: SpanFs<D>,
    paths: HashMap<u64, String>,
    daemon_groups: Vec<u32>,
}

impl<D: BlockDevice> SpanFuse<D> {
    pub fn new(fs: SpanFs<D>) -> SpanFuse<D> {
        let mut paths = HashMap::new();
        paths.insert(fuser::FUSE_ROOT_ID, String::from("/"));
        paths.insert(fs.volume.superblock.root_inode as u64, String::from("/"));
        SpanFuse { fs, paths, daemon_groups: process_groups() }
    }

    fn credentials(&self, request: &Request<'_>) -> Credentials {
        Credentials {
            uid: request.uid(),
            gid: request.gid(),
            groups: self.daemon_groups.clone(),
        }
    }

    fn path_of(&self, ino: u64) -> FsResult<String> {
        self.paths.get(&ino).cloned().ok_or(FsError::NoEntry)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FsResult<String> {
        let name = name.to_str().ok_or(FsError::InvalidArgument)?;
        if name.len() > MAX_NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        let parent_path = self.path_of(parent)?;
        if parent_path == "/" {
            Ok(format!("/{}", name))
        } else {
            Ok(format!("{}/{}", parent_path, name))
        }
    }

    fn remember(&mut self, inode: InodeNo, path: String) {
        self.paths.insert(inode as u64, path);
    }

    fn stat_path(&self, caller: &Credentials, path: &str) -> FsResult<FileAttr> {
        let stat = self.fs.getattr(caller, path)?;
        Ok(file_attr(&stat))
    }
}

fn process_groups() -> Vec<u32> {
    let count = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
    if count <= 0 {
        return Vec::new();
    }
    let mut groups = vec![0 as libc::gid_t; count as usize];
    let filled = unsafe { libc::getgroups(count, groups.as_mut_ptr()) };
    if filled < 0 {
        return Vec::new();
    }
    groups.truncate(filled as usize);
    groups.into_iter().map(|gid| gid as u32).collect()
}

fn file_kind(mode: ModeBits) -> FileType {
    match mode.file_type_nibble() {
        0x4 => FileType::Directory,
        0xA => FileType::Symlink,
        0x1 => FileType::NamedPipe,
        _ => FileType::RegularFile,
    }
}

fn file_attr(stat: &FileStat) -> FileAttr {
    FileAttr {
        ino: stat.inode as u64,
        size: stat.size as u64,
        blocks: stat.blocks as u64,
        atime: to_system_time(stat.atime),
        mtime: to_system_time(stat.mtime),
        ctime: to_system_time(stat.ctime),
        crtime: to_system_time(stat.ctime),
        kind: file_kind(stat.mode),
        perm: stat.mode.permissions(),
        nlink: stat.links_count as u32,
        uid: stat.uid as u32,
        gid: stat.gid as u32,
        rdev: 0,
        blksize: BLOCK_SIZE as u32,
        flags: 0,
    }
}

fn set_time_of(time: Option<TimeOrNow>) -> SetTime {
    match time {
        None => SetTime::Omit,
        Some(TimeOrNow::Now) => SetTime::Now,
        Some(TimeOrNow::SpecificTime(when)) => SetTime::At(
            when.duration_since(SystemTime::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs() as u32)
                .unwrap_or(0),
        ),
    }
}

impl<D: BlockDevice> Filesystem for SpanFuse<D> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let caller = self.credentials(req);
        let result = self
            .child_path(parent, name)
            .and_then(|path| self.stat_path(&caller, &path).map(|attr| (path, attr)));
        match result {
            Ok((path, attr)) => {
                self.remember(attr.ino as InodeNo, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(error) => reply.error(error.errno()),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let caller = self.credentials(req);
        match self.path_of(ino).and_then(|path| self.stat_path(&caller, &path)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(error) => reply.error(error.errno()),
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
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let caller = self.credentials(req);
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(error) => return reply.error(error.errno()),
        };

        let result = (|| -> FsResult<()> {
            if let Some(mode) = mode {
                self.fs.chmod(&caller, &path, mode as ModeBits)?;
            }
            if uid.is_some() || gid.is_some() {
                self.fs.chown(&caller, &path, uid, gid)?;
            }
            if let Some(size) = size {
                self.fs.truncate(&caller, &path, size)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.fs
                    .utimens(&caller, &path, set_time_of(atime), set_time_of(mtime))?;
            }
            Ok(())
        })();

        match result.and_then(|_| self.stat_path(&caller, &path)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(error) => reply.error(error.errno()),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let caller = self.credentials(req);
        match self.path_of(ino).and_then(|path| self.fs.readlink(&caller, &path)) {
            Ok(target) => reply.data(&target),
            Err(error) => reply.error(error.errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let caller = self.credentials(req);
        let result = self.child_path(parent, name).and_then(|path| {
            self.fs.mknod(&caller, &path, mode as ModeBits)?;
            self.stat_path(&caller, &path).map(|attr| (path, attr))
        });
        match result {
            Ok((path, attr)) => {
                self.remember(attr.ino as InodeNo, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(error) => reply.error(error.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let caller = self.credentials(req);
        let result = self.child_path(parent, name).and_then(|path| {
            self.fs.mkdir(&caller, &path, mode as ModeBits)?;
            self.stat_path(&caller, &path).map(|attr| (path, attr))
        });
        match result {
            Ok((path, attr)) => {
                self.remember(attr.ino as InodeNo, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(error) => reply.error(error.errno()),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let caller = self.credentials(req);
        let result = self
            .child_path(parent, name)
            .and_then(|path| self.fs.unlink(&caller, &path));
        match result {
            Ok(()) => reply.ok(),
            Err(error) => reply.error(error.errno()),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let caller = self.credentials(req);
        let result = self
            .child_path(parent, name)
            .and_then(|path| self.fs.rmdir(&caller, &path));
        match result {
            Ok(()) => reply.ok(),
            Err(error) => reply.error(error.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let caller = self.credentials(req);
        let result = self.child_path(parent, link_name).and_then(|path| {
            let target = target.to_str().ok_or(FsError::InvalidArgument)?;
            self.fs.symlink(&caller, target, &path)?;
            self.stat_path(&caller, &path).map(|attr| (path, attr))
        });
        match result {
            Ok((path, attr)) => {
                self.remember(attr.ino as InodeNo, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(error) => reply.error(error.errno()),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let caller = self.credentials(req);
        let result = self.path_of(ino).and_then(|old_path| {
            let new_path = self.child_path(newparent, newname)?;
            self.fs.link(&caller, &old_path, &new_path)?;
            self.stat_path(&caller, &new_path).map(|attr| (new_path, attr))
        });
        match result {
            Ok((path, attr)) => {
                self.remember(attr.ino as InodeNo, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(error) => reply.error(error.errno()),
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let caller = self.credentials(req);
        let result = self
            .path_of(ino)
            .and_then(|path| self.fs.read(&caller, &path, size as usize, offset.max(0) as u64));
        match result {
            Ok(data) => reply.data(&data),
            Err(error) => reply.error(error.errno()),
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let caller = self.credentials(req);
        let result = self
            .path_of(ino)
            .and_then(|path| self.fs.write(&caller, &path, data, offset.max(0) as u64));
        match result {
            Ok(written) => reply.written(written as u32),
            Err(error) => reply.error(error.errno()),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let caller = self.credentials(req);
        let result = self.path_of(ino).and_then(|path| {
            let entries = self.fs.readdir(&caller, &path)?;
            Ok((path, entries))
        });
        let (path, entries) = match result {
            Ok(listing) => listing,
            Err(error) => return reply.error(error.errno()),
        };

        for (index, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let name = match std::str::from_utf8(&entry.name) {
                Ok(name) => name,
                Err(_) => {
                    debug!("skipping directory entry with non-UTF-8 name in {}", path);
                    continue;
                }
            };
            let kind = match entry.file_type {
                0x4 => FileType::Directory,
                0xA => FileType::Symlink,
                0x1 => FileType::NamedPipe,
                _ => FileType::RegularFile,
            };
            if name != "." && name != ".." {
                let child = if path == "/" {
                    format!("/{}", name)
                } else {
                    format!("{}/{}", path, name)
                };
                self.paths.insert(entry.inode as u64, child);
            }
            if reply.add(entry.inode as u64, index as i64 + 1, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stat = self.fs.statfs();
        reply.statfs(
            stat.blocks as u64,
            stat.free_blocks as u64,
            stat.free_blocks as u64,
            stat.inodes as u64,
            stat.free_inodes as u64,
            stat.block_size,
            stat.name_max,
            stat.block_size,
        );
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let caller = self.credentials(req);
        let result = self
            .path_of(ino)
            .and_then(|path| self.fs.access(&caller, &path, (mask & 0o7) as u8));
        match result {
            Ok(()) => reply.ok(),
            Err(error) => reply.error(error.errno()),
        }
    }
}
