use crate::consts::{InodeNo, BLOCK_SIZE, MAX_NAME_LEN};
use crate::device::BlockDevice;
use crate::structure::blockmap;
use crate::structure::inode::Inode;
use crate::structure::Volume;
use crate::util::codec::{put_u16, put_u32, u16_at, u32_at};
use crate::util::error::{FsError, FsResult};
use crate::util::time::now;

/// A directory is a file whose payload is a stream of 4-byte-aligned
/// variable-length records, one block at a time. A record with `inode == 0`
/// is free space; the last record of a block always extends to the block
/// boundary. Directory blocks are never sparse.

const HEADER_LEN: usize = 8;

/// Slot size for a name of the given length.
pub fn entry_len(name_len: usize) -> usize {
    (HEADER_LEN + name_len + 3) & !3
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub inode: InodeNo,
    pub file_type: u8,
    pub name: Vec<u8>,
}

struct RawEntry {
    inode: InodeNo,
    rec_len: usize,
    name_len: usize,
    file_type: u8,
}

/// Decode and sanity-check the record header at `offset`. A zero or
/// truncated `rec_len`, or one too small for the stored name, marks the
/// block as corrupt.
fn parse_entry(buffer: &[u8], offset: usize) -> FsResult<RawEntry> {
    if offset + HEADER_LEN > BLOCK_SIZE {
        return Err(FsError::Io);
    }
    let entry = RawEntry {
        inode: u32_at(buffer, offset),
        rec_len: u16_at(buffer, offset + 4) as usize,
        name_len: buffer[offset + 6] as usize,
        file_type: buffer[offset + 7],
    };
    if entry.rec_len < entry_len(0) || offset + entry.rec_len > BLOCK_SIZE {
        return Err(FsError::Io);
    }
    if entry.inode != 0 && entry.rec_len < entry_len(entry.name_len) {
        return Err(FsError::Io);
    }
    Ok(entry)
}

fn write_entry(
    buffer: &mut [u8],
    offset: usize,
    inode: InodeNo,
    rec_len: usize,
    name: &[u8],
    file_type: u8,
) {
    put_u32(buffer, offset, inode);
    put_u16(buffer, offset + 4, rec_len as u16);
    buffer[offset + 6] = name.len() as u8;
    buffer[offset + 7] = file_type;
    buffer[offset + HEADER_LEN..offset + HEADER_LEN + name.len()].copy_from_slice(name);
}

fn write_free_entry(buffer: &mut [u8], offset: usize, rec_len: usize) {
    put_u32(buffer, offset, 0);
    put_u16(buffer, offset + 4, rec_len as u16);
    buffer[offset + 6] = 0;
    buffer[offset + 7] = 0;
}

/// Build the initial data block of a directory: `.` and `..`, with `..`
/// stretched to the block end.
pub fn new_dir_block(self_inode: InodeNo, parent_inode: InodeNo, file_type: u8) -> Vec<u8> {
    let mut buffer = vec![0u8; BLOCK_SIZE];
    let dot_len = entry_len(1);
    write_entry(&mut buffer, 0, self_inode, dot_len, b".", file_type);
    write_entry(&mut buffer, dot_len, parent_inode, BLOCK_SIZE - dot_len, b"..", file_type);
    buffer
}

/// Place `name` in the first slot that fits, trying free records first and
/// the slack of active records second. Returns false when the block is full.
fn try_insert(
    buffer: &mut [u8],
    name: &[u8],
    child: InodeNo,
    file_type: u8,
) -> FsResult<bool> {
    let needed = entry_len(name.len());
    let mut offset = 0;
    while offset < BLOCK_SIZE {
        let entry = parse_entry(buffer, offset)?;

        if entry.inode == 0 && entry.rec_len >= needed {
            // split the free record
            let remainder = entry.rec_len - needed;
            if remainder >= entry_len(0) {
                write_entry(buffer, offset, child, needed, name, file_type);
                write_free_entry(buffer, offset + needed, remainder);
            } else {
                write_entry(buffer, offset, child, needed + remainder, name, file_type);
            }
            return Ok(true);
        }

        if entry.inode != 0 {
            // shrink an over-long active record and take its slack
            let used = entry_len(entry.name_len);
            let slack = entry.rec_len - used;
            if slack >= needed {
                put_u16(buffer, offset + 4, used as u16);
                let spot = offset + used;
                let remainder = slack - needed;
                if remainder >= entry_len(0) {
                    write_entry(buffer, spot, child, needed, name, file_type);
                    write_free_entry(buffer, spot + needed, remainder);
                } else {
                    write_entry(buffer, spot, child, needed + remainder, name, file_type);
                }
                return Ok(true);
            }
        }

        offset += entry.rec_len;
    }
    Ok(false)
}

/// Link `name` to `child` in the parent directory, growing the directory by
/// one block when no existing block has room. Bumps and persists the
/// parent's mtime/ctime and size.
pub fn add_entry<D: BlockDevice>(
    volume: &mut Volume<D>,
    parent: &mut Inode,
    parent_num: InodeNo,
    name: &[u8],
    child: InodeNo,
    file_type: u8,
) -> FsResult<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong);
    }
    if name.is_empty() {
        return Err(FsError::InvalidArgument);
    }

    let mut lbn = 0u32;
    loop {
        let (block, newly_allocated) =
            blockmap::alloc_for_write(volume, parent, parent_num, lbn, true)?;
        let mut buffer = if newly_allocated {
            // a fresh block is one big free record
            let mut buffer = vec![0u8; BLOCK_SIZE];
            write_free_entry(&mut buffer, 0, BLOCK_SIZE);
            buffer
        } else {
            volume.read_block(block)?
        };

        if try_insert(&mut buffer, name, child, file_type)? {
            volume.write_block(block, &buffer)?;
            let min_size = (lbn as u64 + 1) * BLOCK_SIZE as u64;
            if (parent.size as u64) < min_size {
                parent.size = min_size as u32;
            }
            parent.mtime = now();
            parent.ctime = parent.mtime;
            volume.write_inode(parent_num, parent)?;
            return Ok(());
        }
        lbn += 1;
    }
}

/// Unlink `name` from the parent directory. The record is coalesced into
/// its predecessor, or marked free when it leads the block; directory
/// blocks are never returned to the allocator here.
pub fn remove_entry<D: BlockDevice>(
    volume: &mut Volume<D>,
    parent: &mut Inode,
    parent_num: InodeNo,
    name: &[u8],
) -> FsResult<()> {
    if name.is_empty() || name == b"." || name == b".." {
        return Err(FsError::InvalidArgument);
    }

    let block_count = (parent.size as u64).div_ceil(BLOCK_SIZE as u64) as u32;
    for lbn in 0..block_count {
        let block = blockmap::map_block(volume, parent, lbn)?;
        if block == 0 {
            continue;
        }
        let mut buffer = volume.read_block(block)?;

        let mut offset = 0;
        let mut previous: Option<usize> = None;
        while offset < BLOCK_SIZE {
            let entry = parse_entry(&buffer, offset)?;
            if entry.inode != 0
                && entry.name_len == name.len()
                && &buffer[offset + HEADER_LEN..offset + HEADER_LEN + entry.name_len] == name
            {
                match previous {
                    Some(prev_offset) => {
                        let prev_len = u16_at(&buffer, prev_offset + 4) as usize;
                        put_u16(&mut buffer, prev_offset + 4, (prev_len + entry.rec_len) as u16);
                    }
                    None => put_u32(&mut buffer, offset, 0),
                }
                volume.write_block(block, &buffer)?;
                parent.mtime = now();
                parent.ctime = parent.mtime;
                volume.write_inode(parent_num, parent)?;
                return Ok(());
            }
            previous = Some(offset);
            offset += entry.rec_len;
        }
    }
    Err(FsError::NoEntry)
}

/// Look up a single name, without materializing the whole listing.
pub fn lookup<D: BlockDevice>(
    volume: &Volume<D>,
    directory: &Inode,
    name: &[u8],
) -> FsResult<Option<InodeNo>> {
    let block_count = (directory.size as u64).div_ceil(BLOCK_SIZE as u64) as u32;
    for lbn in 0..block_count {
        let block = blockmap::map_block(volume, directory, lbn)?;
        if block == 0 {
            continue;
        }
        let buffer = volume.read_block(block)?;
        let mut offset = 0;
        while offset < BLOCK_SIZE {
            let entry = parse_entry(&buffer, offset)?;
            if entry.inode != 0
                && entry.name_len == name.len()
                && &buffer[offset + HEADER_LEN..offset + HEADER_LEN + entry.name_len] == name
            {
                return Ok(Some(entry.inode));
            }
            offset += entry.rec_len;
        }
    }
    Ok(None)
}

/// Every active record of the directory, in storage order.
pub fn entries<D: BlockDevice>(volume: &Volume<D>, directory: &Inode) -> FsResult<Vec<DirEntry>> {
    let mut listing = Vec::new();
    walk(volume, directory, |entry, name| {
        listing.push(DirEntry {
            inode: entry.inode,
            file_type: entry.file_type,
            name: name.to_vec(),
        });
        true
    })?;
    Ok(listing)
}

/// A directory is empty when nothing but `.` and `..` remains active.
pub fn is_empty<D: BlockDevice>(volume: &Volume<D>, directory: &Inode) -> FsResult<bool> {
    let mut empty = true;
    walk(volume, directory, |_, name| {
        if name != b"." && name != b".." {
            empty = false;
            return false;
        }
        true
    })?;
    Ok(empty)
}

fn walk<D: BlockDevice>(
    volume: &Volume<D>,
    directory: &Inode,
    mut visit: impl FnMut(&RawEntry, &[u8]) -> bool,
) -> FsResult<()> {
    let block_count = (directory.size as u64).div_ceil(BLOCK_SIZE as u64) as u32;
    for lbn in 0..block_count {
        let block = blockmap::map_block(volume, directory, lbn)?;
        if block == 0 {
            continue;
        }
        let buffer = volume.read_block(block)?;
        let mut offset = 0;
        while offset < BLOCK_SIZE {
            let entry = parse_entry(&buffer, offset)?;
            if entry.inode != 0 && entry.name_len > 0 {
                let name = &buffer[offset + HEADER_LEN..offset + HEADER_LEN + entry.name_len];
                if !visit(&entry, name) {
                    return Ok(());
                }
            }
            offset += entry.rec_len;
        }
    }
    Ok(())
}

/// Used by tests and fsck-style checks: every block's record lengths must
/// tile the block exactly.
#[cfg(test)]
fn check_block_tiling<D: BlockDevice>(volume: &Volume<D>, directory: &Inode) -> FsResult<()> {
    let block_count = (directory.size as u64).div_ceil(BLOCK_SIZE as u64) as u32;
    for lbn in 0..block_count {
        let block = blockmap::map_block(volume, directory, lbn)?;
        if block == 0 {
            return Err(FsError::Io);
        }
        let buffer = volume.read_block(block)?;
        let mut offset = 0;
        while offset < BLOCK_SIZE {
            let entry = parse_entry(&buffer, offset)?;
            offset += entry.rec_len;
        }
        if offset != BLOCK_SIZE {
            return Err(FsError::Io);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::ROOT_INODE;
    use crate::device::FileDevice;
    use crate::mkfs;
    use crate::util::mode::{ModeBitsHelper, TYPE_DIRECTORY, TYPE_REGULAR};

    fn test_volume(blocks: u32) -> Volume<FileDevice> {
        let file = tempfile::tempfile().unwrap();
        file.set_len(blocks as u64 * BLOCK_SIZE as u64).unwrap();
        let mut device = FileDevice::from_file(file).unwrap();
        mkfs::format(&mut device).unwrap();
        Volume::mount(device).unwrap()
    }

    fn names<D: BlockDevice>(volume: &Volume<D>, directory: &Inode) -> Vec<String> {
        entries(volume, directory)
            .unwrap()
            .into_iter()
            .map(|entry| String::from_utf8(entry.name).unwrap())
            .collect()
    }

    #[test]
    fn entry_len_is_4_byte_aligned() {
        assert_eq!(entry_len(0), 8);
        assert_eq!(entry_len(1), 12);
        assert_eq!(entry_len(4), 12);
        assert_eq!(entry_len(5), 16);
        assert_eq!(entry_len(255), 264);
    }

    #[test]
    fn fresh_directory_lists_dot_entries() {
        let volume = test_volume(1024);
        let root = volume.read_inode(ROOT_INODE).unwrap();
        let listing = entries(&volume, &root).unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].name, b".");
        assert_eq!(listing[0].inode, ROOT_INODE);
        assert_eq!(listing[1].name, b"..");
        assert_eq!(listing[1].inode, ROOT_INODE);
        assert!(is_empty(&volume, &root).unwrap());
    }

    #[test]
    fn add_and_lookup() {
        let mut volume = test_volume(1024);
        let mut root = volume.read_inode(ROOT_INODE).unwrap();
        let file_type = (TYPE_REGULAR).file_type_nibble();

        add_entry(&mut volume, &mut root, ROOT_INODE, b"hello.txt", 12, file_type).unwrap();
        assert_eq!(lookup(&volume, &root, b"hello.txt").unwrap(), Some(12));
        assert_eq!(lookup(&volume, &root, b"other").unwrap(), None);
        assert!(!is_empty(&volume, &root).unwrap());
        check_block_tiling(&volume, &root).unwrap();
    }

    #[test]
    fn remove_coalesces_into_predecessor() {
        let mut volume = test_volume(1024);
        let mut root = volume.read_inode(ROOT_INODE).unwrap();
        let file_type = TYPE_REGULAR.file_type_nibble();

        for (name, child) in [(b"aa".as_ref(), 12u32), (b"bbb".as_ref(), 13), (b"cccc".as_ref(), 14)] {
            add_entry(&mut volume, &mut root, ROOT_INODE, name, child, file_type).unwrap();
        }
        remove_entry(&mut volume, &mut root, ROOT_INODE, b"bbb").unwrap();

        assert_eq!(names(&volume, &root), vec![".", "..", "aa", "cccc"]);
        check_block_tiling(&volume, &root).unwrap();

        // freed slack is reused for the next insertion
        add_entry(&mut volume, &mut root, ROOT_INODE, b"bb2", 15, file_type).unwrap();
        assert_eq!(names(&volume, &root), vec![".", "..", "aa", "bb2", "cccc"]);
        check_block_tiling(&volume, &root).unwrap();
    }

    #[test]
    fn removing_dot_entries_is_rejected() {
        let mut volume = test_volume(1024);
        let mut root = volume.read_inode(ROOT_INODE).unwrap();
        assert_eq!(
            remove_entry(&mut volume, &mut root, ROOT_INODE, b"."),
            Err(FsError::InvalidArgument)
        );
        assert_eq!(
            remove_entry(&mut volume, &mut root, ROOT_INODE, b".."),
            Err(FsError::InvalidArgument)
        );
        assert_eq!(
            remove_entry(&mut volume, &mut root, ROOT_INODE, b"ghost"),
            Err(FsError::NoEntry)
        );
    }

    #[test]
    fn long_names_are_rejected() {
        let mut volume = test_volume(1024);
        let mut root = volume.read_inode(ROOT_INODE).unwrap();
        let name = vec![b'x'; MAX_NAME_LEN + 1];
        assert_eq!(
            add_entry(&mut volume, &mut root, ROOT_INODE, &name, 12, 8),
            Err(FsError::NameTooLong)
        );
    }

    #[test]
    fn directory_grows_by_whole_blocks() {
        let mut volume = test_volume(1024);
        let mut root = volume.read_inode(ROOT_INODE).unwrap();
        let file_type = TYPE_REGULAR.file_type_nibble();

        // ~170 names of 16 bytes each (24-byte records) overflow one block
        for i in 0..200 {
            let name = format!("file-{:011}", i);
            add_entry(&mut volume, &mut root, ROOT_INODE, name.as_bytes(), 100 + i, file_type)
                .unwrap();
        }
        assert_eq!(root.size as usize % BLOCK_SIZE, 0);
        assert!(root.size as usize > BLOCK_SIZE);
        assert_eq!(entries(&volume, &root).unwrap().len(), 202);
        check_block_tiling(&volume, &root).unwrap();
    }

    #[test]
    fn churn_preserves_exactly_the_active_names() {
        let mut volume = test_volume(1024);
        let mut root = volume.read_inode(ROOT_INODE).unwrap();
        let file_type = TYPE_REGULAR.file_type_nibble();

        let mut kept = Vec::new();
        for i in 0..60u32 {
            let name = format!("n{}-{}", i % 7, i);
            add_entry(&mut volume, &mut root, ROOT_INODE, name.as_bytes(), 50 + i, file_type)
                .unwrap();
            if i % 3 == 0 {
                remove_entry(&mut volume, &mut root, ROOT_INODE, name.as_bytes()).unwrap();
            } else {
                kept.push(name);
            }
        }

        let mut listed = names(&volume, &root);
        listed.retain(|name| name != "." && name != "..");
        let mut expected = kept.clone();
        expected.sort();
        listed.sort();
        assert_eq!(listed, expected);
        check_block_tiling(&volume, &root).unwrap();
    }

    #[test]
    fn new_dir_block_shape() {
        let buffer = new_dir_block(7, ROOT_INODE, TYPE_DIRECTORY.file_type_nibble());
        let dot = parse_entry(&buffer, 0).unwrap();
        assert_eq!(dot.inode, 7);
        assert_eq!(dot.rec_len, 12);
        let dotdot = parse_entry(&buffer, 12).unwrap();
        assert_eq!(dotdot.inode, ROOT_INODE);
        assert_eq!(dotdot.rec_len, BLOCK_SIZE - 12);
    }
}
