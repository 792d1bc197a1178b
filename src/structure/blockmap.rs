use crate::consts::{
    BlockNo, InodeNo, BLOCK_POINTERS, DIRECT_POINTERS, POINTERS_PER_BLOCK, SECTORS_PER_BLOCK,
    SECTOR_SIZE,
};
use crate::device::BlockDevice;
use crate::structure::inode::Inode;
use crate::structure::Volume;
use crate::util::codec::{put_u32, u32_at};
use crate::util::error::{FsError, FsResult};

/// The inode block tree: 12 direct pointers, then one single-, one double-
/// and one triple-indirect subtree with 1024 pointers per indirect node.
///
/// The tree is an arena of block numbers; every traversal is an explicit
/// walk, at most three levels deep.

/// Slot in `inode.block`, levels of indirection, and offset within the
/// region, for a logical block past the direct range.
fn indirect_region(lbn: u32) -> FsResult<(usize, u32, u64)> {
    let pointers = POINTERS_PER_BLOCK as u64;
    let mut offset = lbn as u64 - DIRECT_POINTERS as u64;
    if offset < pointers {
        return Ok((DIRECT_POINTERS, 1, offset));
    }
    offset -= pointers;
    if offset < pointers * pointers {
        return Ok((DIRECT_POINTERS + 1, 2, offset));
    }
    offset -= pointers * pointers;
    if offset < pointers * pointers * pointers {
        return Ok((DIRECT_POINTERS + 2, 3, offset));
    }
    Err(FsError::TooLarge)
}

fn checked_pointer(block: BlockNo, blocks_count: u32) -> FsResult<BlockNo> {
    if block >= blocks_count {
        return Err(FsError::Io);
    }
    Ok(block)
}

/// Map a logical block to its physical block, read-only. Returns 0 for a
/// hole; reads past end of file see zeros.
pub fn map_block<D: BlockDevice>(volume: &Volume<D>, inode: &Inode, lbn: u32) -> FsResult<BlockNo> {
    if (lbn as usize) < DIRECT_POINTERS {
        return checked_pointer(inode.block[lbn as usize], volume.superblock.blocks_count);
    }
    let (slot, levels, mut offset) = indirect_region(lbn)?;
    let mut current = checked_pointer(inode.block[slot], volume.superblock.blocks_count)?;
    for level in (1..=levels).rev() {
        if current == 0 {
            return Ok(0);
        }
        let buffer = volume.read_block(current)?;
        let stride = (POINTERS_PER_BLOCK as u64).pow(level - 1);
        let index = (offset / stride) as usize;
        offset %= stride;
        current = checked_pointer(u32_at(&buffer, index * 4), volume.superblock.blocks_count)?;
    }
    Ok(current)
}

/// Allocate a block and, when it will hold pointers or well-formed directory
/// records, zero it on disk before it becomes reachable.
fn materialize<D: BlockDevice>(
    volume: &mut Volume<D>,
    preferred_group: u32,
    zero: bool,
) -> FsResult<BlockNo> {
    let block = volume.alloc_block(preferred_group)?;
    if zero {
        if let Err(error) = volume.device.write_zero_blocks(block, 1) {
            volume.free_block(block);
            return Err(error);
        }
    }
    Ok(block)
}

/// Idempotent materialization of the path down to `lbn`. Returns the
/// physical block and whether the leaf was newly allocated; a newly
/// allocated leaf that was not zeroed must be treated as all-zero by the
/// caller.
///
/// Each allocated block (indirect nodes included) charges 8 sectors to the
/// inode. If an install step fails the block just allocated is released
/// again before the error propagates.
pub fn alloc_for_write<D: BlockDevice>(
    volume: &mut Volume<D>,
    inode: &mut Inode,
    inode_num: InodeNo,
    lbn: u32,
    zero_leaf: bool,
) -> FsResult<(BlockNo, bool)> {
    let preferred_group = volume.preferred_group(inode_num);

    if (lbn as usize) < DIRECT_POINTERS {
        let slot = lbn as usize;
        if inode.block[slot] != 0 {
            return Ok((inode.block[slot], false));
        }
        let block = materialize(volume, preferred_group, zero_leaf)?;
        inode.block[slot] = block;
        inode.blocks += SECTORS_PER_BLOCK;
        return Ok((block, true));
    }

    let (slot, levels, mut offset) = indirect_region(lbn)?;
    if inode.block[slot] == 0 {
        let block = materialize(volume, preferred_group, true)?;
        inode.block[slot] = block;
        inode.blocks += SECTORS_PER_BLOCK;
    }
    let mut current = inode.block[slot];
    let mut newly_allocated = false;

    for level in (1..=levels).rev() {
        let stride = (POINTERS_PER_BLOCK as u64).pow(level - 1);
        let index = (offset / stride) as usize;
        offset %= stride;

        let mut buffer = volume.read_block(current)?;
        let mut child = checked_pointer(u32_at(&buffer, index * 4), volume.superblock.blocks_count)?;
        if child == 0 {
            let is_leaf = level == 1;
            let block = materialize(volume, preferred_group, !is_leaf || zero_leaf)?;
            put_u32(&mut buffer, index * 4, block);
            if let Err(error) = volume.write_block(current, &buffer) {
                volume.free_block(block);
                return Err(error);
            }
            inode.blocks += SECTORS_PER_BLOCK;
            newly_allocated = is_leaf;
            child = block;
        }
        current = child;
    }
    Ok((current, newly_allocated))
}

/// Free the data blocks backing `[start_lbn, end_lbn)`. Indirect nodes stay
/// allocated; the inode's sector count is recomputed from its size, which
/// deliberately ignores surviving indirect nodes.
pub fn release_range<D: BlockDevice>(
    volume: &mut Volume<D>,
    inode: &mut Inode,
    start_lbn: u32,
    end_lbn: u32,
) {
    for lbn in start_lbn..end_lbn {
        if let Ok(block) = map_block(volume, inode, lbn) {
            if block != 0 {
                volume.free_block(block);
            }
        }
    }
    inode.blocks = inode.size.div_ceil(SECTOR_SIZE as u32);
}

fn free_tree<D: BlockDevice>(volume: &mut Volume<D>, block: BlockNo, level: u32) {
    if block == 0 {
        return;
    }
    if level > 0 {
        if let Ok(buffer) = volume.read_block(block) {
            for index in 0..POINTERS_PER_BLOCK as usize {
                let child = u32_at(&buffer, index * 4);
                if child != 0 {
                    free_tree(volume, child, level - 1);
                }
            }
        }
    }
    volume.free_block(block);
}

/// Release every data block and indirect node of the inode, post-order, and
/// reset its pointer array and sector count.
pub fn free_all<D: BlockDevice>(volume: &mut Volume<D>, inode: &mut Inode) {
    for slot in 0..DIRECT_POINTERS {
        if inode.block[slot] != 0 {
            volume.free_block(inode.block[slot]);
        }
    }
    free_tree(volume, inode.block[DIRECT_POINTERS], 1);
    free_tree(volume, inode.block[DIRECT_POINTERS + 1], 2);
    free_tree(volume, inode.block[DIRECT_POINTERS + 2], 3);
    inode.block = [0; BLOCK_POINTERS];
    inode.blocks = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::BLOCK_SIZE;
    use crate::device::FileDevice;
    use crate::mkfs;
    use crate::util::mode::TYPE_REGULAR;

    fn test_volume(blocks: u32) -> Volume<FileDevice> {
        let file = tempfile::tempfile().unwrap();
        file.set_len(blocks as u64 * BLOCK_SIZE as u64).unwrap();
        let mut device = FileDevice::from_file(file).unwrap();
        mkfs::format(&mut device).unwrap();
        Volume::mount(device).unwrap()
    }

    fn test_inode() -> Inode {
        Inode {
            mode: TYPE_REGULAR | 0o644,
            links_count: 1,
            ..Inode::default()
        }
    }

    #[test]
    fn regions() {
        assert_eq!(indirect_region(12).unwrap(), (12, 1, 0));
        assert_eq!(indirect_region(12 + 1023).unwrap(), (12, 1, 1023));
        assert_eq!(indirect_region(12 + 1024).unwrap(), (13, 2, 0));
        assert_eq!(indirect_region(12 + 1024 + 1024 * 1024).unwrap(), (14, 3, 0));
        assert_eq!(
            indirect_region(u32::MAX),
            Err(FsError::TooLarge) // beyond the triple-indirect range
        );
    }

    #[test]
    fn holes_map_to_zero() {
        let volume = test_volume(2048);
        let inode = test_inode();
        assert_eq!(map_block(&volume, &inode, 0).unwrap(), 0);
        assert_eq!(map_block(&volume, &inode, 12).unwrap(), 0);
        assert_eq!(map_block(&volume, &inode, 12 + 1024 + 7).unwrap(), 0);
    }

    #[test]
    fn direct_allocation_is_idempotent() {
        let mut volume = test_volume(2048);
        let mut inode = test_inode();

        let (block, newly) = alloc_for_write(&mut volume, &mut inode, 11, 0, false).unwrap();
        assert!(newly);
        assert_ne!(block, 0);
        assert_eq!(inode.blocks, 8);

        let (again, newly) = alloc_for_write(&mut volume, &mut inode, 11, 0, false).unwrap();
        assert_eq!(again, block);
        assert!(!newly);
        assert_eq!(inode.blocks, 8);

        assert_eq!(map_block(&volume, &inode, 0).unwrap(), block);
    }

    #[test]
    fn single_indirect_charges_the_indirect_node() {
        let mut volume = test_volume(2048);
        let mut inode = test_inode();

        let (block, newly) = alloc_for_write(&mut volume, &mut inode, 11, 12, false).unwrap();
        assert!(newly);
        assert_ne!(inode.block[12], 0);
        assert_ne!(block, inode.block[12]);
        // one data block plus the indirect node
        assert_eq!(inode.blocks, 16);
        assert_eq!(map_block(&volume, &inode, 12).unwrap(), block);
    }

    #[test]
    fn double_indirect_walk() {
        let mut volume = test_volume(2048);
        let mut inode = test_inode();
        let lbn = 12 + 1024 + 1;

        let (block, newly) = alloc_for_write(&mut volume, &mut inode, 11, lbn, false).unwrap();
        assert!(newly);
        assert_ne!(block, 0);
        // data block + double-indirect root + intermediate single node
        assert_eq!(inode.blocks, 24);
        assert_eq!(map_block(&volume, &inode, lbn).unwrap(), block);
        // the sibling slot is still a hole
        assert_eq!(map_block(&volume, &inode, lbn + 1).unwrap(), 0);
    }

    #[test]
    fn release_range_frees_data_blocks() {
        let mut volume = test_volume(2048);
        let mut inode = test_inode();
        for lbn in 0..3 {
            alloc_for_write(&mut volume, &mut inode, 11, lbn, false).unwrap();
        }
        inode.size = 3 * BLOCK_SIZE as u32;
        let free_before = volume.superblock.free_blocks_count;

        inode.size = BLOCK_SIZE as u32 + 1;
        release_range(&mut volume, &mut inode, 2, 3);
        assert_eq!(volume.superblock.free_blocks_count, free_before + 1);
        assert_eq!(map_block(&volume, &inode, 2).unwrap(), 0);
        assert_ne!(map_block(&volume, &inode, 1).unwrap(), 0);
        assert_eq!(inode.blocks, (BLOCK_SIZE as u32 + 1).div_ceil(512));
    }

    #[test]
    fn free_all_returns_every_block() {
        let mut volume = test_volume(2048);
        let free_before = volume.superblock.free_blocks_count;
        let mut inode = test_inode();

        for lbn in [0, 5, 11, 12, 13, 12 + 1024, 12 + 1024 + 1025] {
            alloc_for_write(&mut volume, &mut inode, 11, lbn, false).unwrap();
        }
        assert!(volume.superblock.free_blocks_count < free_before);

        free_all(&mut volume, &mut inode);
        assert_eq!(volume.superblock.free_blocks_count, free_before);
        assert_eq!(inode.blocks, 0);
        assert_eq!(inode.block, [0; BLOCK_POINTERS]);
    }

    #[test]
    fn release_range_leaves_holes_alone() {
        let mut volume = test_volume(2048);
        let mut inode = test_inode();
        alloc_for_write(&mut volume, &mut inode, 11, 4, false).unwrap();
        inode.size = 5 * BLOCK_SIZE as u32;
        let free_before = volume.superblock.free_blocks_count;

        inode.size = 0;
        release_range(&mut volume, &mut inode, 0, 5);
        // only the single backed block came back
        assert_eq!(volume.superblock.free_blocks_count, free_before + 1);
    }
}
