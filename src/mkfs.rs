use log::info;

use crate::consts::{
    BLOCKS_PER_GROUP, BLOCK_SIZE, FIRST_INODE, GDT_START_BLOCK, INODES_PER_GROUP, INODE_SIZE,
    MAGIC, MIN_BLOCKS, ROOT_INODE, SECTORS_PER_BLOCK, SUPERBLOCK_BLOCK,
};
use crate::device::BlockDevice;
use crate::ops::directory;
use crate::structure::bitmap;
use crate::structure::group::{gdt_blocks, gdt_to_blocks, inode_table_blocks, is_backup_group, GroupDesc};
use crate::structure::inode::Inode;
use crate::structure::superblock::SuperBlock;
use crate::util::error::{FsError, FsResult};
use crate::util::mode::{ModeBitsHelper, TYPE_DIRECTORY};
use crate::util::time::now;

/// Write an initial consistent filesystem onto a blank device: superblock,
/// group descriptors, bitmaps, zeroed inode tables, the root directory and
/// all backup copies. Any I/O error aborts with no partial recovery.
pub fn format<D: BlockDevice>(device: &mut D) -> FsResult<SuperBlock> {
    let blocks_count = device.block_count();
    if blocks_count < MIN_BLOCKS {
        return Err(FsError::InvalidArgument);
    }

    let group_count = blocks_count.div_ceil(BLOCKS_PER_GROUP);
    let gdt_block_count = gdt_blocks(group_count);
    let table_blocks = inode_table_blocks();
    let inodes_count = group_count
        .checked_mul(INODES_PER_GROUP)
        .ok_or(FsError::TooLarge)?;

    info!(
        "formatting {} blocks, {} group(s), {} inodes",
        blocks_count, group_count, inodes_count
    );

    // Place each group's metadata. Group 0 starts after the primary SB and
    // GDT; backup groups reserve their first blocks for the copies.
    let mut gdt: Vec<GroupDesc> = Vec::with_capacity(group_count as usize);
    for group in 0..group_count {
        let group_start = group * BLOCKS_PER_GROUP;
        let block_bitmap = if group == 0 {
            GDT_START_BLOCK + gdt_block_count
        } else if is_backup_group(group) {
            group_start + 1 + gdt_block_count
        } else {
            group_start
        };
        let desc = GroupDesc {
            block_bitmap,
            inode_bitmap: block_bitmap + 1,
            inode_table: block_bitmap + 2,
            free_blocks_count: 0,
            free_inodes_count: 0,
            used_dirs_count: 0,
        };
        if desc.inode_table + table_blocks > blocks_count {
            return Err(FsError::InvalidArgument);
        }
        gdt.push(desc);
    }
    let first_data_block = gdt[0].inode_table + table_blocks;

    let timestamp = now();
    let mut superblock = SuperBlock {
        magic: MAGIC,
        inodes_count,
        blocks_count,
        free_blocks_count: 0,
        free_inodes_count: 0,
        first_data_block,
        log_block_size: (BLOCK_SIZE as u32).trailing_zeros() - 10,
        blocks_per_group: BLOCKS_PER_GROUP,
        inodes_per_group: INODES_PER_GROUP,
        mtime: 0,
        wtime: timestamp,
        mnt_count: 0,
        max_mnt_count: 20,
        state: 1,
        errors: 1,
        first_ino: FIRST_INODE,
        inode_size: INODE_SIZE as u16,
        block_group_nr: 0,
        root_inode: ROOT_INODE,
    };

    // Per group: mark the metadata blocks in the block bitmap, reserve the
    // two leading inodes in group 0, zero the inode table.
    let mut root_block = 0;
    for group in 0..group_count {
        let desc = &mut gdt[group as usize];
        let group_start = group * BLOCKS_PER_GROUP;
        let blocks_in_group = if group == group_count - 1 {
            blocks_count - group_start
        } else {
            BLOCKS_PER_GROUP
        };

        let mut block_bitmap = vec![0u8; BLOCK_SIZE];
        let mut used = Vec::new();
        if group == 0 {
            used.push(0); // reserved boot slot
            used.push(SUPERBLOCK_BLOCK);
            for i in 0..gdt_block_count {
                used.push(GDT_START_BLOCK + i);
            }
        } else if is_backup_group(group) {
            used.push(group_start);
            for i in 0..gdt_block_count {
                used.push(group_start + 1 + i);
            }
        }
        used.push(desc.block_bitmap);
        used.push(desc.inode_bitmap);
        for i in 0..table_blocks {
            used.push(desc.inode_table + i);
        }
        for &block in &used {
            bitmap::set(&mut block_bitmap, block - group_start);
        }
        desc.free_blocks_count = (blocks_in_group - used.len() as u32) as u16;

        let mut inode_bitmap = vec![0u8; BLOCK_SIZE];
        desc.free_inodes_count = INODES_PER_GROUP as u16;
        if group == 0 {
            // inodes 1 and 2 (bits 0 and 1) are reserved; 2 is the root
            bitmap::set(&mut inode_bitmap, 0);
            bitmap::set(&mut inode_bitmap, 1);
            desc.free_inodes_count -= 2;

            // carve out the root directory's data block while the bitmap is
            // at hand
            root_block = (first_data_block..group_start + blocks_in_group)
                .find(|&block| !bitmap::is_set(&block_bitmap, block - group_start))
                .ok_or(FsError::NoSpace)?;
            bitmap::set(&mut block_bitmap, root_block - group_start);
            desc.free_blocks_count -= 1;
            desc.used_dirs_count = 1;
        }

        device.write_block(desc.block_bitmap, &block_bitmap)?;
        device.write_block(desc.inode_bitmap, &inode_bitmap)?;
        device.write_zero_blocks(desc.inode_table, table_blocks)?;

        superblock.free_blocks_count += desc.free_blocks_count as u32;
        superblock.free_inodes_count += desc.free_inodes_count as u32;
    }

    // Root directory: one data block holding `.` and `..`, and inode 2 in
    // group 0's table.
    let dir_type = TYPE_DIRECTORY.file_type_nibble();
    device.write_block(root_block, &directory::new_dir_block(ROOT_INODE, ROOT_INODE, dir_type))?;

    let root_inode = Inode {
        mode: TYPE_DIRECTORY | 0o777,
        uid: 0,
        gid: 0,
        size: BLOCK_SIZE as u32,
        links_count: 2,
        blocks: SECTORS_PER_BLOCK,
        atime: timestamp,
        ctime: timestamp,
        mtime: timestamp,
        dtime: 0,
        flags: 0,
        block: {
            let mut block = [0u32; 15];
            block[0] = root_block;
            block
        },
    };
    let inodes_per_block = (BLOCK_SIZE / INODE_SIZE) as u32;
    let root_index = ROOT_INODE - 1;
    let table_block = gdt[0].inode_table + root_index / inodes_per_block;
    let offset = (root_index % inodes_per_block) as usize * INODE_SIZE;
    let mut buffer = vec![0u8; BLOCK_SIZE];
    device.read_block(table_block, &mut buffer)?;
    buffer[offset..offset + INODE_SIZE].copy_from_slice(&root_inode.to_bytes());
    device.write_block(table_block, &buffer)?;

    // Superblock and GDT last: primary copies, then every backup group.
    let superblock_block = superblock.to_block();
    let gdt_image = gdt_to_blocks(&gdt);
    device.write_block(SUPERBLOCK_BLOCK, &superblock_block)?;
    for (i, block) in gdt_image.iter().enumerate() {
        device.write_block(GDT_START_BLOCK + i as u32, block)?;
    }
    for group in 1..group_count {
        if !is_backup_group(group) {
            continue;
        }
        let group_start = group * BLOCKS_PER_GROUP;
        device.write_block(group_start, &superblock_block)?;
        for (i, block) in gdt_image.iter().enumerate() {
            device.write_block(group_start + 1 + i as u32, block)?;
        }
    }

    info!(
        "format complete: {} free blocks, {} free inodes, first data block {}",
        superblock.free_blocks_count, superblock.free_inodes_count, superblock.first_data_block
    );
    Ok(superblock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDevice;
    use crate::fsck;
    use crate::structure::Volume;

    fn scratch_device(blocks: u32) -> FileDevice {
        let file = tempfile::tempfile().unwrap();
        file.set_len(blocks as u64 * BLOCK_SIZE as u64).unwrap();
        FileDevice::from_file(file).unwrap()
    }

    #[test]
    fn refuses_tiny_devices() {
        let mut device = scratch_device(MIN_BLOCKS - 1);
        assert_eq!(format(&mut device), Err(FsError::InvalidArgument));
    }

    #[test]
    fn formats_a_minimal_image() {
        let mut device = scratch_device(MIN_BLOCKS);
        let superblock = format(&mut device).unwrap();
        assert_eq!(superblock.first_data_block, 2 + 1 + 2 + inode_table_blocks());
        // data blocks: everything after the metadata, minus the root block
        assert_eq!(
            superblock.free_blocks_count,
            MIN_BLOCKS - superblock.first_data_block - 1
        );
        assert_eq!(superblock.free_inodes_count, INODES_PER_GROUP - 2);
    }

    #[test]
    fn formatted_image_mounts_clean() {
        let mut device = scratch_device(1024);
        format(&mut device).unwrap();
        assert!(fsck::check(&device).unwrap().is_empty());

        let volume = Volume::mount(device).unwrap();
        assert_eq!(volume.superblock.magic, MAGIC);
        assert_eq!(volume.superblock.root_inode, ROOT_INODE);

        let root = volume.read_inode(ROOT_INODE).unwrap();
        assert!(root.is_directory());
        assert_eq!(root.links_count, 2);
        assert_eq!(root.size, BLOCK_SIZE as u32);
        assert_eq!(root.blocks, 8);
    }

    #[test]
    fn multi_group_layout_places_backups() {
        // 3 groups: 0 and 1 carry backups, 2 does not
        let blocks = BLOCKS_PER_GROUP * 2 + 512;
        let mut device = scratch_device(blocks);
        let superblock = format(&mut device).unwrap();
        assert_eq!(superblock.group_count(), 3);
        assert!(fsck::check(&device).unwrap().is_empty());

        let volume = Volume::mount(device).unwrap();
        // group 1 is a backup group: bitmap sits after its SB + GDT copy
        assert_eq!(volume.gdt[1].block_bitmap, BLOCKS_PER_GROUP + 2);
        // group 2 is plain: bitmap at the group start
        assert_eq!(volume.gdt[2].block_bitmap, BLOCKS_PER_GROUP * 2);
        // backup superblock is readable where expected
        let copy = volume.read_block(BLOCKS_PER_GROUP).unwrap();
        let backup = SuperBlock::from_bytes(&copy);
        assert_eq!(backup.magic, MAGIC);
        assert_eq!(backup.blocks_count, blocks);
    }
}
