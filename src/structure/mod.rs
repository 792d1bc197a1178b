use log::warn;

use crate::consts::{
    BlockNo, InodeNo, BLOCK_SIZE, FIRST_INODE, GDT_START_BLOCK, INODE_SIZE, ROOT_INODE,
    SUPERBLOCK_BLOCK,
};
use crate::device::BlockDevice;
use crate::structure::group::{gdt_to_blocks, is_backup_group, read_gdt, GroupDesc};
use crate::structure::inode::Inode;
use crate::structure::superblock::SuperBlock;
use crate::util::error::{FsError, FsResult};
use crate::util::mode::{ModeBits, ModeBitsHelper};
use crate::util::time::now;

pub mod bitmap;
pub mod blockmap;
pub mod group;
pub mod inode;
pub mod superblock;

/// The mounted volume: the device plus the in-memory superblock and group
/// descriptor table. Every core routine operates through a `&mut Volume`;
/// counters are mutated in place and persisted by `flush_metadata`.
pub struct Volume<D: BlockDevice> {
    pub device: D,
    pub superblock: SuperBlock,
    pub gdt: Vec<GroupDesc>,
}

impl<D: BlockDevice> Volume<D> {
    /// Load the superblock and GDT from a formatted device.
    pub fn mount(device: D) -> FsResult<Volume<D>> {
        let superblock = SuperBlock::read(&device)?;
        let gdt = read_gdt(&device, superblock.group_count())?;
        Ok(Volume { device, superblock, gdt })
    }

    pub fn read_block(&self, index: BlockNo) -> FsResult<Vec<u8>> {
        let mut buffer = vec![0u8; BLOCK_SIZE];
        self.device.read_block(index, &mut buffer)?;
        Ok(buffer)
    }

    pub fn write_block(&mut self, index: BlockNo, buffer: &[u8]) -> FsResult<()> {
        self.device.write_block(index, buffer)
    }

    fn group_containing_inode(&self, inode_num: InodeNo) -> FsResult<usize> {
        let group = ((inode_num - 1) / self.superblock.inodes_per_group) as usize;
        if group >= self.gdt.len() {
            return Err(FsError::Io);
        }
        Ok(group)
    }

    /// The group an inode lives in, used as the locality hint for its data
    /// blocks.
    pub fn preferred_group(&self, inode_num: InodeNo) -> u32 {
        (inode_num - 1) / self.superblock.inodes_per_group
    }

    fn inode_location(&self, inode_num: InodeNo) -> FsResult<(BlockNo, usize)> {
        if inode_num == 0 || inode_num > self.superblock.inodes_count {
            return Err(FsError::InvalidArgument);
        }
        let group = self.group_containing_inode(inode_num)?;
        let index_in_group = (inode_num - 1) % self.superblock.inodes_per_group;
        let inodes_per_block = (BLOCK_SIZE / INODE_SIZE) as u32;
        let block = self.gdt[group].inode_table + index_in_group / inodes_per_block;
        let offset = (index_in_group % inodes_per_block) as usize * INODE_SIZE;
        if block == 0 || block >= self.superblock.blocks_count {
            return Err(FsError::Io);
        }
        Ok((block, offset))
    }

    pub fn read_inode(&self, inode_num: InodeNo) -> FsResult<Inode> {
        let (block, offset) = self.inode_location(inode_num)?;
        let buffer = self.read_block(block)?;
        Ok(Inode::from_bytes(&buffer[offset..offset + INODE_SIZE]))
    }

    pub fn write_inode(&mut self, inode_num: InodeNo, inode: &Inode) -> FsResult<()> {
        let (block, offset) = self.inode_location(inode_num)?;
        let mut buffer = self.read_block(block)?;
        buffer[offset..offset + INODE_SIZE].copy_from_slice(&inode.to_bytes());
        self.write_block(block, &buffer)
    }

    /// First-fit inode allocation: lowest clear bit in the lowest-index group
    /// with free inodes. Marks the bit, persists the bitmap and adjusts the
    /// free counts.
    pub fn alloc_inode(&mut self, mode: ModeBits) -> FsResult<InodeNo> {
        if self.superblock.free_inodes_count == 0 {
            return Err(FsError::NoSpace);
        }
        let inodes_per_group = self.superblock.inodes_per_group;
        for group in 0..self.gdt.len() {
            if self.gdt[group].free_inodes_count == 0 {
                continue;
            }
            let bitmap_block = self.gdt[group].inode_bitmap;
            let mut bitmap = self.read_block(bitmap_block)?;
            for bit in 0..inodes_per_group {
                if bitmap::is_set(&bitmap, bit) {
                    continue;
                }
                let inode_num = group as u32 * inodes_per_group + bit + 1;
                if inode_num > self.superblock.inodes_count {
                    continue;
                }
                bitmap::set(&mut bitmap, bit);
                self.write_block(bitmap_block, &bitmap)?;
                self.gdt[group].free_inodes_count -= 1;
                self.superblock.free_inodes_count -= 1;
                if mode.is_directory() {
                    self.gdt[group].used_dirs_count += 1;
                }
                return Ok(inode_num);
            }
        }
        Err(FsError::NoSpace)
    }

    /// Release an inode number back to its group. Reserved numbers and
    /// out-of-range numbers are ignored.
    pub fn free_inode(&mut self, inode_num: InodeNo, mode: ModeBits) {
        if inode_num == 0 || inode_num > self.superblock.inodes_count {
            return;
        }
        if inode_num < FIRST_INODE && inode_num != ROOT_INODE {
            return;
        }
        let group = match self.group_containing_inode(inode_num) {
            Ok(group) => group,
            Err(_) => return,
        };
        let bit = (inode_num - 1) % self.superblock.inodes_per_group;
        let bitmap_block = self.gdt[group].inode_bitmap;
        let mut bitmap = match self.read_block(bitmap_block) {
            Ok(bitmap) => bitmap,
            Err(_) => return,
        };
        bitmap::clear(&mut bitmap, bit);
        if self.write_block(bitmap_block, &bitmap).is_err() {
            return;
        }
        self.gdt[group].free_inodes_count += 1;
        self.superblock.free_inodes_count += 1;
        if mode.is_directory() && self.gdt[group].used_dirs_count > 0 {
            self.gdt[group].used_dirs_count -= 1;
        }
    }

    /// First-fit block allocation with a group locality hint. Block 0 is
    /// never handed out.
    pub fn alloc_block(&mut self, preferred_group: u32) -> FsResult<BlockNo> {
        if self.superblock.free_blocks_count == 0 {
            return Err(FsError::NoSpace);
        }
        let group_count = self.gdt.len() as u32;
        let mut target = None;
        if preferred_group < group_count && self.gdt[preferred_group as usize].free_blocks_count > 0 {
            target = Some(preferred_group);
        }
        if target.is_none() {
            target = (0..group_count).find(|&g| self.gdt[g as usize].free_blocks_count > 0);
        }
        let group = target.ok_or(FsError::NoSpace)?;

        let bitmap_block = self.gdt[group as usize].block_bitmap;
        let mut bitmap = self.read_block(bitmap_block)?;
        for bit in 0..self.superblock.blocks_per_group {
            if bitmap::is_set(&bitmap, bit) {
                continue;
            }
            let block_num = group * self.superblock.blocks_per_group + bit;
            if block_num == 0 || block_num >= self.superblock.blocks_count {
                continue;
            }
            bitmap::set(&mut bitmap, bit);
            self.write_block(bitmap_block, &bitmap)?;
            self.gdt[group as usize].free_blocks_count -= 1;
            self.superblock.free_blocks_count -= 1;
            return Ok(block_num);
        }
        Err(FsError::NoSpace)
    }

    /// Release a data block. Zero and out-of-range numbers are ignored.
    pub fn free_block(&mut self, block_num: BlockNo) {
        if block_num == 0 || block_num >= self.superblock.blocks_count {
            return;
        }
        let group = (block_num / self.superblock.blocks_per_group) as usize;
        if group >= self.gdt.len() {
            return;
        }
        let bit = block_num % self.superblock.blocks_per_group;
        let bitmap_block = self.gdt[group].block_bitmap;
        let mut bitmap = match self.read_block(bitmap_block) {
            Ok(bitmap) => bitmap,
            Err(_) => return,
        };
        bitmap::clear(&mut bitmap, bit);
        if self.write_block(bitmap_block, &bitmap).is_err() {
            return;
        }
        self.gdt[group].free_blocks_count += 1;
        self.superblock.free_blocks_count += 1;
    }

    /// Persist the superblock and GDT: primary copies first, then the copy in
    /// every backup group. No ordering or checksums; a crash mid-flush may
    /// leave the copies divergent.
    pub fn flush_metadata(&mut self) -> FsResult<()> {
        self.superblock.wtime = now();
        let superblock_block = self.superblock.to_block();
        let gdt_blocks = gdt_to_blocks(&self.gdt);

        self.write_block(SUPERBLOCK_BLOCK, &superblock_block)?;
        for (i, block) in gdt_blocks.iter().enumerate() {
            self.write_block(GDT_START_BLOCK + i as u32, block)?;
        }

        for group in 1..self.gdt.len() as u32 {
            if !is_backup_group(group) {
                continue;
            }
            let group_start = group * self.superblock.blocks_per_group;
            if self.write_block(group_start, &superblock_block).is_err() {
                warn!("failed to refresh backup superblock in group {}", group);
                continue;
            }
            for (i, block) in gdt_blocks.iter().enumerate() {
                if self.write_block(group_start + 1 + i as u32, block).is_err() {
                    warn!("failed to refresh backup GDT in group {}", group);
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mkfs;
    use crate::util::mode::{TYPE_DIRECTORY, TYPE_REGULAR};

    fn test_volume(blocks: u32) -> Volume<crate::device::FileDevice> {
        let file = tempfile::tempfile().unwrap();
        file.set_len(blocks as u64 * BLOCK_SIZE as u64).unwrap();
        let mut device = crate::device::FileDevice::from_file(file).unwrap();
        mkfs::format(&mut device).unwrap();
        Volume::mount(device).unwrap()
    }

    #[test]
    fn mount_reads_back_formatted_state() {
        let volume = test_volume(1024);
        assert_eq!(volume.superblock.blocks_count, 1024);
        assert_eq!(volume.superblock.root_inode, ROOT_INODE);
        assert_eq!(volume.gdt.len(), 1);
        assert_eq!(volume.gdt[0].used_dirs_count, 1);
    }

    #[test]
    fn inode_roundtrip_through_table() {
        let mut volume = test_volume(1024);
        let inode_num = volume.alloc_inode(TYPE_REGULAR | 0o644).unwrap();
        assert_eq!(inode_num, 3); // first clear bit after the reserved 1 and 2

        let inode = Inode {
            mode: TYPE_REGULAR | 0o644,
            uid: 7,
            gid: 8,
            links_count: 1,
            size: 123,
            ..Inode::default()
        };
        volume.write_inode(inode_num, &inode).unwrap();
        assert_eq!(volume.read_inode(inode_num).unwrap(), inode);
    }

    #[test]
    fn alloc_inode_updates_counts() {
        let mut volume = test_volume(1024);
        let free_before = volume.superblock.free_inodes_count;

        let inode_num = volume.alloc_inode(TYPE_DIRECTORY | 0o755).unwrap();
        assert_eq!(volume.superblock.free_inodes_count, free_before - 1);
        assert_eq!(volume.gdt[0].used_dirs_count, 2);

        volume.free_inode(inode_num, TYPE_DIRECTORY | 0o755);
        assert_eq!(volume.superblock.free_inodes_count, free_before);
        assert_eq!(volume.gdt[0].used_dirs_count, 1);
    }

    #[test]
    fn free_inode_ignores_reserved_numbers() {
        let mut volume = test_volume(1024);
        let free_before = volume.superblock.free_inodes_count;
        volume.free_inode(0, 0);
        volume.free_inode(1, 0);
        volume.free_inode(volume.superblock.inodes_count + 1, 0);
        assert_eq!(volume.superblock.free_inodes_count, free_before);
    }

    #[test]
    fn alloc_block_prefers_lowest_free_bit() {
        let mut volume = test_volume(1024);
        let free_before = volume.superblock.free_blocks_count;

        let first = volume.alloc_block(0).unwrap();
        let second = volume.alloc_block(0).unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(volume.superblock.free_blocks_count, free_before - 2);

        volume.free_block(first);
        assert_eq!(volume.alloc_block(0).unwrap(), first);
    }

    #[test]
    fn free_block_ignores_zero_and_out_of_range() {
        let mut volume = test_volume(1024);
        let free_before = volume.superblock.free_blocks_count;
        volume.free_block(0);
        volume.free_block(volume.superblock.blocks_count);
        assert_eq!(volume.superblock.free_blocks_count, free_before);
    }

    #[test]
    fn flush_metadata_survives_remount() {
        let mut volume = test_volume(1024);
        let _ = volume.alloc_block(0).unwrap();
        let free_blocks = volume.superblock.free_blocks_count;
        let group_free = volume.gdt[0].free_blocks_count;
        volume.flush_metadata().unwrap();

        let remounted = Volume::mount(volume.device).unwrap();
        assert_eq!(remounted.superblock.free_blocks_count, free_blocks);
        assert_eq!(remounted.gdt[0].free_blocks_count, group_free);
    }
}
