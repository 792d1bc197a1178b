use crate::consts::{BlockNo, BLOCK_SIZE, GDT_START_BLOCK, GROUP_DESC_SIZE, INODES_PER_GROUP, INODE_SIZE};
use crate::device::BlockDevice;
use crate::util::codec::{put_u16, put_u32, u16_at, u32_at};
use crate::util::error::FsResult;

/// One 32-byte group descriptor: where the group's bitmaps and inode table
/// live, plus its free counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupDesc {
    pub block_bitmap: BlockNo,
    pub inode_bitmap: BlockNo,
    pub inode_table: BlockNo,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    pub fn to_bytes(&self) -> [u8; GROUP_DESC_SIZE] {
        let mut buffer = [0u8; GROUP_DESC_SIZE];
        put_u32(&mut buffer, 0, self.block_bitmap);
        put_u32(&mut buffer, 4, self.inode_bitmap);
        put_u32(&mut buffer, 8, self.inode_table);
        put_u16(&mut buffer, 12, self.free_blocks_count);
        put_u16(&mut buffer, 14, self.free_inodes_count);
        put_u16(&mut buffer, 16, self.used_dirs_count);
        buffer
    }

    pub fn from_bytes(buffer: &[u8]) -> GroupDesc {
        GroupDesc {
            block_bitmap: u32_at(buffer, 0),
            inode_bitmap: u32_at(buffer, 4),
            inode_table: u32_at(buffer, 8),
            free_blocks_count: u16_at(buffer, 12),
            free_inodes_count: u16_at(buffer, 14),
            used_dirs_count: u16_at(buffer, 16),
        }
    }
}

/// Blocks occupied by a table of `group_count` descriptors.
pub fn gdt_blocks(group_count: u32) -> u32 {
    (group_count * GROUP_DESC_SIZE as u32).div_ceil(BLOCK_SIZE as u32)
}

/// Blocks occupied by one group's inode table.
pub fn inode_table_blocks() -> u32 {
    (INODES_PER_GROUP * INODE_SIZE as u32).div_ceil(BLOCK_SIZE as u32)
}

/// A group carries a superblock + GDT copy iff its index is 0, 1, or factors
/// entirely over {3, 5, 7}.
pub fn is_backup_group(group: u32) -> bool {
    if group == 0 || group == 1 {
        return true;
    }
    let mut n = group;
    while n % 3 == 0 {
        n /= 3;
    }
    while n % 5 == 0 {
        n /= 5;
    }
    while n % 7 == 0 {
        n /= 7;
    }
    n == 1
}

/// Serialize the descriptor table into zero-padded blocks.
pub fn gdt_to_blocks(gdt: &[GroupDesc]) -> Vec<Vec<u8>> {
    let mut raw = Vec::with_capacity(gdt.len() * GROUP_DESC_SIZE);
    for desc in gdt {
        raw.extend_from_slice(&desc.to_bytes());
    }
    raw.resize(gdt_blocks(gdt.len() as u32) as usize * BLOCK_SIZE, 0);
    raw.chunks(BLOCK_SIZE).map(|chunk| chunk.to_vec()).collect()
}

/// Read the primary descriptor table from its fixed location after the
/// superblock.
pub fn read_gdt<D: BlockDevice>(device: &D, group_count: u32) -> FsResult<Vec<GroupDesc>> {
    let blocks = gdt_blocks(group_count);
    let mut raw = vec![0u8; blocks as usize * BLOCK_SIZE];
    for i in 0..blocks {
        let offset = i as usize * BLOCK_SIZE;
        device.read_block(GDT_START_BLOCK + i, &mut raw[offset..offset + BLOCK_SIZE])?;
    }
    let gdt = (0..group_count as usize)
        .map(|g| GroupDesc::from_bytes(&raw[g * GROUP_DESC_SIZE..(g + 1) * GROUP_DESC_SIZE]))
        .collect();
    Ok(gdt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrip() {
        let desc = GroupDesc {
            block_bitmap: 37,
            inode_bitmap: 38,
            inode_table: 39,
            free_blocks_count: 31000,
            free_inodes_count: 1022,
            used_dirs_count: 1,
        };
        let bytes = desc.to_bytes();
        assert_eq!(bytes.len(), GROUP_DESC_SIZE);
        assert_eq!(GroupDesc::from_bytes(&bytes), desc);
    }

    #[test]
    fn backup_groups_factor_over_3_5_7() {
        let backups: Vec<u32> = (0..50).filter(|&g| is_backup_group(g)).collect();
        assert_eq!(backups, vec![0, 1, 3, 5, 7, 9, 15, 21, 25, 27, 35, 45]);
    }

    #[test]
    fn gdt_sizes() {
        assert_eq!(gdt_blocks(1), 1);
        assert_eq!(gdt_blocks(128), 1);
        assert_eq!(gdt_blocks(129), 2);
        assert_eq!(inode_table_blocks(), 32);
    }

    #[test]
    fn gdt_block_serialization() {
        let gdt = vec![GroupDesc::default(); 3];
        let blocks = gdt_to_blocks(&gdt);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), BLOCK_SIZE);
    }
}
