use crate::consts::{BlockNo, InodeNo, BLOCK_SIZE, MAGIC, SUPERBLOCK_BLOCK, SUPERBLOCK_SIZE};
use crate::device::BlockDevice;
use crate::util::codec::{put_u16, put_u32, u16_at, u32_at};
use crate::util::error::{FsError, FsResult};

/// The 1024-byte superblock stored at block 1 and replicated into every
/// backup group's first block.
#[derive(Debug, Clone, PartialEq)]
pub struct SuperBlock {
    pub magic: u16,
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: BlockNo,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub state: u16,
    pub errors: u16,
    pub first_ino: InodeNo,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub root_inode: InodeNo,
}

impl SuperBlock {
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buffer = [0u8; SUPERBLOCK_SIZE];
        put_u16(&mut buffer, 0, self.magic);
        put_u32(&mut buffer, 2, self.inodes_count);
        put_u32(&mut buffer, 6, self.blocks_count);
        put_u32(&mut buffer, 10, self.free_blocks_count);
        put_u32(&mut buffer, 14, self.free_inodes_count);
        put_u32(&mut buffer, 18, self.first_data_block);
        put_u32(&mut buffer, 22, self.log_block_size);
        put_u32(&mut buffer, 26, self.blocks_per_group);
        put_u32(&mut buffer, 30, self.inodes_per_group);
        put_u32(&mut buffer, 34, self.mtime);
        put_u32(&mut buffer, 38, self.wtime);
        put_u16(&mut buffer, 42, self.mnt_count);
        put_u16(&mut buffer, 44, self.max_mnt_count);
        put_u16(&mut buffer, 46, self.state);
        put_u16(&mut buffer, 48, self.errors);
        put_u32(&mut buffer, 50, self.first_ino);
        put_u16(&mut buffer, 54, self.inode_size);
        put_u16(&mut buffer, 56, self.block_group_nr);
        put_u32(&mut buffer, 58, self.root_inode);
        buffer
    }

    pub fn from_bytes(buffer: &[u8]) -> SuperBlock {
        SuperBlock {
            magic: u16_at(buffer, 0),
            inodes_count: u32_at(buffer, 2),
            blocks_count: u32_at(buffer, 6),
            free_blocks_count: u32_at(buffer, 10),
            free_inodes_count: u32_at(buffer, 14),
            first_data_block: u32_at(buffer, 18),
            log_block_size: u32_at(buffer, 22),
            blocks_per_group: u32_at(buffer, 26),
            inodes_per_group: u32_at(buffer, 30),
            mtime: u32_at(buffer, 34),
            wtime: u32_at(buffer, 38),
            mnt_count: u16_at(buffer, 42),
            max_mnt_count: u16_at(buffer, 44),
            state: u16_at(buffer, 46),
            errors: u16_at(buffer, 48),
            first_ino: u32_at(buffer, 50),
            inode_size: u16_at(buffer, 54),
            block_group_nr: u16_at(buffer, 56),
            root_inode: u32_at(buffer, 58),
        }
    }

    /// Read and validate the superblock from its primary location.
    pub fn read<D: BlockDevice>(device: &D) -> FsResult<SuperBlock> {
        let mut buffer = vec![0u8; BLOCK_SIZE];
        device.read_block(SUPERBLOCK_BLOCK, &mut buffer)?;
        let superblock = SuperBlock::from_bytes(&buffer);
        if superblock.magic != MAGIC {
            return Err(FsError::InvalidArgument);
        }
        Ok(superblock)
    }

    /// Render into a full zero-padded block for writing.
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..SUPERBLOCK_SIZE].copy_from_slice(&self.to_bytes());
        block
    }

    pub fn group_count(&self) -> u32 {
        self.blocks_count.div_ceil(self.blocks_per_group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{FIRST_INODE, INODE_SIZE, ROOT_INODE};

    fn sample() -> SuperBlock {
        SuperBlock {
            magic: MAGIC,
            inodes_count: 2048,
            blocks_count: 65536,
            free_blocks_count: 65000,
            free_inodes_count: 2040,
            first_data_block: 37,
            log_block_size: 2,
            blocks_per_group: 32768,
            inodes_per_group: 1024,
            mtime: 100,
            wtime: 200,
            mnt_count: 3,
            max_mnt_count: 20,
            state: 1,
            errors: 1,
            first_ino: FIRST_INODE,
            inode_size: INODE_SIZE as u16,
            block_group_nr: 0,
            root_inode: ROOT_INODE,
        }
    }

    #[test]
    fn roundtrip() {
        let superblock = sample();
        let bytes = superblock.to_bytes();
        assert_eq!(SuperBlock::from_bytes(&bytes), superblock);
    }

    #[test]
    fn layout_is_little_endian_and_packed() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), SUPERBLOCK_SIZE);
        // magic lands in the first two bytes, low byte first
        assert_eq!(bytes[0], 0x50);
        assert_eq!(bytes[1], 0x53);
        // inodes_count immediately follows, unaligned
        assert_eq!(u32::from_le_bytes(bytes[2..6].try_into().unwrap()), 2048);
    }

    #[test]
    fn group_count_rounds_up() {
        let mut superblock = sample();
        assert_eq!(superblock.group_count(), 2);
        superblock.blocks_count = 32768;
        assert_eq!(superblock.group_count(), 1);
        superblock.blocks_count = 32769;
        assert_eq!(superblock.group_count(), 2);
    }
}
