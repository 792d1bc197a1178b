use crate::consts::{BlockNo, BLOCK_POINTERS, INODE_SIZE};
use crate::util::codec::{put_u16, put_u32, u16_at, u32_at};
use crate::util::mode::{ModeBits, ModeBitsHelper};

/// The 128-byte on-disk inode record. Numbers are 1-based; inode 2 is the
/// root directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inode {
    pub mode: ModeBits,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// 512-byte sectors charged to this inode, indirect nodes included.
    /// Zero for a fast symlink, whose target lives inline in `block`.
    pub blocks: u32,
    pub flags: u32,
    pub block: [BlockNo; BLOCK_POINTERS],
}

impl Inode {
    pub fn to_bytes(&self) -> [u8; INODE_SIZE] {
        let mut buffer = [0u8; INODE_SIZE];
        put_u16(&mut buffer, 0, self.mode);
        put_u16(&mut buffer, 2, self.uid);
        put_u32(&mut buffer, 4, self.size);
        put_u32(&mut buffer, 8, self.atime);
        put_u32(&mut buffer, 12, self.ctime);
        put_u32(&mut buffer, 16, self.mtime);
        put_u32(&mut buffer, 20, self.dtime);
        put_u16(&mut buffer, 24, self.gid);
        put_u16(&mut buffer, 26, self.links_count);
        put_u32(&mut buffer, 28, self.blocks);
        put_u32(&mut buffer, 32, self.flags);
        for (i, pointer) in self.block.iter().enumerate() {
            put_u32(&mut buffer, 36 + i * 4, *pointer);
        }
        buffer
    }

    pub fn from_bytes(buffer: &[u8]) -> Inode {
        let mut block = [0u32; BLOCK_POINTERS];
        for (i, pointer) in block.iter_mut().enumerate() {
            *pointer = u32_at(buffer, 36 + i * 4);
        }
        Inode {
            mode: u16_at(buffer, 0),
            uid: u16_at(buffer, 2),
            size: u32_at(buffer, 4),
            atime: u32_at(buffer, 8),
            ctime: u32_at(buffer, 12),
            mtime: u32_at(buffer, 16),
            dtime: u32_at(buffer, 20),
            gid: u16_at(buffer, 24),
            links_count: u16_at(buffer, 26),
            blocks: u32_at(buffer, 28),
            flags: u32_at(buffer, 32),
            block,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.mode.is_directory()
    }

    pub fn is_regular(&self) -> bool {
        self.mode.is_regular()
    }

    pub fn is_symlink(&self) -> bool {
        self.mode.is_symlink()
    }

    /// A symlink whose target bytes live inline in the pointer array.
    pub fn is_fast_symlink(&self) -> bool {
        self.is_symlink() && self.blocks == 0
    }

    /// The pointer array reinterpreted as raw bytes, little-endian, for fast
    /// symlink storage.
    pub fn inline_target(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(BLOCK_POINTERS * 4);
        for pointer in &self.block {
            bytes.extend_from_slice(&pointer.to_le_bytes());
        }
        bytes.truncate(self.size as usize);
        bytes
    }

    pub fn set_inline_target(&mut self, target: &[u8]) {
        debug_assert!(target.len() < BLOCK_POINTERS * 4);
        let mut raw = [0u8; BLOCK_POINTERS * 4];
        raw[..target.len()].copy_from_slice(target);
        for (i, pointer) in self.block.iter_mut().enumerate() {
            *pointer = u32::from_le_bytes(raw[i * 4..(i + 1) * 4].try_into().unwrap());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::mode::{TYPE_REGULAR, TYPE_SYMLINK};

    #[test]
    fn roundtrip() {
        let inode = Inode {
            mode: TYPE_REGULAR | 0o644,
            uid: 1000,
            size: 8192,
            atime: 1,
            ctime: 2,
            mtime: 3,
            dtime: 0,
            gid: 100,
            links_count: 2,
            blocks: 16,
            flags: 0,
            block: [9, 10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        };
        let bytes = inode.to_bytes();
        assert_eq!(bytes.len(), INODE_SIZE);
        assert_eq!(Inode::from_bytes(&bytes), inode);
    }

    #[test]
    fn inline_target_roundtrip() {
        let mut inode = Inode {
            mode: TYPE_SYMLINK | 0o777,
            ..Inode::default()
        };
        let target = b"../some/relative/target";
        inode.set_inline_target(target);
        inode.size = target.len() as u32;
        assert!(inode.is_fast_symlink());
        assert_eq!(inode.inline_target(), target);

        // survives the on-disk codec
        let reread = Inode::from_bytes(&inode.to_bytes());
        assert_eq!(reread.inline_target(), target);
    }
}
