use crate::consts::BLOCK_SIZE;
use crate::device::BlockDevice;
use crate::structure::bitmap;
use crate::structure::group::read_gdt;
use crate::structure::superblock::SuperBlock;
use crate::util::error::FsResult;

/// Read-only consistency check: recompute each group's free counts from its
/// bitmaps and compare against the group descriptors and the superblock.
/// Returns one line per mismatch; an empty report means the counters agree.
pub fn check<D: BlockDevice>(device: &D) -> FsResult<Vec<String>> {
    let superblock = SuperBlock::read(device)?;
    let gdt = read_gdt(device, superblock.group_count())?;

    let mut report = Vec::new();
    let mut total_free_blocks: u64 = 0;
    let mut total_free_inodes: u64 = 0;

    for (group, desc) in gdt.iter().enumerate() {
        let group_start = group as u32 * superblock.blocks_per_group;
        let blocks_in_group = superblock
            .blocks_per_group
            .min(superblock.blocks_count - group_start);

        let mut block_bitmap = vec![0u8; BLOCK_SIZE];
        device.read_block(desc.block_bitmap, &mut block_bitmap)?;
        let free_blocks = bitmap::count_clear(&block_bitmap, blocks_in_group);
        if free_blocks != desc.free_blocks_count as u32 {
            report.push(format!(
                "group {}: block bitmap has {} free, descriptor says {}",
                group, free_blocks, desc.free_blocks_count
            ));
        }

        let mut inode_bitmap = vec![0u8; BLOCK_SIZE];
        device.read_block(desc.inode_bitmap, &mut inode_bitmap)?;
        let free_inodes = bitmap::count_clear(&inode_bitmap, superblock.inodes_per_group);
        if free_inodes != desc.free_inodes_count as u32 {
            report.push(format!(
                "group {}: inode bitmap has {} free, descriptor says {}",
                group, free_inodes, desc.free_inodes_count
            ));
        }

        total_free_blocks += free_blocks as u64;
        total_free_inodes += free_inodes as u64;
    }

    if total_free_blocks != superblock.free_blocks_count as u64 {
        report.push(format!(
            "superblock free block count {} does not match bitmaps ({})",
            superblock.free_blocks_count, total_free_blocks
        ));
    }
    if total_free_inodes != superblock.free_inodes_count as u64 {
        report.push(format!(
            "superblock free inode count {} does not match bitmaps ({})",
            superblock.free_inodes_count, total_free_inodes
        ));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::SUPERBLOCK_BLOCK;
    use crate::device::FileDevice;
    use crate::mkfs;

    fn formatted_device(blocks: u32) -> FileDevice {
        let file = tempfile::tempfile().unwrap();
        file.set_len(blocks as u64 * BLOCK_SIZE as u64).unwrap();
        let mut device = FileDevice::from_file(file).unwrap();
        mkfs::format(&mut device).unwrap();
        device
    }

    #[test]
    fn fresh_image_is_clean() {
        let device = formatted_device(1024);
        assert!(check(&device).unwrap().is_empty());
    }

    #[test]
    fn detects_a_skewed_superblock_count() {
        let mut device = formatted_device(1024);
        let mut superblock = SuperBlock::read(&device).unwrap();
        superblock.free_blocks_count -= 1;
        device
            .write_block(SUPERBLOCK_BLOCK, &superblock.to_block())
            .unwrap();

        let report = check(&device).unwrap();
        assert_eq!(report.len(), 1);
        assert!(report[0].contains("superblock free block count"));
    }

    #[test]
    fn detects_a_corrupt_group_descriptor() {
        let mut device = formatted_device(1024);
        let superblock = SuperBlock::read(&device).unwrap();
        let mut gdt = read_gdt(&device, superblock.group_count()).unwrap();
        gdt[0].free_inodes_count += 5;
        let blocks = crate::structure::group::gdt_to_blocks(&gdt);
        device.write_block(crate::consts::GDT_START_BLOCK, &blocks[0]).unwrap();

        let report = check(&device).unwrap();
        assert!(report.iter().any(|line| line.contains("inode bitmap")));
    }
}
