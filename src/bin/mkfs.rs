use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::info;

use spanfs::consts::MIN_BLOCKS;
use spanfs::device::{BlockDevice, FileDevice};
use spanfs::mkfs;

#[derive(Parser)]
#[command(name = "mkfs.spanfs", about = "Write an empty SpanFS onto a device or image file")]
struct Cli {
    /// Disk image or block device to format
    device: PathBuf,

    /// Total block count; required when creating a new image file, ignored
    /// for block devices
    num_blocks: Option<u32>,
}

fn open_target(cli: &Cli) -> Result<(FileDevice, bool), Box<dyn Error>> {
    if !cli.device.exists() {
        let blocks = cli
            .num_blocks
            .ok_or("image file does not exist; pass a block count to create it")?;
        info!("creating {} with {} blocks", cli.device.display(), blocks);
        return Ok((FileDevice::create(&cli.device, blocks)?, true));
    }

    let mut device = FileDevice::open(&cli.device)?;
    if device.is_block_device() {
        if cli.num_blocks.is_some() {
            info!("block device size is probed; ignoring the block count argument");
        }
        return Ok((device, false));
    }

    if device.block_count() == 0 {
        let blocks = cli
            .num_blocks
            .ok_or("image file is empty; pass a block count to size it")?;
        device.set_block_count(blocks)?;
    } else if cli.num_blocks.is_some() {
        info!("image file already has a size; ignoring the block count argument");
    }
    Ok((device, false))
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let (mut device, created) = open_target(&cli)?;

    if device.block_count() < MIN_BLOCKS {
        if created {
            let _ = std::fs::remove_file(&cli.device);
        }
        return Err(format!("device too small: at least {} blocks required", MIN_BLOCKS).into());
    }

    match mkfs::format(&mut device) {
        Ok(superblock) => {
            println!(
                "formatted {}: {} blocks in {} group(s), {} inodes, {} blocks free",
                cli.device.display(),
                superblock.blocks_count,
                superblock.group_count(),
                superblock.inodes_count,
                superblock.free_blocks_count
            );
            Ok(())
        }
        Err(error) => {
            // no partial recovery; a file we created is removed again
            if created {
                let _ = std::fs::remove_file(&cli.device);
            }
            Err(error.into())
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("mkfs.spanfs: {}", error);
            ExitCode::FAILURE
        }
    }
}
