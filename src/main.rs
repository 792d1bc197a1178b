use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fuser::MountOption;
use log::info;

use spanfs::device::FileDevice;
use spanfs::fuse::SpanFuse;
use spanfs::ops::SpanFs;
use spanfs::util::time::now;

#[derive(Parser)]
#[command(name = "spanfs", about = "Mount a SpanFS image over FUSE")]
struct Cli {
    /// Disk image or block device holding the filesystem
    device: PathBuf,

    /// Directory to mount it on
    mountpoint: PathBuf,

    /// Extra mount options, passed through to FUSE
    #[arg(short = 'o', value_name = "OPT")]
    options: Vec<String>,
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let device = FileDevice::open(&cli.device)?;
    let mut fs = SpanFs::mount(device)?;
    info!(
        "mounted {}: {} blocks, {} free",
        cli.device.display(),
        fs.volume.superblock.blocks_count,
        fs.volume.superblock.free_blocks_count
    );

    fs.volume.superblock.mnt_count += 1;
    fs.volume.superblock.mtime = now();
    fs.volume.flush_metadata()?;

    let mut options = vec![MountOption::FSName(String::from("spanfs"))];
    if !cli.options.iter().any(|option| option == "allow_other") {
        options.push(MountOption::AllowOther);
    }
    for option in cli.options {
        options.push(MountOption::CUSTOM(option));
    }

    fuser::mount2(SpanFuse::new(fs), &cli.mountpoint, &options)?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("spanfs: {}", error);
            ExitCode::FAILURE
        }
    }
}
