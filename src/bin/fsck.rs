use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use spanfs::device::FileDevice;
use spanfs::fsck;

#[derive(Parser)]
#[command(name = "fsck.spanfs", about = "Check SpanFS free-count consistency, read-only")]
struct Cli {
    /// Disk image or block device to check
    device: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let device = match FileDevice::open_read_only(&cli.device) {
        Ok(device) => device,
        Err(error) => {
            eprintln!("fsck.spanfs: cannot open {}: {}", cli.device.display(), error);
            return ExitCode::FAILURE;
        }
    };

    match fsck::check(&device) {
        Ok(report) => {
            for line in &report {
                println!("{}", line);
            }
            if report.is_empty() {
                println!("{}: clean", cli.device.display());
            } else {
                println!("{}: {} mismatch(es) found", cli.device.display(), report.len());
            }
            // reporting is the job; mismatches do not fail the run
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("fsck.spanfs: {}", error);
            ExitCode::FAILURE
        }
    }
}
