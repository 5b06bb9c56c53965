use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;
use log::LevelFilter;

use appendfs::AppendFs;

/// Append-only log-backed FUSE filesystem.
#[derive(Parser, Debug)]
#[command(name = "appendfs", version, author)]
struct Cli {
    /// Where to mount the filesystem.
    mount_point: PathBuf,

    /// Path to the append-only data log (created if missing).
    #[arg(long, default_value = "appendfs.data")]
    data_log: PathBuf,

    /// Path to the metadata log (created if missing).
    #[arg(long, default_value = "appendfs.meta")]
    meta_log: PathBuf,

    /// Automatically unmount when this process exits.
    #[arg(long)]
    auto_unmount: bool,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,

    /// Verbosity; repeat for more detail (-v, -vv, -vvv).
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .format_timestamp_nanos()
        .filter_level(log_level)
        .init();

    let fs = match AppendFs::open(&cli.data_log, &cli.meta_log) {
        Ok(fs) => fs,
        Err(err) => {
            error!("failed to open logs: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut options = vec![fuser::MountOption::FSName("appendfs".to_string())];
    if cli.auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    if cli.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    match fuser::mount2(fs, &cli.mount_point, &options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if err.kind() == ErrorKind::PermissionDenied {
                error!("{err} (is \"user_allow_other\" set in /etc/fuse.conf?)");
            } else {
                error!("{err}");
            }
            ExitCode::FAILURE
        }
    }
}
