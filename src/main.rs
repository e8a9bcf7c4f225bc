use clap::crate_version;
use clap::App;
use clap::Arg;

use fuser::MountOption;
use log::error;
use log::LevelFilter;

use crate::base::parse_size;
use crate::fuse_adapter::MemFUSE;
use crate::storage::BLOCK_SIZE;

mod base;
mod fuse_adapter;
mod storage;

fn main() {
    let matches = App::new("memfs")
        .version(crate_version!())
        .arg(Arg::with_name("MOUNTPOINT")
            .required(true)
            .index(1)
            .help("Directory to mount the filesystem at"))
        .arg(Arg::with_name("capacity")
            .long("capacity")
            .value_name("SIZE")
            .default_value("512M")
            .help("Maximum bytes of file data, e.g. 512M or 4G")
            .takes_value(true))
        .arg(Arg::with_name("inodes")
            .long("inodes")
            .value_name("COUNT")
            .help("Maximum number of inodes (default: one per block)")
            .takes_value(true))
        .arg(Arg::with_name("allow-other")
            .long("allow-other")
            .help("Allow other users to access the mount"))
        .arg(Arg::with_name("direct-io")
            .long("direct-io")
            .help("Bypass the kernel page cache for reads and writes"))
        .arg(Arg::with_name("v")
            .short("v")
            .multiple(true)
            .help("Sets the level of verbosity"))
        .get_matches();

    let verbosity: u64 = matches.occurrences_of("v");
    let log_level = match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder().filter_level(log_level).init();

    let mountpoint = matches.value_of("MOUNTPOINT").unwrap_or_default().to_string();
    let capacity = match parse_size(matches.value_of("capacity").unwrap_or_default()) {
        Some(value) if value >= BLOCK_SIZE => value,
        _ => {
            eprintln!("Invalid --capacity; expected a size of at least 4K, e.g. 512M");
            std::process::exit(1);
        }
    };
    let total_blocks = capacity / BLOCK_SIZE;
    let total_inodes = match matches.value_of("inodes") {
        Some(value) => match value.parse::<u64>() {
            Ok(count) if count >= 2 => count,
            _ => {
                eprintln!("Invalid --inodes; expected a number of at least 2");
                std::process::exit(1);
            }
        },
        None => total_blocks.max(2),
    };

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let filesystem = MemFUSE::new(
        total_blocks,
        total_inodes,
        uid,
        gid,
        matches.is_present("direct-io"),
    );

    let mut options = vec![
        MountOption::FSName("memfs".to_string()),
        MountOption::Subtype("memfs".to_string()),
    ];
    if matches.is_present("allow-other") {
        options.push(MountOption::AllowOther);
        options.push(MountOption::AutoUnmount);
    }

    if let Err(error) = fuser::mount2(filesystem, &mountpoint, &options) {
        error!("Failed to mount: {}", error);
        std::process::exit(1);
    }
}
