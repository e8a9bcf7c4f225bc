mod inode;
mod table;

pub use inode::InodeAttributes;
pub use table::{FilesystemStats, InodeTable};

use fuser::FUSE_ROOT_ID;

pub const ROOT_INODE: u64 = FUSE_ROOT_ID;
pub const BLOCK_SIZE: u64 = 4096;
pub const MAX_NAME_LENGTH: u32 = 255;
pub const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024 * 1024;
