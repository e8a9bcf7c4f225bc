mod types;
mod utils;

pub use types::{ErrorCode, FileKind, UserContext};
pub use utils::{check_access, parse_size};
