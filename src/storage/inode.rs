use std::collections::BTreeMap;
use std::mem;
use std::ops::Bound;
use std::time::SystemTime;

use crate::base::FileKind;
use crate::storage::BLOCK_SIZE;

const BLOCK_BYTES: usize = BLOCK_SIZE as usize;

#[derive(Clone, Debug)]
pub struct InodeAttributes {
    pub inode: u64,
    pub size: u64,
    pub last_accessed: SystemTime,
    pub last_modified: SystemTime,
    pub last_metadata_changed: SystemTime,
    pub creation_time: SystemTime,
    pub kind: FileKind,
    // Permissions and special mode bits
    pub mode: u16,
    pub hardlinks: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
}

impl InodeAttributes {
    pub fn blocks(&self) -> u64 {
        blocks_for(self.size)
    }
}

pub fn blocks_for(size: u64) -> u64 {
    (size + BLOCK_SIZE - 1) / BLOCK_SIZE
}

pub struct Inode {
    pub attrs: InodeAttributes,
    // Kernel-side dentry references. Raised by every entry reply, drained by
    // forget. Independent of attrs.hardlinks; the slot is reclaimed only once
    // both reach zero.
    pub nlookup: u64,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub body: InodeBody,
}

pub enum InodeBody {
    File(FileBlocks),
    Directory(DirectoryEntries),
    Symlink { target: String },
    // Occupies reserved slots (inode 0); never reachable by any operation.
    Special,
}

/// The byte range `[0, size)` of a regular file, stored as fixed-size chunks.
/// Bytes between `size` and the end of the last chunk are kept zeroed so that
/// sparse growth reads back zeros.
pub struct FileBlocks {
    blocks: Vec<Box<[u8; BLOCK_BYTES]>>,
}

impl FileBlocks {
    pub fn new() -> FileBlocks {
        FileBlocks { blocks: vec![] }
    }

    pub fn read(&self, file_size: u64, offset: u64, size: u32) -> Vec<u8> {
        if offset >= file_size {
            return vec![];
        }
        let end = file_size.min(offset + u64::from(size)) as usize;
        let mut result = Vec::with_capacity(end - offset as usize);
        let mut position = offset as usize;
        while position < end {
            let block = position / BLOCK_BYTES;
            let block_offset = position % BLOCK_BYTES;
            let chunk = (BLOCK_BYTES - block_offset).min(end - position);
            result.extend_from_slice(&self.blocks[block][block_offset..block_offset + chunk]);
            position += chunk;
        }
        result
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) {
        let needed = blocks_for(offset + data.len() as u64) as usize;
        while self.blocks.len() < needed {
            self.blocks.push(Box::new([0; BLOCK_BYTES]));
        }
        let mut position = offset as usize;
        let mut written = 0;
        while written < data.len() {
            let block = position / BLOCK_BYTES;
            let block_offset = position % BLOCK_BYTES;
            let chunk = (BLOCK_BYTES - block_offset).min(data.len() - written);
            self.blocks[block][block_offset..block_offset + chunk]
                .copy_from_slice(&data[written..written + chunk]);
            position += chunk;
            written += chunk;
        }
    }

    pub fn truncate(&mut self, new_size: u64) {
        let needed = blocks_for(new_size) as usize;
        while self.blocks.len() < needed {
            self.blocks.push(Box::new([0; BLOCK_BYTES]));
        }
        self.blocks.truncate(needed);
        // The cut-off tail must read back as zero if the file grows again.
        let tail = (new_size % BLOCK_SIZE) as usize;
        if tail != 0 {
            if let Some(last) = self.blocks.last_mut() {
                last[tail..].fill(0);
            }
        }
    }
}

/// Directory contents: a name-ordered map from entry name to inode number.
/// Every directory holds `.` and `..`; the name ordering is what the readdir
/// cursor resumes on.
pub struct DirectoryEntries {
    children: BTreeMap<String, u64>,
}

impl DirectoryEntries {
    pub fn new() -> DirectoryEntries {
        DirectoryEntries {
            children: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.children.get(name).copied()
    }

    pub fn insert(&mut self, name: String, inode: u64) {
        self.children.insert(name, inode);
    }

    pub fn remove(&mut self, name: &str) -> Option<u64> {
        self.children.remove(name)
    }

    /// True when the directory holds anything beyond `.` and `..`.
    pub fn has_real_entries(&self) -> bool {
        self.children.len() > 2
    }

    pub fn iter_after<'a>(
        &'a self,
        resume_after: Option<&str>,
    ) -> impl Iterator<Item = (&'a String, u64)> + 'a {
        let start = match resume_after {
            Some(name) => Bound::Excluded(name),
            None => Bound::Unbounded,
        };
        self.children
            .range::<str, _>((start, Bound::Unbounded))
            .map(|(name, ino)| (name, *ino))
    }
}

/// Byte-size estimate of one directory entry, mirrored into the directory's
/// reported size as entries come and go.
pub fn directory_entry_size(name: &str) -> u64 {
    (mem::size_of::<String>() + mem::size_of::<u64>() + name.len()) as u64
}

pub fn directory_base_size() -> u64 {
    mem::size_of::<BTreeMap<String, u64>>() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn read_empty_file() {
        let file = FileBlocks::new();
        assert_eq!(file.read(0, 0, 4096), Vec::<u8>::new());
    }

    #[test]
    fn read_past_end_is_empty() {
        let mut file = FileBlocks::new();
        file.write(0, b"hello");
        assert_eq!(file.read(5, 5, 100), Vec::<u8>::new());
        assert_eq!(file.read(5, 100, 100), Vec::<u8>::new());
    }

    #[test]
    fn read_clamps_to_size() {
        let mut file = FileBlocks::new();
        file.write(0, b"hello");
        assert_eq!(file.read(5, 0, 100), b"hello");
        assert_eq!(file.read(5, 3, 100), b"lo");
    }

    #[test]
    fn sparse_write_zero_fills_the_hole() {
        let mut file = FileBlocks::new();
        file.write(BLOCK_SIZE + 10, b"x");
        let data = file.read(BLOCK_SIZE + 11, 0, (BLOCK_SIZE + 11) as u32);
        assert_eq!(data.len() as u64, BLOCK_SIZE + 11);
        assert!(data[..(BLOCK_SIZE + 10) as usize].iter().all(|&b| b == 0));
        assert_eq!(data[(BLOCK_SIZE + 10) as usize], b'x');
    }

    #[test]
    fn write_spanning_blocks() {
        let mut file = FileBlocks::new();
        let data: Vec<u8> = (0..3 * BLOCK_BYTES + 17).map(|i| (i % 251) as u8).collect();
        file.write(100, &data);
        let size = 100 + data.len() as u64;
        assert_eq!(file.read(size, 100, data.len() as u32), data);
    }

    #[test]
    fn truncate_then_grow_reads_zeros() {
        let mut file = FileBlocks::new();
        file.write(0, &[0xff; 3000]);
        file.truncate(1000);
        file.truncate(3000);
        let data = file.read(3000, 0, 3000);
        assert_eq!(&data[..1000], &[0xff; 1000][..]);
        assert!(data[1000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn truncate_frees_whole_blocks() {
        let mut file = FileBlocks::new();
        file.write(0, &vec![1u8; 3 * BLOCK_BYTES]);
        file.truncate(BLOCK_SIZE);
        assert_eq!(file.blocks.len(), 1);
        file.truncate(0);
        assert_eq!(file.blocks.len(), 0);
    }

    #[test]
    fn blocks_for_rounds_up() {
        assert_eq!(blocks_for(0), 0);
        assert_eq!(blocks_for(1), 1);
        assert_eq!(blocks_for(BLOCK_SIZE), 1);
        assert_eq!(blocks_for(BLOCK_SIZE + 1), 2);
    }

    #[test]
    fn random_writes_match_flat_model() {
        let mut file = FileBlocks::new();
        let mut model = vec![0u8; 20 * 1024];
        let mut size = 0u64;

        for _ in 0..1000 {
            let len = rand::thread_rng().gen_range(1..2000);
            let offset = rand::thread_rng().gen_range(0..(model.len() - len));
            let mut data = vec![0u8; len];
            rand::thread_rng().fill(&mut data[..]);

            model[offset..offset + len].copy_from_slice(&data);
            file.write(offset as u64, &data);
            size = size.max((offset + len) as u64);

            assert_eq!(file.read(size, offset as u64, len as u32), data);
            assert_eq!(file.read(size, 0, size as u32), model[..size as usize]);
        }
    }

    #[test]
    fn directory_entries_are_name_ordered() {
        let mut dir = DirectoryEntries::new();
        dir.insert(".".to_string(), 1);
        dir.insert("..".to_string(), 1);
        dir.insert("zeta".to_string(), 5);
        dir.insert("alpha".to_string(), 3);
        let names: Vec<&str> = dir.iter_after(None).map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, [".", "..", "alpha", "zeta"]);
    }

    #[test]
    fn iter_after_resumes_past_the_cursor() {
        let mut dir = DirectoryEntries::new();
        for name in ["a", "b", "c", "d"] {
            dir.insert(name.to_string(), 10);
        }
        let names: Vec<&str> = dir.iter_after(Some("b")).map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["c", "d"]);
        // A deleted cursor name still resumes at the next present entry
        dir.remove("c");
        let names: Vec<&str> = dir.iter_after(Some("b")).map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["d"]);
    }

    #[test]
    fn has_real_entries_ignores_dot_entries() {
        let mut dir = DirectoryEntries::new();
        dir.insert(".".to_string(), 2);
        dir.insert("..".to_string(), 1);
        assert!(!dir.has_real_entries());
        dir.insert("f".to_string(), 3);
        assert!(dir.has_real_entries());
    }
}
