//! File System implementation
//!
//! The stateful front end of the store.  It composes the block manager and the
//! version graph, tracks which files are open, and implements the
//! copy-on-write write path: reconstruct the current image, splice in the new
//! bytes, diff at block granularity, allocate fresh blocks for the changed
//! positions only, and append a version that shares everything else with its
//! parent.
//!
//! External callers interact only with this type; it exclusively owns both
//! collaborators underneath.

use std::{
    cmp,
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use chrono::{TimeZone, Utc};
use log::{debug, error, info};

use crate::{
    block::{BlockManager, BlockNumber, BlockSize},
    error::{Result, StoreError},
    graph::VersionGraph,
    metadata::{FileMetadata, FileSize, VersionInfo},
};

/// Suffix appended to the storage path to name the metadata directory.
const METADATA_DIR_SUFFIX: &str = "_metadata";

/// How much of each block `inspect_blocks` shows.
const PREVIEW_BYTES: usize = 40;

/// Main File System Implementation
///
/// One instance per backing file.  Dropping the instance performs a final
/// sync, so a host that simply lets it go out of scope gets a durable
/// checkpoint.
#[derive(Debug)]
pub struct CowFileSystem {
    block_manager: BlockManager,
    version_graph: VersionGraph,
    /// Names of the files currently open
    ///
    open_files: HashSet<String>,
}

impl CowFileSystem {
    /// Open or create a store at `path` with the default block size.
    ///
    /// The capacity is rounded down to a whole number of blocks.  Metadata
    /// persisted by an earlier instance under `<path>_metadata` is loaded, so
    /// reopening with the same arguments resumes exactly where the last
    /// `sync` left off.
    pub fn new<P: AsRef<Path>>(path: P, total_bytes: u64) -> Result<Self> {
        CowFileSystem::with_block_size(path, total_bytes, BlockSize::default())
    }

    /// As [`CowFileSystem::new`], with an explicit block size.
    pub fn with_block_size<P: AsRef<Path>>(
        path: P,
        total_bytes: u64,
        block_size: BlockSize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let block_manager = BlockManager::open_with_block_size(path, total_bytes, block_size)?;

        let mut dir = path.as_os_str().to_os_string();
        dir.push(METADATA_DIR_SUFFIX);
        let metadata_dir = PathBuf::from(dir);

        let mut version_graph = VersionGraph::new(&metadata_dir);
        if metadata_dir.exists() {
            version_graph.load()?;
        }

        info!(
            "mounted store at {:?}: {} {} blocks, {} files",
            path,
            block_manager.total_blocks(),
            block_manager.block_size(),
            version_graph.files().len()
        );

        Ok(CowFileSystem {
            block_manager,
            version_graph,
            open_files: HashSet::new(),
        })
    }

    /// Create a file
    ///
    /// The new file gets version 1: no parent, no blocks.  Creating does not
    /// open it.
    pub fn create(&mut self, name: &str, file_type: &str) -> Result<()> {
        debug!("--------");
        debug!("`create`: {} ({})", name, file_type);

        if name.contains('/') || name.contains('\\') {
            return Err(StoreError::InvalidName(name.to_owned()));
        }

        self.version_graph.create_file(name, file_type)
    }

    /// Open a file
    ///
    /// Reads and writes require the file to be open.  A file can be opened
    /// only once at a time; any number of distinct files may be open
    /// together.
    pub fn open(&mut self, name: &str) -> Result<()> {
        debug!("--------");
        debug!("`open`: {}", name);

        if !self.version_graph.file_exists(name) {
            return Err(StoreError::NotFound(name.to_owned()));
        }
        if !self.open_files.insert(name.to_owned()) {
            return Err(StoreError::AlreadyOpen(name.to_owned()));
        }
        Ok(())
    }

    /// Close a file
    ///
    /// Closing syncs the store.
    pub fn close(&mut self, name: &str) -> Result<()> {
        debug!("--------");
        debug!("`close`: {}", name);

        if !self.open_files.remove(name) {
            return Err(StoreError::NotOpen(name.to_owned()));
        }
        self.sync()
    }

    /// Read the full current content of an open file.
    ///
    /// Trailing NUL bytes produced by block padding are stripped.
    pub fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        debug!("--------");
        debug!("`read`: {}", name);

        self.check_open(name)?;
        let current = self.version_graph.current_version(name)?;
        self.version_graph
            .restore(&mut self.block_manager, name, current)
    }

    /// Write `bytes` at `offset` in an open file.
    ///
    /// This is the copy-on-write core: only the logical blocks that actually
    /// change receive fresh storage; every other position of the new version
    /// points at the parent's blocks.  Offsets beyond the end of the file pad
    /// the gap with ASCII spaces.
    ///
    /// Metadata is not touched until every block write has succeeded; on a
    /// mid-loop failure all blocks allocated by this call are released and
    /// the file is left exactly as it was.
    pub fn write(&mut self, name: &str, offset: u64, bytes: &[u8]) -> Result<()> {
        debug!("--------");
        debug!("`write`: {} bytes at {} in {}", bytes.len(), offset, name);

        self.check_open(name)?;
        let block_size = usize::from(self.block_manager.block_size());
        let offset = offset as usize;

        let current_version = self.version_graph.current_version(name)?;
        let current =
            self.version_graph
                .restore(&mut self.block_manager, name, current_version)?;
        let parent_blocks = self
            .version_graph
            .version(name, current_version)?
            .block_list()
            .to_vec();

        // Splice the new image together.
        let mut image = current.clone();
        if offset <= image.len() {
            let end = offset + bytes.len();
            if end > image.len() {
                image.resize(end, 0);
            }
            image[offset..end].copy_from_slice(bytes);
        } else {
            // Writes past EOF pad the gap with spaces, not NULs, so the gap
            // survives the trailing-NUL trim on read.
            image.resize(offset, b' ');
            image.extend_from_slice(bytes);
        }

        let modified = modified_blocks(&current, &image, block_size);
        debug!("modified positions: {:?}", modified);

        // Fresh storage for the changed positions only.  Any failure releases
        // what this call allocated before surfacing the error.
        let mut fresh: HashMap<u64, BlockNumber> = HashMap::new();
        for &pos in &modified {
            let start = pos as usize * block_size;
            let end = cmp::min(start + block_size, image.len());

            let bn = match self.block_manager.allocate() {
                Ok(bn) => bn,
                Err(e) => {
                    self.release_fresh(&fresh);
                    return Err(e);
                }
            };
            fresh.insert(pos, bn);

            if let Err(e) = self.block_manager.write(bn, &image[start..end]) {
                self.release_fresh(&fresh);
                return Err(e);
            }
        }

        // All block writes landed; now the metadata may advance.
        let block_count = (image.len() + block_size - 1) / block_size;
        let mut block_list = Vec::with_capacity(block_count);
        for pos in 0..block_count as u64 {
            match fresh.get(&pos) {
                Some(&bn) => block_list.push(bn),
                None => block_list.push(parent_blocks[pos as usize]),
            }
        }

        let version = VersionInfo::new(
            current_version + 1,
            current_version,
            block_list,
            modified,
        );
        self.version_graph.add_version(name, version)?;
        self.version_graph
            .update_file_size(name, image.len() as FileSize)?;

        Ok(())
    }

    /// Retarget a file's current version.
    ///
    /// History is untouched: later versions stay reachable until garbage
    /// collection chooses to remove them.  Works whether or not the file is
    /// open.
    pub fn rollback(&mut self, name: &str, version_id: u64) -> Result<()> {
        debug!("--------");
        debug!("`rollback`: {} to version {}", name, version_id);

        self.version_graph.set_current(name, version_id)?;
        info!("{} restored to version {}", name, version_id);
        Ok(())
    }

    /// Free every block not reachable from the current version of some file.
    ///
    /// Returns the number of blocks freed.
    pub fn collect_garbage(&mut self) -> usize {
        debug!("--------");
        debug!("`collect_garbage`");

        self.version_graph.collect_garbage(&mut self.block_manager)
    }

    /// Flush the backing file and persist the free map and all metadata.
    ///
    /// No operation guarantees durability without this.
    pub fn sync(&mut self) -> Result<()> {
        debug!("--------");
        debug!("`sync`");

        self.block_manager.sync()?;
        self.version_graph.save()
    }

    /// List every file in the store, on stdout.
    pub fn list_files(&self) {
        let mut names: Vec<&String> = self.version_graph.files().keys().collect();
        names.sort();

        println!("{} file(s)", names.len());
        for name in names {
            let meta = &self.version_graph.files()[name];
            let current = self.version_graph.current_version(name).unwrap_or(0);
            println!(
                "  {} ({}) -- {} bytes, {} version(s), current {}",
                meta.name(),
                meta.file_type(),
                meta.size(),
                meta.version_count(),
                current
            );
        }
    }

    /// Print a file's metadata and version history, on stdout.
    pub fn print_metadata(&self, name: &str) -> Result<()> {
        let meta = self.version_graph.metadata(name)?;

        println!("File: {}", meta.name());
        println!("Size: {} bytes", meta.size());
        println!("Type: {}", meta.file_type());
        println!();
        println!("Version history:");

        let mut ids: Vec<u64> = meta.versions().keys().cloned().collect();
        ids.sort();
        for id in ids {
            let version = &meta.versions()[&id];
            println!("  Version {} - {}", id, format_timestamp(version.timestamp()));
            println!("    Total blocks: {}", version.block_count());
            println!("    Modified blocks: {:?}", version.modified_blocks());
            if version.parent_version() > 0 {
                println!("    Derived from version: {}", version.parent_version());
            }
            println!();
        }
        Ok(())
    }

    /// Print the physical placement and a content preview of every block of a
    /// file's current version, on stdout.
    pub fn inspect_blocks(&mut self, name: &str) -> Result<()> {
        let current = self.version_graph.current_version(name)?;
        let block_list = self
            .version_graph
            .version(name, current)?
            .block_list()
            .to_vec();
        let block_size = usize::from(self.block_manager.block_size());

        println!("{} @ version {}: {} block(s)", name, current, block_list.len());
        for (pos, bn) in block_list.iter().enumerate() {
            let mut data = self.block_manager.read(*bn, block_size)?;
            while data.last() == Some(&0) {
                data.pop();
            }
            data.truncate(PREVIEW_BYTES);
            println!(
                "  logical {} -> physical {}: {:?}",
                pos,
                bn,
                String::from_utf8_lossy(&data)
            );
        }
        Ok(())
    }

    /// Print a summary of storage and metadata usage, on stdout.
    pub fn print_usage(&self) {
        let versions: usize = self
            .version_graph
            .files()
            .values()
            .map(|meta| meta.version_count())
            .sum();

        println!(
            "blocks: {} used / {} total ({})",
            self.block_manager.used_block_count(),
            self.block_manager.total_blocks(),
            self.block_manager.block_size()
        );
        println!(
            "files: {}, versions: {}",
            self.version_graph.files().len(),
            versions
        );
    }

    /// The current version id of a file.
    pub fn current_version(&self, name: &str) -> Result<u64> {
        self.version_graph.current_version(name)
    }

    /// The number of versions a file has.
    pub fn version_count(&self, name: &str) -> Result<usize> {
        Ok(self.version_graph.metadata(name)?.version_count())
    }

    /// The declared size of a file, in bytes.
    pub fn file_size(&self, name: &str) -> Result<FileSize> {
        Ok(self.version_graph.metadata(name)?.size())
    }

    /// A file's metadata, version history included.
    pub fn metadata(&self, name: &str) -> Result<&FileMetadata> {
        self.version_graph.metadata(name)
    }

    /// The number of allocated blocks on the device.
    pub fn allocated_block_count(&self) -> u64 {
        self.block_manager.used_block_count()
    }

    /// The total number of blocks on the device.
    pub fn total_blocks(&self) -> u64 {
        self.block_manager.total_blocks()
    }

    /// The block size of the device.
    pub fn block_size(&self) -> BlockSize {
        self.block_manager.block_size()
    }

    fn check_open(&self, name: &str) -> Result<()> {
        if self.open_files.contains(name) {
            Ok(())
        } else {
            Err(StoreError::NotOpen(name.to_owned()))
        }
    }

    fn release_fresh(&mut self, fresh: &HashMap<u64, BlockNumber>) {
        for &bn in fresh.values() {
            self.block_manager.free(bn);
        }
    }
}

impl Drop for CowFileSystem {
    fn drop(&mut self) {
        debug!("dropping CowFileSystem");
        if let Err(e) = self.sync() {
            error!("sync on drop failed: {}", e);
        }
    }
}

fn format_timestamp(timestamp: i64) -> String {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(when) => when.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("@{}", timestamp),
    }
}

/// Block-level diff of two buffers.
///
/// Position *i* is modified iff it exists in only one of the buffers, or the
/// two blocks differ byte-for-byte.  The zero padding of a short final block
/// is part of the comparison, so a buffer and its zero-extension to a block
/// boundary compare equal.  Returns positions in ascending order.
fn modified_blocks(old: &[u8], new: &[u8], block_size: usize) -> Vec<u64> {
    let n_old = (old.len() + block_size - 1) / block_size;
    let n_new = (new.len() + block_size - 1) / block_size;

    let mut modified = vec![];
    for i in 0..cmp::max(n_old, n_new) {
        if (i >= n_old) != (i >= n_new) || !block_eq(old, new, i, block_size) {
            modified.push(i as u64);
        }
    }
    modified
}

/// Compare block `i` of two buffers, treating bytes past either buffer's end
/// as zero.
fn block_eq(a: &[u8], b: &[u8], i: usize, block_size: usize) -> bool {
    let start = i * block_size;
    let a = &a[cmp::min(start, a.len())..cmp::min(start + block_size, a.len())];
    let b = &b[cmp::min(start, b.len())..cmp::min(start + block_size, b.len())];

    let common = cmp::min(a.len(), b.len());
    a[..common] == b[..common]
        && a[common..].iter().all(|&byte| byte == 0)
        && b[common..].iter().all(|&byte| byte == 0)
}
