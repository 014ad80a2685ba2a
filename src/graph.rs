//! Version Graph
//!
//! The index over every file's metadata, plus the current-version pointer for
//! each file.  The graph appends versions, reconstructs file images from
//! blocks, retargets current-version pointers for rollback, and runs the
//! garbage collector.  It also persists the whole metadata set: one
//! `<name>.meta` per file and a `current_versions.meta` index, all inside a
//! metadata directory sibling to the block file.
//!
//! The graph does not own the block manager; the façade owns both and lends
//! the manager to the calls that need it, so there are no reference cycles.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use bincode::Options;
use log::{debug, info, warn};

use crate::{
    block::BlockManager,
    error::{Result, StoreError},
    metadata::{
        file::{deserialize_exact, wire_options},
        FileMetadata, FileSize, VersionInfo,
    },
};

const META_EXT: &str = "meta";
const CURRENT_VERSIONS_FILE: &str = "current_versions.meta";

/// Index of versioned files
///
/// Keyed by file name.  One instance per metadata directory.
#[derive(Debug)]
pub struct VersionGraph {
    /// Where the metadata set persists
    ///
    metadata_dir: PathBuf,
    /// Per-file metadata
    ///
    files: HashMap<String, FileMetadata>,
    /// The current version of each file
    ///
    current: HashMap<String, u64>,
}

impl VersionGraph {
    /// An empty graph persisting under `metadata_dir`.
    pub fn new<P: AsRef<Path>>(metadata_dir: P) -> Self {
        VersionGraph {
            metadata_dir: metadata_dir.as_ref().to_path_buf(),
            files: HashMap::new(),
            current: HashMap::new(),
        }
    }

    /// Install metadata for a new file, with its root version as current.
    pub(crate) fn create_file(&mut self, name: &str, file_type: &str) -> Result<()> {
        if self.files.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_owned()));
        }

        let meta = FileMetadata::new(name, file_type);
        self.current.insert(name.to_owned(), meta.latest_version());
        self.files.insert(name.to_owned(), meta);
        debug!("created file {}", name);
        Ok(())
    }

    /// Append a version and advance the file's current-version pointer.
    pub(crate) fn add_version(&mut self, name: &str, version: VersionInfo) -> Result<()> {
        let meta = self
            .files
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;

        let version_id = version.version_id();
        meta.add_version(version);
        self.current.insert(name.to_owned(), version_id);
        debug!("{} is now at version {}", name, version_id);
        Ok(())
    }

    /// Does the graph know this file?
    pub fn file_exists(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    /// The metadata of a file.
    pub fn metadata(&self, name: &str) -> Result<&FileMetadata> {
        self.files
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))
    }

    /// All files in the graph, keyed by name.
    pub fn files(&self) -> &HashMap<String, FileMetadata> {
        &self.files
    }

    /// The current version id of a file.
    pub fn current_version(&self, name: &str) -> Result<u64> {
        self.current
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))
    }

    /// A specific version of a file.
    pub(crate) fn version(&self, name: &str, version_id: u64) -> Result<&VersionInfo> {
        self.metadata(name)?.version(version_id).ok_or_else(|| {
            StoreError::NotFound(format!("version {} of {}", version_id, name))
        })
    }

    /// Retarget the current-version pointer.  History is untouched; versions
    /// above the target stay in the table until the garbage collector decides
    /// otherwise.
    pub(crate) fn set_current(&mut self, name: &str, version_id: u64) -> Result<()> {
        self.version(name, version_id)?;
        self.current.insert(name.to_owned(), version_id);
        debug!("{} rolled to version {}", name, version_id);
        Ok(())
    }

    pub(crate) fn update_file_size(&mut self, name: &str, size: FileSize) -> Result<()> {
        self.files
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?
            .set_size(size);
        Ok(())
    }

    /// Reconstruct the full image of a file at a version.
    ///
    /// Every block of the version is read in logical order and concatenated;
    /// trailing NUL bytes introduced by block padding are trimmed from the
    /// result.  The current-version pointer is not touched -- rollback is
    /// expressed through [`VersionGraph::set_current`].
    pub(crate) fn restore(
        &self,
        blocks: &mut BlockManager,
        name: &str,
        version_id: u64,
    ) -> Result<Vec<u8>> {
        let info = self.version(name, version_id)?;
        let block_size = usize::from(blocks.block_size());

        let mut data = Vec::with_capacity(info.block_count() * block_size);
        for &bn in info.block_list() {
            data.extend_from_slice(&blocks.read(bn, block_size)?);
        }

        while data.last() == Some(&0) {
            data.pop();
        }

        Ok(data)
    }

    /// Single-pass mark-and-sweep over the device.
    ///
    /// Marking walks each file's *current* version up the parent chain to the
    /// root; everything else is swept.  Versions above a rolled-back head are
    /// deliberately collectable.  Returns the number of blocks freed.
    pub(crate) fn collect_garbage(&self, blocks: &mut BlockManager) -> usize {
        let mut live = HashSet::new();
        for (name, meta) in &self.files {
            let current = self.current.get(name).cloned().unwrap_or(0);
            let mut version = meta.version(current);
            while let Some(info) = version {
                live.extend(info.block_list().iter().cloned());
                version = meta.version(info.parent_version());
            }
        }

        let mut freed = 0;
        for bn in 0..blocks.total_blocks() {
            if blocks.is_used(bn) && !live.contains(&bn) {
                blocks.free(bn);
                freed += 1;
            }
        }

        info!("garbage collection freed {} blocks", freed);
        freed
    }

    /// Persist the whole metadata set under the metadata directory.
    pub(crate) fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.metadata_dir)?;

        for (name, meta) in &self.files {
            let path = self.metadata_dir.join(format!("{}.{}", name, META_EXT));
            fs::write(path, meta.serialize()?)?;
        }

        let mut current: Vec<(String, u64)> = self
            .current
            .iter()
            .map(|(name, version)| (name.clone(), *version))
            .collect();
        current.sort();

        let bytes = wire_options().serialize(&current)?;
        fs::write(self.metadata_dir.join(CURRENT_VERSIONS_FILE), bytes)?;

        debug!("saved metadata for {} files", self.files.len());
        Ok(())
    }

    /// Clear in-memory state and reload everything from the metadata
    /// directory.
    pub(crate) fn load(&mut self) -> Result<()> {
        self.files.clear();
        self.current.clear();

        for entry in fs::read_dir(&self.metadata_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(CURRENT_VERSIONS_FILE) {
                continue;
            }

            let meta = FileMetadata::deserialize(&fs::read(&path)?)?;
            self.files.insert(meta.name().to_owned(), meta);
        }

        let index_path = self.metadata_dir.join(CURRENT_VERSIONS_FILE);
        if index_path.exists() {
            let current: Vec<(String, u64)> = deserialize_exact(&fs::read(&index_path)?)?;
            self.current.extend(current);
        }

        for (name, meta) in &self.files {
            if !self.current.contains_key(name) {
                warn!("no current-version entry for {}; assuming latest", name);
                self.current.insert(name.clone(), meta.latest_version());
            }
        }

        info!("loaded metadata for {} files", self.files.len());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::block::BlockSize;

    const TEST_ROOT: &str = "/tmp/cowfs_test/graph";

    fn test_dir(name: &str) -> PathBuf {
        let dir: PathBuf = [TEST_ROOT, name].iter().collect();
        fs::remove_dir_all(&dir).unwrap_or_default();
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn block_manager(dir: &Path) -> BlockManager {
        BlockManager::open_with_block_size(dir.join("blocks"), 32 * 512, BlockSize::FiveTwelve)
            .unwrap()
    }

    fn write_version(
        graph: &mut VersionGraph,
        bm: &mut BlockManager,
        name: &str,
        version_id: u64,
        payloads: &[&[u8]],
        modified: Vec<u64>,
    ) {
        let mut block_list = vec![];
        for payload in payloads {
            let bn = bm.allocate().unwrap();
            bm.write(bn, payload).unwrap();
            block_list.push(bn);
        }
        let parent = graph.current_version(name).unwrap();
        graph
            .add_version(name, VersionInfo::new(version_id, parent, block_list, modified))
            .unwrap();
    }

    #[test]
    fn restore_concatenates_and_trims() {
        init();
        let dir = test_dir("restore_concatenates_and_trims");
        let mut bm = block_manager(&dir);
        let mut graph = VersionGraph::new(dir.join("meta"));

        graph.create_file("f", "txt").unwrap();
        write_version(&mut graph, &mut bm, "f", 2, &[&[0x61; 512], b"tail"], vec![0, 1]);

        let data = graph.restore(&mut bm, "f", 2).unwrap();
        assert_eq!(data.len(), 512 + 4, "padding after the tail is trimmed");
        assert_eq!(&data[512..], b"tail");
    }

    #[test]
    fn restore_of_the_root_version_is_empty() {
        init();
        let dir = test_dir("restore_of_the_root_version_is_empty");
        let mut bm = block_manager(&dir);
        let mut graph = VersionGraph::new(dir.join("meta"));

        graph.create_file("f", "txt").unwrap();
        assert_eq!(graph.restore(&mut bm, "f", 1).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn missing_file_and_version_are_not_found() {
        init();
        let dir = test_dir("missing_file_and_version_are_not_found");
        let mut bm = block_manager(&dir);
        let mut graph = VersionGraph::new(dir.join("meta"));

        assert_matches!(
            graph.restore(&mut bm, "ghost", 1),
            Err(StoreError::NotFound(_))
        );

        graph.create_file("f", "txt").unwrap();
        assert_matches!(graph.restore(&mut bm, "f", 9), Err(StoreError::NotFound(_)));
        assert_matches!(graph.set_current("f", 9), Err(StoreError::NotFound(_)));
    }

    #[test]
    fn gc_reclaims_versions_above_a_rolled_back_head() {
        init();
        let dir = test_dir("gc_reclaims_versions_above_a_rolled_back_head");
        let mut bm = block_manager(&dir);
        let mut graph = VersionGraph::new(dir.join("meta"));

        graph.create_file("f", "txt").unwrap();
        write_version(&mut graph, &mut bm, "f", 2, &[b"one"], vec![0]);
        write_version(&mut graph, &mut bm, "f", 3, &[b"two"], vec![0]);
        assert_eq!(bm.used_block_count(), 2);

        graph.set_current("f", 2).unwrap();
        let freed = graph.collect_garbage(&mut bm);

        assert_eq!(freed, 1, "the future version's block is collectable");
        assert_eq!(bm.used_block_count(), 1);
        assert_eq!(graph.restore(&mut bm, "f", 2).unwrap(), b"one".to_vec());
    }

    #[test]
    fn gc_keeps_blocks_shared_through_parents() {
        init();
        let dir = test_dir("gc_keeps_blocks_shared_through_parents");
        let mut bm = block_manager(&dir);
        let mut graph = VersionGraph::new(dir.join("meta"));

        graph.create_file("f", "txt").unwrap();
        write_version(&mut graph, &mut bm, "f", 2, &[b"base"], vec![0]);

        // Version 3 shares version 2's block and adds one of its own.
        let shared = graph.version("f", 2).unwrap().block_list()[0];
        let fresh = bm.allocate().unwrap();
        bm.write(fresh, b"more").unwrap();
        graph
            .add_version("f", VersionInfo::new(3, 2, vec![shared, fresh], vec![1]))
            .unwrap();

        assert_eq!(graph.collect_garbage(&mut bm), 0, "everything is reachable");
        assert!(bm.is_used(shared));
        assert!(bm.is_used(fresh));
    }

    #[test]
    fn save_and_load_roundtrip() {
        init();
        let dir = test_dir("save_and_load_roundtrip");
        let mut bm = block_manager(&dir);
        let meta_dir = dir.join("meta");

        let mut graph = VersionGraph::new(&meta_dir);
        graph.create_file("a", "txt").unwrap();
        graph.create_file("b", "bin").unwrap();
        write_version(&mut graph, &mut bm, "a", 2, &[b"hello"], vec![0]);
        graph.update_file_size("a", 5).unwrap();
        graph.set_current("a", 1).unwrap();
        graph.save().unwrap();

        let mut restored = VersionGraph::new(&meta_dir);
        restored.load().unwrap();

        assert_eq!(restored.files().len(), 2);
        assert_eq!(restored.current_version("a").unwrap(), 1);
        assert_eq!(restored.current_version("b").unwrap(), 1);
        assert_eq!(restored.metadata("a").unwrap().size(), 5);
        assert_eq!(restored.metadata("a").unwrap().version_count(), 2);
        assert_eq!(
            restored.version("a", 2).unwrap(),
            graph.version("a", 2).unwrap()
        );
    }

    #[test]
    fn load_clears_previous_state() {
        init();
        let dir = test_dir("load_clears_previous_state");
        let meta_dir = dir.join("meta");

        let mut graph = VersionGraph::new(&meta_dir);
        graph.create_file("kept", "txt").unwrap();
        graph.save().unwrap();

        graph.create_file("unsaved", "txt").unwrap();
        graph.load().unwrap();

        assert!(graph.file_exists("kept"));
        assert!(!graph.file_exists("unsaved"), "load starts from disk state");
    }
}
