//! Versioned file metadata
//!
//! A file is a list of blocks with some metadata attached.  Because files are
//! versioned, so too is the block list: the top-level structure is a table of
//! [`VersionInfo`]s keyed by version id, and each entry carries the complete
//! block image for its version plus the set of logical positions that differ
//! from the parent.  Unchanged positions point at the parent's physical
//! blocks, which is the whole of the copy-on-write bookkeeping.
//!
//! Serialization is bincode with fixed-width little-endian integers.  The
//! struct field order *is* the on-disk record layout, and versions are written
//! sorted by id so output is deterministic.  Deserialization rejects both
//! truncated and over-long input with a typed error; the format is exact, not
//! extensible.

use std::{collections::HashMap, io::Cursor};

use bincode::Options;
use chrono::Utc;
use log::warn;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};

use crate::{
    block::BlockNumber,
    error::{Result, StoreError},
    metadata::FileSize,
};

/// The bincode option set producing the on-disk layout: little-endian,
/// fixed-width integers.
pub(crate) fn wire_options() -> impl Options {
    bincode::options().with_fixint_encoding()
}

/// Deserialize a whole byte string, and nothing less.
///
/// bincode is content to stop once the value is complete, so the
/// trailing-bytes check has to happen here: anything left over after the
/// value means the input is not in the exact on-disk layout.
pub(crate) fn deserialize_exact<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut cursor = Cursor::new(bytes);
    let value = wire_options().deserialize_from(&mut cursor)?;

    let consumed = cursor.position() as usize;
    if consumed != bytes.len() {
        return Err(StoreError::Format(format!(
            "{} trailing bytes after metadata",
            bytes.len() - consumed
        )));
    }
    Ok(value)
}

/// One immutable version of a file
///
/// Versions are cheap: a couple of fixed-width fields and two block-number
/// lists.  Entry *i* of `block_list` holds the i-th logical block of the file
/// at this version.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VersionInfo {
    // Field order is the on-disk record layout; do not reorder.
    version_id: u64,
    timestamp: i64,
    parent_version: u64,
    block_list: Vec<BlockNumber>,
    modified_blocks: Vec<u64>,
}

impl VersionInfo {
    /// The root version of a fresh file: id 1, no parent, no blocks.
    pub(crate) fn root() -> Self {
        VersionInfo {
            version_id: 1,
            timestamp: Utc::now().timestamp(),
            parent_version: 0,
            block_list: vec![],
            modified_blocks: vec![],
        }
    }

    /// A new version derived from `parent_version`.
    ///
    /// `modified_blocks` must be sorted ascending; the diff produces it that
    /// way.
    pub(crate) fn new(
        version_id: u64,
        parent_version: u64,
        block_list: Vec<BlockNumber>,
        modified_blocks: Vec<u64>,
    ) -> Self {
        VersionInfo {
            version_id,
            timestamp: Utc::now().timestamp(),
            parent_version,
            block_list,
            modified_blocks,
        }
    }

    /// The id of this version, unique within its file.
    pub fn version_id(&self) -> u64 {
        self.version_id
    }

    /// Creation time, in Unix seconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The id of the parent version; 0 for the root.
    pub fn parent_version(&self) -> u64 {
        self.parent_version
    }

    /// The physical blocks making up the file at this version, in logical
    /// order.
    pub fn block_list(&self) -> &[BlockNumber] {
        &self.block_list
    }

    /// The logical positions that differ from the parent version.
    pub fn modified_blocks(&self) -> &[u64] {
        &self.modified_blocks
    }

    /// The size of the file at this version, in whole blocks.
    pub fn block_count(&self) -> usize {
        self.block_list.len()
    }
}

/// Data about Files
///
/// The primary purpose of this struct is to store the existing versions of a
/// file.  The latest version id is derived from the table rather than stored,
/// so the two can never disagree.
#[derive(Clone, Debug, PartialEq)]
pub struct FileMetadata {
    name: String,
    size: FileSize,
    file_type: String,
    versions: HashMap<u64, VersionInfo>,
}

/// The persisted shape of [`FileMetadata`]
///
/// Field order is the on-disk layout; the version table flattens to a
/// sequence sorted by id, each entry already carrying its own id.
#[derive(Deserialize, Serialize)]
struct FileMetadataWire {
    name: String,
    size: FileSize,
    file_type: String,
    versions: Vec<VersionInfo>,
}

impl FileMetadata {
    /// Create metadata for a new file.
    ///
    /// A new file immediately receives its root version, mostly so that we
    /// capture a timestamp of when the file was created.
    pub(crate) fn new<S: Into<String>>(name: S, file_type: S) -> Self {
        let root = VersionInfo::root();
        let mut versions = HashMap::new();
        versions.insert(root.version_id, root);
        FileMetadata {
            name: name.into(),
            size: 0,
            file_type: file_type.into(),
            versions,
        }
    }

    /// The file's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared size of the file, in bytes.
    pub fn size(&self) -> FileSize {
        self.size
    }

    pub(crate) fn set_size(&mut self, size: FileSize) {
        self.size = size;
    }

    /// The file's type tag.
    pub fn file_type(&self) -> &str {
        &self.file_type
    }

    /// Look up a specific version.
    pub fn version(&self, version_id: u64) -> Option<&VersionInfo> {
        self.versions.get(&version_id)
    }

    /// The number of versions of the file.
    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// The highest version id present; 0 for an empty table.
    pub fn latest_version(&self) -> u64 {
        self.versions.keys().cloned().max().unwrap_or(0)
    }

    /// All versions of the file, keyed by id.
    pub fn versions(&self) -> &HashMap<u64, VersionInfo> {
        &self.versions
    }

    /// Insert a version, replacing any existing entry with the same id.
    ///
    /// Replacement happens when a write lands after a rollback: the stale
    /// "future" version loses its slot and its blocks become garbage.
    pub(crate) fn add_version(&mut self, version: VersionInfo) {
        if let Some(stale) = self.versions.insert(version.version_id, version) {
            warn!(
                "version {} of {} replaced; its blocks are now collectable",
                stale.version_id, self.name
            );
        }
    }

    /// Serialize to the on-disk layout.
    pub(crate) fn serialize(&self) -> Result<Vec<u8>> {
        let mut versions: Vec<VersionInfo> = self.versions.values().cloned().collect();
        versions.sort_by_key(|v| v.version_id);

        let wire = FileMetadataWire {
            name: self.name.clone(),
            size: self.size,
            file_type: self.file_type.clone(),
            versions,
        };
        Ok(wire_options().serialize(&wire)?)
    }

    /// Reconstitute from the on-disk layout.
    ///
    /// Truncated input and trailing garbage are both `Format` errors.
    pub(crate) fn deserialize(bytes: &[u8]) -> Result<Self> {
        let wire: FileMetadataWire = deserialize_exact(bytes)?;

        let mut versions = HashMap::with_capacity(wire.versions.len());
        for version in wire.versions {
            versions.insert(version.version_id, version);
        }

        Ok(FileMetadata {
            name: wire.name,
            size: wire.size,
            file_type: wire.file_type,
            versions,
        })
    }
}
