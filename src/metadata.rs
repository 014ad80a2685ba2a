//! File Metadata
//!
//! Per-file bookkeeping for the store.  Files are versioned: every successful
//! write appends an immutable [`VersionInfo`] describing the full block image
//! at that version and the logical positions it changed relative to its
//! parent.  The types here are pure values; persistence and reconstruction
//! live in the version graph.

pub(crate) mod file;

pub use self::file::{FileMetadata, VersionInfo};

/// The size of a file, in bytes.
pub type FileSize = u64;
