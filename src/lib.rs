#![warn(missing_docs)]
//! A copy-on-write versioned file store: cowfs
//!
//! The store sits on a single fixed-capacity backing file carved into
//! equal-size blocks.  Clients create named files, read and write arbitrary
//! byte ranges, and roll any file back to an earlier version.  Every write
//! produces a new immutable version whose block list shares unchanged blocks
//! with its parent, so storage grows with what changed, not with the size of
//! the file.  A mark-and-sweep garbage collector reclaims blocks no current
//! version can reach.
//!
//! [`CowFileSystem`] is the front door; the block manager and version graph
//! underneath are exposed for tooling that wants to work a layer lower.

mod block;
mod error;
mod fsimpl;
mod graph;
mod metadata;

pub use crate::{
    block::{manager::BlockManager, BlockCardinality, BlockNumber, BlockSize},
    error::{Result, StoreError},
    fsimpl::CowFileSystem,
    graph::VersionGraph,
    metadata::{FileMetadata, FileSize, VersionInfo},
};
