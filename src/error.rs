//! Error taxonomy
//!
//! Every fallible operation in the engine returns one of these kinds; errors
//! are returned, never thrown across the public surface.  The only fatal
//! condition in the system is failing to open the backing file at startup,
//! and even that surfaces here as `Io`.

use std::io;

use failure::Fail;

use crate::block::BlockNumber;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the store.
#[derive(Debug, Fail)]
pub enum StoreError {
    /// A file or version that was asked for does not exist.
    #[fail(display = "not found: {}", _0)]
    NotFound(String),
    /// A file with this name already exists.
    #[fail(display = "file already exists: {}", _0)]
    AlreadyExists(String),
    /// The operation requires the file to be open, and it is not.
    #[fail(display = "file is not open: {}", _0)]
    NotOpen(String),
    /// The file is already open.
    #[fail(display = "file is already open: {}", _0)]
    AlreadyOpen(String),
    /// The block allocator is exhausted.
    #[fail(display = "no free blocks left on the device")]
    OutOfSpace,
    /// A block operation referred to an index outside the device.
    #[fail(display = "block {} is out of range", _0)]
    BadIndex(BlockNumber),
    /// A block operation referred to a block that is not allocated.
    #[fail(display = "block {} is not allocated", _0)]
    NotAllocated(BlockNumber),
    /// A payload or read request exceeds the block size.
    #[fail(display = "{} bytes exceeds the {} byte block size", size, block_size)]
    TooLarge {
        /// Requested payload or buffer size.
        size: usize,
        /// The fixed block size of the device.
        block_size: usize,
    },
    /// File names may not contain path separators.
    #[fail(display = "invalid file name: {}", _0)]
    InvalidName(String),
    /// An I/O failure on the backing file or a metadata file.
    #[fail(display = "I/O error: {}", _0)]
    Io(#[fail(cause)] io::Error),
    /// Metadata failed to deserialize.
    #[fail(display = "metadata format error: {}", _0)]
    Format(String),
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Format(e.to_string())
    }
}
