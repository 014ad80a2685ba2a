//! Storage Blocks
//!
//! The store is comprised of fixed-size blocks living in one backing file.
//! File contents are stored in blocks; which blocks belong to which file, and
//! at which version, is the business of the metadata layer.  A block itself is
//! nothing but a span of `block_size` bytes at `index * block_size` in the
//! backing file, addressed by its index.
//!
//! There are a fixed number of blocks in a store, determined when the store is
//! created, and all blocks are the same size.  Payloads shorter than the block
//! size are padded with zero bytes on the way to disk.

pub(crate) mod manager;
pub(crate) mod map;

use std::fmt;

pub(crate) use self::manager::BlockManager;

/// A physical block number.
pub type BlockNumber = u64;
/// The number of blocks in a store.
pub type BlockCardinality = u64;

/// Available Block Sizes
///
/// Why not let someone choose a weird block size?  Constraints exist so that
/// blocks map cleanly onto physical sectors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockSize {
    /// 512 byte block size
    ///
    FiveTwelve = 512,
    /// 1024 byte block size
    ///
    TenTwentyFour = 1024,
    /// 2048 byte block size
    ///
    TwentyFortyEight = 2048,
    /// 4096 byte block size
    ///
    FortyNinetySix = 4096,
}

impl Default for BlockSize {
    fn default() -> Self {
        BlockSize::FortyNinetySix
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockSize::FiveTwelve => "512-byte".fmt(f),
            BlockSize::TenTwentyFour => "1k".fmt(f),
            BlockSize::TwentyFortyEight => "2k".fmt(f),
            BlockSize::FortyNinetySix => "4k".fmt(f),
        }
    }
}

impl From<BlockSize> for usize {
    fn from(n: BlockSize) -> Self {
        match n {
            BlockSize::FiveTwelve => 512,
            BlockSize::TenTwentyFour => 1024,
            BlockSize::TwentyFortyEight => 2048,
            BlockSize::FortyNinetySix => 4096,
        }
    }
}

impl From<BlockSize> for u64 {
    fn from(n: BlockSize) -> Self {
        usize::from(n) as u64
    }
}
