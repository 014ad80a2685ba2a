//! Block Manager
//!
//! Low level access to block storage.  The block manager owns one backing file
//! of fixed capacity, carved into equal-size blocks, together with the
//! [`FreeMap`] that records which of them are allocated.  It hands out blocks
//! first-fit, reads and writes single blocks at `index * block_size`, and
//! persists the free map alongside the backing file as `<path>.meta`.
//!
//! It has no knowledge of files or versions; that lives above it.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    block::{map::FreeMap, BlockCardinality, BlockNumber, BlockSize},
    error::{Result, StoreError},
};

fn map_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".meta");
    PathBuf::from(os)
}

/// Manager of Blocks
///
/// One instance per backing file.  Allocation is first-fit over ascending
/// indices, and the free map reaches disk before `allocate` returns, so a
/// crash between allocation and use leaks at most one block -- which the
/// garbage collector can reclaim later.
#[derive(Debug)]
pub struct BlockManager {
    /// Path of the backing file
    ///
    path: PathBuf,
    /// Where the free map persists
    ///
    map_path: PathBuf,
    file: File,
    block_size: BlockSize,
    block_count: BlockCardinality,
    map: FreeMap,
}

impl BlockManager {
    /// Open or create a block device at `path` with the default block size.
    ///
    /// The capacity is rounded down to a whole number of blocks and the
    /// backing file is sized to exactly that many bytes.  An existing free map
    /// at `<path>.meta` is loaded; otherwise every block starts out free.
    pub fn open<P: AsRef<Path>>(path: P, total_bytes: u64) -> Result<Self> {
        BlockManager::open_with_block_size(path, total_bytes, BlockSize::default())
    }

    /// As [`BlockManager::open`], with an explicit block size.
    pub fn open_with_block_size<P: AsRef<Path>>(
        path: P,
        total_bytes: u64,
        block_size: BlockSize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let map_path = map_path(&path);
        let block_count = total_bytes / u64::from(block_size);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(block_count * u64::from(block_size))?;

        let map = if map_path.exists() {
            FreeMap::from_bytes(fs::read(&map_path)?, block_count)?
        } else {
            FreeMap::new(block_count)
        };

        debug!(
            "opened block device {:?}: {} {} blocks, {} in use",
            path,
            block_count,
            block_size,
            map.used_count()
        );

        Ok(BlockManager {
            path,
            map_path,
            file,
            block_size,
            block_count,
            map,
        })
    }

    /// Reserve the smallest free block and mark it used.
    ///
    /// The free map is persisted before the block number is returned.
    pub fn allocate(&mut self) -> Result<BlockNumber> {
        let bn = self.map.first_free().ok_or(StoreError::OutOfSpace)?;
        self.map.set(bn);
        self.save_map()?;
        debug!("allocated block {}", bn);
        Ok(bn)
    }

    /// Return a block to the free pool.
    ///
    /// A silent no-op for out-of-range or already-free blocks.  The map
    /// reaches disk on the next `allocate` or `sync`.
    pub fn free(&mut self, bn: BlockNumber) {
        if bn < self.block_count && self.map.is_used(bn) {
            self.map.clear(bn);
            debug!("freed block {}", bn);
        }
    }

    /// Write a payload into an allocated block.
    ///
    /// Payloads shorter than the block size are padded with zero bytes, so a
    /// partially-filled block never exposes stale data.
    pub fn write(&mut self, bn: BlockNumber, data: &[u8]) -> Result<()> {
        self.check_block(bn)?;
        let block_size = usize::from(self.block_size);
        if data.len() > block_size {
            return Err(StoreError::TooLarge {
                size: data.len(),
                block_size,
            });
        }

        let mut block = vec![0u8; block_size];
        block[..data.len()].copy_from_slice(data);

        self.file
            .seek(SeekFrom::Start(bn * u64::from(self.block_size)))?;
        self.file.write_all(&block)?;
        debug!("wrote block {}", bn);
        Ok(())
    }

    /// Read `size` bytes from the front of an allocated block.
    pub fn read(&mut self, bn: BlockNumber, size: usize) -> Result<Vec<u8>> {
        self.check_block(bn)?;
        let block_size = usize::from(self.block_size);
        if size > block_size {
            return Err(StoreError::TooLarge { size, block_size });
        }

        let mut buffer = vec![0u8; size];
        self.file
            .seek(SeekFrom::Start(bn * u64::from(self.block_size)))?;
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Flush the backing file to disk and persist the free map.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        self.save_map()?;
        debug!("synced {:?}", self.path);
        Ok(())
    }

    /// The system-wide block size, in bytes.
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// The total number of blocks on the device.
    pub fn total_blocks(&self) -> BlockCardinality {
        self.block_count
    }

    /// Is the block allocated?  Out-of-range indices read as free.
    pub fn is_used(&self, bn: BlockNumber) -> bool {
        self.map.is_used(bn)
    }

    /// The number of allocated blocks.
    pub fn used_block_count(&self) -> BlockCardinality {
        self.map.used_count()
    }

    /// The number of available, un-allocated blocks.
    pub fn free_block_count(&self) -> BlockCardinality {
        self.block_count - self.map.used_count()
    }

    fn check_block(&self, bn: BlockNumber) -> Result<()> {
        if bn >= self.block_count {
            return Err(StoreError::BadIndex(bn));
        }
        if !self.map.is_used(bn) {
            return Err(StoreError::NotAllocated(bn));
        }
        Ok(())
    }

    fn save_map(&self) -> Result<()> {
        fs::write(&self.map_path, self.map.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use hex_literal::hex;

    use super::*;

    const TEST_ROOT: &str = "/tmp/cowfs_test/manager";

    fn test_store(name: &str) -> PathBuf {
        let dir: PathBuf = [TEST_ROOT, name].iter().collect();
        fs::remove_dir_all(&dir).unwrap_or_default();
        fs::create_dir_all(&dir).unwrap();
        dir.join("blocks")
    }

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn construction_sanity() {
        init();
        let path = test_store("construction_sanity");
        let bm = BlockManager::open_with_block_size(&path, 4 * 512 + 100, BlockSize::FiveTwelve)
            .unwrap();

        assert_eq!(bm.block_size() as usize, 512, "verify block size");
        assert_eq!(
            bm.total_blocks(),
            4,
            "capacity rounds down to whole blocks"
        );
        assert_eq!(bm.free_block_count(), 4, "all blocks start out free");
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            4 * 512,
            "backing file sized to capacity"
        );
    }

    #[test]
    fn allocate_is_first_fit() {
        init();
        let path = test_store("allocate_is_first_fit");
        let mut bm =
            BlockManager::open_with_block_size(&path, 8 * 512, BlockSize::FiveTwelve).unwrap();

        assert_eq!(bm.allocate().unwrap(), 0);
        assert_eq!(bm.allocate().unwrap(), 1);
        assert_eq!(bm.allocate().unwrap(), 2);

        bm.free(1);
        assert_eq!(bm.allocate().unwrap(), 1, "freed block is reused first");
    }

    #[test]
    fn out_of_space() {
        init();
        let path = test_store("out_of_space");
        let mut bm =
            BlockManager::open_with_block_size(&path, 2 * 512, BlockSize::FiveTwelve).unwrap();

        bm.allocate().unwrap();
        bm.allocate().unwrap();
        assert_matches!(bm.allocate(), Err(StoreError::OutOfSpace));
    }

    #[test]
    fn bad_block_number() {
        init();
        let path = test_store("bad_block_number");
        let mut bm =
            BlockManager::open_with_block_size(&path, 3 * 512, BlockSize::FiveTwelve).unwrap();

        assert_matches!(bm.read(7, 512), Err(StoreError::BadIndex(7)));
        assert_matches!(bm.write(7, b"abc"), Err(StoreError::BadIndex(7)));
    }

    #[test]
    fn unallocated_block_is_rejected() {
        init();
        let path = test_store("unallocated_block_is_rejected");
        let mut bm =
            BlockManager::open_with_block_size(&path, 3 * 512, BlockSize::FiveTwelve).unwrap();

        assert_matches!(bm.write(1, b"abc"), Err(StoreError::NotAllocated(1)));
        assert_matches!(bm.read(1, 512), Err(StoreError::NotAllocated(1)));
    }

    #[test]
    fn payload_too_large() {
        init();
        let path = test_store("payload_too_large");
        let mut bm =
            BlockManager::open_with_block_size(&path, 16 * 512, BlockSize::FiveTwelve).unwrap();

        let bn = bm.allocate().unwrap();
        let data = [0x42; 513];
        assert_matches!(
            bm.write(bn, &data[..]),
            Err(StoreError::TooLarge { size: 513, .. })
        );
    }

    #[test]
    fn write_pads_with_zeroes() {
        init();
        let path = test_store("write_pads_with_zeroes");
        let mut bm =
            BlockManager::open_with_block_size(&path, 16 * 512, BlockSize::FiveTwelve).unwrap();

        let data = hex!("451101250ec6f26652249d59dc974b73");
        let bn = bm.allocate().unwrap();
        bm.write(bn, &data[..]).unwrap();

        let mut expected = vec![0u8; 512];
        expected[..data.len()].copy_from_slice(&data[..]);
        assert_eq!(
            bm.read(bn, 512).unwrap(),
            expected,
            "short payload reads back zero-padded"
        );
    }

    #[test]
    fn free_is_a_silent_noop_outside_preconditions() {
        init();
        let path = test_store("free_is_a_silent_noop_outside_preconditions");
        let mut bm =
            BlockManager::open_with_block_size(&path, 4 * 512, BlockSize::FiveTwelve).unwrap();

        bm.free(99);
        bm.free(2);
        assert_eq!(bm.used_block_count(), 0);
    }

    #[test]
    fn free_map_survives_reopen() {
        init();
        let path = test_store("free_map_survives_reopen");
        {
            let mut bm =
                BlockManager::open_with_block_size(&path, 8 * 512, BlockSize::FiveTwelve).unwrap();
            bm.allocate().unwrap();
            bm.allocate().unwrap();
            bm.sync().unwrap();
        }

        let bm = BlockManager::open_with_block_size(&path, 8 * 512, BlockSize::FiveTwelve).unwrap();
        assert_eq!(bm.used_block_count(), 2);
        assert!(bm.is_used(0));
        assert!(bm.is_used(1));
        assert!(!bm.is_used(2));
    }

    #[test]
    fn reopen_with_wrong_capacity_is_a_format_error() {
        init();
        let path = test_store("reopen_with_wrong_capacity_is_a_format_error");
        {
            let mut bm =
                BlockManager::open_with_block_size(&path, 64 * 512, BlockSize::FiveTwelve).unwrap();
            bm.allocate().unwrap();
            bm.sync().unwrap();
        }

        assert_matches!(
            BlockManager::open_with_block_size(&path, 8 * 512, BlockSize::FiveTwelve),
            Err(StoreError::Format(_))
        );
    }
}
