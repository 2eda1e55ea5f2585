//! Block-level storage for a torrent's data file.
//!
//! The file is addressed as a sequence of fixed-size blocks, each with an
//! expected SHA-256 digest from the metainfo. Opening the store sizes the
//! file to the declared length and checks every block on disk; storing a
//! block is gated on its hash, so the file never holds bytes that differ
//! from the expected content.

use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::bitfield::BitField;
use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::BLOCK_SIZE;

#[derive(Debug)]
pub struct Storage {
    file: File,
    file_size: u64,
    block_hashes: Vec<[u8; 32]>,
    block_map: BitField,
}

impl Storage {
    /// Opens or creates the data file read-write, sizes it to the declared
    /// length and fills the validity map by hashing every block on disk.
    pub fn open(metainfo: &Metainfo, path: &Path) -> Result<Storage> {
        log::debug!("checking data file {}...", path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(metainfo.file_size)?;

        let mut storage = Storage {
            file,
            file_size: metainfo.file_size,
            block_hashes: metainfo.block_hashes.clone(),
            block_map: BitField::new(metainfo.block_hashes.len()),
        };
        for block_number in 0..storage.block_count() {
            let block = storage.load_block(block_number)?;
            let correct = verify_block(&block, &storage.block_hashes[block_number as usize]);
            if correct {
                storage.block_map.set(block_number as usize);
            }
            log::debug!(
                "block {block_number} is {}",
                if correct { "correct" } else { "missing" }
            );
        }
        Ok(storage)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_hashes.len() as u64
    }

    /// Size of the given block: `BLOCK_SIZE` for every block except the
    /// last, whose size is the remainder of the file.
    pub fn block_size(&self, block_number: u64) -> u64 {
        assert!(block_number < self.block_count());
        if block_number + 1 == self.block_count() {
            match self.file_size % BLOCK_SIZE as u64 {
                0 => BLOCK_SIZE as u64,
                last => last,
            }
        } else {
            BLOCK_SIZE as u64
        }
    }

    /// True iff the block currently on disk hashes to its expected digest.
    pub fn has_block(&self, block_number: u64) -> bool {
        self.block_map.is_set(block_number as usize)
    }

    pub fn block_map(&self) -> &BitField {
        &self.block_map
    }

    pub fn is_complete(&self) -> bool {
        self.block_map.is_complete()
    }

    /// Reads the block at `block_number` from disk. The file is sized to
    /// the declared length on open, so a short read is an I/O error.
    pub fn load_block(&mut self, block_number: u64) -> Result<Vec<u8>> {
        let size = self.block_size(block_number);
        self.file
            .seek(SeekFrom::Start(block_number * BLOCK_SIZE as u64))?;
        let mut data = vec![0u8; size as usize];
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Verifies `data` against the block's expected digest and, on a match,
    /// writes it at the block's offset and marks the block valid. On a
    /// mismatch the file is left untouched.
    pub fn store_block(&mut self, block_number: u64, data: &[u8]) -> Result<()> {
        assert!(!data.is_empty() && data.len() <= BLOCK_SIZE);
        if !verify_block(data, &self.block_hashes[block_number as usize]) {
            return Err(Error::InvalidBlock(block_number));
        }
        self.file
            .seek(SeekFrom::Start(block_number * BLOCK_SIZE as u64))?;
        self.file.write_all(data)?;
        self.block_map.set(block_number as usize);
        Ok(())
    }
}

fn verify_block(data: &[u8], expected: &[u8; 32]) -> bool {
    let digest: [u8; 32] = Sha256::digest(data).into();
    digest == *expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo;
    use std::fs;

    fn open_storage(content: &[u8], write_file: bool) -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("payload");
        fs::write(&file, content).unwrap();
        let metainfo = Metainfo::load(&metainfo::create(&file).unwrap()).unwrap();
        if !write_file {
            fs::remove_file(&file).unwrap();
        }
        let storage = Storage::open(&metainfo, &file).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_open_scans_existing_file() {
        let (_dir, storage) = open_storage(&vec![b'a'; 100], true);
        assert_eq!(storage.block_count(), 1);
        assert_eq!(storage.block_size(0), 100);
        assert!(storage.has_block(0));
        assert!(storage.is_complete());
    }

    #[test]
    fn test_open_sizes_missing_file() {
        let (dir, storage) = open_storage(&vec![b'a'; 100], false);
        assert_eq!(fs::metadata(dir.path().join("payload")).unwrap().len(), 100);
        assert!(!storage.has_block(0));
        assert!(!storage.is_complete());
    }

    #[test]
    fn test_block_sizes_at_boundary() {
        let mut content = vec![b'x'; BLOCK_SIZE];
        content.push(b'y');
        let (_dir, storage) = open_storage(&content, true);
        assert_eq!(storage.block_count(), 2);
        assert_eq!(storage.block_size(0), BLOCK_SIZE as u64);
        assert_eq!(storage.block_size(1), 1);
    }

    #[test]
    fn test_block_size_of_exact_multiple() {
        let (_dir, storage) = open_storage(&vec![b'x'; BLOCK_SIZE], true);
        assert_eq!(storage.block_count(), 1);
        assert_eq!(storage.block_size(0), BLOCK_SIZE as u64);
    }

    #[test]
    fn test_store_rejects_wrong_bytes() {
        let (dir, mut storage) = open_storage(&vec![b'a'; 100], false);
        let result = storage.store_block(0, &vec![b'b'; 100]);
        assert!(matches!(result, Err(Error::InvalidBlock(0))));
        assert!(!storage.has_block(0));
        // the file stays zero-filled
        assert_eq!(
            fs::read(dir.path().join("payload")).unwrap(),
            vec![0u8; 100]
        );
    }

    #[test]
    fn test_store_then_load() {
        let (dir, mut storage) = open_storage(&vec![b'a'; 100], false);
        storage.store_block(0, &vec![b'a'; 100]).unwrap();
        assert!(storage.has_block(0));
        assert!(storage.is_complete());
        assert_eq!(storage.load_block(0).unwrap(), vec![b'a'; 100]);
        assert_eq!(
            fs::read(dir.path().join("payload")).unwrap(),
            vec![b'a'; 100]
        );
    }

    #[test]
    fn test_empty_file_is_complete() {
        let (_dir, storage) = open_storage(b"", true);
        assert_eq!(storage.block_count(), 0);
        assert!(storage.is_complete());
    }

    #[test]
    fn test_load_detects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("payload");
        fs::write(&file, vec![b'a'; 100]).unwrap();
        let metainfo = Metainfo::load(&metainfo::create(&file).unwrap()).unwrap();
        let mut storage = Storage::open(&metainfo, &file).unwrap();
        // shrink the file behind the store's back
        storage.file.set_len(10).unwrap();
        assert!(storage.load_block(0).is_err());
    }
}
