use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};

use crate::bitfield::BitField;
use crate::error::Result;
use crate::metainfo::Metainfo;
use crate::storage::Storage;
use crate::utils;

/// A torrent bound to its data file: the parsed metainfo's peers plus the
/// block store that tracks which parts of the file are already verified.
#[derive(Debug)]
pub struct Torrent {
    metainfo_name: PathBuf,
    peers: Vec<SocketAddrV4>,
    storage: Storage,
}

impl Torrent {
    /// Opens the torrent described by a `.ttorrent` document, deriving the
    /// data file name by stripping the extension.
    pub fn open(metainfo_path: &Path) -> Result<Torrent> {
        let data_path = utils::original_file_name(metainfo_path)?;
        Self::open_with_file(metainfo_path, &data_path)
    }

    /// Opens the torrent with an explicitly named data file.
    pub fn open_with_file(metainfo_path: &Path, data_path: &Path) -> Result<Torrent> {
        log::debug!(
            "metainfo: {}, data file: {}",
            metainfo_path.display(),
            data_path.display()
        );
        let metainfo = Metainfo::load(metainfo_path)?;
        let storage = Storage::open(&metainfo, data_path)?;
        Ok(Torrent {
            metainfo_name: metainfo_path.to_path_buf(),
            peers: metainfo.peers,
            storage,
        })
    }

    pub fn metainfo_name(&self) -> &Path {
        &self.metainfo_name
    }

    pub fn peers(&self) -> &[SocketAddrV4] {
        &self.peers
    }

    pub fn file_size(&self) -> u64 {
        self.storage.file_size()
    }

    pub fn block_count(&self) -> u64 {
        self.storage.block_count()
    }

    pub fn block_size(&self, block_number: u64) -> u64 {
        self.storage.block_size(block_number)
    }

    pub fn has_block(&self, block_number: u64) -> bool {
        self.storage.has_block(block_number)
    }

    pub fn block_map(&self) -> &BitField {
        self.storage.block_map()
    }

    pub fn load_block(&mut self, block_number: u64) -> Result<Vec<u8>> {
        self.storage.load_block(block_number)
    }

    pub fn store_block(&mut self, block_number: u64, data: &[u8]) -> Result<()> {
        self.storage.store_block(block_number, data)
    }

    pub fn is_complete(&self) -> bool {
        self.storage.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo;
    use std::fs;

    #[test]
    fn test_open_derives_data_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("payload");
        fs::write(&file, vec![b'a'; 100]).unwrap();
        let metainfo_name = metainfo::create(&file).unwrap();

        let torrent = Torrent::open(&metainfo_name).unwrap();
        assert_eq!(torrent.metainfo_name(), metainfo_name);
        assert_eq!(torrent.file_size(), 100);
        assert_eq!(torrent.block_count(), 1);
        assert_eq!(torrent.peers().len(), 20);
        assert!(torrent.is_complete());
    }

    #[test]
    fn test_open_rejects_wrong_extension() {
        assert!(Torrent::open(Path::new("payload.torrent")).is_err());
    }
}
