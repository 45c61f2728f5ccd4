//! Test fixtures for storage testing.
//!
//! Deterministic torrent payloads with matching hash tables, an in-memory
//! storage backend and temporary download directories.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::{PieceStorage, StorageError, verify_piece};
use crate::torrent::{PieceIndex, PieceLayout};

/// Creates a temporary download directory.
///
/// # Panics
///
/// Panics if temporary directory creation fails.
/// This is acceptable in test fixtures where failures indicate environment issues.
pub fn create_temp_download_dir() -> (tempfile::TempDir, PathBuf) {
    let temp_dir = tempfile::tempdir().unwrap();
    let downloads_dir = temp_dir.path().join("downloads");
    std::fs::create_dir_all(&downloads_dir).unwrap();
    (temp_dir, downloads_dir)
}

/// Deterministic torrent payload with its layout and piece hashes.
#[derive(Debug, Clone)]
pub struct TestContent {
    pub layout: PieceLayout,
    pub data: Vec<u8>,
    pub piece_hashes: Vec<[u8; 20]>,
}

impl TestContent {
    /// Generates `total_length` bytes split into `piece_length` pieces.
    ///
    /// Each piece gets a distinct byte pattern so misplaced writes show up
    /// as hash failures.
    pub fn new(piece_length: u32, total_length: u64) -> Self {
        let layout = PieceLayout::new(piece_length, total_length);
        let data: Vec<u8> = (0..total_length)
            .map(|i| ((i * 31 + i / piece_length as u64) % 251) as u8)
            .collect();
        let piece_hashes = (0..layout.piece_count())
            .map(|i| {
                let index = PieceIndex::new(i);
                let start = layout.piece_offset(index) as usize;
                let end = start + layout.piece_size(index) as usize;
                Sha1::digest(&data[start..end]).into()
            })
            .collect();

        Self {
            layout,
            data,
            piece_hashes,
        }
    }

    /// Bytes of one piece.
    pub fn piece(&self, index: PieceIndex) -> &[u8] {
        let start = self.layout.piece_offset(index) as usize;
        let end = start + self.layout.piece_size(index) as usize;
        &self.data[start..end]
    }

    /// Bencoded single-file `.torrent` describing this content.
    pub fn to_torrent_bytes(&self, name: &str, announce: &str) -> Vec<u8> {
        let mut pieces = Vec::with_capacity(self.piece_hashes.len() * 20);
        for hash in &self.piece_hashes {
            pieces.extend_from_slice(hash);
        }

        let mut out = Vec::new();
        out.extend_from_slice(format!("d8:announce{}:{announce}", announce.len()).as_bytes());
        out.extend_from_slice(b"4:infod");
        out.extend_from_slice(format!("6:lengthi{}e", self.layout.total_length()).as_bytes());
        out.extend_from_slice(format!("4:name{}:{name}", name.len()).as_bytes());
        out.extend_from_slice(
            format!("12:piece lengthi{}e", self.layout.piece_length()).as_bytes(),
        );
        out.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        out.extend_from_slice(&pieces);
        out.extend_from_slice(b"ee");
        out
    }
}

/// In-memory storage with the same verification rules as [`super::FileStorage`].
pub struct MemoryStorage {
    layout: PieceLayout,
    piece_hashes: Vec<[u8; 20]>,
    pieces: Mutex<HashMap<PieceIndex, Vec<u8>>>,
    bitfield: Mutex<Option<Vec<u8>>>,
    syncs: Mutex<usize>,
}

impl MemoryStorage {
    /// Empty storage for the given content's layout and hashes.
    pub fn new(content: &TestContent) -> Self {
        Self {
            layout: content.layout,
            piece_hashes: content.piece_hashes.clone(),
            pieces: Mutex::new(HashMap::new()),
            bitfield: Mutex::new(None),
            syncs: Mutex::new(0),
        }
    }

    /// Storage already holding every piece of `content`.
    pub fn seeded(content: &TestContent) -> Self {
        let storage = Self::new(content);
        {
            let mut pieces = storage.pieces.lock();
            for i in 0..content.layout.piece_count() {
                let index = PieceIndex::new(i);
                pieces.insert(index, content.piece(index).to_vec());
            }
        }
        storage
    }

    /// Number of pieces written so far.
    pub fn stored_piece_count(&self) -> usize {
        self.pieces.lock().len()
    }

    /// Raw bitfield last passed to `save_bitfield`.
    pub fn saved_bitfield(&self) -> Option<Vec<u8>> {
        self.bitfield.lock().clone()
    }

    /// Number of `sync` calls.
    pub fn sync_count(&self) -> usize {
        *self.syncs.lock()
    }
}

#[async_trait]
impl PieceStorage for MemoryStorage {
    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        verify_piece(&self.layout, &self.piece_hashes, index, data)?;
        self.pieces.lock().insert(index, data.to_vec());
        Ok(())
    }

    async fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>, StorageError> {
        self.pieces
            .lock()
            .get(&index)
            .cloned()
            .ok_or(StorageError::PieceNotFound { index })
    }

    async fn sync(&self) -> Result<(), StorageError> {
        *self.syncs.lock() += 1;
        Ok(())
    }

    async fn load_bitfield(&self, len: usize) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .bitfield
            .lock()
            .as_ref()
            .filter(|bytes| bytes.len() >= len)
            .map(|bytes| bytes[..len].to_vec()))
    }

    async fn save_bitfield(&self, bitfield: &[u8]) -> Result<(), StorageError> {
        *self.bitfield.lock() = Some(bitfield.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_download_dir() {
        let (_temp_dir, downloads) = create_temp_download_dir();
        assert!(downloads.is_dir());
    }

    #[test]
    fn test_content_pieces_match_hashes() {
        let content = TestContent::new(10, 25);
        assert_eq!(content.layout.piece_count(), 3);
        assert_eq!(content.piece(PieceIndex::new(2)).len(), 5);

        for i in 0..3 {
            let index = PieceIndex::new(i);
            assert!(
                verify_piece(&content.layout, &content.piece_hashes, index, content.piece(index))
                    .is_ok()
            );
        }
    }

    #[tokio::test]
    async fn test_memory_storage_verifies_writes() {
        let content = TestContent::new(10, 25);
        let storage = MemoryStorage::new(&content);

        let result = storage.write_piece(PieceIndex::new(0), &[0u8; 10]).await;
        assert!(matches!(result, Err(StorageError::HashMismatch { .. })));
        assert_eq!(storage.stored_piece_count(), 0);

        let index = PieceIndex::new(1);
        storage.write_piece(index, content.piece(index)).await.unwrap();
        assert_eq!(storage.read_piece(index).await.unwrap(), content.piece(index));
    }
}
