//! Storage layer for torrent data.
//!
//! Defines the storage interface the piece store writes verified pieces
//! through, with a single-file implementation. Every write is re-verified
//! against the piece hash table before it reaches the backend.

pub mod file_storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use async_trait::async_trait;
pub use file_storage::FileStorage;
use sha1::{Digest, Sha1};

use crate::torrent::{PieceIndex, PieceLayout};

/// Storage operations for torrent piece data.
///
/// Implementations own the piece hash table and refuse to persist data
/// that does not match it. Methods take `&self` so one backend can be
/// shared by every connection through the piece store.
#[async_trait]
pub trait PieceStorage: Send + Sync {
    /// Verifies and persists one complete piece.
    ///
    /// # Errors
    ///
    /// - `StorageError::InvalidPieceSize` - If data length differs from the piece size
    /// - `StorageError::HashMismatch` - If SHA-1 of data differs from the piece hash
    /// - `StorageError::Io` - If file system operation failed
    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError>;

    /// Loads one complete piece.
    ///
    /// # Errors
    ///
    /// - `StorageError::PieceNotFound` - If the index is outside the torrent or never written
    /// - `StorageError::Io` - If file system operation failed
    async fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>, StorageError>;

    /// Flushes written piece data to durable storage.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If file system operation failed
    async fn sync(&self) -> Result<(), StorageError>;

    /// Loads the persisted local bitfield.
    ///
    /// Returns `None` when nothing was persisted or the persisted data is
    /// shorter than `len` bytes.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If file system operation failed
    async fn load_bitfield(&self, len: usize) -> Result<Option<Vec<u8>>, StorageError>;

    /// Persists the raw local bitfield.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If file system operation failed
    async fn save_bitfield(&self, bitfield: &[u8]) -> Result<(), StorageError>;
}

/// Errors that occur during storage operations.
///
/// Covers file system errors and data corruption during piece storage
/// and retrieval operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Requested piece has not been downloaded yet
    #[error("Piece {index} not found")]
    PieceNotFound {
        /// Index of the piece that was not found
        index: PieceIndex,
    },

    /// Piece data does not hash to the expected SHA-1
    #[error("Piece {index} failed hash verification")]
    HashMismatch {
        /// Index of the corrupt piece
        index: PieceIndex,
    },

    /// Piece data has the wrong length for its index
    #[error("Piece {index} is {actual} bytes, expected {expected}")]
    InvalidPieceSize {
        /// Index of the piece
        index: PieceIndex,
        /// Size dictated by the torrent layout
        expected: u32,
        /// Size that was supplied
        actual: usize,
    },

    /// File system specific error occurred
    #[error("File system error: {message}")]
    FilesystemError {
        /// Description of the file system error
        message: String,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Checks piece length and SHA-1 against the torrent's hash table.
///
/// # Errors
///
/// - `StorageError::PieceNotFound` - If the index is outside the torrent
/// - `StorageError::InvalidPieceSize` - If data length differs from the piece size
/// - `StorageError::HashMismatch` - If SHA-1 of data differs from the piece hash
pub fn verify_piece(
    layout: &PieceLayout,
    piece_hashes: &[[u8; 20]],
    index: PieceIndex,
    data: &[u8],
) -> Result<(), StorageError> {
    let Some(expected_hash) = piece_hashes.get(index.as_usize()) else {
        return Err(StorageError::PieceNotFound { index });
    };

    let expected = layout.piece_size(index);
    if data.len() != expected as usize {
        return Err(StorageError::InvalidPieceSize {
            index,
            expected,
            actual: data.len(),
        });
    }

    let actual_hash: [u8; 20] = Sha1::digest(data).into();
    if actual_hash != *expected_hash {
        return Err(StorageError::HashMismatch { index });
    }

    Ok(())
}
