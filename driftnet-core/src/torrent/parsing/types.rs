//! Core types for torrent metainfo parsing

use std::path::Path;

use async_trait::async_trait;

use super::super::{InfoHash, PieceLayout, TorrentError};

/// Complete metadata extracted from a single-file torrent.
///
/// Contains everything needed to download the payload: the info hash
/// identifying the swarm, piece geometry and hashes, and tracker URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub announce_urls: Vec<String>,
}

impl TorrentMetadata {
    /// Piece geometry derived from piece length and total length.
    pub fn layout(&self) -> PieceLayout {
        PieceLayout::new(self.piece_length, self.total_length)
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }
}

/// Abstract torrent parsing interface.
///
/// Implementations turn raw `.torrent` bytes into validated metadata.
#[async_trait]
pub trait TorrentParser: Send + Sync {
    /// Parses torrent metadata from raw bencode bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode, missing fields or a multi-file torrent
    async fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentMetadata, TorrentError>;

    /// Parses torrent file from filesystem path.
    ///
    /// # Errors
    /// - `TorrentError::Io` - File could not be read
    /// - `TorrentError::InvalidTorrentFile` - Parsing failure
    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError>;
}
