//! BitTorrent peer-wire piece exchange

pub mod bitfield;
pub mod parsing;
pub mod piece_store;
pub mod protocol;
pub mod session;
pub mod swarm;
pub mod tracker;

use std::fmt;
use std::time::Duration;

pub use bitfield::Bitfield;
pub use parsing::{BencodeTorrentParser, TorrentMetadata, TorrentParser};
pub use piece_store::{ConnectionDescriptor, PieceLayout, PieceStore, Progress};
pub use protocol::{HandshakeCodec, MessageCodec, PeerHandshake, PeerId, PeerMessage};
pub use session::{
    ConnectionStatus, PeerSession, SessionContext, SessionSettings, SessionState,
};
pub use swarm::{AdmissionHandle, SwarmCoordinator, UnchokeAdmission};
pub use tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, HttpTrackerClient, TrackerClient,
    TrackerManager, TrackerPeer,
};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the bencoded info dictionary. Exchanged in the
/// handshake and sent to the tracker to select the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a usize for bitfield and table lookups.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Connection-scoped failures (protocol, I/O, decode) tear down only the
/// session that raised them. Piece-level failures are recoverable and the
/// dispatch loop keeps running; see [`TorrentError::is_connection_fatal`].
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Tracker connection failed: {url}")]
    TrackerConnectionFailed { url: String },

    #[error("Tracker request timed out: {url}")]
    TrackerTimeout { url: String },

    #[error("Tracker {url} returned server error {status}")]
    TrackerServerError { url: String, status: u16 },

    #[error("Tracker failure: {reason}")]
    TrackerFailure { reason: String },

    #[error("Handshake mismatch: {reason}")]
    ProtocolMismatch { reason: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Unknown message ID: {id}")]
    UnknownMessageId { id: u8 },

    #[error("Malformed message: {message}")]
    DecodeError { message: String },

    #[error("Peer requested piece {index} while choked")]
    ChokeViolation { index: PieceIndex },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("No data from peer within {timeout:?}")]
    ReadTimeout { timeout: Duration },

    #[error("Request for piece {index} was not answered in time")]
    RequestTimeout { index: PieceIndex },

    #[error("Piece {index} hash mismatch")]
    PieceHashMismatch { index: PieceIndex },

    #[error("Piece {index} already downloaded")]
    DuplicatePiece { index: PieceIndex },

    #[error("Piece {index} not available")]
    PieceNotFound { index: PieceIndex },

    #[error("Range {begin}+{length} exceeds piece {index} of {piece_size} bytes")]
    RangeExceeded {
        index: PieceIndex,
        begin: u32,
        length: u32,
        piece_size: u32,
    },

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("Swarm coordinator has shut down")]
    CoordinatorShutdown,

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}

impl TorrentError {
    /// Returns true when the error must close the connection that raised it.
    ///
    /// Choke violations, duplicate or corrupt pieces and unservable requests
    /// are logged by the session and the dispatch loop continues.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(
            self,
            TorrentError::ChokeViolation { .. }
                | TorrentError::DuplicatePiece { .. }
                | TorrentError::PieceHashMismatch { .. }
                | TorrentError::PieceNotFound { .. }
                | TorrentError::RangeExceeded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
        assert_eq!(piece2.as_usize(), 10);
    }

    #[test]
    fn test_connection_fatal_classification() {
        let index = PieceIndex::new(3);
        assert!(!TorrentError::ChokeViolation { index }.is_connection_fatal());
        assert!(!TorrentError::DuplicatePiece { index }.is_connection_fatal());
        assert!(!TorrentError::PieceHashMismatch { index }.is_connection_fatal());
        assert!(!TorrentError::PieceNotFound { index }.is_connection_fatal());

        assert!(TorrentError::UnknownMessageId { id: 42 }.is_connection_fatal());
        assert!(
            TorrentError::ProtocolMismatch {
                reason: "info hash".to_string()
            }
            .is_connection_fatal()
        );
        assert!(TorrentError::RequestTimeout { index }.is_connection_fatal());
    }
}
