//! Core types for the BitTorrent wire protocol

use std::fmt;

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol string carried in every handshake.
pub const PROTOCOL_NAME: &str = "BitTorrent protocol";

/// Client prefix of locally generated peer ids.
pub const CLIENT_PREFIX: &[u8; 8] = b"-DN0001-";

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker communication to identify clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate random peer ID for this client.
    pub fn generate() -> Self {
        Self::generate_with_prefix(CLIENT_PREFIX)
    }

    /// Generate a peer ID with a custom 8-byte client prefix.
    pub fn generate_with_prefix(prefix: &[u8; 8]) -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(prefix);
        for byte in &mut id[8..] {
            *byte = rand::random();
        }
        Self(id)
    }

    /// Builds a peer ID from a tracker-supplied byte string.
    ///
    /// Returns `None` unless the input is exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let id: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(id))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Client prefixes are printable; the random tail is not
        let prefix = &self.0[..8];
        if prefix.iter().all(|b| b.is_ascii_graphic()) {
            write!(
                f,
                "{}{}",
                String::from_utf8_lossy(prefix),
                hex::encode(&self.0[8..])
            )
        } else {
            f.write_str(&hex::encode(self.0))
        }
    }
}

/// BitTorrent wire protocol messages.
///
/// The BEP 3 message set. Every message id outside 0..=8 is rejected at
/// decode time rather than skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length frame keeping an idle connection open
    KeepAlive,
    /// Sender will not serve requests
    Choke,
    /// Sender will serve requests
    Unchoke,
    /// Sender wants pieces the receiver has
    Interested,
    /// Sender wants nothing from the receiver
    NotInterested,
    /// Sender has completed a piece
    Have {
        /// Index of the completed piece
        piece_index: PieceIndex,
    },
    /// Sender's full piece availability, MSB-first
    Bitfield {
        /// Raw bitmap bytes
        bitfield: Bytes,
    },
    /// Request a byte range of a piece
    Request {
        /// Index of the piece to request from
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes to request
        length: u32,
    },
    /// A byte range of piece data
    Piece {
        /// Index of the piece this data belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// The actual piece data
        data: Bytes,
    },
    /// Withdraw a previously sent request
    Cancel {
        /// Index of the piece to cancel
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes that were requested
        length: u32,
    },
}

impl PeerMessage {
    /// Wire id of this message, `None` for keep-alive.
    pub fn message_id(&self) -> Option<u8> {
        match self {
            PeerMessage::KeepAlive => None,
            PeerMessage::Choke => Some(0),
            PeerMessage::Unchoke => Some(1),
            PeerMessage::Interested => Some(2),
            PeerMessage::NotInterested => Some(3),
            PeerMessage::Have { .. } => Some(4),
            PeerMessage::Bitfield { .. } => Some(5),
            PeerMessage::Request { .. } => Some(6),
            PeerMessage::Piece { .. } => Some(7),
            PeerMessage::Cancel { .. } => Some(8),
        }
    }

    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keepalive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
        }
    }
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and verify info hash matching for torrent verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandshake {
    /// Protocol identifier string ("BitTorrent protocol")
    pub protocol: Vec<u8>,
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: PROTOCOL_NAME.as_bytes().to_vec(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}
