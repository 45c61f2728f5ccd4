//! BitTorrent wire protocol abstractions and message types.
//!
//! BEP 3 handshake and length-prefixed message codec, plus exact-length
//! framing over any async byte stream. The codec is stateless; the session
//! owns the stream and decides what each message means.

pub mod handshake;
pub mod messages;
pub mod types;

// Re-export public API
pub use handshake::HandshakeCodec;
pub use messages::MessageCodec;
pub use types::{CLIENT_PREFIX, PROTOCOL_NAME, PeerHandshake, PeerId, PeerMessage};

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::torrent::{InfoHash, PieceIndex};

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate();
        let bytes = peer_id.as_bytes();

        assert_eq!(&bytes[..8], b"-DN0001-");

        let peer_id2 = PeerId::generate();
        assert_ne!(peer_id.as_bytes(), peer_id2.as_bytes());
    }

    #[test]
    fn test_peer_id_from_slice() {
        assert!(PeerId::from_slice(&[7u8; 20]).is_some());
        assert!(PeerId::from_slice(&[7u8; 19]).is_none());
        assert!(PeerId::from_slice(&[7u8; 21]).is_none());
    }

    #[test]
    fn test_peer_id_display_keeps_client_prefix() {
        let mut id = [0xABu8; 20];
        id[..8].copy_from_slice(b"-DN0001-");
        let shown = PeerId::new(id).to_string();
        assert!(shown.starts_with("-DN0001-abab"));
    }

    #[test]
    fn test_message_ids() {
        assert_eq!(PeerMessage::KeepAlive.message_id(), None);
        assert_eq!(PeerMessage::Choke.message_id(), Some(0));
        assert_eq!(
            PeerMessage::Have {
                piece_index: PieceIndex::new(1)
            }
            .message_id(),
            Some(4)
        );
    }

    #[tokio::test]
    async fn test_handshake_then_messages_over_duplex() {
        let (mut left, mut right) = duplex(256);
        let info_hash = InfoHash::new([4u8; 20]);
        let handshake = PeerHandshake::new(info_hash, PeerId::generate());

        HandshakeCodec::write_handshake(&mut left, &handshake)
            .await
            .unwrap();
        MessageCodec::write_message(&mut left, &PeerMessage::Interested)
            .await
            .unwrap();

        let received = HandshakeCodec::read_handshake(&mut right).await.unwrap();
        HandshakeCodec::validate(&received, &info_hash, Some(&handshake.peer_id)).unwrap();
        assert_eq!(
            MessageCodec::read_message(&mut right, 64).await.unwrap(),
            PeerMessage::Interested
        );
    }
}
