//! BitTorrent handshake serialization, validation and stream framing

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{PROTOCOL_NAME, PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Bytes after the protocol string: reserved, info hash, peer id.
const HANDSHAKE_TAIL_LEN: usize = 8 + 20 + 20;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + handshake.protocol.len() + HANDSHAKE_TAIL_LEN);

        buf.push(handshake.protocol.len() as u8);
        buf.extend_from_slice(&handshake.protocol);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());

        buf
    }

    /// Deserializes handshake message following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::DecodeError` - Input shorter than the declared handshake
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        let Some(&protocol_len) = data.first() else {
            return Err(TorrentError::DecodeError {
                message: "Empty handshake".to_string(),
            });
        };
        let protocol_len = protocol_len as usize;
        let total = 1 + protocol_len + HANDSHAKE_TAIL_LEN;
        if data.len() < total {
            return Err(TorrentError::DecodeError {
                message: format!("Handshake is {} bytes, expected {total}", data.len()),
            });
        }

        let protocol = data[1..1 + protocol_len].to_vec();
        let mut rest = &data[1 + protocol_len..total];

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&rest[..8]);
        rest = &rest[8..];

        let mut info_hash_bytes = [0u8; 20];
        info_hash_bytes.copy_from_slice(&rest[..20]);
        rest = &rest[20..];

        let mut peer_id_bytes = [0u8; 20];
        peer_id_bytes.copy_from_slice(&rest[..20]);

        Ok(PeerHandshake {
            protocol,
            reserved,
            info_hash: InfoHash::new(info_hash_bytes),
            peer_id: PeerId::new(peer_id_bytes),
        })
    }

    /// Checks a received handshake against what this session expects.
    ///
    /// The peer id is only compared when the caller knows it in advance,
    /// i.e. when dialing a tracker entry that carried one.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolMismatch` - Protocol string, info hash or peer id differs
    pub fn validate(
        received: &PeerHandshake,
        expected_info_hash: &InfoHash,
        expected_peer_id: Option<&PeerId>,
    ) -> Result<(), TorrentError> {
        if received.protocol != PROTOCOL_NAME.as_bytes() {
            return Err(TorrentError::ProtocolMismatch {
                reason: format!(
                    "unexpected protocol string {:?}",
                    String::from_utf8_lossy(&received.protocol)
                ),
            });
        }

        if received.info_hash != *expected_info_hash {
            return Err(TorrentError::ProtocolMismatch {
                reason: format!(
                    "info hash {} does not match {expected_info_hash}",
                    received.info_hash
                ),
            });
        }

        if let Some(expected) = expected_peer_id
            && received.peer_id != *expected
        {
            return Err(TorrentError::ProtocolMismatch {
                reason: format!("peer id {} does not match {expected}", received.peer_id),
            });
        }

        Ok(())
    }

    /// Reads one handshake from the stream.
    ///
    /// Reads the length byte, then exactly `pstrlen + 48` more bytes.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Stream closed or failed before the handshake completed
    pub async fn read_handshake<R>(reader: &mut R) -> Result<PeerHandshake, TorrentError>
    where
        R: AsyncRead + Unpin,
    {
        let protocol_len = reader.read_u8().await?;
        let mut buf = vec![0u8; 1 + protocol_len as usize + HANDSHAKE_TAIL_LEN];
        buf[0] = protocol_len;
        reader.read_exact(&mut buf[1..]).await?;
        Self::deserialize_handshake(&buf)
    }

    /// Writes one handshake to the stream and flushes it.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Write or flush failed
    pub async fn write_handshake<W>(
        writer: &mut W,
        handshake: &PeerHandshake,
    ) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        writer
            .write_all(&Self::serialize_handshake(handshake))
            .await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;

    fn sample_handshake() -> PeerHandshake {
        PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::new([2u8; 20]))
    }

    #[test]
    fn test_handshake_layout() {
        let bytes = HandshakeCodec::serialize_handshake(&sample_handshake());

        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[test]
    fn test_deserialize_rejects_short_input() {
        let bytes = HandshakeCodec::serialize_handshake(&sample_handshake());
        let result = HandshakeCodec::deserialize_handshake(&bytes[..60]);
        assert!(matches!(result, Err(TorrentError::DecodeError { .. })));
        assert!(HandshakeCodec::deserialize_handshake(&[]).is_err());
    }

    #[test]
    fn test_validate_info_hash_mismatch() {
        let handshake = sample_handshake();
        let other = InfoHash::new([9u8; 20]);

        let result = HandshakeCodec::validate(&handshake, &other, None);
        assert!(matches!(result, Err(TorrentError::ProtocolMismatch { .. })));
    }

    #[test]
    fn test_validate_peer_id_only_when_known() {
        let handshake = sample_handshake();
        let info_hash = handshake.info_hash;

        assert!(HandshakeCodec::validate(&handshake, &info_hash, None).is_ok());
        assert!(
            HandshakeCodec::validate(&handshake, &info_hash, Some(&PeerId::new([2u8; 20]))).is_ok()
        );
        assert!(
            HandshakeCodec::validate(&handshake, &info_hash, Some(&PeerId::new([3u8; 20])))
                .is_err()
        );
    }

    #[test]
    fn test_validate_protocol_string() {
        let mut handshake = sample_handshake();
        handshake.protocol = b"BitTorrent protocoX".to_vec();
        let info_hash = handshake.info_hash;

        assert!(matches!(
            HandshakeCodec::validate(&handshake, &info_hash, None),
            Err(TorrentError::ProtocolMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_handshake_across_partial_reads() {
        let bytes = HandshakeCodec::serialize_handshake(&sample_handshake());
        let mut reader = Builder::new()
            .read(&bytes[..1])
            .read(&bytes[1..30])
            .read(&bytes[30..])
            .build();

        let handshake = HandshakeCodec::read_handshake(&mut reader).await.unwrap();
        assert_eq!(handshake, sample_handshake());
    }

    #[tokio::test]
    async fn test_read_handshake_truncated_stream() {
        let bytes = HandshakeCodec::serialize_handshake(&sample_handshake());
        let mut reader = Builder::new().read(&bytes[..40]).build();

        let result = HandshakeCodec::read_handshake(&mut reader).await;
        assert!(matches!(result, Err(TorrentError::Io(_))));
    }
}
