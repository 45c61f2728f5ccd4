//! BitTorrent wire protocol message serialization and stream framing

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::super::{PieceIndex, TorrentError};
use super::types::PeerMessage;

/// Frame overhead of a PIECE message: id, index and begin.
pub const PIECE_HEADER_LEN: u32 = 1 + 4 + 4;

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes peer message following BEP 3
    pub fn serialize_message(message: &PeerMessage) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::frame_len(message));

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.put_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(6);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(PIECE_HEADER_LEN + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
        }

        buf.freeze()
    }

    /// Deserializes a full frame, length prefix included.
    ///
    /// # Errors
    /// - `TorrentError::DecodeError` - Truncated frame or wrong fixed payload size
    /// - `TorrentError::UnknownMessageId` - Message id outside 0..=8
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        if data.len() < 4 {
            return Err(TorrentError::DecodeError {
                message: "Frame shorter than its length prefix".to_string(),
            });
        }

        let mut buf = data;
        let length = buf.get_u32() as usize;
        if buf.len() < length {
            return Err(TorrentError::DecodeError {
                message: format!("Frame declares {length} bytes, {} present", buf.len()),
            });
        }

        Self::decode_body(Bytes::copy_from_slice(&buf[..length]))
    }

    /// Decodes a frame body (id and payload, length prefix stripped).
    ///
    /// An empty body is a keep-alive.
    ///
    /// # Errors
    /// - `TorrentError::DecodeError` - Wrong fixed payload size
    /// - `TorrentError::UnknownMessageId` - Message id outside 0..=8
    pub fn decode_body(mut body: Bytes) -> Result<PeerMessage, TorrentError> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let message_id = body.get_u8();
        let payload_len = body.len();

        match message_id {
            0..=3 => {
                expect_payload_len("state", payload_len, 0)?;
                Ok(match message_id {
                    0 => PeerMessage::Choke,
                    1 => PeerMessage::Unchoke,
                    2 => PeerMessage::Interested,
                    _ => PeerMessage::NotInterested,
                })
            }
            4 => {
                expect_payload_len("have", payload_len, 4)?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(body.get_u32()),
                })
            }
            5 => Ok(PeerMessage::Bitfield { bitfield: body }),
            6 | 8 => {
                expect_payload_len("request", payload_len, 12)?;
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                let length = body.get_u32();
                if message_id == 6 {
                    Ok(PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    })
                } else {
                    Ok(PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    })
                }
            }
            7 => {
                if payload_len < 8 {
                    return Err(TorrentError::DecodeError {
                        message: format!("piece payload is {payload_len} bytes, minimum 8"),
                    });
                }
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: body,
                })
            }
            id => Err(TorrentError::UnknownMessageId { id }),
        }
    }

    /// Reads exactly one frame from the stream.
    ///
    /// Partial reads are retried until the declared length has arrived.
    /// Frames declaring more than `max_frame_len` bytes are rejected before
    /// any buffer is allocated.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Stream closed or failed mid-frame
    /// - `TorrentError::DecodeError` - Oversized or malformed frame
    /// - `TorrentError::UnknownMessageId` - Message id outside 0..=8
    pub async fn read_message<R>(
        reader: &mut R,
        max_frame_len: usize,
    ) -> Result<PeerMessage, TorrentError>
    where
        R: AsyncRead + Unpin,
    {
        let length = reader.read_u32().await? as usize;
        if length > max_frame_len {
            return Err(TorrentError::DecodeError {
                message: format!("Frame of {length} bytes exceeds limit of {max_frame_len}"),
            });
        }

        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        Self::decode_body(Bytes::from(body))
    }

    /// Writes one complete frame and flushes.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Write or flush failed
    pub async fn write_message<W>(writer: &mut W, message: &PeerMessage) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        writer
            .write_all(&Self::serialize_message(message))
            .await?;
        writer.flush().await?;
        Ok(())
    }

    fn frame_len(message: &PeerMessage) -> usize {
        4 + match message {
            PeerMessage::KeepAlive => 0,
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => 1,
            PeerMessage::Have { .. } => 5,
            PeerMessage::Bitfield { bitfield } => 1 + bitfield.len(),
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => 13,
            PeerMessage::Piece { data, .. } => PIECE_HEADER_LEN as usize + data.len(),
        }
    }
}

fn expect_payload_len(kind: &str, actual: usize, expected: usize) -> Result<(), TorrentError> {
    if actual != expected {
        return Err(TorrentError::DecodeError {
            message: format!("{kind} payload is {actual} bytes, expected {expected}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;

    #[test]
    fn test_request_frame_bytes() {
        let message = PeerMessage::Request {
            piece_index: PieceIndex::new(5),
            offset: 0,
            length: 16384,
        };

        let bytes = MessageCodec::serialize_message(&message);
        assert_eq!(
            bytes.as_ref(),
            &[0, 0, 0, 13, 6, 0, 0, 0, 5, 0, 0, 0, 0, 0, 0, 0x40, 0]
        );
        assert_eq!(MessageCodec::deserialize_message(&bytes).unwrap(), message);
    }

    #[test]
    fn test_full_piece_round_trip() {
        let data = Bytes::from((0..16384u32).map(|i| (i % 251) as u8).collect::<Vec<_>>());
        let message = PeerMessage::Piece {
            piece_index: PieceIndex::new(5),
            offset: 0,
            data: data.clone(),
        };

        let bytes = MessageCodec::serialize_message(&message);
        assert_eq!(bytes.len(), 4 + 9 + 16384);
        assert_eq!(&bytes[..4], &(9u32 + 16384).to_be_bytes());
        assert_eq!(MessageCodec::deserialize_message(&bytes).unwrap(), message);
    }

    #[test]
    fn test_all_variants_round_trip() {
        let messages = [
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have {
                piece_index: PieceIndex::new(42),
            },
            PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1010_0000, 0xFF, 0x01]),
            },
            PeerMessage::Cancel {
                piece_index: PieceIndex::new(7),
                offset: 16384,
                length: 16384,
            },
        ];

        for message in messages {
            let bytes = MessageCodec::serialize_message(&message);
            assert_eq!(MessageCodec::deserialize_message(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn test_keepalive_is_zero_length() {
        let bytes = MessageCodec::serialize_message(&PeerMessage::KeepAlive);
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_unknown_message_id_rejected() {
        // Id 9 (DHT port) is outside the supported set
        let frame = [0, 0, 0, 3, 9, 0x1A, 0xE1];
        assert!(matches!(
            MessageCodec::deserialize_message(&frame),
            Err(TorrentError::UnknownMessageId { id: 9 })
        ));
    }

    #[test]
    fn test_wrong_fixed_payload_size() {
        let have_too_long = [0, 0, 0, 6, 4, 0, 0, 0, 1, 0];
        assert!(matches!(
            MessageCodec::deserialize_message(&have_too_long),
            Err(TorrentError::DecodeError { .. })
        ));

        let choke_with_payload = [0, 0, 0, 2, 0, 1];
        assert!(MessageCodec::deserialize_message(&choke_with_payload).is_err());

        let short_piece = [0, 0, 0, 5, 7, 0, 0, 0, 1];
        assert!(MessageCodec::deserialize_message(&short_piece).is_err());
    }

    #[test]
    fn test_truncated_frame() {
        let frame = [0, 0, 0, 13, 6, 0, 0];
        assert!(matches!(
            MessageCodec::deserialize_message(&frame),
            Err(TorrentError::DecodeError { .. })
        ));
        assert!(MessageCodec::deserialize_message(&[0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_read_message_reassembles_partial_reads() {
        let message = PeerMessage::Piece {
            piece_index: PieceIndex::new(1),
            offset: 0,
            data: Bytes::from_static(b"partial reads are normal"),
        };
        let bytes = MessageCodec::serialize_message(&message);

        let mut reader = Builder::new()
            .read(&bytes[..2])
            .read(&bytes[2..7])
            .read(&bytes[7..20])
            .read(&bytes[20..])
            .build();

        let decoded = MessageCodec::read_message(&mut reader, 1024).await.unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_read_message_consecutive_frames() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&MessageCodec::serialize_message(&PeerMessage::Unchoke));
        wire.extend_from_slice(&MessageCodec::serialize_message(&PeerMessage::KeepAlive));
        wire.extend_from_slice(&MessageCodec::serialize_message(&PeerMessage::Have {
            piece_index: PieceIndex::new(3),
        }));
        let mut reader = Builder::new().read(&wire).build();

        assert_eq!(
            MessageCodec::read_message(&mut reader, 64).await.unwrap(),
            PeerMessage::Unchoke
        );
        assert_eq!(
            MessageCodec::read_message(&mut reader, 64).await.unwrap(),
            PeerMessage::KeepAlive
        );
        assert_eq!(
            MessageCodec::read_message(&mut reader, 64).await.unwrap(),
            PeerMessage::Have {
                piece_index: PieceIndex::new(3)
            }
        );
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_frame() {
        let mut reader = Builder::new().read(&[0, 1, 0, 0]).build();
        let result = MessageCodec::read_message(&mut reader, 1024).await;
        assert!(matches!(result, Err(TorrentError::DecodeError { .. })));
    }

    #[tokio::test]
    async fn test_read_message_eof_mid_frame() {
        let mut reader = Builder::new().read(&[0, 0, 0, 5, 4, 0]).build();
        let result = MessageCodec::read_message(&mut reader, 1024).await;
        assert!(matches!(result, Err(TorrentError::Io(_))));
    }

    #[tokio::test]
    async fn test_write_message_writes_whole_frame() {
        let message = PeerMessage::Have {
            piece_index: PieceIndex::new(258),
        };
        let mut writer = Builder::new().write(&[0, 0, 0, 5, 4, 0, 0, 1, 2]).build();

        MessageCodec::write_message(&mut writer, &message)
            .await
            .unwrap();
    }
}
