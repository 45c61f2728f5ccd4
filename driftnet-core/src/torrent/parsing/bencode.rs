//! Bencode parsing logic and info hash calculation

use sha1::{Digest, Sha1};

use super::types::TorrentMetadata;
use crate::torrent::{InfoHash, PieceLayout, TorrentError};

pub(super) type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
pub(super) type ParseResult<T> = Result<T, TorrentError>;

/// Bencode parsing utilities for torrent metadata extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Parse bencode data and extract single-file torrent metadata
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If bencode parsing or metadata extraction failed
    pub fn parse_bencode_data(torrent_bytes: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        let parsed = bencode_rs::Value::parse(torrent_bytes).map_err(|e| {
            TorrentError::InvalidTorrentFile {
                reason: format!("Bencode parsing failed: {e:?}"),
            }
        })?;

        let Some(root) = parsed.first() else {
            return Err(invalid("Empty bencode data"));
        };

        if let bencode_rs::Value::Dictionary(dict) = root {
            Self::extract_metadata_from_dict(dict, torrent_bytes)
        } else {
            Err(invalid("Root element must be dictionary"))
        }
    }

    /// Extract torrent metadata from the root dictionary
    fn extract_metadata_from_dict(
        dict: &BencodeDict<'_>,
        original_data: &[u8],
    ) -> ParseResult<TorrentMetadata> {
        let Some(bencode_rs::Value::Dictionary(info)) = dict.get(b"info".as_slice()) else {
            return Err(invalid("Missing or invalid 'info' dictionary"));
        };

        if info.contains_key(b"files".as_slice()) {
            return Err(invalid("Multi-file torrents are not supported"));
        }

        let name = Self::extract_bytes_as_string(info, b"name")?;
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!("Unusable file name {name:?}"),
            });
        }

        let piece_length = Self::extract_integer(info, b"piece length")?;
        let piece_length = u32::try_from(piece_length)
            .ok()
            .filter(|&length| length > 0)
            .ok_or_else(|| TorrentError::InvalidTorrentFile {
                reason: format!("Invalid piece length {piece_length}"),
            })?;

        let total_length = Self::extract_integer(info, b"length")?;
        let total_length =
            u64::try_from(total_length).map_err(|_| TorrentError::InvalidTorrentFile {
                reason: format!("Invalid length {total_length}"),
            })?;

        let pieces_bytes = Self::extract_bytes(info, b"pieces")?;
        if !pieces_bytes.len().is_multiple_of(20) {
            return Err(invalid("Invalid pieces length"));
        }

        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let expected_pieces = PieceLayout::new(piece_length, total_length).piece_count();
        if piece_hashes.len() != expected_pieces as usize {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "{} piece hashes for {expected_pieces} pieces",
                    piece_hashes.len()
                ),
            });
        }

        let info_hash = Self::calculate_info_hash(original_data)?;
        let announce_urls = Self::extract_announce_urls(dict)?;

        Ok(TorrentMetadata {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            announce_urls,
        })
    }

    /// Calculate SHA-1 of the raw bencoded info dictionary
    ///
    /// Walks the top-level dictionary key by key so an `info` string
    /// appearing inside another value is never mistaken for the key.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If no top-level info dictionary exists
    pub fn calculate_info_hash(original_data: &[u8]) -> Result<InfoHash, TorrentError> {
        if original_data.first() != Some(&b'd') {
            return Err(invalid("Expected dictionary start"));
        }

        let mut pos = 1;
        while pos < original_data.len() && original_data[pos] != b'e' {
            let (key, value_start) = Self::read_string(original_data, pos)?;
            let value_end = value_start + Self::find_bencode_value_end(&original_data[value_start..])?;

            if key == b"info" {
                let info_bytes = &original_data[value_start..value_end];
                if info_bytes.first() != Some(&b'd') {
                    return Err(invalid("Info field must be dictionary"));
                }
                let hash: [u8; 20] = Sha1::digest(info_bytes).into();
                return Ok(InfoHash::new(hash));
            }

            pos = value_end;
        }

        Err(invalid("Could not find info dictionary in data"))
    }

    /// Find the end position of the bencode value starting at `data[0]`
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the value is malformed or truncated
    pub fn find_bencode_value_end(data: &[u8]) -> Result<usize, TorrentError> {
        let mut pos = 0;
        let mut depth = 0usize;

        loop {
            let Some(&byte) = data.get(pos) else {
                return Err(invalid("Incomplete bencode value"));
            };

            match byte {
                b'd' | b'l' => {
                    depth += 1;
                    pos += 1;
                }
                b'e' if depth > 0 => {
                    depth -= 1;
                    pos += 1;
                }
                b'i' => {
                    let Some(offset) = data[pos..].iter().position(|&b| b == b'e') else {
                        return Err(invalid("Unterminated integer"));
                    };
                    pos += offset + 1;
                }
                b'0'..=b'9' => {
                    let (_, end) = Self::read_string(data, pos)?;
                    pos = end;
                }
                _ => return Err(invalid("Invalid bencode character")),
            }

            if depth == 0 {
                return Ok(pos);
            }
        }
    }

    /// Reads a `<len>:<bytes>` string at `pos`, returning it and the end offset
    fn read_string(data: &[u8], pos: usize) -> ParseResult<(&[u8], usize)> {
        let Some(colon) = data[pos..].iter().position(|&b| b == b':') else {
            return Err(invalid("Invalid string format"));
        };

        let length: usize = std::str::from_utf8(&data[pos..pos + colon])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| invalid("Invalid string length"))?;

        let start = pos + colon + 1;
        let end = start
            .checked_add(length)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| invalid("String runs past end of data"))?;

        Ok((&data[start..end], end))
    }

    /// Extract string from bencode dictionary
    fn extract_bytes_as_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| TorrentError::InvalidTorrentFile {
            reason: format!("Invalid UTF-8 in field: {:?}", String::from_utf8_lossy(key)),
        })
    }

    /// Extract bytes from bencode dictionary
    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    /// Extract integer from bencode dictionary
    fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid integer field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    /// Extract announce URLs, primary first, then the announce-list tiers
    fn extract_announce_urls(dict: &BencodeDict<'_>) -> ParseResult<Vec<String>> {
        let mut announce_urls = Vec::new();

        if let Ok(announce) = Self::extract_bytes_as_string(dict, b"announce") {
            announce_urls.push(announce);
        }

        if let Some(bencode_rs::Value::List(announce_list)) = dict.get(b"announce-list".as_slice())
        {
            for tier in announce_list {
                if let bencode_rs::Value::List(tier_urls) = tier {
                    for url_value in tier_urls {
                        if let bencode_rs::Value::Bytes(url_bytes) = url_value
                            && let Ok(url) = String::from_utf8(url_bytes.to_vec())
                            && !announce_urls.contains(&url)
                        {
                            announce_urls.push(url);
                        }
                    }
                }
            }
        }

        if announce_urls.is_empty() {
            return Err(invalid("No announce URLs found"));
        }

        Ok(announce_urls)
    }
}

fn invalid(reason: &str) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.to_string(),
    }
}
