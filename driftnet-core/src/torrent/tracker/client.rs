//! HTTP tracker client implementation with URL building and response parsing

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use url::Url;

use super::types::{AnnounceRequest, AnnounceResponse, TrackerClient, TrackerPeer};
use crate::config::NetworkConfig;
use crate::torrent::{PeerId, TorrentError};

type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;

/// HTTP tracker client implementation
pub struct HttpTrackerClient {
    announce_url: String,
    client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates HTTP tracker client for one announce URL.
    ///
    /// Uses network configuration for timeout and user agent settings.
    ///
    /// # Errors
    /// - `TorrentError::UrlParsing` - Announce URL is not a valid URL
    /// - `TorrentError::TrackerConnectionFailed` - Announce URL is not http or https
    /// - `TorrentError::Http` - HTTP client could not be constructed
    pub fn new(announce_url: String, config: &NetworkConfig) -> Result<Self, TorrentError> {
        let parsed = Url::parse(&announce_url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TorrentError::TrackerConnectionFailed { url: announce_url });
        }

        let client = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            announce_url,
            client,
        })
    }

    /// Build announce URL with query parameters
    ///
    /// `info_hash` and `peer_id` are percent-encoded byte by byte with
    /// `urlencoding::encode_binary`; any query already present on the
    /// announce URL (passkeys) is preserved.
    pub(super) fn build_announce_url(&self, request: &AnnounceRequest) -> Result<Url, TorrentError> {
        let mut url = Url::parse(&self.announce_url)?;

        let mut query = url.query().map(|q| format!("{q}&")).unwrap_or_default();
        query.push_str(&format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            urlencoding::encode_binary(request.info_hash.as_bytes()),
            urlencoding::encode_binary(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        ));
        if let Some(event) = request.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }

        url.set_query(Some(&query));
        Ok(url)
    }

    /// Parse compact IPv4 peer list (6 bytes per peer)
    ///
    /// # Errors
    /// - `TorrentError::TrackerFailure` - Length is not a multiple of 6 bytes
    pub(crate) fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<TrackerPeer>, TorrentError> {
        if !peer_bytes.len().is_multiple_of(6) {
            return Err(TorrentError::TrackerFailure {
                reason: "Invalid compact peer data length".to_string(),
            });
        }

        Ok(peer_bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                TrackerPeer::new(SocketAddr::new(IpAddr::V4(ip), port))
            })
            .collect())
    }

    /// Parse compact IPv6 peer list (18 bytes per peer)
    ///
    /// # Errors
    /// - `TorrentError::TrackerFailure` - Length is not a multiple of 18 bytes
    pub(crate) fn parse_compact_peers6(peer_bytes: &[u8]) -> Result<Vec<TrackerPeer>, TorrentError> {
        if !peer_bytes.len().is_multiple_of(18) {
            return Err(TorrentError::TrackerFailure {
                reason: "Invalid compact IPv6 peer data length".to_string(),
            });
        }

        Ok(peer_bytes
            .chunks_exact(18)
            .map(|chunk| {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&chunk[..16]);
                let port = u16::from_be_bytes([chunk[16], chunk[17]]);
                TrackerPeer::new(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            })
            .collect())
    }

    /// Parse the dictionary peer list form
    ///
    /// Entries with a hostname instead of an address, or a missing port,
    /// are skipped.
    pub(crate) fn parse_dict_peers(entries: &[bencode_rs::Value<'_>]) -> Vec<TrackerPeer> {
        entries
            .iter()
            .filter_map(|entry| {
                let bencode_rs::Value::Dictionary(dict) = entry else {
                    return None;
                };
                let Some(bencode_rs::Value::Bytes(ip)) = dict.get(b"ip".as_slice()) else {
                    return None;
                };
                let Some(bencode_rs::Value::Integer(port)) = dict.get(b"port".as_slice()) else {
                    return None;
                };

                let ip: IpAddr = std::str::from_utf8(ip).ok()?.parse().ok()?;
                let port = u16::try_from(*port).ok()?;
                let peer_id = match dict.get(b"peer id".as_slice()) {
                    Some(bencode_rs::Value::Bytes(id)) => PeerId::from_slice(id),
                    _ => None,
                };

                Some(TrackerPeer {
                    address: SocketAddr::new(ip, port),
                    peer_id,
                })
            })
            .collect()
    }

    /// Parse tracker response from bencode data
    pub(super) fn parse_announce_response(
        response_bytes: &[u8],
    ) -> Result<AnnounceResponse, TorrentError> {
        let parsed =
            bencode_rs::Value::parse(response_bytes).map_err(|e| TorrentError::TrackerFailure {
                reason: format!("Failed to parse tracker response: {e:?}"),
            })?;

        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(TorrentError::TrackerFailure {
                reason: "Invalid tracker response format".to_string(),
            });
        };

        if let Some(bencode_rs::Value::Bytes(failure_reason)) =
            dict.get(b"failure reason".as_slice())
        {
            return Err(TorrentError::TrackerFailure {
                reason: String::from_utf8_lossy(failure_reason).to_string(),
            });
        }

        let interval = match dict.get(b"interval".as_slice()) {
            Some(bencode_rs::Value::Integer(val)) if *val >= 0 => *val as u32,
            _ => {
                return Err(TorrentError::TrackerFailure {
                    reason: "Missing interval in tracker response".to_string(),
                });
            }
        };

        let mut peers = match dict.get(b"peers".as_slice()) {
            Some(bencode_rs::Value::Bytes(peer_data)) => Self::parse_compact_peers(peer_data)?,
            Some(bencode_rs::Value::List(entries)) => Self::parse_dict_peers(entries),
            _ => Vec::new(),
        };
        if let Some(bencode_rs::Value::Bytes(peer_data)) = dict.get(b"peers6".as_slice()) {
            peers.extend(Self::parse_compact_peers6(peer_data)?);
        }

        Ok(AnnounceResponse {
            interval,
            min_interval: optional_u32(dict, b"min interval"),
            complete: optional_u32(dict, b"complete").unwrap_or(0),
            incomplete: optional_u32(dict, b"incomplete").unwrap_or(0),
            peers,
        })
    }
}

fn optional_u32(dict: &BencodeDict<'_>, key: &[u8]) -> Option<u32> {
    match dict.get(key) {
        Some(bencode_rs::Value::Integer(val)) => u32::try_from(*val).ok(),
        _ => None,
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(&request)?;
        tracing::debug!(
            "Announcing to {} (event={:?}, left={})",
            self.announce_url,
            request.event,
            request.left
        );

        let response = self.client.get(url).send().await.map_err(|e| {
            tracing::warn!("HTTP request to {} failed: {}", self.announce_url, e);
            if e.is_timeout() {
                TorrentError::TrackerTimeout {
                    url: self.announce_url.clone(),
                }
            } else {
                TorrentError::TrackerConnectionFailed {
                    url: self.announce_url.clone(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                "Tracker {} returned error status: {}",
                self.announce_url,
                status
            );
            return Err(match status.as_u16() {
                500..=599 => TorrentError::TrackerServerError {
                    url: self.announce_url.clone(),
                    status: status.as_u16(),
                },
                _ => TorrentError::TrackerConnectionFailed {
                    url: self.announce_url.clone(),
                },
            });
        }

        let response_bytes = response.bytes().await.map_err(|e| {
            tracing::warn!(
                "Failed to read response body from {}: {}",
                self.announce_url,
                e
            );
            TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            }
        })?;

        let announce = Self::parse_announce_response(&response_bytes).inspect_err(|e| {
            tracing::warn!("Failed to parse response from {}: {}", self.announce_url, e);
        })?;

        tracing::debug!(
            "Tracker {} returned {} peers (interval {}s)",
            self.announce_url,
            announce.peers.len(),
            announce.interval
        );
        Ok(announce)
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}
