//! Core types for BitTorrent tracker communication

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::torrent::{InfoHash, PeerId, TorrentError};

/// Tracker announce request.
///
/// Contains client statistics and torrent information sent to tracker
/// during announce operations to report progress and request peer list.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// Unique identifier for the torrent being announced
    pub info_hash: InfoHash,
    /// Client's unique 20-byte identifier
    pub peer_id: PeerId,
    /// TCP port client is listening on for peer connections
    pub port: u16,
    /// Total bytes uploaded to other peers
    pub uploaded: u64,
    /// Total bytes downloaded from other peers
    pub downloaded: u64,
    /// Bytes remaining to download (0 for seeders)
    pub left: u64,
    /// State change being reported; `None` for periodic announces
    pub event: Option<AnnounceEvent>,
}

/// BitTorrent announce events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Client started downloading this torrent
    Started,
    /// Client stopped downloading this torrent
    Stopped,
    /// Client completed downloading this torrent
    Completed,
}

impl AnnounceEvent {
    /// Tracker protocol string for this event.
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// A peer returned by the tracker.
///
/// Compact responses carry no peer id, so the handshake can only check
/// it when the dictionary form supplied one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerPeer {
    pub address: SocketAddr,
    pub peer_id: Option<PeerId>,
}

impl TrackerPeer {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            peer_id: None,
        }
    }
}

impl fmt::Display for TrackerPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Tracker announce response.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until next announce request should be sent
    pub interval: u32,
    /// Minimum allowed interval between announces
    pub min_interval: Option<u32>,
    /// Number of seeders in the swarm
    pub complete: u32,
    /// Number of leechers in the swarm
    pub incomplete: u32,
    /// Peers to connect to
    pub peers: Vec<TrackerPeer>,
}

/// Abstract tracker communication interface.
///
/// The swarm coordinator only ever announces; implementations hide the
/// transport and failover between trackers.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announces client presence to tracker and retrieves peer list.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - If network or HTTP error
    /// - `TorrentError::TrackerTimeout` - If the tracker did not answer in time
    /// - `TorrentError::TrackerServerError` - If the tracker answered with a 5xx status
    /// - `TorrentError::TrackerFailure` - If the tracker rejected the announce
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError>;

    /// Returns tracker URL for debugging and logging purposes.
    fn tracker_url(&self) -> &str;
}
