//! Centralized configuration for Driftnet.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all Driftnet components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct DriftnetConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

/// Piece exchange configuration.
///
/// Controls request scheduling and stall detection for piece downloads.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// BitTorrent client identifier prefix for generated peer ids
    pub client_id: &'static str,
    /// Protocol string sent in the handshake
    pub protocol_name: &'static str,
    /// Maximum time a piece request may stay unanswered
    pub piece_timeout: Duration,
    /// Capacity of each connection's request queue
    pub request_queue_size: usize,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: "-DN0001-",
            protocol_name: "BitTorrent protocol",
            piece_timeout: Duration::from_secs(60),
            request_queue_size: 10,
        }
    }
}

/// Network communication and tracker configuration.
///
/// Controls tracker timeouts, peer connection limits, unchoke slots
/// and per-connection I/O deadlines.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// Minimum announce interval
    pub min_announce_interval: Duration,
    /// Default announce interval when the tracker does not supply one
    pub default_announce_interval: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// TCP port to accept inbound peer connections on
    pub listen_port: u16,
    /// Maximum concurrent peer connections
    pub max_peer_connections: usize,
    /// Number of peers we upload to at once
    pub max_unchoked_peers: usize,
    /// Outbound dial timeout
    pub connect_timeout: Duration,
    /// Deadline for a single socket read
    pub read_timeout: Duration,
    /// Idle time after which the send loop writes a keep-alive
    pub keepalive_interval: Duration,
    /// Period at which the send loop folds pending HAVE notifications
    pub have_flush_interval: Duration,
    /// Capacity of the per-connection outbound message channel
    pub outbound_queue_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tracker_timeout: Duration::from_secs(30),
            min_announce_interval: Duration::from_secs(60),
            default_announce_interval: Duration::from_secs(1800), // 30 minutes
            user_agent: "driftnet/0.1.0",
            listen_port: 6881,
            max_peer_connections: 10,
            max_unchoked_peers: 10,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(90),
            have_flush_interval: Duration::from_secs(2),
            outbound_queue_capacity: 64,
        }
    }
}

/// File storage configuration.
///
/// Controls naming of the bitfield sidecar next to the data file.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Suffix appended to the hidden bitfield sidecar file
    pub metadata_suffix: &'static str,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            metadata_suffix: ".meta",
        }
    }
}

impl DriftnetConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("DRIFTNET_TRACKER_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.network.tracker_timeout = Duration::from_secs(seconds);
        }

        if let Ok(max_peers) = std::env::var("DRIFTNET_MAX_PEERS")
            && let Ok(count) = max_peers.parse::<usize>()
        {
            config.network.max_peer_connections = count;
        }

        if let Ok(max_unchoked) = std::env::var("DRIFTNET_MAX_UNCHOKED")
            && let Ok(count) = max_unchoked.parse::<usize>()
        {
            config.network.max_unchoked_peers = count;
        }

        if let Ok(port) = std::env::var("DRIFTNET_LISTEN_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            config.network.listen_port = port;
        }

        if let Ok(queue_size) = std::env::var("DRIFTNET_REQUEST_QUEUE_SIZE")
            && let Ok(size) = queue_size.parse::<usize>()
            && size > 0
        {
            config.torrent.request_queue_size = size;
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short deadlines keep stalled-peer tests fast and an ephemeral
    /// listen port avoids collisions between parallel tests.
    pub fn for_testing() -> Self {
        Self {
            torrent: TorrentConfig {
                piece_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            network: NetworkConfig {
                tracker_timeout: Duration::from_secs(2),
                min_announce_interval: Duration::from_millis(50),
                listen_port: 0,
                connect_timeout: Duration::from_secs(1),
                read_timeout: Duration::from_secs(5),
                keepalive_interval: Duration::from_secs(1),
                have_flush_interval: Duration::from_millis(50),
                ..Default::default()
            },
            storage: StorageConfig::default(),
        }
    }
}
