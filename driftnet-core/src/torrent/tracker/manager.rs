//! Tracker failover across every announce URL of a torrent

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{AnnounceRequest, AnnounceResponse, HttpTrackerClient, TrackerClient};
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// Announces through a list of trackers, failing over in order.
///
/// The tracker that answered last is tried first on the next announce.
pub struct TrackerManager {
    clients: Vec<Arc<dyn TrackerClient>>,
    preferred: AtomicUsize,
}

impl TrackerManager {
    /// Builds HTTP clients for every usable announce URL.
    ///
    /// URLs with other schemes (udp, wss) or that fail to parse are
    /// skipped with a warning.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - If no URL is usable
    pub fn new(announce_urls: &[String], config: &NetworkConfig) -> Result<Self, TorrentError> {
        let mut clients: Vec<Arc<dyn TrackerClient>> = Vec::new();
        for url in announce_urls {
            match HttpTrackerClient::new(url.clone(), config) {
                Ok(client) => clients.push(Arc::new(client)),
                Err(e) => tracing::warn!("Skipping tracker {}: {}", url, e),
            }
        }

        if clients.is_empty() {
            return Err(TorrentError::TrackerConnectionFailed {
                url: "No usable tracker URLs".to_string(),
            });
        }
        Ok(Self::from_clients(clients))
    }

    /// Wraps already constructed clients, tried in the given order.
    pub fn from_clients(clients: Vec<Arc<dyn TrackerClient>>) -> Self {
        Self {
            clients,
            preferred: AtomicUsize::new(0),
        }
    }

    /// Number of trackers available for failover.
    pub fn tracker_count(&self) -> usize {
        self.clients.len()
    }
}

#[async_trait]
impl TrackerClient for TrackerManager {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        if self.clients.is_empty() {
            return Err(TorrentError::TrackerConnectionFailed {
                url: "No tracker URLs provided".to_string(),
            });
        }

        let start = self.preferred.load(Ordering::Relaxed) % self.clients.len();
        let mut last_error = None;

        for offset in 0..self.clients.len() {
            let slot = (start + offset) % self.clients.len();
            let client = &self.clients[slot];

            match client.announce(request.clone()).await {
                Ok(response) => {
                    tracing::info!(
                        "Tracker {} responded with {} peers, complete: {}, incomplete: {}",
                        client.tracker_url(),
                        response.peers.len(),
                        response.complete,
                        response.incomplete
                    );
                    self.preferred.store(slot, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!("Tracker {} failed: {}", client.tracker_url(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TorrentError::TrackerConnectionFailed {
            url: "All trackers failed".to_string(),
        }))
    }

    fn tracker_url(&self) -> &str {
        let slot = self.preferred.load(Ordering::Relaxed);
        self.clients
            .get(slot)
            .or_else(|| self.clients.first())
            .map(|client| client.tracker_url())
            .unwrap_or("")
    }
}
