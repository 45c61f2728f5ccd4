//! Driftnet Core - BitTorrent piece exchange engine
//!
//! This crate provides the peer-wire building blocks of the Driftnet client:
//! the wire codec, the shared piece store that schedules requests across
//! connections, the per-connection session state machine, and the swarm
//! coordinator that owns connections and unchoke admission. Tracker, storage
//! and metainfo collaborators live alongside them behind narrow traits.

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::DriftnetConfig;
pub use storage::{FileStorage, PieceStorage, StorageError};
pub use torrent::{PieceStore, SwarmCoordinator, TorrentError};

/// Errors that can bubble up from any Driftnet subsystem.
///
/// High-level error type used by binaries that drive the engine.
#[derive(Debug, thiserror::Error)]
pub enum DriftnetError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriftnetError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            DriftnetError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::TrackerConnectionFailed { url } => {
                    format!("Could not connect to tracker: {url}")
                }
                TorrentError::TrackerFailure { reason } => {
                    format!("Tracker rejected the announce: {reason}")
                }
                _ => "Download error occurred".to_string(),
            },
            DriftnetError::Storage(_) => "Storage error occurred".to_string(),
            DriftnetError::Configuration { reason } => format!("Configuration error: {reason}"),
            DriftnetError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DriftnetError::Configuration { .. }
                | DriftnetError::Torrent(TorrentError::InvalidTorrentFile { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, DriftnetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_classification() {
        let config_error = DriftnetError::Configuration {
            reason: "port out of range".to_string(),
        };
        assert!(config_error.is_user_error());

        let torrent_error = DriftnetError::Torrent(TorrentError::InvalidTorrentFile {
            reason: "missing info".to_string(),
        });
        assert!(torrent_error.is_user_error());
        assert_eq!(
            torrent_error.user_message(),
            "Invalid torrent file: missing info"
        );

        let io_error = DriftnetError::Io(std::io::Error::other("disk"));
        assert!(!io_error.is_user_error());
    }
}
