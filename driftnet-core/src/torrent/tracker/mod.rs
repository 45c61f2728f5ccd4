//! Tracker communication for peer discovery.
//!
//! HTTP announces with compact and dictionary peer lists, plus failover
//! across the announce URLs of a torrent.

pub mod client;
pub mod manager;
pub mod types;

pub use client::HttpTrackerClient;
pub use manager::TrackerManager;
pub use types::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient, TrackerPeer};
