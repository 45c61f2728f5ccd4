//! Single-file `.torrent` metainfo parsing.
//!
//! Metadata extraction using bencode-rs, with the info hash computed over
//! the raw bytes of the info dictionary.

pub mod bencode;
pub mod parser;
pub mod types;

// Re-export public API
pub use parser::BencodeTorrentParser;
pub use types::{TorrentMetadata, TorrentParser};
