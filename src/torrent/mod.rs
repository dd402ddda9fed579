//! Metainfo view: projects a decoded bencode dictionary into the typed
//! fields a downloader actually needs — name, piece length, piece
//! digests, file list, announce URLs, info-hash.
use thiserror::Error;

pub mod info_hash;
pub mod metainfo;

pub use metainfo::{FileEntry, Metainfo};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("malformed metainfo: missing or invalid field `{0}`")]
    MissingField(&'static str),

    #[error("malformed metainfo: {0}")]
    InvalidFormat(String),

    #[error("pieces string length is not a multiple of 20 bytes")]
    InvalidPiecesHashLength,

    #[error("piece_digests length does not match ceil(total_length / piece_length)")]
    PieceCountMismatch,

    #[error("unsafe file path `{0}`: absolute or contains `..`")]
    UnsafePath(String),
}

/// Result type for torrent operations.
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
