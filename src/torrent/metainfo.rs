//! Parses a decoded bencode dictionary into a [`Metainfo`] — the typed
//! projection the rest of the engine works with.
use super::{TorrentError, TorrentResult};
use crate::bencode::{decoder, BencodeValue};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};
use tracing::instrument;

/// One entry in a (possibly multi-file) torrent's file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub relative_path: PathBuf,
    pub length: u64,
    /// Byte offset of this file within the logical concatenated stream.
    pub offset: u64,
}

/// Immutable view over a parsed `.torrent` file (§3 "Metainfo").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub name: String,
    pub piece_length: u64,
    pub total_length: u64,
    pub piece_digests: Vec<[u8; 20]>,
    pub info_hash: [u8; 20],
    pub files: Vec<FileEntry>,
    pub announce_tiers: Vec<Vec<String>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,
    pub creation_date: Option<std::time::SystemTime>,
}

impl Metainfo {
    /// Parses raw `.torrent` bytes end to end: bencode decode, field
    /// extraction, info-hash computation, path sanitization.
    #[instrument(skip(data), level = "debug")]
    pub fn from_bytes(data: &[u8]) -> TorrentResult<Metainfo> {
        let value = decoder::decode(data)?;
        Self::from_value(value)
    }

    pub fn from_value(value: BencodeValue) -> TorrentResult<Metainfo> {
        let mut top = match value {
            BencodeValue::Dict(d) => d,
            _ => return Err(TorrentError::InvalidFormat("root is not a dictionary".into())),
        };

        let info_value = top
            .remove(&b"info"[..].to_vec())
            .ok_or(TorrentError::MissingField("info"))?;
        let info_dict = match &info_value {
            BencodeValue::Dict(d) => d.clone(),
            _ => return Err(TorrentError::InvalidFormat("info is not a dictionary".into())),
        };
        let info_hash = super::info_hash::calculate_info_hash(&info_dict)?;

        let (name, piece_length, piece_digests, files, total_length) =
            parse_info_dict(&info_dict)?;

        let announce_tiers = parse_announce_tiers(&mut top)?;

        let creation_date = match top.remove(&b"creation date"[..].to_vec()) {
            Some(BencodeValue::Int(secs)) if secs >= 0 => {
                Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
            }
            _ => None,
        };
        let comment = take_optional_string(&mut top, b"comment");
        let created_by = take_optional_string(&mut top, b"created by");
        let encoding = take_optional_string(&mut top, b"encoding");

        Ok(Metainfo {
            name,
            piece_length,
            total_length,
            piece_digests,
            info_hash,
            files,
            announce_tiers,
            comment,
            created_by,
            encoding,
            creation_date,
        })
    }

    /// Number of pieces, derived from `piece_digests`.
    pub fn num_pieces(&self) -> usize {
        self.piece_digests.len()
    }

    /// Size of piece `index`: `piece_length` for all but the last piece.
    pub fn piece_size(&self, index: usize) -> u64 {
        if index + 1 < self.num_pieces() {
            self.piece_length
        } else {
            self.total_length - (self.num_pieces() as u64 - 1) * self.piece_length
        }
    }
}

fn take_optional_string(dict: &mut BTreeMap<Vec<u8>, BencodeValue>, key: &[u8]) -> Option<String> {
    match dict.remove(&key.to_vec()) {
        Some(BencodeValue::ByteStr(s)) => String::from_utf8(s).ok(),
        _ => None,
    }
}

fn require_string(
    dict: &BTreeMap<Vec<u8>, BencodeValue>,
    key: &'static str,
) -> TorrentResult<String> {
    match dict.get(key.as_bytes()) {
        Some(BencodeValue::ByteStr(s)) => {
            String::from_utf8(s.clone()).map_err(|_| TorrentError::MissingField(key))
        }
        _ => Err(TorrentError::MissingField(key)),
    }
}

fn parse_pieces(bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    Ok(bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut digest = [0u8; 20];
            digest.copy_from_slice(chunk);
            digest
        })
        .collect())
}

/// Sanitizes a file path: rejects absolute prefixes and `..` segments,
/// and empty paths (§6 "On-disk layout").
fn sanitize_relative_path(parts: &[String]) -> TorrentResult<PathBuf> {
    if parts.is_empty() {
        return Err(TorrentError::UnsafePath("empty path".into()));
    }
    let mut path = PathBuf::new();
    for part in parts {
        if part.is_empty() || part == ".." || part.starts_with('/') {
            return Err(TorrentError::UnsafePath(parts.join("/")));
        }
        path.push(part);
    }
    Ok(path)
}

type InfoFields = (String, u64, Vec<[u8; 20]>, Vec<FileEntry>, u64);

fn parse_info_dict(dict: &BTreeMap<Vec<u8>, BencodeValue>) -> TorrentResult<InfoFields> {
    let name = require_string(dict, "name")?;

    let piece_length = match dict.get(&b"piece length"[..]) {
        Some(BencodeValue::Int(i)) if *i > 0 => *i as u64,
        _ => return Err(TorrentError::MissingField("piece length")),
    };

    let pieces_bytes = match dict.get(&b"pieces"[..]) {
        Some(BencodeValue::ByteStr(s)) => s.clone(),
        _ => return Err(TorrentError::MissingField("pieces")),
    };
    let piece_digests = parse_pieces(&pieces_bytes)?;

    let (files, total_length) = if let Some(BencodeValue::List(entries)) = dict.get(&b"files"[..])
    {
        let mut files = Vec::with_capacity(entries.len());
        let mut offset = 0u64;
        for entry in entries {
            let entry_dict = match entry {
                BencodeValue::Dict(d) => d,
                _ => return Err(TorrentError::InvalidFormat("file entry is not a dict".into())),
            };
            let length = match entry_dict.get(&b"length"[..]) {
                Some(BencodeValue::Int(i)) if *i >= 0 => *i as u64,
                _ => return Err(TorrentError::MissingField("length")),
            };
            let path_parts = match entry_dict.get(&b"path"[..]) {
                Some(BencodeValue::List(parts)) => parts
                    .iter()
                    .map(|p| match p {
                        BencodeValue::ByteStr(s) => String::from_utf8(s.clone())
                            .map_err(|_| TorrentError::InvalidFormat("non-UTF8 path".into())),
                        _ => Err(TorrentError::InvalidFormat("path component not a string".into())),
                    })
                    .collect::<TorrentResult<Vec<_>>>()?,
                _ => return Err(TorrentError::MissingField("path")),
            };
            let relative_path = sanitize_relative_path(&path_parts)?;
            files.push(FileEntry {
                relative_path,
                length,
                offset,
            });
            offset += length;
        }
        (files, offset)
    } else {
        let length = match dict.get(&b"length"[..]) {
            Some(BencodeValue::Int(i)) if *i >= 0 => *i as u64,
            _ => return Err(TorrentError::MissingField("length")),
        };
        (
            vec![FileEntry {
                relative_path: PathBuf::from(&name),
                length,
                offset: 0,
            }],
            length,
        )
    };

    let expected_pieces = total_length.div_ceil(piece_length).max(1) as usize;
    if piece_digests.len() != expected_pieces {
        return Err(TorrentError::PieceCountMismatch);
    }

    Ok((name, piece_length, piece_digests, files, total_length))
}

fn parse_announce_tiers(
    top: &mut BTreeMap<Vec<u8>, BencodeValue>,
) -> TorrentResult<Vec<Vec<String>>> {
    if let Some(BencodeValue::List(tiers)) = top.remove(&b"announce-list"[..].to_vec()) {
        let mut result = Vec::with_capacity(tiers.len());
        for tier in tiers {
            let tier_list = match tier {
                BencodeValue::List(urls) => urls,
                _ => return Err(TorrentError::InvalidFormat("announce-list tier not a list".into())),
            };
            let mut urls = Vec::with_capacity(tier_list.len());
            for url in tier_list {
                match url {
                    BencodeValue::ByteStr(s) => urls.push(
                        String::from_utf8(s).map_err(|_| {
                            TorrentError::InvalidFormat("non-UTF8 announce URL".into())
                        })?,
                    ),
                    _ => {
                        return Err(TorrentError::InvalidFormat(
                            "announce-list entry not a string".into(),
                        ))
                    }
                }
            }
            if !urls.is_empty() {
                result.push(urls);
            }
        }
        if !result.is_empty() {
            return Ok(result);
        }
    }

    let announce = require_string(top, "announce")?;
    Ok(vec![vec![announce]])
}
