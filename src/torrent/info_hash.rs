//! Computes the info-hash: the SHA-1 digest of the canonical bencoding of
//! the `info` sub-dictionary.
//!
//! This must re-encode the already-decoded `info` dict rather than slicing
//! the original input bytes — slicing is brittle against non-canonical
//! input and produces a hash that can disagree with peers who re-encode.
use crate::bencode::{encoder, BencodeResult, BencodeValue};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

pub fn calculate_info_hash(info_dict: &BTreeMap<Vec<u8>, BencodeValue>) -> BencodeResult<[u8; 20]> {
    let canonical = encoder::encode_to_vec(&BencodeValue::Dict(info_dict.clone()))?;
    let digest = Sha1::digest(&canonical);
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&digest);
    Ok(info_hash)
}
