//! Bencode codec: the self-describing wire format used by metainfo files
//! and tracker responses.
//!
//! Grammar: `i<signed-int>e`, `<len>:<raw-bytes>`, `l<value>*e`,
//! `d(<bytestring><value>)*e`. Dictionary keys are always byte strings.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// A decoded bencode value.
///
/// Dict keys are raw byte sequences, not text, and are kept in a
/// `BTreeMap` so that iteration order is always lexicographic — this is
/// what makes `encode` canonical without a separate sort step.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    ByteStr(Vec<u8>),
    Int(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::ByteStr(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("trailing bytes follow the top-level value")]
    TrailingBytes,

    #[error("invalid integer literal")]
    InvalidInteger,

    #[error("invalid string length prefix")]
    InvalidStringLength,

    #[error("length prefix exceeds remaining input")]
    LengthExceedsInput,

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected leading byte: {0:#04x}")]
    UnexpectedByte(u8),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
