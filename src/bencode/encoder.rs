//! Canonical bencode encoder.
//!
//! Canonicalization (dict keys emitted in lexicographic byte order) is
//! required because the info-hash is a digest of the re-encoded `info`
//! sub-dictionary; a non-canonical encoder would produce a hash that
//! doesn't match what peers expect. `BencodeValue::Dict` is a `BTreeMap`,
//! so iteration is already in key order — the encoder just has to avoid
//! undoing that.
use super::{BencodeResult, BencodeValue};
use std::io::Write;
use tracing::instrument;

fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

fn encode_dict<W: Write>(
    writer: &mut W,
    dict: &std::collections::BTreeMap<Vec<u8>, BencodeValue>,
) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::ByteStr(s) => encode_string(writer, s),
        BencodeValue::Int(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

#[instrument(skip(writer), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Convenience wrapper for callers that just want owned bytes — used by
/// the info-hash calculation and by tests.
pub fn encode_to_vec(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode(&mut buf, value)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::super::decoder::decode;
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn encodes_canonical_sample() {
        let mut dict = BTreeMap::new();
        dict.insert(b"bar".to_vec(), BencodeValue::ByteStr(b"spam".to_vec()));
        dict.insert(b"foo".to_vec(), BencodeValue::Int(42));
        let value = BencodeValue::Dict(dict);
        assert_eq!(encode_to_vec(&value).unwrap(), b"d3:bar4:spam3:fooi42ee");
    }

    #[test]
    fn key_order_is_independent_of_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert(b"z".to_vec(), BencodeValue::Int(1));
        a.insert(b"a".to_vec(), BencodeValue::Int(2));
        let mut b = BTreeMap::new();
        b.insert(b"a".to_vec(), BencodeValue::Int(2));
        b.insert(b"z".to_vec(), BencodeValue::Int(1));
        assert_eq!(
            encode_to_vec(&BencodeValue::Dict(a)).unwrap(),
            encode_to_vec(&BencodeValue::Dict(b)).unwrap()
        );
    }

    #[test]
    fn round_trips_through_decode() {
        let mut dict = BTreeMap::new();
        dict.insert(
            b"list".to_vec(),
            BencodeValue::List(vec![BencodeValue::Int(1), BencodeValue::Int(-2)]),
        );
        dict.insert(b"name".to_vec(), BencodeValue::ByteStr(b"x".to_vec()));
        let value = BencodeValue::Dict(dict);
        let bytes = encode_to_vec(&value).unwrap();
        assert_eq!(decode(&bytes).unwrap(), value);
    }
}
