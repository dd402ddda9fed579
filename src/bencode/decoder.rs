//! Recursive-descent bencode decoder over an in-memory byte cursor.
//!
//! Unlike a `Read`-based decoder, a cursor lets every error carry the byte
//! offset it was found at, which is what the original Python `Decoder`
//! class did by tracking a single integer read-position.
use super::{BencodeError, BencodeResult, BencodeValue};
use std::collections::BTreeMap;
use tracing::instrument;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn take(&mut self) -> BencodeResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn take_n(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(BencodeError::LengthExceedsInput);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_until(&mut self, delim: u8) -> BencodeResult<&'a [u8]> {
        let start = self.pos;
        loop {
            let b = self.take()?;
            if b == delim {
                return Ok(&self.buf[start..self.pos - 1]);
            }
        }
    }
}

/// Decodes a bencode string in the form `<len>:<bytes>`.
///
/// Rejects a length prefix with leading zeros other than a bare `0`.
fn decode_string<'a>(cur: &mut Cursor<'a>) -> BencodeResult<&'a [u8]> {
    let digits = cur.take_until(b':')?;
    if digits.is_empty() || (digits.len() > 1 && digits[0] == b'0') {
        return Err(BencodeError::InvalidStringLength);
    }
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidStringLength);
    }
    let len_str =
        std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidStringLength)?;
    let len: usize = len_str
        .parse()
        .map_err(|_| BencodeError::InvalidStringLength)?;
    cur.take_n(len)
}

/// Decodes a bencode integer in the form `i<signed-int>e`.
///
/// Rejects leading zeros (other than a bare `0`), `-0`, and `-` with no
/// digits following.
fn decode_integer(cur: &mut Cursor) -> BencodeResult<i64> {
    if cur.take()? != b'i' {
        return Err(BencodeError::InvalidInteger);
    }
    let digits = cur.take_until(b'e')?;
    let s = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;

    let (sign, unsigned) = match s.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, s),
    };
    if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BencodeError::InvalidInteger);
    }
    if unsigned.len() > 1 && unsigned.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }
    if sign == -1 && unsigned == "0" {
        return Err(BencodeError::InvalidInteger);
    }
    let magnitude: i64 = unsigned.parse().map_err(|_| BencodeError::InvalidInteger)?;
    Ok(sign * magnitude)
}

fn decode_list(cur: &mut Cursor) -> BencodeResult<Vec<BencodeValue>> {
    if cur.take()? != b'l' {
        return Err(BencodeError::UnexpectedByte(b'l'));
    }
    let mut items = Vec::new();
    loop {
        if cur.peek()? == b'e' {
            cur.take()?;
            return Ok(items);
        }
        items.push(decode_value(cur)?);
    }
}

fn decode_dict(cur: &mut Cursor) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
    if cur.take()? != b'd' {
        return Err(BencodeError::UnexpectedByte(b'd'));
    }
    let mut map = BTreeMap::new();
    loop {
        if cur.peek()? == b'e' {
            cur.take()?;
            return Ok(map);
        }
        // Dictionary keys are always byte strings, never nested values.
        let key = decode_string(cur)?.to_vec();
        let value = decode_value(cur)?;
        map.insert(key, value);
    }
}

fn decode_value(cur: &mut Cursor) -> BencodeResult<BencodeValue> {
    match cur.peek()? {
        b'0'..=b'9' => decode_string(cur).map(|s| BencodeValue::ByteStr(s.to_vec())),
        b'i' => decode_integer(cur).map(BencodeValue::Int),
        b'l' => decode_list(cur).map(BencodeValue::List),
        b'd' => decode_dict(cur).map(BencodeValue::Dict),
        other => Err(BencodeError::UnexpectedByte(other)),
    }
}

/// Decodes a single top-level bencode value from `data`.
///
/// Fails with [`BencodeError::TrailingBytes`] if anything follows the
/// value.
#[instrument(skip(data), level = "trace")]
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    let mut cur = Cursor::new(data);
    let value = decode_value(&mut cur)?;
    if cur.pos != data.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn decodes_string() {
        assert_eq!(
            decode(b"4:spam").unwrap(),
            BencodeValue::ByteStr(b"spam".to_vec())
        );
    }

    #[test]
    fn decodes_integer() {
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Int(42));
        assert_eq!(decode(b"i-42e").unwrap(), BencodeValue::Int(-42));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Int(0));
    }

    #[test]
    fn rejects_leading_zero_integer() {
        assert!(decode(b"i042e").is_err());
        assert!(decode(b"i-0e").is_err());
    }

    #[test]
    fn rejects_leading_zero_length() {
        assert!(decode(b"04:spam").is_err());
    }

    #[test]
    fn decodes_list() {
        assert_eq!(
            decode(b"l4:spami42ee").unwrap(),
            BencodeValue::List(vec![
                BencodeValue::ByteStr(b"spam".to_vec()),
                BencodeValue::Int(42)
            ])
        );
    }

    #[test]
    fn decodes_dict_sample() {
        let mut expected = BTreeMap::new();
        expected.insert(b"bar".to_vec(), BencodeValue::ByteStr(b"spam".to_vec()));
        expected.insert(b"foo".to_vec(), BencodeValue::Int(42));
        assert_eq!(
            decode(b"d3:bar4:spam3:fooi42ee").unwrap(),
            BencodeValue::Dict(expected)
        );
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert!(decode(b"i1ee").is_err());
    }

    #[test]
    fn rejects_truncated_container() {
        assert!(decode(b"d3:foo").is_err());
        assert!(decode(b"l4:spam").is_err());
    }

    #[test]
    fn rejects_length_exceeding_input() {
        assert!(decode(b"10:spam").is_err());
    }
}
