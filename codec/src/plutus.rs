//! Plutus structured-data model and its CBOR wire form.
//!
//! The on-chain script consumes the exact byte form produced here, so the
//! encoder is deterministic: constructor tags use the compact 121/1280 ranges,
//! non-empty arrays are indefinite-length, byte strings longer than 64 bytes
//! are chunked into indefinite-length segments. `decode(encode(d)) == d` for
//! every value the contract can produce.

use crate::error::CodecError;

/// Maximum definite byte-string chunk the ledger accepts inside plutus data.
pub const MAX_BYTES_CHUNK: usize = 64;

/// A plutus data value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlutusData {
    /// Constructor application: alternative index plus ordered fields.
    Constr { tag: u64, fields: Vec<PlutusData> },
    /// Arbitrary byte string.
    Bytes(Vec<u8>),
    /// Unsigned integer (the contract never uses negatives or big ints).
    Int(u64),
    /// Homogeneous or heterogeneous list.
    List(Vec<PlutusData>),
    /// Association list, order-preserving.
    Map(Vec<(PlutusData, PlutusData)>),
}

impl PlutusData {
    /// Constructor with no fields (enum-like alternatives).
    pub fn unit_constr(tag: u64) -> Self {
        PlutusData::Constr {
            tag,
            fields: Vec::new(),
        }
    }

    /// UTF-8 string as plutus bytes.
    pub fn from_str_bytes(s: &str) -> Self {
        PlutusData::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_constr(&self) -> Result<(u64, &[PlutusData]), CodecError> {
        match self {
            PlutusData::Constr { tag, fields } => Ok((*tag, fields)),
            other => Err(CodecError::DatumMismatch(format!(
                "expected constructor, found {}",
                other.kind()
            ))),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], CodecError> {
        match self {
            PlutusData::Bytes(b) => Ok(b),
            other => Err(CodecError::DatumMismatch(format!(
                "expected bytes, found {}",
                other.kind()
            ))),
        }
    }

    pub fn as_int(&self) -> Result<u64, CodecError> {
        match self {
            PlutusData::Int(i) => Ok(*i),
            other => Err(CodecError::DatumMismatch(format!(
                "expected integer, found {}",
                other.kind()
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            PlutusData::Constr { .. } => "constructor",
            PlutusData::Bytes(_) => "bytes",
            PlutusData::Int(_) => "integer",
            PlutusData::List(_) => "list",
            PlutusData::Map(_) => "map",
        }
    }

    /// Encode to the canonical CBOR byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        encode_into(self, &mut out);
        out
    }

    /// Decode a single plutus data value, requiring the full input is used.
    pub fn decode(bytes: &[u8]) -> Result<PlutusData, CodecError> {
        let mut cursor = Cursor::new(bytes);
        let value = decode_value(&mut cursor)?;
        if cursor.pos != bytes.len() {
            return Err(CodecError::DatumMismatch(format!(
                "{} trailing bytes after datum",
                bytes.len() - cursor.pos
            )));
        }
        Ok(value)
    }

    /// Decode from a hex string (the form chain indexers hand back).
    pub fn decode_hex(hex_str: &str) -> Result<PlutusData, CodecError> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| CodecError::invalid_hex("inline_datum", e.to_string()))?;
        Self::decode(&bytes)
    }
}

// --- encoding -------------------------------------------------------------

fn encode_into(value: &PlutusData, out: &mut Vec<u8>) {
    match value {
        PlutusData::Int(i) => write_head(out, 0, *i),
        PlutusData::Bytes(b) => encode_bytes(b, out),
        PlutusData::List(items) => encode_array(items, out),
        PlutusData::Map(pairs) => {
            write_head(out, 5, pairs.len() as u64);
            for (k, v) in pairs {
                encode_into(k, out);
                encode_into(v, out);
            }
        }
        PlutusData::Constr { tag, fields } => {
            if *tag <= 6 {
                write_head(out, 6, 121 + tag);
            } else if *tag <= 127 {
                write_head(out, 6, 1280 + (tag - 7));
            } else {
                // general constructor wrapper
                write_head(out, 6, 102);
                out.push(0x9f);
                write_head(out, 0, *tag);
                encode_array(fields, out);
                out.push(0xff);
                return;
            }
            encode_array(fields, out);
        }
    }
}

fn encode_array(items: &[PlutusData], out: &mut Vec<u8>) {
    if items.is_empty() {
        out.push(0x80);
        return;
    }
    out.push(0x9f);
    for item in items {
        encode_into(item, out);
    }
    out.push(0xff);
}

fn encode_bytes(b: &[u8], out: &mut Vec<u8>) {
    if b.len() <= MAX_BYTES_CHUNK {
        write_head(out, 2, b.len() as u64);
        out.extend_from_slice(b);
        return;
    }
    out.push(0x5f);
    for chunk in b.chunks(MAX_BYTES_CHUNK) {
        write_head(out, 2, chunk.len() as u64);
        out.extend_from_slice(chunk);
    }
    out.push(0xff);
}

/// Write a CBOR head with the minimal-length argument encoding.
pub(crate) fn write_head(out: &mut Vec<u8>, major: u8, arg: u64) {
    let mt = major << 5;
    if arg < 24 {
        out.push(mt | arg as u8);
    } else if arg <= u8::MAX as u64 {
        out.push(mt | 24);
        out.push(arg as u8);
    } else if arg <= u16::MAX as u64 {
        out.push(mt | 25);
        out.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= u32::MAX as u64 {
        out.push(mt | 26);
        out.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        out.push(mt | 27);
        out.extend_from_slice(&arg.to_be_bytes());
    }
}

// --- decoding -------------------------------------------------------------

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn peek(&self) -> Result<u8, CodecError> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or(CodecError::UnexpectedEof(self.pos))
    }

    fn take(&mut self) -> Result<u8, CodecError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + len > self.bytes.len() {
            return Err(CodecError::UnexpectedEof(self.bytes.len()));
        }
        let s = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }

    fn read_arg(&mut self, info: u8) -> Result<u64, CodecError> {
        match info {
            0..=23 => Ok(info as u64),
            24 => Ok(self.take()? as u64),
            25 => {
                let s = self.take_slice(2)?;
                Ok(u16::from_be_bytes([s[0], s[1]]) as u64)
            }
            26 => {
                let s = self.take_slice(4)?;
                Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]) as u64)
            }
            27 => {
                let s = self.take_slice(8)?;
                Ok(u64::from_be_bytes([
                    s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7],
                ]))
            }
            _ => Err(CodecError::UnsupportedItem {
                major: 0xff,
                offset: self.pos,
            }),
        }
    }
}

fn decode_value(cur: &mut Cursor) -> Result<PlutusData, CodecError> {
    let offset = cur.pos;
    let head = cur.take()?;
    let major = head >> 5;
    let info = head & 0x1f;

    match major {
        0 => Ok(PlutusData::Int(cur.read_arg(info)?)),
        2 => decode_bytes(cur, info),
        4 => Ok(PlutusData::List(decode_array(cur, info)?)),
        5 => {
            let len = cur.read_arg(info)?;
            let mut pairs = Vec::with_capacity(len as usize);
            for _ in 0..len {
                let k = decode_value(cur)?;
                let v = decode_value(cur)?;
                pairs.push((k, v));
            }
            Ok(PlutusData::Map(pairs))
        }
        6 => {
            let tag = cur.read_arg(info)?;
            decode_tagged(cur, tag)
        }
        _ => Err(CodecError::UnsupportedItem { major, offset }),
    }
}

fn decode_bytes(cur: &mut Cursor, info: u8) -> Result<PlutusData, CodecError> {
    if info == 31 {
        // indefinite-length: definite chunks until break
        let mut buf = Vec::new();
        loop {
            if cur.peek()? == 0xff {
                cur.take()?;
                break;
            }
            let head = cur.take()?;
            if head >> 5 != 2 {
                return Err(CodecError::UnsupportedItem {
                    major: head >> 5,
                    offset: cur.pos - 1,
                });
            }
            let len = cur.read_arg(head & 0x1f)? as usize;
            buf.extend_from_slice(cur.take_slice(len)?);
        }
        return Ok(PlutusData::Bytes(buf));
    }
    let len = cur.read_arg(info)? as usize;
    Ok(PlutusData::Bytes(cur.take_slice(len)?.to_vec()))
}

fn decode_array(cur: &mut Cursor, info: u8) -> Result<Vec<PlutusData>, CodecError> {
    if info == 31 {
        let mut items = Vec::new();
        loop {
            if cur.peek()? == 0xff {
                cur.take()?;
                return Ok(items);
            }
            items.push(decode_value(cur)?);
        }
    }
    let len = cur.read_arg(info)? as usize;
    let mut items = Vec::with_capacity(len);
    for _ in 0..len {
        items.push(decode_value(cur)?);
    }
    Ok(items)
}

fn decode_tagged(cur: &mut Cursor, tag: u64) -> Result<PlutusData, CodecError> {
    let constr_tag = match tag {
        121..=127 => tag - 121,
        1280..=1400 => tag - 1280 + 7,
        102 => {
            // general wrapper: array of [index, fields]
            let head = cur.take()?;
            if head >> 5 != 4 {
                return Err(CodecError::InvalidConstructorTag(tag));
            }
            let items = decode_array(cur, head & 0x1f)?;
            if items.len() != 2 {
                return Err(CodecError::InvalidConstructorTag(tag));
            }
            let index = items[0].as_int()?;
            let fields = match &items[1] {
                PlutusData::List(f) => f.clone(),
                _ => return Err(CodecError::InvalidConstructorTag(tag)),
            };
            return Ok(PlutusData::Constr { tag: index, fields });
        }
        other => return Err(CodecError::InvalidConstructorTag(other)),
    };
    let head = cur.take()?;
    if head >> 5 != 4 {
        return Err(CodecError::UnsupportedItem {
            major: head >> 5,
            offset: cur.pos - 1,
        });
    }
    let fields = decode_array(cur, head & 0x1f)?;
    Ok(PlutusData::Constr {
        tag: constr_tag,
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(d: PlutusData) {
        let encoded = d.encode();
        let decoded = PlutusData::decode(&encoded).expect("decode");
        assert_eq!(decoded, d);
    }

    #[test]
    fn test_int_roundtrip() {
        for i in [0u64, 23, 24, 255, 256, 65535, 65536, u32::MAX as u64, u64::MAX] {
            roundtrip(PlutusData::Int(i));
        }
    }

    #[test]
    fn test_small_constr_uses_compact_tag() {
        let d = PlutusData::unit_constr(0);
        assert_eq!(d.encode(), vec![0xd8, 0x79, 0x80]);
        let d = PlutusData::unit_constr(3);
        assert_eq!(d.encode(), vec![0xd8, 0x7c, 0x80]);
    }

    #[test]
    fn test_high_constr_tag_range() {
        roundtrip(PlutusData::unit_constr(7));
        roundtrip(PlutusData::unit_constr(127));
        roundtrip(PlutusData::Constr {
            tag: 500,
            fields: vec![PlutusData::Int(1)],
        });
    }

    #[test]
    fn test_long_bytes_are_chunked() {
        let payload = vec![0xabu8; 150];
        let d = PlutusData::Bytes(payload.clone());
        let encoded = d.encode();
        assert_eq!(encoded[0], 0x5f);
        assert_eq!(*encoded.last().unwrap(), 0xff);
        roundtrip(d);
    }

    #[test]
    fn test_nonempty_list_is_indefinite() {
        let d = PlutusData::List(vec![PlutusData::Int(1), PlutusData::Int(2)]);
        let encoded = d.encode();
        assert_eq!(encoded[0], 0x9f);
        roundtrip(d);
    }

    #[test]
    fn test_empty_list_is_definite() {
        assert_eq!(PlutusData::List(vec![]).encode(), vec![0x80]);
    }

    #[test]
    fn test_nested_constr_roundtrip() {
        let d = PlutusData::Constr {
            tag: 0,
            fields: vec![
                PlutusData::Bytes(vec![1, 2, 3]),
                PlutusData::Constr {
                    tag: 1,
                    fields: vec![PlutusData::Int(42)],
                },
                PlutusData::Map(vec![(
                    PlutusData::from_str_bytes("k"),
                    PlutusData::Int(7),
                )]),
            ],
        };
        roundtrip(d);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut encoded = PlutusData::Int(1).encode();
        encoded.push(0x00);
        assert!(PlutusData::decode(&encoded).is_err());
    }
}
