//! Transaction metadata construction.
//!
//! On-chain metadata strings are capped at 64 bytes per entry, so longer
//! strings become lists of chunks. Label 721 carries the agent registry
//! payload, label 674 the human-readable message convention.

use std::collections::BTreeMap;

use crate::plutus::write_head;

/// Metadata label for NFT-style token info.
pub const LABEL_NFT: u64 = 721;
/// Metadata label for the message convention.
pub const LABEL_MSG: u64 = 674;

/// A transaction metadata value (the metadatum subset the coordinator emits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Int(u64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<MetadataValue>),
    /// Order-preserving map; keys are text in every structure we emit.
    Map(Vec<(MetadataValue, MetadataValue)>),
}

impl MetadataValue {
    pub fn text(s: impl Into<String>) -> Self {
        MetadataValue::Text(s.into())
    }

    pub fn map(entries: Vec<(&str, MetadataValue)>) -> Self {
        MetadataValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (MetadataValue::text(k), v))
                .collect(),
        )
    }

    /// CBOR-encode this metadatum.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            MetadataValue::Int(i) => write_head(out, 0, *i),
            MetadataValue::Text(s) => {
                write_head(out, 3, s.len() as u64);
                out.extend_from_slice(s.as_bytes());
            }
            MetadataValue::Bytes(b) => {
                write_head(out, 2, b.len() as u64);
                out.extend_from_slice(b);
            }
            MetadataValue::List(items) => {
                write_head(out, 4, items.len() as u64);
                for item in items {
                    item.encode_into(out);
                }
            }
            MetadataValue::Map(pairs) => {
                write_head(out, 5, pairs.len() as u64);
                for (k, v) in pairs {
                    k.encode_into(out);
                    v.encode_into(out);
                }
            }
        }
    }
}

/// Split a UTF-8 string into on-chain metadata form.
///
/// Strings of 64 bytes or fewer stay scalar; longer strings become a list of
/// chunks, each at most 64 bytes and each a valid UTF-8 boundary split.
pub fn string_to_metadata(s: &str) -> MetadataValue {
    if s.len() <= 64 {
        return MetadataValue::text(s);
    }
    let mut chunks = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let mut end = rest.len().min(64);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (chunk, tail) = rest.split_at(end);
        chunks.push(MetadataValue::text(chunk));
        rest = tail;
    }
    MetadataValue::List(chunks)
}

/// A full metadata section: label -> metadatum, encoded as a CBOR map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxMetadata {
    entries: BTreeMap<u64, MetadataValue>,
}

impl TxMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: u64, value: MetadataValue) {
        self.entries.insert(label, value);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode as the auxiliary-data metadata map.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_head(&mut out, 5, self.entries.len() as u64);
        for (label, value) in &self.entries {
            write_head(&mut out, 0, *label);
            value.encode_into(&mut out);
        }
        out
    }
}

/// Build the 674 message metadatum: `{msg: [..lines..]}`.
pub fn message_metadata(lines: &[&str]) -> MetadataValue {
    MetadataValue::map(vec![(
        "msg",
        MetadataValue::List(lines.iter().map(|l| MetadataValue::text(*l)).collect()),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_string_stays_scalar() {
        assert_eq!(string_to_metadata("hello"), MetadataValue::text("hello"));
    }

    #[test]
    fn test_exactly_64_bytes_stays_scalar() {
        let s = "a".repeat(64);
        assert_eq!(string_to_metadata(&s), MetadataValue::text(s));
    }

    #[test]
    fn test_long_string_chunks_at_64_bytes() {
        let s = "a".repeat(130);
        match string_to_metadata(&s) {
            MetadataValue::List(chunks) => {
                assert_eq!(chunks.len(), 3);
                assert_eq!(chunks[0], MetadataValue::text("a".repeat(64)));
                assert_eq!(chunks[2], MetadataValue::text("aa"));
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn test_chunking_respects_utf8_boundaries() {
        // 3-byte characters that do not divide 64 evenly
        let s = "€".repeat(30);
        match string_to_metadata(&s) {
            MetadataValue::List(chunks) => {
                for chunk in chunks {
                    let MetadataValue::Text(t) = chunk else {
                        panic!("non-text chunk")
                    };
                    assert!(t.len() <= 64);
                    assert!(t.len() % 3 == 0, "split mid-character");
                }
            }
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn test_message_metadata_shape() {
        let value = message_metadata(&["Masumi", "RegisterAgent"]);
        let MetadataValue::Map(pairs) = value else {
            panic!("expected map")
        };
        assert_eq!(pairs[0].0, MetadataValue::text("msg"));
    }

    #[test]
    fn test_metadata_labels_sorted_in_encoding() {
        let mut meta = TxMetadata::new();
        meta.insert(LABEL_NFT, MetadataValue::Int(1));
        meta.insert(LABEL_MSG, MetadataValue::Int(2));
        let bytes = meta.encode();
        // map(2), then 674 (0x19 0x02 0xa2) must precede 721 (0x19 0x02 0xd1)
        assert_eq!(bytes[0], 0xa2);
        assert_eq!(&bytes[1..4], &[0x19, 0x02, 0xa2]);
    }
}
