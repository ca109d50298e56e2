//! Chunked encoding of discovery records.
//!
//! A record is serialized to JSON, encoded as URL-safe unpadded base64 and
//! sliced into segments. Every segment is prefixed with a six character
//! header of three two-digit lowercase hex fields:
//!
//! ```text
//! +-------+-------+-------+---------------------+
//! | index | total | len   | data (len bytes)    |
//! | 2 hex | 2 hex | 2 hex | base64, <= 249 bytes|
//! +-------+-------+-------+---------------------+
//! ```
//!
//! `index` is zero based, `total` is the number of chunks in the set and `len`
//! is the byte length of the data that follows, so a chunk never exceeds the
//! 255 byte ceiling of a single DNS text string and can be reassembled in any
//! arrival order.

use crate::error::{CodecError, Result};
use crate::record::DiscoveryRecord;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use lanreg_core::config::MAX_RECORD_SIZE_LIMIT;

/// Hard ceiling of one text string on the wire.
pub const MAX_CHUNK_LEN: usize = 255;

/// Length of the `index|total|len` header.
pub const HEADER_LEN: usize = 6;

/// Data bytes carried by every chunk but the last.
pub const CHUNK_DATA_LEN: usize = MAX_CHUNK_LEN - HEADER_LEN;

/// Most chunks a single record may be split into.
pub const MAX_CHUNKS: usize = 255;

/// Default limit on the JSON size of a record.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 16 * 1024;

/// Parsed chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub index: usize,
    pub total: usize,
    pub len: usize,
}

impl ChunkHeader {
    /// Returns true for the final chunk of the set.
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total
    }
}

/// Splits a chunk into its header and data, validating both.
pub fn parse_chunk(chunk: &str) -> Result<(ChunkHeader, &str)> {
    if chunk.len() > MAX_CHUNK_LEN {
        return Err(CodecError::corrupt(format!(
            "chunk of {} bytes exceeds {} bytes",
            chunk.len(),
            MAX_CHUNK_LEN
        )));
    }

    let field = |start: usize| -> Result<usize> {
        chunk
            .get(start..start + 2)
            .filter(|s| s.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .map(usize::from)
            .ok_or_else(|| CodecError::corrupt("unreadable chunk header"))
    };

    let header = ChunkHeader {
        index: field(0)?,
        total: field(2)?,
        len: field(4)?,
    };
    let data = chunk
        .get(HEADER_LEN..)
        .ok_or_else(|| CodecError::corrupt("unreadable chunk header"))?;

    if header.total == 0 || header.index >= header.total {
        return Err(CodecError::corrupt(format!(
            "chunk index {} out of range for {} chunks",
            header.index, header.total
        )));
    }

    if data.len() != header.len {
        return Err(CodecError::LengthMismatch {
            index: header.index,
            expected: header.len,
            actual: data.len(),
        });
    }

    if !header.is_last() && header.len != CHUNK_DATA_LEN {
        return Err(CodecError::corrupt(format!(
            "chunk {} of {} is short ({} bytes)",
            header.index, header.total, header.len
        )));
    }

    Ok((header, data))
}

/// Encoder/decoder bound to a maximum record size.
#[derive(Debug, Clone, Copy)]
pub struct RecordCodec {
    max_record_size: usize,
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD_SIZE)
    }
}

impl RecordCodec {
    /// Creates a codec. The limit is capped at what 255 chunks can carry.
    pub fn new(max_record_size: usize) -> Self {
        Self {
            max_record_size: max_record_size.min(MAX_RECORD_SIZE_LIMIT),
        }
    }

    pub fn max_record_size(&self) -> usize {
        self.max_record_size
    }

    /// Encodes a record into an ordered chunk sequence.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooLarge`] if the serialized record exceeds the
    /// configured maximum.
    pub fn encode(&self, record: &DiscoveryRecord) -> Result<Vec<String>> {
        let json = serde_json::to_vec(record)?;
        if json.len() > self.max_record_size {
            return Err(CodecError::TooLarge {
                size: json.len(),
                max: self.max_record_size,
            });
        }

        let text = URL_SAFE_NO_PAD.encode(&json);
        let total = text.len().div_ceil(CHUNK_DATA_LEN);
        if total > MAX_CHUNKS {
            return Err(CodecError::TooLarge {
                size: json.len(),
                max: self.max_record_size,
            });
        }

        // base64 output is ASCII so byte offsets are char boundaries
        let chunks = (0..total)
            .map(|index| {
                let start = index * CHUNK_DATA_LEN;
                let end = (start + CHUNK_DATA_LEN).min(text.len());
                format!(
                    "{:02x}{:02x}{:02x}{}",
                    index,
                    total,
                    end - start,
                    &text[start..end]
                )
            })
            .collect();

        Ok(chunks)
    }

    /// Reassembles and decodes a chunk set given in any order.
    ///
    /// Exact duplicates are tolerated. Gaps, conflicting duplicates, corrupt
    /// headers and oversized payloads are rejected.
    pub fn decode<I, S>(&self, chunks: I) -> Result<DiscoveryRecord>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut slots: Vec<Option<String>> = Vec::new();
        let mut expected_total = None;

        for chunk in chunks {
            let (header, data) = parse_chunk(chunk.as_ref())?;

            match expected_total {
                None => {
                    expected_total = Some(header.total);
                    slots = vec![None; header.total];
                }
                Some(total) if total != header.total => {
                    return Err(CodecError::InconsistentTotal {
                        expected: total,
                        found: header.total,
                    });
                }
                Some(_) => {}
            }

            match &slots[header.index] {
                Some(existing) if existing != data => {
                    return Err(CodecError::corrupt(format!(
                        "conflicting copies of chunk {}",
                        header.index
                    )));
                }
                Some(_) => {}
                None => slots[header.index] = Some(data.to_string()),
            }
        }

        let total = expected_total.ok_or(CodecError::Empty)?;

        let mut text = String::with_capacity(total * CHUNK_DATA_LEN);
        for (index, slot) in slots.iter().enumerate() {
            match slot {
                Some(data) => text.push_str(data),
                None => return Err(CodecError::MissingChunk { index, total }),
            }
        }

        let size = text.len() * 3 / 4;
        if size > self.max_record_size {
            return Err(CodecError::TooLarge {
                size,
                max: self.max_record_size,
            });
        }

        let json = URL_SAFE_NO_PAD
            .decode(text.as_bytes())
            .map_err(|e| CodecError::corrupt(format!("invalid base64 payload: {}", e)))?;

        Ok(serde_json::from_slice(&json)?)
    }
}

/// Encodes a record with the default size limit.
pub fn encode(record: &DiscoveryRecord) -> Result<Vec<String>> {
    RecordCodec::default().encode(record)
}

/// Decodes a chunk set with the default size limit.
pub fn decode<I, S>(chunks: I) -> Result<DiscoveryRecord>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    RecordCodec::default().decode(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanreg_core::types::{Endpoint, Value};

    fn sample_record() -> DiscoveryRecord {
        let mut endpoint = Endpoint::new("endpoint1");
        endpoint.request = Some(Value::new("request", "request"));
        endpoint.response = Some(Value::new("response", "response"));
        endpoint.metadata.insert("foo1".to_string(), "bar1".to_string());

        let mut record = DiscoveryRecord {
            version: "1.0.0".to_string(),
            ..Default::default()
        };
        record.metadata.insert("foo".to_string(), "bar".to_string());
        record.endpoints.push(endpoint);
        record
    }

    fn large_record(endpoints: usize) -> DiscoveryRecord {
        let mut record = sample_record();
        record.metadata.insert("emoji".to_string(), "🚀 données 数据".to_string());
        for i in 0..endpoints {
            let mut endpoint = Endpoint::new(format!("Service.Method{}", i));
            let mut request = Value::new("req", "Request");
            request.values.push(Value::new("id", "string"));
            endpoint.request = Some(request);
            record.endpoints.push(endpoint);
        }
        record
    }

    #[test]
    fn test_round_trip() {
        let record = sample_record();
        let chunks = encode(&record).unwrap();
        assert_eq!(decode(&chunks).unwrap(), record);
    }

    #[test]
    fn test_round_trip_unicode_and_many_endpoints() {
        let record = large_record(100);
        let chunks = encode(&record).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(decode(&chunks).unwrap(), record);
    }

    #[test]
    fn test_empty_record() {
        let record = DiscoveryRecord::default();
        let chunks = encode(&record).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(decode(&chunks).unwrap(), record);
    }

    #[test]
    fn test_every_chunk_within_ceiling() {
        let chunks = encode(&large_record(150)).unwrap();
        for chunk in &chunks {
            assert!(chunk.len() <= MAX_CHUNK_LEN, "chunk is {} bytes", chunk.len());
        }
    }

    #[test]
    fn test_decode_out_of_order_with_duplicates() {
        let record = large_record(40);
        let mut chunks = encode(&record).unwrap();
        chunks.reverse();
        let first = chunks[0].clone();
        chunks.push(first);
        assert_eq!(decode(&chunks).unwrap(), record);
    }

    #[test]
    fn test_missing_chunk_is_rejected() {
        let mut chunks = encode(&large_record(40)).unwrap();
        assert!(chunks.len() >= 3);
        chunks.remove(1);
        assert_eq!(
            decode(&chunks).unwrap_err(),
            CodecError::MissingChunk {
                index: 1,
                total: chunks.len() + 1
            }
        );
    }

    #[test]
    fn test_truncated_chunk_is_rejected() {
        let mut chunks = encode(&sample_record()).unwrap();
        chunks[0].pop();
        assert!(matches!(
            decode(&chunks).unwrap_err(),
            CodecError::LengthMismatch { index: 0, .. }
        ));
    }

    #[test]
    fn test_inconsistent_total_is_rejected() {
        let a = encode(&sample_record()).unwrap();
        let b = encode(&large_record(40)).unwrap();
        let mixed = vec![a[0].clone(), b[1].clone()];
        assert!(matches!(
            decode(&mixed).unwrap_err(),
            CodecError::InconsistentTotal { .. }
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            decode(["zz01ffhello"]).unwrap_err(),
            CodecError::CorruptChunk(_)
        ));
        assert!(matches!(
            decode(["0001"]).unwrap_err(),
            CodecError::CorruptChunk(_)
        ));
        assert_eq!(decode(Vec::<String>::new()).unwrap_err(), CodecError::Empty);
    }

    #[test]
    fn test_valid_framing_with_bad_payload() {
        assert!(matches!(
            decode(["000105!!!!!"]).unwrap_err(),
            CodecError::CorruptChunk(_)
        ));
        // "bm90IGpzb24" is base64 for "not json"
        assert!(matches!(
            decode(["00010bbm90IGpzb24"]).unwrap_err(),
            CodecError::Malformed(_)
        ));
    }

    #[test]
    fn test_encode_too_large() {
        let codec = RecordCodec::new(256);
        let err = codec.encode(&large_record(20)).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { max: 256, .. }));
    }

    #[test]
    fn test_decode_too_large() {
        let chunks = encode(&large_record(20)).unwrap();
        let err = RecordCodec::new(256).decode(&chunks).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { max: 256, .. }));
    }
}
