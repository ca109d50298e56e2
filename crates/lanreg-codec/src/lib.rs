//! Discovery record codec.
//!
//! Packs a [`DiscoveryRecord`] (version, node metadata and endpoints) into a
//! sequence of text chunks no longer than 255 bytes each, and reassembles such
//! a sequence back into the record regardless of arrival order.
//!
//! # Example
//!
//! ```
//! use lanreg_codec::{decode, encode, DiscoveryRecord};
//!
//! let mut record = DiscoveryRecord::default();
//! record.version = "1.0.0".to_string();
//! record.metadata.insert("zone".to_string(), "eu-west".to_string());
//!
//! let chunks = encode(&record).unwrap();
//! assert!(chunks.iter().all(|c| c.len() <= 255));
//! assert_eq!(decode(&chunks).unwrap(), record);
//! ```

pub mod chunk;
pub mod error;
pub mod record;

pub use chunk::{
    decode, encode, parse_chunk, ChunkHeader, RecordCodec, CHUNK_DATA_LEN, MAX_CHUNKS,
    MAX_CHUNK_LEN,
};
pub use error::{CodecError, Result};
pub use record::DiscoveryRecord;
