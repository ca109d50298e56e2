//! Reassembly of record chunks received across several packets.
//!
//! Chunk sets are keyed by (service, node, record id). A set that does not
//! complete within the retention window is discarded, and the number of
//! incomplete sets is capped so a noisy peer cannot grow memory unbounded.

use crate::clock::Clock;
use crate::wire::Fragment;
use lanreg_codec::{parse_chunk, CodecError, RecordCodec};
use lanreg_core::types::Service;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    service: String,
    node_id: String,
    record_id: u16,
}

#[derive(Debug)]
struct PendingRecord {
    first_seen: Instant,
    total: usize,
    chunks: BTreeMap<usize, String>,
}

/// A fully received peer announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub service: Service,
    pub ttl: Duration,
}

/// Collects fragments until a record can be decoded.
#[derive(Debug)]
pub struct ChunkAssembler {
    codec: RecordCodec,
    window: Duration,
    max_pending: usize,
    clock: Arc<dyn Clock>,
    pending: Mutex<HashMap<PendingKey, PendingRecord>>,
}

impl ChunkAssembler {
    pub fn new(
        codec: RecordCodec,
        window: Duration,
        max_pending: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            codec,
            window,
            max_pending: max_pending.max(1),
            clock,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a fragment. Returns the decoded service once every chunk of its
    /// record has arrived.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for corrupt chunks or a set that cannot be
    /// decoded; the offending set is discarded.
    pub fn accept(&self, fragment: Fragment) -> Result<Option<Completed>, CodecError> {
        let Fragment {
            service,
            node_id,
            record_id,
            ttl_secs,
            address,
            chunks,
        } = fragment;

        let mut parsed = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let (header, _) = parse_chunk(chunk)?;
            parsed.push((header, chunk));
        }
        let Some(total) = parsed.first().map(|(header, _)| header.total) else {
            return Ok(None);
        };

        let key = PendingKey {
            service,
            node_id,
            record_id,
        };
        let now = self.clock.now();
        let mut pending = self.pending.lock();

        if pending
            .get(&key)
            .is_some_and(|record| now.duration_since(record.first_seen) >= self.window)
        {
            pending.remove(&key);
        }

        if !pending.contains_key(&key) && pending.len() >= self.max_pending {
            if let Some(oldest) = pending
                .iter()
                .min_by_key(|(_, record)| record.first_seen)
                .map(|(key, _)| key.clone())
            {
                debug!(service = %oldest.service, node = %oldest.node_id, "Evicting incomplete record");
                pending.remove(&oldest);
            }
        }

        let record = pending.entry(key.clone()).or_insert_with(|| PendingRecord {
            first_seen: now,
            total,
            chunks: BTreeMap::new(),
        });

        for (header, chunk) in parsed {
            if header.total != record.total {
                let expected = record.total;
                pending.remove(&key);
                return Err(CodecError::InconsistentTotal {
                    expected,
                    found: header.total,
                });
            }
            match record.chunks.get(&header.index) {
                Some(existing) if existing != chunk => {
                    pending.remove(&key);
                    return Err(CodecError::CorruptChunk(format!(
                        "conflicting copies of chunk {}",
                        header.index
                    )));
                }
                Some(_) => {}
                None => {
                    record.chunks.insert(header.index, chunk.clone());
                }
            }
        }

        if record.chunks.len() < record.total {
            return Ok(None);
        }

        let Some(record) = pending.remove(&key) else {
            return Ok(None);
        };
        drop(pending);

        let decoded = self.codec.decode(record.chunks.values())?;
        Ok(Some(Completed {
            service: decoded.into_service(key.service, key.node_id, address),
            ttl: Duration::from_secs(u64::from(ttl_secs)),
        }))
    }

    /// Drops incomplete sets older than the window. Returns how many.
    pub fn purge(&self) -> usize {
        let now = self.clock.now();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, record| now.duration_since(record.first_seen) < self.window);
        before - pending.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}
