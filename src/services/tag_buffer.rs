//! Per-transit tag set, deduplicated by TID

use crate::domain::error::DecodeError;
use crate::domain::types::TagRecord;
use crate::io::tag_decoder::{local_timestamp, TagDecoder};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;

/// Outcome of offering one raw tag frame to the buffer
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    /// New TID added; `load` is the batch size after insertion
    Inserted { record: TagRecord, load: usize, evicted: Option<String> },
    /// TID already in the batch
    Duplicate { tid: String },
    /// Frame could not be decoded; the record is for logging only
    DecodeFailed { record: TagRecord, error: DecodeError },
}

/// Tags collected during one transit, in first-seen order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitBatch {
    records: Vec<TagRecord>,
}

impl TransitBatch {
    pub fn new(records: Vec<TagRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TagRecord> {
        self.records.iter()
    }
}

/// Owns the in-progress transit's tags. Bounded; the oldest TID is evicted
/// once `capacity` is reached.
pub struct TagIngestBuffer {
    decoder: Box<dyn TagDecoder + Send>,
    batch: VecDeque<TagRecord>,
    tids: FxHashSet<String>,
    last_seen: Option<TagRecord>,
    capacity: usize,
}

impl TagIngestBuffer {
    pub fn new(decoder: Box<dyn TagDecoder + Send>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            decoder,
            batch: VecDeque::with_capacity(capacity.min(1024)),
            tids: FxHashSet::default(),
            last_seen: None,
            capacity,
        }
    }

    /// Decode and insert one raw tag frame
    pub fn ingest(&mut self, raw: &[u8]) -> Ingest {
        let record = match self.decoder.decode(raw) {
            Ok(record) => record,
            Err(error) => {
                return Ingest::DecodeFailed {
                    record: TagRecord::failed(error.to_string(), local_timestamp()),
                    error,
                }
            }
        };

        self.last_seen = Some(record.clone());

        if self.tids.contains(&record.tid) {
            return Ingest::Duplicate { tid: record.tid };
        }

        let evicted = if self.batch.len() >= self.capacity {
            self.batch.pop_front().map(|oldest| {
                self.tids.remove(&oldest.tid);
                oldest.tid
            })
        } else {
            None
        };

        self.tids.insert(record.tid.clone());
        self.batch.push_back(record.clone());
        Ingest::Inserted { record, load: self.batch.len(), evicted }
    }

    /// Hand the batch over and leave the buffer empty
    pub fn take(&mut self) -> TransitBatch {
        self.tids.clear();
        TransitBatch::new(self.batch.drain(..).collect())
    }

    pub fn clear(&mut self) {
        self.batch.clear();
        self.tids.clear();
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn contains(&self, tid: &str) -> bool {
        self.tids.contains(tid)
    }

    /// Most recent successfully decoded tag, duplicates included
    pub fn last_seen(&self) -> Option<&TagRecord> {
        self.last_seen.as_ref()
    }
}
