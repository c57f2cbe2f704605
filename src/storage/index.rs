//! In-memory deletion index (live set and per-id lifecycles).
//!
//! The DeletionIndex tracks, for every non-local id, the generations of its
//! lifecycle and which ids are currently live. Live records are kept in a
//! BTreeMap ordered by update sequence so that:
//!
//! - counting live documents is O(1) regardless of how many tombstones exist
//! - a batch scan of `limit` documents touches only `limit` entries
//! - a scan clones `Arc`s under one lock and is a consistent snapshot
//!
//! A generation starts when an id is written while absent or tombstoned and
//! ends when it is removed. Re-putting a tombstoned id opens a new generation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::storage::StoredRecord;

/// A single lifecycle of an id, from creation to removal.
#[derive(Clone, Debug)]
struct Generation {
    /// Sequence number of the write that opened this generation
    created: u64,

    /// Sequence numbers of every write in this generation (including creation)
    writes: Vec<u64>,

    /// Sequence number of the removal (None while live)
    deleted: Option<u64>,
}

/// Index entry for a single id.
#[derive(Clone, Debug, Default)]
struct IndexEntry {
    generations: Vec<Generation>,
}

impl IndexEntry {
    /// Sequence number under which the id currently sits in the live set.
    fn live_seq(&self) -> Option<u64> {
        self.generations
            .last()
            .filter(|gen| gen.deleted.is_none())
            .and_then(|gen| gen.writes.last().copied())
    }

    fn is_tombstoned(&self) -> bool {
        self.generations
            .last()
            .map_or(false, |gen| gen.deleted.is_some())
    }
}

/// Lifecycle tracking for the ids of one database.
#[derive(Default)]
pub struct DeletionIndex {
    /// Map from id to its lifecycle
    entries: HashMap<String, IndexEntry>,

    /// Live records ordered by update sequence, shared with the engine
    live: BTreeMap<u64, Arc<StoredRecord>>,

    /// Number of ids whose latest state is a tombstone
    tombstoned: usize,
}

impl DeletionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest state of a document, written at `record.seq`.
    ///
    /// Local documents are ignored; they never enter the live set.
    pub fn apply(&mut self, record: Arc<StoredRecord>) {
        if record.doc.is_local() {
            return;
        }
        if record.doc.is_deleted() {
            self.tombstone(&record.doc.id, record.seq);
        } else {
            self.put(record);
        }
    }

    /// Records a live write.
    ///
    /// If the id is absent or tombstoned a new generation is opened,
    /// otherwise the write is appended to the current generation.
    pub fn put(&mut self, record: Arc<StoredRecord>) {
        let seq = record.seq;
        let entry = self.entries.entry(record.doc.id.clone()).or_default();

        if let Some(previous) = entry.live_seq() {
            self.live.remove(&previous);
        }

        match entry.generations.last().map(|gen| gen.deleted.is_none()) {
            Some(true) => {
                if let Some(gen) = entry.generations.last_mut() {
                    gen.writes.push(seq);
                }
            }
            reopened => {
                if reopened.is_some() {
                    self.tombstoned -= 1;
                }
                entry.generations.push(Generation {
                    created: seq,
                    writes: vec![seq],
                    deleted: None,
                });
            }
        }

        debug!(id = %record.doc.id, seq, "Index: live write");
        self.live.insert(seq, record);
    }

    /// Swaps in a rewritten copy of a live record without moving it.
    pub fn refresh(&mut self, record: Arc<StoredRecord>) {
        if let Some(slot) = self.live.get_mut(&record.seq) {
            if slot.doc.id == record.doc.id {
                *slot = record;
            }
        }
    }

    /// Records a removal at `seq`.
    pub fn tombstone(&mut self, id: &str, seq: u64) {
        let entry = self.entries.entry(id.to_string()).or_default();

        if let Some(previous) = entry.live_seq() {
            self.live.remove(&previous);
        }

        match entry.generations.last_mut() {
            Some(gen) => {
                if gen.deleted.is_none() {
                    gen.deleted = Some(seq);
                    self.tombstoned += 1;
                }
            }
            None => {
                // Tombstone for an id never seen live (e.g. replayed from storage)
                entry.generations.push(Generation {
                    created: seq,
                    writes: vec![seq],
                    deleted: Some(seq),
                });
                self.tombstoned += 1;
            }
        }

        debug!(id, seq, "Index: tombstone");
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .map_or(false, |entry| entry.live_seq().is_some())
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.entries.get(id).map_or(false, IndexEntry::is_tombstoned)
    }

    /// Number of live, non-local documents.
    pub fn count_live(&self) -> usize {
        self.live.len()
    }

    /// Number of ids whose latest state is a tombstone.
    pub fn count_tombstoned(&self) -> usize {
        self.tombstoned
    }

    /// Up to `limit` live records in ascending update sequence.
    pub fn scan(&self, limit: usize) -> Vec<Arc<StoredRecord>> {
        self.live.values().take(limit).cloned().collect()
    }

    /// Number of lifecycles recorded for an id.
    pub fn generations(&self, id: &str) -> usize {
        self.entries
            .get(id)
            .map_or(0, |entry| entry.generations.len())
    }

    /// Number of writes recorded for an id across all generations.
    pub fn count_writes(&self, id: &str) -> usize {
        self.entries
            .get(id)
            .map(|entry| entry.generations.iter().map(|gen| gen.writes.len()).sum())
            .unwrap_or(0)
    }

    /// Forgets closed generations and all but the latest write of each id.
    ///
    /// The live set and tombstone state are unchanged. Returns the number of
    /// write records dropped.
    pub fn compact(&mut self) -> usize {
        let mut dropped = 0;

        for entry in self.entries.values_mut() {
            let before: usize = entry.generations.iter().map(|gen| gen.writes.len()).sum();

            if entry.generations.len() > 1 {
                let last = entry.generations.len() - 1;
                entry.generations.drain(..last);
            }
            if let Some(gen) = entry.generations.last_mut() {
                if gen.writes.len() > 1 {
                    let last = gen.writes.len() - 1;
                    gen.writes.drain(..last);
                }
                if let Some(&first) = gen.writes.first() {
                    gen.created = gen.created.max(first);
                }
            }

            let after = entry.generations.first().map_or(0, |gen| gen.writes.len());
            dropped += before - after;
        }

        debug!(dropped, "Index: compacted");
        dropped
    }

    /// Total number of ids ever recorded (live or tombstoned).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.live.clear();
        self.tombstoned = 0;
    }
}
