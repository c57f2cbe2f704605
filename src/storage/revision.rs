//! Revision identifiers and compare-and-set validation.
//!
//! Every successful write of an id produces a new [`Revision`] whose generation
//! is one higher than its parent's and whose hash fingerprints the parent, the
//! deletion flag and the canonical body. A writer must present the revision it
//! last observed; the write is accepted only if that equals the stored one.
//!
//! Adapters run [`RevisionTracker::apply`] inside whatever per-id atomic
//! section their engine provides, so the check and the update cannot be
//! separated by another writer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::storage::{DocState, Document, StorageError, StorageResult, StoredRecord};

/// Default number of revisions (current included) retained per document.
pub const DEFAULT_REVS_LIMIT: usize = 1000;

/// Hex characters kept from the SHA-256 digest.
const HASH_LEN: usize = 32;

/// A `(generation, hash)` revision. Ordered by generation first.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    generation: u64,
    hash: String,
}

impl Revision {
    pub fn new(generation: u64, hash: impl Into<String>) -> Self {
        Self {
            generation,
            hash: hash.into(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for Revision {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StorageError::InvalidArgument(format!("invalid revision: {:?}", s));

        let (generation, hash) = s.split_once('-').ok_or_else(invalid)?;
        let generation = generation.parse::<u64>().map_err(|_| invalid())?;
        if generation == 0 || hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        Ok(Revision::new(generation, hash))
    }
}

impl TryFrom<String> for Revision {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.to_string()
    }
}

/// A mutation to validate against the stored state of one id.
#[derive(Clone, Debug)]
pub enum WriteIntent {
    /// Insert or update with a live body.
    Put(Document),
    /// Convert the document into a tombstone.
    Remove {
        id: String,
        revision: Option<Revision>,
    },
}

impl WriteIntent {
    pub fn id(&self) -> &str {
        match self {
            WriteIntent::Put(doc) => &doc.id,
            WriteIntent::Remove { id, .. } => id,
        }
    }

    /// Routes tombstone-state documents to a removal.
    pub fn from_document(doc: Document) -> Self {
        if doc.is_deleted() {
            WriteIntent::Remove {
                id: doc.id,
                revision: doc.revision,
            }
        } else {
            WriteIntent::Put(doc)
        }
    }
}

/// Computes and validates revisions for one database.
#[derive(Clone, Debug)]
pub struct RevisionTracker {
    revs_limit: usize,
    auto_compaction: bool,
}

impl Default for RevisionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_REVS_LIMIT, false)
    }
}

impl RevisionTracker {
    pub fn new(revs_limit: usize, auto_compaction: bool) -> Self {
        Self {
            revs_limit: revs_limit.max(1),
            auto_compaction,
        }
    }

    pub fn revs_limit(&self) -> usize {
        self.revs_limit
    }

    /// Validates `intent` against `current` and returns the record to store.
    ///
    /// `seq` is the update sequence number stamped on the new record.
    pub fn apply(
        &self,
        current: Option<&StoredRecord>,
        intent: WriteIntent,
        seq: u64,
    ) -> StorageResult<StoredRecord> {
        match intent {
            WriteIntent::Put(doc) => {
                Self::check_put(&doc.id, current, doc.revision.as_ref())?;
                self.next_record(current, doc.id, DocState::Live, doc.body, seq)
            }
            WriteIntent::Remove { id, revision } => {
                Self::check_remove(&id, current, revision.as_ref())?;
                self.next_record(current, id, DocState::Tombstone, Map::new(), seq)
            }
        }
    }

    /// A put is accepted when the supplied revision equals the stored one.
    /// Brand-new ids and tombstones may also be written without a revision.
    pub fn check_put(
        id: &str,
        current: Option<&StoredRecord>,
        supplied: Option<&Revision>,
    ) -> StorageResult<()> {
        let accepted = match current {
            None => supplied.is_none(),
            Some(record) if record.doc.is_deleted() => {
                supplied.is_none() || supplied == record.revision()
            }
            Some(record) => supplied.is_some() && supplied == record.revision(),
        };

        if accepted {
            Ok(())
        } else {
            Err(conflict(id, current, supplied))
        }
    }

    /// A removal needs a live document and its exact current revision.
    pub fn check_remove(
        id: &str,
        current: Option<&StoredRecord>,
        supplied: Option<&Revision>,
    ) -> StorageResult<()> {
        match current {
            None => Err(StorageError::NotFound(id.to_string())),
            Some(record) if record.doc.is_deleted() => Err(StorageError::NotFound(id.to_string())),
            Some(record) if supplied.is_some() && supplied == record.revision() => Ok(()),
            Some(_) => Err(conflict(id, current, supplied)),
        }
    }

    fn next_record(
        &self,
        current: Option<&StoredRecord>,
        id: String,
        state: DocState,
        body: Map<String, Value>,
        seq: u64,
    ) -> StorageResult<StoredRecord> {
        let parent = current.and_then(|r| r.revision()).cloned();
        let generation = parent.as_ref().map_or(1, |p| p.generation + 1);
        let hash = fingerprint(parent.as_ref(), state, &body)?;

        let mut history = Vec::new();
        if let Some(parent) = parent {
            history.push(parent);
            if let Some(record) = current {
                history.extend(record.history.iter().cloned());
            }
        }
        if self.auto_compaction {
            self.trim(&mut history);
        }

        Ok(StoredRecord {
            doc: Document {
                id,
                revision: Some(Revision::new(generation, hash)),
                state,
                body,
            },
            seq,
            history,
        })
    }

    /// Drops ancestors beyond the limit. Returns the number removed.
    pub fn trim(&self, history: &mut Vec<Revision>) -> usize {
        let keep = self.revs_limit - 1;
        if history.len() <= keep {
            return 0;
        }
        let pruned = history.len() - keep;
        history.truncate(keep);
        pruned
    }
}

fn conflict(id: &str, current: Option<&StoredRecord>, supplied: Option<&Revision>) -> StorageError {
    StorageError::RevisionConflict {
        id: id.to_string(),
        current: current.and_then(|r| r.revision()).cloned(),
        supplied: supplied.cloned(),
    }
}

/// Content hash over the parent revision, deletion flag and canonical body.
fn fingerprint(
    parent: Option<&Revision>,
    state: DocState,
    body: &Map<String, Value>,
) -> StorageResult<String> {
    let mut hasher = Sha256::new();
    if let Some(parent) = parent {
        hasher.update(parent.to_string().as_bytes());
    }
    hasher.update(b"\n");
    hasher.update(match state {
        DocState::Live => b"live".as_slice(),
        DocState::Tombstone => b"deleted".as_slice(),
    });
    hasher.update(b"\n");
    hasher.update(serde_json::to_vec(body)?);

    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..HASH_LEN].to_string())
}
