//! Documents as seen by callers and as persisted by adapters.
//!
//! A document is a JSON object addressed by id. Ids starting with
//! [`LOCAL_PREFIX`] are node-local bookkeeping documents: they are stored and
//! fetched like any other document but never counted or scanned.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::storage::{Revision, StorageError, StorageResult};

/// Id prefix reserved for local documents.
pub const LOCAL_PREFIX: &str = "_local/";

/// Id prefix reserved for design documents; accepted as a regular id.
const DESIGN_PREFIX: &str = "_design/";

/// Hex characters of the field-list digest appended to derived index names.
const INDEX_DIGEST_LEN: usize = 8;

/// Lifecycle state of a stored document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocState {
    Live,
    Tombstone,
}

/// A document with its revision metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,

    /// Revision the caller last observed. `None` for brand-new documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,

    pub state: DocState,

    #[serde(default)]
    pub body: Map<String, Value>,
}

impl Document {
    /// Creates a live document without a revision.
    pub fn new(id: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            revision: None,
            state: DocState::Live,
            body,
        }
    }

    /// Creates a live document with an empty body.
    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, Map::new())
    }

    /// Creates a tombstone for `id` at `revision`.
    pub fn tombstone(id: impl Into<String>, revision: Revision) -> Self {
        Self {
            id: id.into(),
            revision: Some(revision),
            state: DocState::Tombstone,
            body: Map::new(),
        }
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn is_local(&self) -> bool {
        is_local_id(&self.id)
    }

    pub fn is_deleted(&self) -> bool {
        self.state == DocState::Tombstone
    }

    /// Returns a top-level body field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }

    /// Builds a document from its JSON wire shape.
    ///
    /// The reserved members `_id` (required), `_rev` and `_deleted` are lifted
    /// into metadata; any other member starting with `_` is rejected.
    pub fn from_json(value: Value) -> StorageResult<Self> {
        let Value::Object(mut body) = value else {
            return Err(StorageError::InvalidArgument(
                "document must be a JSON object".to_string(),
            ));
        };

        let id = match body.remove("_id") {
            Some(Value::String(id)) => id,
            Some(_) => {
                return Err(StorageError::InvalidArgument("_id must be a string".to_string()))
            }
            None => return Err(StorageError::InvalidArgument("missing _id".to_string())),
        };

        let revision = match body.remove("_rev") {
            Some(Value::String(rev)) => Some(rev.parse::<Revision>()?),
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(StorageError::InvalidArgument("_rev must be a string".to_string()))
            }
        };

        let state = match body.remove("_deleted") {
            Some(Value::Bool(true)) => DocState::Tombstone,
            Some(Value::Bool(false)) | Some(Value::Null) | None => DocState::Live,
            Some(_) => {
                return Err(StorageError::InvalidArgument(
                    "_deleted must be a boolean".to_string(),
                ))
            }
        };

        if let Some(key) = body.keys().find(|k| k.starts_with('_')) {
            return Err(StorageError::InvalidArgument(format!(
                "reserved document member: {}",
                key
            )));
        }

        let doc = Self {
            id,
            revision,
            state,
            body,
        };
        validate_id(&doc.id)?;
        Ok(doc)
    }

    /// Renders the document in its JSON wire shape.
    pub fn to_json(&self) -> Value {
        let mut out = self.body.clone();
        out.insert("_id".to_string(), Value::String(self.id.clone()));
        if let Some(rev) = &self.revision {
            out.insert("_rev".to_string(), Value::String(rev.to_string()));
        }
        if self.is_deleted() {
            out.insert("_deleted".to_string(), Value::Bool(true));
        }
        Value::Object(out)
    }
}

/// True if `id` addresses a local document.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_PREFIX)
}

/// Rejects empty ids and ids using a reserved prefix other than
/// `_local/` and `_design/`.
pub fn validate_id(id: &str) -> StorageResult<()> {
    if id.is_empty() {
        return Err(StorageError::InvalidArgument("document id is empty".to_string()));
    }
    if is_local_id(id) {
        if id.len() == LOCAL_PREFIX.len() {
            return Err(StorageError::InvalidArgument(
                "local document id has no name".to_string(),
            ));
        }
        return Ok(());
    }
    if id.starts_with('_') && !id.starts_with(DESIGN_PREFIX) {
        return Err(StorageError::InvalidArgument(format!(
            "document id uses a reserved prefix: {}",
            id
        )));
    }
    Ok(())
}

/// Persisted form of a document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Latest state; `doc.revision` is always set.
    pub doc: Document,

    /// Update sequence number of the write that produced this state.
    pub seq: u64,

    /// Ancestor revisions, newest first. The current revision is not included.
    #[serde(default)]
    pub history: Vec<Revision>,
}

impl StoredRecord {
    pub fn revision(&self) -> Option<&Revision> {
        self.doc.revision.as_ref()
    }

    /// True if this record belongs in the live set (counted and scanned).
    pub fn is_live_user_doc(&self) -> bool {
        !self.doc.is_deleted() && !self.doc.is_local()
    }
}

/// Declaration of a secondary index over a sequence of body fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub fields: Vec<String>,
}

impl IndexDefinition {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: None,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Explicit name, or one derived from the field list.
    ///
    /// A derived name ends in a digest of the exact field list, so lists such
    /// as `["a", "b"]` and `["a-b"]` never resolve to the same name.
    pub fn resolved_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        let mut hasher = Sha256::new();
        for field in &self.fields {
            hasher.update(field.as_bytes());
            hasher.update(b"\0");
        }
        let digest = format!("{:x}", hasher.finalize());
        format!(
            "idx-{}-{}",
            self.fields.join("-").replace('.', "_"),
            &digest[..INDEX_DIGEST_LEN]
        )
    }

    /// Two declarations are equivalent when they cover the same fields in
    /// the same order.
    pub fn is_equivalent(&self, other: &IndexDefinition) -> bool {
        self.fields == other.fields
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.fields.is_empty() {
            return Err(StorageError::InvalidArgument(
                "index must declare at least one field".to_string(),
            ));
        }
        for field in &self.fields {
            let valid = !field.is_empty()
                && !field.starts_with('.')
                && !field.ends_with('.')
                && field
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
            if !valid {
                return Err(StorageError::InvalidArgument(format!(
                    "invalid index field: {:?}",
                    field
                )));
            }
        }
        if let Some(name) = &self.name {
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(StorageError::InvalidArgument(format!(
                    "invalid index name: {:?}",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Result of declaring an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOutcome {
    Created,
    Exists,
}
