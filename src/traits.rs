/// Storage abstraction for histogram and file-list documents
///
/// The service layer only ever talks to a `DocumentStore`, so the backend can be
/// swapped between ClickHouse in production and the in-memory store in tests.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// A stored record: a JSON object
pub type Document = Map<String, Value>;

/// Scope of every store call: one collection in one database
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionRef {
    pub database: String,
    pub collection: String,
}

impl CollectionRef {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.database, self.collection)
    }
}

/// Monotonic version of a stored document, bumped on every write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(pub u64);

/// A document together with the revision it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub document: Document,
    pub revision: Revision,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The document changed between read and write
    #[error("document '{name}' was modified concurrently (expected {expected:?}, found {found:?})")]
    RevisionMismatch {
        name: String,
        expected: Option<Revision>,
        found: Option<Revision>,
    },
    #[error("storage backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

// ============================================================================
// Document Store Trait
// ============================================================================

/// Trait for persisting named documents grouped in collections
///
/// Implementations:
/// - ClickHouse (versioned rows in a ReplacingMergeTree)
/// - In-memory maps for tests and local runs
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the document called `name`, with its current revision
    async fn find_by_name(
        &self,
        scope: &CollectionRef,
        name: &str,
    ) -> Result<Option<StoredDocument>, StoreError>;

    /// Conditionally write `document` under `name`.
    ///
    /// `expected` is the revision observed when the document was read, or
    /// `None` if it did not exist. The write fails with
    /// `StoreError::RevisionMismatch` when the stored revision differs, so
    /// concurrent read-modify-write cycles cannot lose each other's updates.
    async fn upsert(
        &self,
        scope: &CollectionRef,
        name: &str,
        document: Document,
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError>;

    /// Names of every document in the collection
    async fn list_names(&self, scope: &CollectionRef) -> Result<BTreeSet<String>, StoreError>;

    /// Every document in the collection, ordered by name
    async fn list_documents(&self, scope: &CollectionRef) -> Result<Vec<Document>, StoreError>;

    /// Databases visible to clients (system databases filtered out)
    async fn list_databases(&self) -> Result<Vec<String>, StoreError>;

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError>;

    /// Get the name/identifier of this store (for logging)
    fn name(&self) -> &str;
}
