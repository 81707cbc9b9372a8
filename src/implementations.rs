use crate::traits::{CollectionRef, Document, DocumentStore, Revision, StoreError, StoredDocument};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

type Collection = BTreeMap<String, StoredDocument>;

/// Document store backed by nested maps, for tests and local runs
///
/// Layout: database -> collection -> name -> document. Revisions come from a
/// single counter, so they are unique across the whole store.
pub struct InMemoryStore {
    databases: RwLock<BTreeMap<String, BTreeMap<String, Collection>>>,
    next_revision: AtomicU64,
    excluded_databases: BTreeSet<String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            databases: RwLock::new(BTreeMap::new()),
            next_revision: AtomicU64::new(1),
            excluded_databases: BTreeSet::new(),
        }
    }

    /// Hide these databases from `list_databases`
    pub fn with_excluded_databases<I, S>(mut self, databases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_databases = databases.into_iter().map(Into::into).collect();
        self
    }

    /// Number of documents across every collection
    pub async fn document_count(&self) -> usize {
        let databases = self.databases.read().await;
        databases
            .values()
            .flat_map(|collections| collections.values())
            .map(|collection| collection.len())
            .sum()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn find_by_name(
        &self,
        scope: &CollectionRef,
        name: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let databases = self.databases.read().await;
        Ok(databases
            .get(&scope.database)
            .and_then(|collections| collections.get(&scope.collection))
            .and_then(|collection| collection.get(name))
            .cloned())
    }

    async fn upsert(
        &self,
        scope: &CollectionRef,
        name: &str,
        document: Document,
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        let mut databases = self.databases.write().await;
        let collection = databases
            .entry(scope.database.clone())
            .or_default()
            .entry(scope.collection.clone())
            .or_default();

        let found = collection.get(name).map(|stored| stored.revision);
        if found != expected {
            return Err(StoreError::RevisionMismatch {
                name: name.to_string(),
                expected,
                found,
            });
        }

        let revision = Revision(self.next_revision.fetch_add(1, Ordering::Relaxed));
        collection.insert(name.to_string(), StoredDocument { document, revision });
        Ok(revision)
    }

    async fn list_names(&self, scope: &CollectionRef) -> Result<BTreeSet<String>, StoreError> {
        let databases = self.databases.read().await;
        Ok(databases
            .get(&scope.database)
            .and_then(|collections| collections.get(&scope.collection))
            .map(|collection| collection.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_documents(&self, scope: &CollectionRef) -> Result<Vec<Document>, StoreError> {
        let databases = self.databases.read().await;
        Ok(databases
            .get(&scope.database)
            .and_then(|collections| collections.get(&scope.collection))
            .map(|collection| {
                collection
                    .values()
                    .map(|stored| stored.document.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        let databases = self.databases.read().await;
        Ok(databases
            .keys()
            .filter(|name| !self.excluded_databases.contains(*name))
            .cloned()
            .collect())
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        let databases = self.databases.read().await;
        Ok(databases
            .get(database)
            .map(|collections| collections.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}
