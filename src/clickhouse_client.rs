/// ClickHouse document store
///
/// Documents are stored as JSON bodies in a `ReplacingMergeTree(revision)`
/// table, one row per write. Reads use `FINAL` so only the newest revision of
/// each document is visible.

use crate::traits::{CollectionRef, Document, DocumentStore, Revision, StoreError, StoredDocument};
use anyhow::{Context, Result};
use async_trait::async_trait;
use clickhouse::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct DocumentRow {
    pub database: String,
    pub collection: String,
    pub name: String,
    pub revision: u64,
    pub body: String,
}

#[derive(Debug, Deserialize, clickhouse::Row)]
struct NameRow {
    name: String,
}

#[derive(Debug, Deserialize, clickhouse::Row)]
struct RevisionRow {
    revision: u64,
}

#[derive(Debug, Deserialize, clickhouse::Row)]
struct BodyRow {
    revision: u64,
    body: String,
}

#[derive(Debug, Clone, Default)]
pub struct ClickHouseSettings {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

pub struct ClickHouseStore {
    client: Client,
    url: String,
    excluded_databases: BTreeSet<String>,
    // serialises read-check-insert for conditional writes within this process
    write_lock: Mutex<()>,
}

impl ClickHouseStore {
    /// Create a new ClickHouse-backed store
    pub fn new(settings: &ClickHouseSettings) -> Self {
        let mut client = Client::default()
            .with_url(&settings.url)
            .with_database(&settings.database);

        if let Some(user) = &settings.user {
            client = client.with_user(user);
        }
        if let Some(password) = &settings.password {
            client = client.with_password(password);
        }

        Self {
            client,
            url: settings.url.clone(),
            excluded_databases: BTreeSet::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_excluded_databases<I, S>(mut self, databases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_databases = databases.into_iter().map(Into::into).collect();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Initialize database schema
    pub async fn init_schema(&self) -> Result<()> {
        let schema = include_str!("../clickhouse_schema.sql");

        for statement in schema.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                self.client
                    .query(trimmed)
                    .execute()
                    .await
                    .context("failed to apply ClickHouse schema")?;
            }
        }

        Ok(())
    }

    async fn current_revision(&self, scope: &CollectionRef, name: &str) -> Result<Option<Revision>> {
        let row = self
            .client
            .query(
                "SELECT revision FROM documents FINAL
                 WHERE database = ? AND collection = ? AND name = ?",
            )
            .bind(&scope.database)
            .bind(&scope.collection)
            .bind(name)
            .fetch_optional::<RevisionRow>()
            .await?;

        Ok(row.map(|r| Revision(r.revision)))
    }

    async fn fetch_document(&self, scope: &CollectionRef, name: &str) -> Result<Option<StoredDocument>> {
        let row = self
            .client
            .query(
                "SELECT revision, body FROM documents FINAL
                 WHERE database = ? AND collection = ? AND name = ?",
            )
            .bind(&scope.database)
            .bind(&scope.collection)
            .bind(name)
            .fetch_optional::<BodyRow>()
            .await?;

        row.map(|row| -> Result<StoredDocument> {
            let document = serde_json::from_str(&row.body)
                .with_context(|| format!("document '{}' in {} is not a JSON object", name, scope))?;
            Ok(StoredDocument {
                document,
                revision: Revision(row.revision),
            })
        })
        .transpose()
    }

    async fn insert_row(&self, row: &DocumentRow) -> Result<()> {
        let mut insert = self.client.insert("documents")?;
        insert.write(row).await?;
        insert.end().await?;
        Ok(())
    }

    async fn conditional_insert(
        &self,
        scope: &CollectionRef,
        name: &str,
        document: Document,
        expected: Option<Revision>,
    ) -> Result<std::result::Result<Revision, StoreError>> {
        let _guard = self.write_lock.lock().await;

        let found = self.current_revision(scope, name).await?;
        if found != expected {
            return Ok(Err(StoreError::RevisionMismatch {
                name: name.to_string(),
                expected,
                found,
            }));
        }

        let revision = Revision(found.map_or(1, |r| r.0 + 1));
        let row = DocumentRow {
            database: scope.database.clone(),
            collection: scope.collection.clone(),
            name: name.to_string(),
            revision: revision.0,
            body: serde_json::to_string(&document)?,
        };
        self.insert_row(&row).await?;
        debug!("Wrote {} in {} at revision {}", name, scope, revision.0);

        Ok(Ok(revision))
    }

    async fn names(&self, sql: &str, binds: &[&str]) -> Result<Vec<String>> {
        let mut query = self.client.query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all::<NameRow>().await?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }

    async fn documents(&self, scope: &CollectionRef) -> Result<Vec<Document>> {
        let rows = self
            .client
            .query(
                "SELECT revision, body FROM documents FINAL
                 WHERE database = ? AND collection = ?
                 ORDER BY name",
            )
            .bind(&scope.database)
            .bind(&scope.collection)
            .fetch_all::<BodyRow>()
            .await?;

        rows.into_iter()
            .map(|row| {
                serde_json::from_str(&row.body)
                    .with_context(|| format!("document in {} is not a JSON object", scope))
            })
            .collect()
    }
}

#[async_trait]
impl DocumentStore for ClickHouseStore {
    async fn find_by_name(
        &self,
        scope: &CollectionRef,
        name: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.fetch_document(scope, name).await?)
    }

    async fn upsert(
        &self,
        scope: &CollectionRef,
        name: &str,
        document: Document,
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        self.conditional_insert(scope, name, document, expected).await?
    }

    async fn list_names(&self, scope: &CollectionRef) -> Result<BTreeSet<String>, StoreError> {
        let names = self
            .names(
                "SELECT DISTINCT name FROM documents FINAL
                 WHERE database = ? AND collection = ?",
                &[scope.database.as_str(), scope.collection.as_str()],
            )
            .await?;
        Ok(names.into_iter().collect())
    }

    async fn list_documents(&self, scope: &CollectionRef) -> Result<Vec<Document>, StoreError> {
        Ok(self.documents(scope).await?)
    }

    async fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        let names = self
            .names(
                "SELECT DISTINCT database AS name FROM documents FINAL ORDER BY name",
                &[],
            )
            .await?;
        Ok(names
            .into_iter()
            .filter(|name| !self.excluded_databases.contains(name))
            .collect())
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .names(
                "SELECT DISTINCT collection AS name FROM documents FINAL
                 WHERE database = ? ORDER BY name",
                &[database],
            )
            .await?)
    }

    fn name(&self) -> &str {
        "clickhouse"
    }
}
