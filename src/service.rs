//! Read-merge-write orchestration over a [`DocumentStore`].
//!
//! Every write reads the stored record together with its revision, lets the
//! merge engine decide the new record, and writes it back conditionally on
//! that revision. A writer that loses the race gets `Error::Conflict` (lost
//! insert) or `Error::Stale` (lost update) and is expected to retry.

use crate::compare::{self, Comparison};
use crate::compare_config::ComparisonConfig;
use crate::error::{Error, Result, StoredRecord};
use crate::filelist::FileList;
use crate::histogram::{now_epoch, Histogram, RecordError, FILELIST_NAME};
use crate::merge::{self, Upsert};
use crate::traits::{CollectionRef, Document, DocumentStore, Revision, StoreError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct HistogramService {
    store: Arc<dyn DocumentStore>,
}

fn is_filelist(document: &Document) -> bool {
    document.get("name").and_then(Value::as_str) == Some(FILELIST_NAME)
}

fn decode_histogram(name: &str, document: &Document) -> Result<Histogram> {
    Histogram::from_dict(document).map_err(|source| Error::Corrupt {
        name: name.to_string(),
        source,
    })
}

impl HistogramService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    pub async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.store.list_databases().await?)
    }

    pub async fn list_collections(&self, database: &str) -> Result<Vec<String>> {
        Ok(self.store.list_collections(database).await?)
    }

    /// Names of the histograms in a collection, the file list excluded
    pub async fn histogram_names(&self, scope: &CollectionRef) -> Result<Vec<String>> {
        let names = self.store.list_names(scope).await?;
        Ok(names.into_iter().filter(|n| n != FILELIST_NAME).collect())
    }

    /// Every histogram in a collection, ordered by name
    pub async fn histograms(&self, scope: &CollectionRef) -> Result<Vec<Histogram>> {
        let documents = self.store.list_documents(scope).await?;
        documents
            .iter()
            .filter(|document| !is_filelist(document))
            .map(|document| {
                let name = document.get("name").and_then(Value::as_str).unwrap_or("<unnamed>");
                decode_histogram(name, document)
            })
            .collect()
    }

    async fn stored_histogram(
        &self,
        scope: &CollectionRef,
        name: &str,
    ) -> Result<Option<(Histogram, Revision)>> {
        match self.store.find_by_name(scope, name).await? {
            Some(stored) => Ok(Some((decode_histogram(name, &stored.document)?, stored.revision))),
            None => Ok(None),
        }
    }

    pub async fn find_histogram(&self, scope: &CollectionRef, name: &str) -> Result<Histogram> {
        if name == FILELIST_NAME {
            return Err(RecordError::ReservedName.into());
        }
        self.stored_histogram(scope, name)
            .await?
            .map(|(histogram, _)| histogram)
            .ok_or_else(|| Error::NotFound {
                kind: "histogram",
                name: name.to_string(),
            })
    }

    /// Validate `payload` and create or merge the histogram it describes
    pub async fn post_histogram(
        &self,
        scope: &CollectionRef,
        payload: &Value,
        update: bool,
    ) -> Result<Upsert<Histogram>> {
        let incoming = merge::parse_incoming_histogram(payload)?;
        let name = incoming.name().to_string();

        let stored = self.stored_histogram(scope, &name).await?;
        let expected = stored.as_ref().map(|(_, revision)| *revision);
        let outcome = merge::upsert_histogram(incoming, stored.map(|(h, _)| h), update, now_epoch())?;

        match self
            .store
            .upsert(scope, &name, outcome.record.to_dict(&[]), expected)
            .await
        {
            Ok(revision) => {
                debug!(
                    "{} histogram '{}' in {} (revision {})",
                    if outcome.updated { "Merged" } else { "Created" },
                    name,
                    scope,
                    revision.0
                );
                Ok(outcome)
            }
            Err(StoreError::RevisionMismatch { .. }) if expected.is_none() => {
                warn!("Lost insert race for '{}' in {}", name, scope);
                match self.stored_histogram(scope, &name).await? {
                    Some((existing, _)) => Err(Error::Conflict {
                        name,
                        existing: Box::new(StoredRecord::Histogram(existing)),
                    }),
                    None => Err(Error::Stale { name }),
                }
            }
            Err(StoreError::RevisionMismatch { .. }) => {
                warn!("Lost update race for '{}' in {}", name, scope);
                Err(Error::Stale { name })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stored_filelist(&self, scope: &CollectionRef) -> Result<Option<(FileList, Revision)>> {
        match self.store.find_by_name(scope, FILELIST_NAME).await? {
            Some(stored) => {
                let list = FileList::from_document(&stored.document).map_err(|source| Error::Corrupt {
                    name: FILELIST_NAME.to_string(),
                    source,
                })?;
                Ok(Some((list, stored.revision)))
            }
            None => Ok(None),
        }
    }

    /// The collection's file list; empty when none was ever posted
    pub async fn find_filelist(&self, scope: &CollectionRef) -> Result<FileList> {
        Ok(self
            .stored_filelist(scope)
            .await?
            .map(|(list, _)| list)
            .unwrap_or_default())
    }

    /// Validate `files` and create or extend the collection's file list
    pub async fn post_files(
        &self,
        scope: &CollectionRef,
        files: &Value,
        update: bool,
    ) -> Result<Upsert<FileList>> {
        let incoming = merge::parse_incoming_files(files)?;

        let stored = self.stored_filelist(scope).await?;
        let expected = stored.as_ref().map(|(_, revision)| *revision);
        let outcome = merge::upsert_filelist(incoming, stored.map(|(l, _)| l), update, now_epoch())?;

        match self
            .store
            .upsert(scope, FILELIST_NAME, outcome.record.to_document(), expected)
            .await
        {
            Ok(_) => {
                debug!("Stored {} files in {}", outcome.record.len(), scope);
                Ok(outcome)
            }
            Err(StoreError::RevisionMismatch { .. }) if expected.is_none() => {
                match self.stored_filelist(scope).await? {
                    Some((existing, _)) => Err(Error::Conflict {
                        name: "files".to_string(),
                        existing: Box::new(StoredRecord::FileList(existing)),
                    }),
                    None => Err(Error::Stale {
                        name: FILELIST_NAME.to_string(),
                    }),
                }
            }
            Err(StoreError::RevisionMismatch { .. }) => Err(Error::Stale {
                name: FILELIST_NAME.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Compare histogram `name` between two collections
    pub async fn compare_histogram(
        &self,
        scope: &CollectionRef,
        reference: &CollectionRef,
        name: &str,
        config: &ComparisonConfig,
    ) -> Result<Comparison> {
        let current = self.find_histogram(scope, name).await?;
        let baseline = self.find_histogram(reference, name).await?;
        Ok(compare::compare_with_timeout(&current, &baseline, config).await)
    }

    /// Compare every histogram of `scope` with its namesake in `reference`
    pub async fn compare_collections(
        &self,
        scope: &CollectionRef,
        reference: &CollectionRef,
        config: &ComparisonConfig,
    ) -> Result<BTreeMap<String, Comparison>> {
        let current = self.histograms(scope).await?;
        let baseline = self.histograms(reference).await?;
        let config = config.clone();

        let results = tokio::task::spawn_blocking(move || {
            compare::compare_collections(&current, &baseline, &config)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("comparison worker failed: {}", e)))?;

        info!(
            "Compared {} histograms between {} and {}",
            results.len(),
            scope,
            reference
        );
        Ok(results)
    }
}
