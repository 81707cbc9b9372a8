use crate::filelist::FileList;
use crate::histogram::{Histogram, RecordError};
use crate::traits::StoreError;
use thiserror::Error;

/// The record already in the store when a write was refused
#[derive(Debug, Clone, PartialEq)]
pub enum StoredRecord {
    Histogram(Histogram),
    FileList(FileList),
}

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or mistyped field, reserved name, or client-supplied history
    #[error(transparent)]
    Validation(#[from] RecordError),

    /// The record exists and no update was requested
    #[error("{name} already in collection")]
    Conflict {
        name: String,
        existing: Box<StoredRecord>,
    },

    /// The incoming record cannot be merged into the stored one
    #[error("histogram '{name}' cannot be merged: {reason}")]
    Incompatible { name: String, reason: String },

    /// Another writer changed the record between our read and write
    #[error("{name} was modified concurrently, re-read and retry")]
    Stale { name: String },

    #[error("{kind} not found ({name})")]
    NotFound { kind: &'static str, name: String },

    /// A stored document no longer passes validation
    #[error("stored record '{name}' is invalid: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: RecordError,
    },

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, Error>;
