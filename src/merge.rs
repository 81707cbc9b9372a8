//! Create-vs-update decisions for histogram and file-list records.
//!
//! Everything here is synchronous and free of I/O: the caller fetches the
//! stored record, asks the engine what the new record should be, and persists
//! the result. Validation always completes before a record is produced.

use crate::error::{Error, Result, StoredRecord};
use crate::filelist::{parse_files, FileList};
use crate::histogram::{Histogram, NamePolicy, RecordError, HISTORY_FIELD};
use serde_json::Value;

/// The record to persist, and whether it merged into an existing one
#[derive(Debug, Clone, PartialEq)]
pub struct Upsert<T> {
    pub record: T,
    pub updated: bool,
}

/// Validate a client payload as a new histogram.
///
/// Clients may not set `history`; it is owned by the engine.
pub fn parse_incoming_histogram(payload: &Value) -> std::result::Result<Histogram, RecordError> {
    if let Value::Object(map) = payload {
        if map.contains_key(HISTORY_FIELD) {
            return Err(RecordError::HistoryNotAllowed);
        }
    }
    Histogram::from_value(payload)
}

/// Validate a client payload as a list of file names
pub fn parse_incoming_files(payload: &Value) -> std::result::Result<Vec<String>, RecordError> {
    parse_files(payload)
}

/// Decide the histogram to store given what is already stored.
///
/// - nothing stored: the incoming record, history seeded with `now`
/// - stored, `update` unset: `Error::Conflict` with the stored record untouched
/// - stored, `update` set: the stored record with `incoming` accumulated into it
pub fn upsert_histogram(
    incoming: Histogram,
    existing: Option<Histogram>,
    update: bool,
    now: f64,
) -> Result<Upsert<Histogram>> {
    if incoming.has_history() {
        return Err(RecordError::HistoryNotAllowed.into());
    }

    let Some(mut stored) = existing else {
        let mut record = incoming;
        record.add_to_history_at(now, false);
        return Ok(Upsert {
            record,
            updated: false,
        });
    };

    if !update {
        return Err(Error::Conflict {
            name: stored.name().to_string(),
            existing: Box::new(StoredRecord::Histogram(stored)),
        });
    }

    if !stored.is_comparable(&incoming, NamePolicy::Require) {
        return Err(Error::Incompatible {
            name: stored.name().to_string(),
            reason: format!(
                "stored binning is [{}, {}] x {} bins, incoming is [{}, {}] x {} bins",
                stored.xmin().as_f64(),
                stored.xmax().as_f64(),
                stored.bin_values().len(),
                incoming.xmin().as_f64(),
                incoming.xmax().as_f64(),
                incoming.bin_values().len(),
            ),
        });
    }

    stored.merge_from_at(&incoming, now);
    Ok(Upsert {
        record: stored,
        updated: true,
    })
}

/// Decide the file list to store given what is already stored.
///
/// Updates take the sorted union of both lists, so re-posting the same files
/// leaves `files` unchanged; the history still grows by one entry.
pub fn upsert_filelist(
    incoming: Vec<String>,
    existing: Option<FileList>,
    update: bool,
    now: f64,
) -> Result<Upsert<FileList>> {
    let Some(mut stored) = existing else {
        let mut record = FileList::new(incoming);
        record.add_to_history_at(now, false);
        return Ok(Upsert {
            record,
            updated: false,
        });
    };

    if !update {
        return Err(Error::Conflict {
            name: "files".to_string(),
            existing: Box::new(StoredRecord::FileList(stored)),
        });
    }

    stored.extend(incoming);
    stored.add_to_history_at(now, true);
    Ok(Upsert {
        record: stored,
        updated: true,
    })
}
