use crate::histogram::{kind_of, History, RecordError, FILELIST_NAME, HISTORY_FIELD};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// The reserved per-collection record listing contributing source files
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileList {
    files: BTreeSet<String>,
    history: History,
}

impl FileList {
    pub fn new<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            history: History::new(),
        }
    }

    /// Files in ascending order, without duplicates
    pub fn files(&self) -> Vec<String> {
        self.files.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, file: &str) -> bool {
        self.files.contains(file)
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Union `files` into the list
    pub fn extend<I, S>(&mut self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files.extend(files.into_iter().map(Into::into));
    }

    pub fn add_to_history_at(&mut self, timestamp: f64, pseudo_first: bool) {
        self.history.record_at(timestamp, pseudo_first);
    }

    /// Read a stored file-list document.
    ///
    /// Older collections may lack `files` or `history`; both read as empty.
    pub fn from_document(document: &Map<String, Value>) -> Result<Self, RecordError> {
        let files = match document.get("files") {
            Some(value) => parse_files(value)?,
            None => Vec::new(),
        };
        let history = match document.get(HISTORY_FIELD) {
            Some(value) => History::from_value(HISTORY_FIELD, value)?,
            None => History::new(),
        };
        Ok(Self {
            files: files.into_iter().collect(),
            history,
        })
    }

    /// Document shape: `{name: "filelist", files: [...], history: [...]}`
    pub fn to_document(&self) -> Map<String, Value> {
        let mut document = Map::new();
        document.insert("name".into(), Value::from(FILELIST_NAME));
        document.insert(
            "files".into(),
            Value::Array(self.files.iter().cloned().map(Value::String).collect()),
        );
        document.insert(HISTORY_FIELD.into(), self.history.to_value());
        document
    }
}

/// Type-check a `files` value: an array of strings
pub fn parse_files(value: &Value) -> Result<Vec<String>, RecordError> {
    let wrong_type = |found: &Value| RecordError::WrongType {
        field: "files".to_string(),
        expected: "an array of strings",
        found: kind_of(found),
    };

    value
        .as_array()
        .ok_or_else(|| wrong_type(value))?
        .iter()
        .map(|item| item.as_str().map(str::to_string).ok_or_else(|| wrong_type(item)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Num;
    use serde_json::json;

    #[test]
    fn test_files_sorted_and_unique() {
        let list = FileList::new(["c.i3", "a.i3", "c.i3", "b.i3"]);
        assert_eq!(list.files(), vec!["a.i3", "b.i3", "c.i3"]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_extend_is_union() {
        let mut list = FileList::new(["a", "b"]);
        list.extend(["b", "c"]);
        list.extend(["b", "c"]);
        assert_eq!(list.files(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_legacy_document() {
        let document = json!({"name": "filelist", "files": ["z", "y"]});
        let list = FileList::from_document(document.as_object().unwrap()).unwrap();
        assert!(list.history().is_empty());
        assert_eq!(list.files(), vec!["y", "z"]);

        let empty = FileList::from_document(&Map::new()).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_document_round_trip() {
        let mut list = FileList::new(["a", "b"]);
        list.add_to_history_at(5.0, false);
        let document = list.to_document();
        assert_eq!(
            Value::Object(document.clone()),
            json!({"name": "filelist", "files": ["a", "b"], "history": [5.0]})
        );
        assert_eq!(FileList::from_document(&document).unwrap(), list);
        assert_eq!(list.history().as_slice(), &[Num::Float(5.0)]);
    }

    #[test]
    fn test_parse_files_rejects_non_strings() {
        let err = parse_files(&json!(["a", 3])).unwrap_err();
        assert_eq!(err.field(), Some("files"));
        assert!(err.to_string().ends_with("not integer"), "{}", err);

        let err = parse_files(&json!(["a", 1.5])).unwrap_err();
        assert!(err.to_string().ends_with("not float"), "{}", err);
        assert!(parse_files(&json!("a")).is_err());
    }
}
