use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::ops::Add;
use thiserror::Error;

/// Name reserved for the per-collection file-list record
pub const FILELIST_NAME: &str = "filelist";

/// Fields every histogram document must carry
pub const MANDATORY_FIELDS: [&str; 7] = [
    "name",
    "xmax",
    "xmin",
    "overflow",
    "underflow",
    "nan_count",
    "bin_values",
];

pub const HISTORY_FIELD: &str = "history";

/// Validation failures for histogram and file-list documents
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("histogram has missing field '{0}'")]
    MissingField(String),
    #[error("field '{field}' should be {expected}, not {found}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("histogram cannot be named 'filelist'")]
    ReservedName,
    #[error("histogram cannot define the field 'history'")]
    HistoryNotAllowed,
    #[error("expected a JSON object, not {0}")]
    NotAnObject(&'static str),
}

impl RecordError {
    /// The offending field, when the error is about one
    pub fn field(&self) -> Option<&str> {
        match self {
            RecordError::MissingField(field) | RecordError::WrongType { field, .. } => Some(field),
            RecordError::ReservedName => Some("name"),
            RecordError::HistoryNotAllowed => Some(HISTORY_FIELD),
            RecordError::NotAnObject(_) => None,
        }
    }
}

/// A JSON number that remembers whether it was written as an integer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    pub fn from_value(value: &Value) -> Option<Num> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(Num::Int)
                .or_else(|| n.as_f64().map(Num::Float)),
            _ => None,
        }
    }
}

impl Add for Num {
    type Output = Num;

    fn add(self, rhs: Num) -> Num {
        match (self, rhs) {
            (Num::Int(a), Num::Int(b)) => a
                .checked_add(b)
                .map(Num::Int)
                .unwrap_or(Num::Float(a as f64 + b as f64)),
            (a, b) => Num::Float(a.as_f64() + b.as_f64()),
        }
    }
}

impl From<i64> for Num {
    fn from(value: i64) -> Self {
        Num::Int(value)
    }
}

impl From<f64> for Num {
    fn from(value: f64) -> Self {
        Num::Float(value)
    }
}

/// Current wall-clock time as fractional epoch seconds
pub fn now_epoch() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Append-only list of write timestamps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History(Vec<Num>);

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// History of a record written for the first time at `timestamp`
    pub fn seeded(timestamp: f64) -> Self {
        Self(vec![Num::Float(timestamp)])
    }

    /// Append `timestamp`; an empty history is first back-filled with the
    /// `0.0` sentinel when `pseudo_first` is set.
    pub fn record_at(&mut self, timestamp: f64, pseudo_first: bool) {
        if self.0.is_empty() && pseudo_first {
            self.0.push(Num::Float(0.0));
        }
        self.0.push(Num::Float(timestamp));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Num] {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.0.iter().map(|n| num_to_value(*n)).collect())
    }

    pub(crate) fn from_value(field: &str, value: &Value) -> Result<Self, RecordError> {
        numeric_array(field, value).map(History)
    }
}

impl From<Vec<Num>> for History {
    fn from(values: Vec<Num>) -> Self {
        Self(values)
    }
}

/// Whether `name` equality is part of the comparability check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamePolicy {
    #[default]
    Require,
    Ignore,
}

/// A typed value for one of the known histogram fields
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FieldValue {
    Name(String),
    Bound(Num),
    Counter(i64),
    Bins(Vec<Num>),
    History(History),
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn wrong_type(field: &str, expected: &'static str, value: &Value) -> RecordError {
    RecordError::WrongType {
        field: field.to_string(),
        expected,
        found: kind_of(value),
    }
}

fn numeric_array(field: &str, value: &Value) -> Result<Vec<Num>, RecordError> {
    let items = value
        .as_array()
        .ok_or_else(|| wrong_type(field, "an array of numbers", value))?;
    items
        .iter()
        .map(|item| Num::from_value(item).ok_or_else(|| wrong_type(field, "an array of numbers", item)))
        .collect()
}

fn num_to_value(num: Num) -> Value {
    match num {
        Num::Int(i) => Value::from(i),
        Num::Float(f) => Value::from(f),
    }
}

fn parse_name(value: &Value) -> Result<String, RecordError> {
    let name = value.as_str().ok_or_else(|| wrong_type("name", "a string", value))?;
    if name == FILELIST_NAME {
        return Err(RecordError::ReservedName);
    }
    Ok(name.to_string())
}

fn parse_bound(key: &str, value: &Value) -> Result<Num, RecordError> {
    Num::from_value(value).ok_or_else(|| wrong_type(key, "a number", value))
}

fn parse_counter(key: &str, value: &Value) -> Result<i64, RecordError> {
    value.as_i64().ok_or_else(|| wrong_type(key, "an integer", value))
}

/// Type-check `value` for the histogram field `key`.
///
/// Returns `Ok(None)` for keys that are not known histogram fields; those are
/// kept as extension attributes.
pub(crate) fn validate_field(key: &str, value: &Value) -> Result<Option<FieldValue>, RecordError> {
    let typed = match key {
        "name" => FieldValue::Name(parse_name(value)?),
        "xmax" | "xmin" => FieldValue::Bound(parse_bound(key, value)?),
        "overflow" | "underflow" | "nan_count" => FieldValue::Counter(parse_counter(key, value)?),
        "bin_values" => FieldValue::Bins(numeric_array(key, value)?),
        HISTORY_FIELD => FieldValue::History(History::from_value(key, value)?),
        _ => return Ok(None),
    };
    Ok(Some(typed))
}

/// A named, fixed-binning histogram with write history and extension fields
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    name: String,
    xmax: Num,
    xmin: Num,
    overflow: i64,
    underflow: i64,
    nan_count: i64,
    bin_values: Vec<Num>,
    history: Option<History>,
    extra: Map<String, Value>,
}

impl Histogram {
    pub fn new(
        name: impl Into<String>,
        xmax: impl Into<Num>,
        xmin: impl Into<Num>,
        overflow: i64,
        underflow: i64,
        nan_count: i64,
        bin_values: Vec<Num>,
    ) -> Result<Self, RecordError> {
        let name = name.into();
        if name == FILELIST_NAME {
            return Err(RecordError::ReservedName);
        }
        Ok(Self {
            name,
            xmax: xmax.into(),
            xmin: xmin.into(),
            overflow,
            underflow,
            nan_count,
            bin_values,
            history: None,
            extra: Map::new(),
        })
    }

    /// Build a histogram from a document.
    ///
    /// All seven mandatory fields must be present and well typed. A `history`
    /// field is validated and kept; any other key becomes an extension field.
    pub fn from_dict(dict: &Map<String, Value>) -> Result<Self, RecordError> {
        if let Some(missing) = MANDATORY_FIELDS.iter().find(|key| !dict.contains_key(**key)) {
            return Err(RecordError::MissingField(missing.to_string()));
        }

        let mut histogram = Histogram::new(
            parse_name(&dict["name"])?,
            parse_bound("xmax", &dict["xmax"])?,
            parse_bound("xmin", &dict["xmin"])?,
            parse_counter("overflow", &dict["overflow"])?,
            parse_counter("underflow", &dict["underflow"])?,
            parse_counter("nan_count", &dict["nan_count"])?,
            numeric_array("bin_values", &dict["bin_values"])?,
        )?;

        for (key, value) in dict {
            if !MANDATORY_FIELDS.contains(&key.as_str()) {
                histogram.set(key, value.clone())?;
            }
        }
        Ok(histogram)
    }

    /// Like [`Histogram::from_dict`] but for an arbitrary JSON value
    pub fn from_value(value: &Value) -> Result<Self, RecordError> {
        match value {
            Value::Object(map) => Self::from_dict(map),
            other => Err(RecordError::NotAnObject(kind_of(other))),
        }
    }

    /// All attributes, extension fields included, minus the keys in `exclude`
    pub fn to_dict(&self, exclude: &[&str]) -> Map<String, Value> {
        let mut dict = Map::new();
        dict.insert("name".into(), Value::from(self.name.clone()));
        dict.insert("xmax".into(), num_to_value(self.xmax));
        dict.insert("xmin".into(), num_to_value(self.xmin));
        dict.insert("overflow".into(), Value::from(self.overflow));
        dict.insert("underflow".into(), Value::from(self.underflow));
        dict.insert("nan_count".into(), Value::from(self.nan_count));
        dict.insert(
            "bin_values".into(),
            Value::Array(self.bin_values.iter().map(|n| num_to_value(*n)).collect()),
        );
        if let Some(history) = &self.history {
            dict.insert(HISTORY_FIELD.into(), history.to_value());
        }
        for (key, value) in &self.extra {
            dict.insert(key.clone(), value.clone());
        }

        for key in exclude {
            dict.remove(*key);
        }
        dict
    }

    /// Set any attribute by key. Known fields go through validation.
    ///
    /// Replacing `bin_values` with a different length makes the histogram
    /// incompatible with its stored namesake; callers check
    /// [`Histogram::is_comparable`] before merging.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), RecordError> {
        match validate_field(key, &value)? {
            Some(FieldValue::Name(name)) => self.name = name,
            Some(FieldValue::Bound(bound)) if key == "xmax" => self.xmax = bound,
            Some(FieldValue::Bound(bound)) => self.xmin = bound,
            Some(FieldValue::Counter(count)) => match key {
                "overflow" => self.overflow = count,
                "underflow" => self.underflow = count,
                _ => self.nan_count = count,
            },
            Some(FieldValue::Bins(bins)) => self.bin_values = bins,
            Some(FieldValue::History(history)) => self.history = Some(history),
            None => {
                self.extra.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), RecordError> {
        self.set("name", Value::String(name.into()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn xmax(&self) -> Num {
        self.xmax
    }

    pub fn xmin(&self) -> Num {
        self.xmin
    }

    pub fn overflow(&self) -> i64 {
        self.overflow
    }

    pub fn underflow(&self) -> i64 {
        self.underflow
    }

    pub fn nan_count(&self) -> i64 {
        self.nan_count
    }

    pub fn bin_values(&self) -> &[Num] {
        &self.bin_values
    }

    /// Write timestamps, empty for records that never tracked them
    pub fn history(&self) -> &[Num] {
        self.history.as_ref().map(History::as_slice).unwrap_or(&[])
    }

    pub fn has_history(&self) -> bool {
        self.history.is_some()
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// Sum of all bin contents
    pub fn total(&self) -> f64 {
        self.bin_values.iter().map(|n| n.as_f64()).sum()
    }

    pub fn values_f64(&self) -> Vec<f64> {
        self.bin_values.iter().map(|n| n.as_f64()).collect()
    }

    /// Width of a single bin; zero when the axis is degenerate or there are no bins
    pub fn bin_width(&self) -> f64 {
        if self.bin_values.is_empty() {
            return 0.0;
        }
        (self.xmax.as_f64() - self.xmin.as_f64()) / self.bin_values.len() as f64
    }

    /// Plot positions for the bins: `xmin + i * (xmax - xmin) / nbins`
    pub fn bin_centers(&self) -> Vec<f64> {
        let xmin = self.xmin.as_f64();
        let width = self.bin_width();
        (0..self.bin_values.len())
            .map(|i| xmin + i as f64 * width)
            .collect()
    }

    /// Same binning (and, under `NamePolicy::Require`, the same name)
    pub fn is_comparable(&self, other: &Histogram, policy: NamePolicy) -> bool {
        let same_name = match policy {
            NamePolicy::Require => self.name == other.name,
            NamePolicy::Ignore => true,
        };
        same_name
            && self.xmin.as_f64() == other.xmin.as_f64()
            && self.xmax.as_f64() == other.xmax.as_f64()
            && self.bin_values.len() == other.bin_values.len()
    }

    pub fn add_to_history(&mut self, pseudo_first: bool) {
        self.add_to_history_at(now_epoch(), pseudo_first);
    }

    pub fn add_to_history_at(&mut self, timestamp: f64, pseudo_first: bool) {
        self.history
            .get_or_insert_with(History::new)
            .record_at(timestamp, pseudo_first);
    }

    /// Accumulate `other` into this histogram
    pub fn merge_from(&mut self, other: &Histogram) {
        self.merge_from_at(other, now_epoch());
    }

    /// Accumulate `other` into this histogram, recording the write at `timestamp`.
    ///
    /// Bins and the three counters are summed. Every other attribute carried
    /// by `other` (its history aside) replaces ours. The history grows by
    /// exactly one entry.
    ///
    /// Both histograms must have the same number of bins.
    pub fn merge_from_at(&mut self, other: &Histogram, timestamp: f64) {
        debug_assert_eq!(
            self.bin_values.len(),
            other.bin_values.len(),
            "merging histograms with different binning"
        );
        self.bin_values = self
            .bin_values
            .iter()
            .zip(&other.bin_values)
            .map(|(a, b)| *a + *b)
            .collect();
        self.overflow = self.overflow.saturating_add(other.overflow);
        self.underflow = self.underflow.saturating_add(other.underflow);
        self.nan_count = self.nan_count.saturating_add(other.nan_count);

        self.name = other.name.clone();
        self.xmax = other.xmax;
        self.xmin = other.xmin;
        for (key, value) in &other.extra {
            self.extra.insert(key.clone(), value.clone());
        }

        self.add_to_history_at(timestamp, true);
    }
}

impl Serialize for Histogram {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_dict(&[]).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Histogram {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let dict = Map::deserialize(deserializer)?;
        Histogram::from_dict(&dict).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn sample() -> Histogram {
        Histogram::new(
            "test",
            10,
            0,
            5,
            3,
            12,
            vec![0.into(), 2.into(), 4.into(), 5.into(), 9.into(), 8.into(), 5.into()],
        )
        .unwrap()
    }

    #[test]
    fn test_basic_fields() {
        let histogram = sample();
        assert_eq!(histogram.name(), "test");
        assert_eq!(histogram.xmax(), Num::Int(10));
        assert_eq!(histogram.overflow(), 5);
        assert_eq!(histogram.underflow(), 3);
        assert_eq!(histogram.nan_count(), 12);
        assert_eq!(histogram.total(), 33.0);
        assert!(histogram.history().is_empty());
    }

    #[test]
    fn test_reserved_name() {
        let err = Histogram::new("filelist", 0, 0, 0, 0, 0, vec![]).unwrap_err();
        assert_eq!(err, RecordError::ReservedName);

        let mut histogram = sample();
        assert_eq!(histogram.set_name("filelist"), Err(RecordError::ReservedName));
        assert_eq!(histogram.name(), "test");
    }

    #[test]
    fn test_round_trip_with_extras() {
        let dict = as_map(json!({
            "name": "test",
            "xmax": 100.1,
            "xmin": 0.023,
            "overflow": 5,
            "underflow": 3,
            "nan_count": 12,
            "bin_values": [0, 2, 4.02, 5, 9.486, 8, 5],
            "history": [10.25, 300],
            "extra_value": "extra",
            "expression": {"nested": [1, 2]}
        }));

        let histogram = Histogram::from_dict(&dict).unwrap();
        assert_eq!(histogram.bin_values()[2], Num::Float(4.02));
        assert_eq!(histogram.bin_values()[1], Num::Int(2));
        assert_eq!(histogram.to_dict(&[]), dict);
    }

    #[test]
    fn test_round_trip_without_history() {
        let dict = as_map(json!({
            "name": "h", "xmax": 1, "xmin": -1, "overflow": 0,
            "underflow": 0, "nan_count": 0, "bin_values": [1, 2]
        }));
        let histogram = Histogram::from_dict(&dict).unwrap();
        assert!(!histogram.has_history());
        assert_eq!(histogram.to_dict(&[]), dict);
    }

    #[test]
    fn test_to_dict_exclude() {
        let mut histogram = Histogram::new("test", 0, 0, 0, 0, 0, vec![]).unwrap();
        histogram.set("extra", json!(5)).unwrap();
        histogram.set("addl", json!(["a"])).unwrap();
        histogram.set("keeps", json!(2.0)).unwrap();

        let dict = histogram.to_dict(&["extra", "addl"]);
        assert!(!dict.contains_key("extra"));
        assert!(!dict.contains_key("addl"));
        assert_eq!(dict["keeps"], json!(2.0));
        assert_eq!(histogram.extra()["extra"], json!(5));
    }

    #[test]
    fn test_missing_field() {
        let dict = as_map(json!({
            "name": "h", "xmax": 1, "xmin": -1, "overflow": 0,
            "underflow": 0, "bin_values": [1, 2]
        }));
        let err = Histogram::from_dict(&dict).unwrap_err();
        assert_eq!(err, RecordError::MissingField("nan_count".to_string()));
        assert_eq!(err.field(), Some("nan_count"));
    }

    #[test]
    fn test_wrong_types() {
        let base = json!({
            "name": "h", "xmax": 1, "xmin": -1, "overflow": 0,
            "underflow": 0, "nan_count": 0, "bin_values": [1, 2]
        });

        for (field, bad) in [
            ("name", json!(7)),
            ("xmax", json!("1")),
            ("overflow", json!(1.5)),
            ("bin_values", json!([1, "two"])),
            ("bin_values", json!(3)),
            ("history", json!([1, null])),
        ] {
            let mut dict = as_map(base.clone());
            dict.insert(field.to_string(), bad);
            let err = Histogram::from_dict(&dict).unwrap_err();
            assert_eq!(err.field(), Some(field), "{err}");
        }
    }

    #[test]
    fn test_add_to_history() {
        let mut histogram = sample();
        histogram.add_to_history_at(100.0, false);
        assert_eq!(histogram.history(), &[Num::Float(100.0)]);

        let mut legacy = sample();
        legacy.add_to_history_at(100.0, true);
        assert_eq!(legacy.history(), &[Num::Float(0.0), Num::Float(100.0)]);

        legacy.add_to_history_at(200.0, true);
        assert_eq!(legacy.history().len(), 3);
    }

    #[test]
    fn test_merge() {
        let mut first = sample();
        first.add_to_history_at(1.0, false);
        let mut second = sample();
        second.set("expression", json!("cos(x)")).unwrap();
        second.set("overflow", json!(1)).unwrap();

        first.merge_from_at(&second, 2.0);

        assert_eq!(first.bin_values()[4], Num::Int(18));
        assert_eq!(first.overflow(), 6);
        assert_eq!(first.underflow(), 6);
        assert_eq!(first.nan_count(), 24);
        assert_eq!(first.extra()["expression"], json!("cos(x)"));
        assert_eq!(first.history(), &[Num::Float(1.0), Num::Float(2.0)]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "different binning")]
    fn test_merge_rejects_rebinned() {
        let mut first = sample();
        let mut second = sample();
        second.set("bin_values", json!([1, 2])).unwrap();
        first.merge_from_at(&second, 2.0);
    }

    #[test]
    fn test_num_addition_keeps_kind() {
        assert_eq!(Num::Int(2) + Num::Int(3), Num::Int(5));
        assert_eq!(Num::Int(2) + Num::Float(0.5), Num::Float(2.5));
        assert_eq!(Num::Int(i64::MAX) + Num::Int(1), Num::Float(i64::MAX as f64 + 1.0));
    }

    #[test]
    fn test_bin_centers() {
        let histogram = Histogram::new("h", 10, 0, 0, 0, 0, vec![1.into(); 5]).unwrap();
        assert_eq!(histogram.bin_centers(), vec![0.0, 2.0, 4.0, 6.0, 8.0]);

        let flat = Histogram::new("h", 1, 1, 0, 0, 0, vec![1.into(); 3]).unwrap();
        assert_eq!(flat.bin_width(), 0.0);
    }

    #[test]
    fn test_comparable_name_policy() {
        let a = sample();
        let mut b = sample();
        b.set_name("other").unwrap();
        assert!(!a.is_comparable(&b, NamePolicy::Require));
        assert!(a.is_comparable(&b, NamePolicy::Ignore));

        b.set("xmax", json!(10.0)).unwrap();
        assert!(a.is_comparable(&b, NamePolicy::Ignore));

        b.set("bin_values", json!([1, 2])).unwrap();
        assert!(!a.is_comparable(&b, NamePolicy::Ignore));
    }

    #[test]
    fn test_serde_uses_dict_form() {
        let mut histogram = sample();
        histogram.set("expression", json!("x")).unwrap();
        let text = serde_json::to_string(&histogram).unwrap();
        let back: Histogram = serde_json::from_str(&text).unwrap();
        assert_eq!(back, histogram);

        let err = serde_json::from_str::<Histogram>(r#"{"name": "filelist"}"#);
        assert!(err.is_err());
    }
}
