//! Histogram comparison: precondition checks, then the configured test battery.
//!
//! Preconditions short-circuit in a fixed order and report a single entry. Once
//! they pass, each enabled test runs in isolation: an error, a non-finite
//! statistic, a panic or (in the async variant) a timeout only affects that
//! test's own entry.

use crate::compare_config::{ComparisonConfig, StatTest};
use crate::histogram::Histogram;
use crate::metrics::{self, Statistic};
use futures::future::join_all;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

pub const BOTH_EMPTY: &str = "both_empty";
pub const COMPARABLE: &str = "comparable";
pub const IDENTITY: &str = "identity";
pub const SINGLE_BIN: &str = "single_bin";
pub const INSUFFICIENT_STATISTICS: &str = "insufficient_statistics";

/// Result of one precondition or test
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestOutcome {
    #[serde(rename = "T", skip_serializing_if = "Option::is_none", default)]
    pub statistic: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pvalue: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exception: Option<String>,
}

impl TestOutcome {
    pub fn pvalue(pvalue: f64) -> Self {
        Self {
            pvalue: Some(pvalue),
            ..Default::default()
        }
    }

    /// A test that could not produce a statistic
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            statistic: None,
            pvalue: Some(0.0),
            exception: Some(message.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.exception.is_some()
    }
}

impl From<Statistic> for TestOutcome {
    fn from(statistic: Statistic) -> Self {
        Self {
            statistic: Some(statistic.value),
            pvalue: statistic.pvalue,
            exception: None,
        }
    }
}

/// Outcomes keyed by precondition or test name
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Comparison(BTreeMap<String, TestOutcome>);

impl Comparison {
    fn single(key: &str, outcome: TestOutcome) -> Self {
        let mut map = BTreeMap::new();
        map.insert(key.to_string(), outcome);
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&TestOutcome> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TestOutcome)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, TestOutcome> {
        self.0
    }
}

fn nonzero_bins(values: &[f64]) -> usize {
    values.iter().filter(|v| **v != 0.0).count()
}

fn common_nonzero_bins(u: &[f64], v: &[f64]) -> usize {
    u.iter().zip(v).filter(|(a, b)| **a > 0.0 && **b > 0.0).count()
}

/// The short-circuit entry for `h1`/`h2`, or `None` when the tests should run
pub fn check_preconditions(
    h1: &Histogram,
    h2: &Histogram,
    config: &ComparisonConfig,
) -> Option<Comparison> {
    let u = h1.values_f64();
    let v = h2.values_f64();
    let comparable = h1.is_comparable(h2, config.name_policy);

    let empty = |values: &[f64]| !values.iter().any(|x| *x > 0.0);
    if empty(&u) && empty(&v) {
        let pvalue = if comparable { 1.0 } else { 0.0 };
        return Some(Comparison::single(BOTH_EMPTY, TestOutcome::pvalue(pvalue)));
    }

    if !comparable {
        return Some(Comparison::single(COMPARABLE, TestOutcome::pvalue(0.0)));
    }

    if u == v {
        return Some(Comparison::single(IDENTITY, TestOutcome::pvalue(1.0)));
    }

    // both single-bin and not identical
    if nonzero_bins(&u) == 1 && nonzero_bins(&v) == 1 {
        return Some(Comparison::single(SINGLE_BIN, TestOutcome::pvalue(0.0)));
    }

    if common_nonzero_bins(&u, &v) < config.min_common_bins {
        return Some(Comparison::single(
            INSUFFICIENT_STATISTICS,
            TestOutcome::pvalue(0.0),
        ));
    }

    None
}

/// Bin contents as handed to the tests.
///
/// With `rescale`, the histogram with the larger total is scaled down to the
/// smaller total. Only the returned copies change.
pub fn prepared_bins(h1: &Histogram, h2: &Histogram, rescale: bool) -> (Vec<f64>, Vec<f64>) {
    let mut u = h1.values_f64();
    let mut v = h2.values_f64();
    if !rescale {
        return (u, v);
    }

    let nu: f64 = u.iter().sum();
    let nv: f64 = v.iter().sum();
    if nu > 0.0 && nv > 0.0 && nu != nv {
        let (larger, factor) = if nu > nv {
            (&mut u, nv / nu)
        } else {
            (&mut v, nu / nv)
        };
        larger.iter_mut().for_each(|x| *x *= factor);
    }
    (u, v)
}

fn run_isolated(test: StatTest, u: &[f64], v: &[f64]) -> TestOutcome {
    match catch_unwind(AssertUnwindSafe(|| metrics::run(test, u, v))) {
        Ok(Ok(statistic)) => statistic.into(),
        Ok(Err(e)) => {
            debug!("{} failed: {}", test.key(), e);
            TestOutcome::failed(e.to_string())
        }
        Err(_) => {
            warn!("{} panicked", test.key());
            TestOutcome::failed(format!("{} panicked", test.key()))
        }
    }
}

/// Compare two histograms with the tests enabled in `config`
pub fn compare(h1: &Histogram, h2: &Histogram, config: &ComparisonConfig) -> Comparison {
    if let Some(short_circuit) = check_preconditions(h1, h2, config) {
        return short_circuit;
    }

    let (u, v) = prepared_bins(h1, h2, config.rescale);
    Comparison(
        config
            .tests
            .iter()
            .map(|test| (test.key().to_string(), run_isolated(*test, &u, &v)))
            .collect(),
    )
}

/// Like [`compare`], with every test on a blocking worker bounded by
/// `config.test_timeout`.
///
/// A test that overruns is reported as failed straight away. Blocking workers
/// cannot be cancelled, so its worker still runs to completion in the blocking
/// pool and the result is dropped.
pub async fn compare_with_timeout(
    h1: &Histogram,
    h2: &Histogram,
    config: &ComparisonConfig,
) -> Comparison {
    if let Some(short_circuit) = check_preconditions(h1, h2, config) {
        return short_circuit;
    }

    let (u, v) = prepared_bins(h1, h2, config.rescale);
    let bins = Arc::new((u, v));
    let timeout = config.test_timeout;

    let runs = config.tests.iter().copied().map(|test| {
        let bins = Arc::clone(&bins);
        async move {
            let task = tokio::task::spawn_blocking(move || metrics::run(test, &bins.0, &bins.1));
            let outcome = match tokio::time::timeout(timeout, task).await {
                Ok(Ok(Ok(statistic))) => statistic.into(),
                Ok(Ok(Err(e))) => TestOutcome::failed(e.to_string()),
                Ok(Err(join_error)) => {
                    warn!("{} worker failed: {}", test.key(), join_error);
                    TestOutcome::failed(format!("{} panicked", test.key()))
                }
                Err(_) => {
                    warn!("{} timed out after {:?}", test.key(), timeout);
                    TestOutcome::failed(format!("timed out after {}ms", timeout.as_millis()))
                }
            };
            (test.key().to_string(), outcome)
        }
    });

    Comparison(join_all(runs).await.into_iter().collect())
}

/// Compare every histogram of collection `a` with its namesake in `b`.
///
/// Names present on one side only are reported as not comparable.
pub fn compare_collections(
    a: &[Histogram],
    b: &[Histogram],
    config: &ComparisonConfig,
) -> BTreeMap<String, Comparison> {
    let left: BTreeMap<&str, &Histogram> = a.iter().map(|h| (h.name(), h)).collect();
    let right: BTreeMap<&str, &Histogram> = b.iter().map(|h| (h.name(), h)).collect();
    let names: BTreeSet<&str> = left.keys().chain(right.keys()).copied().collect();
    let names: Vec<&str> = names.into_iter().collect();

    names
        .par_iter()
        .map(|name| {
            let comparison = match (left.get(name), right.get(name)) {
                (Some(h1), Some(h2)) => compare(h1, h2, config),
                _ => Comparison::single(COMPARABLE, TestOutcome::pvalue(0.0)),
            };
            (name.to_string(), comparison)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Num;
    use std::time::Duration;

    fn histogram(name: &str, bins: &[i64]) -> Histogram {
        Histogram::new(
            name,
            10,
            0,
            0,
            0,
            0,
            bins.iter().map(|b| Num::Int(*b)).collect(),
        )
        .unwrap()
    }

    fn gaussian() -> Vec<i64> {
        vec![2, 5, 11, 20, 31, 40, 31, 20, 11, 5, 2, 1]
    }

    fn shifted() -> Vec<i64> {
        vec![1, 2, 5, 11, 20, 31, 40, 31, 20, 11, 5, 2]
    }

    #[test]
    fn test_both_empty() {
        let config = ComparisonConfig::default();
        let a = histogram("h", &[0, 0, 0]);
        let b = histogram("h", &[0, 0, 0]);
        let result = compare(&a, &b, &config);
        assert_eq!(result.len(), 1);
        assert_eq!(result.get(BOTH_EMPTY).unwrap().pvalue, Some(1.0));

        let c = histogram("other", &[0, 0, 0]);
        let result = compare(&a, &c, &config);
        assert_eq!(result.get(BOTH_EMPTY).unwrap().pvalue, Some(0.0));
    }

    #[test]
    fn test_not_comparable() {
        let config = ComparisonConfig::default();
        let a = histogram("h", &gaussian());
        let b = histogram("h", &[1, 2, 3]);
        let result = compare(&a, &b, &config);
        assert_eq!(result.keys().collect::<Vec<_>>(), vec![COMPARABLE]);
        assert_eq!(result.get(COMPARABLE).unwrap().pvalue, Some(0.0));
    }

    #[test]
    fn test_identity() {
        let config = ComparisonConfig::default();
        let a = histogram("h", &gaussian());
        let result = compare(&a, &a.clone(), &config);
        assert_eq!(result.get(IDENTITY).unwrap().pvalue, Some(1.0));
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_single_bin() {
        let config = ComparisonConfig::default();
        let a = histogram("h", &[0, 5, 0]);
        let b = histogram("h", &[0, 0, 7]);
        let result = compare(&a, &b, &config);
        assert_eq!(result.get(SINGLE_BIN).unwrap().pvalue, Some(0.0));
    }

    #[test]
    fn test_common_bins_boundary() {
        let config = ComparisonConfig::default();
        let mut ten = vec![3; 10];
        ten.extend([0, 0]);
        let mut other = vec![4; 10];
        other.extend([0, 0]);
        let result = compare(&histogram("h", &ten), &histogram("h", &other), &config);
        assert!(result.contains(INSUFFICIENT_STATISTICS));

        let eleven_a = [3; 11];
        let eleven_b = [4; 11];
        let result = compare(&histogram("h", &eleven_a), &histogram("h", &eleven_b), &config);
        assert!(!result.contains(INSUFFICIENT_STATISTICS));
        assert_eq!(result.len(), config.tests.len());
    }

    #[test]
    fn test_runs_enabled_tests() {
        let config = ComparisonConfig::dashboard();
        let result = compare(
            &histogram("h", &gaussian()),
            &histogram("h", &shifted()),
            &config,
        );
        assert_eq!(
            result.keys().collect::<Vec<_>>(),
            vec!["anderson_darling", "ks", "shape_chisq"]
        );
        for (_, outcome) in result.iter() {
            assert!(!outcome.is_failure());
            assert!(outcome.statistic.is_some());
        }
    }

    #[test]
    fn test_failing_test_is_isolated() {
        let config = ComparisonConfig::exhaustive();
        let a = histogram("h", &[600; 12]);
        let mut bins = vec![700; 12];
        bins[0] = 650;
        let b = histogram("h", &bins);

        let result = compare(&a, &b, &config);
        let llh = result.get("llh_value").unwrap();
        assert_eq!(llh.pvalue, Some(0.0));
        assert!(llh.exception.is_some());
        assert!(!result.get("ks").unwrap().is_failure());
    }

    #[test]
    fn test_rescale_leaves_inputs_alone() {
        let a = histogram("h", &gaussian());
        let b_bins: Vec<i64> = shifted().iter().map(|x| x * 3).collect();
        let b = histogram("h", &b_bins);
        let before = (a.clone(), b.clone());

        let (u, v) = prepared_bins(&a, &b, true);
        assert!((u.iter().sum::<f64>() - v.iter().sum::<f64>()).abs() < 1e-9);
        assert_eq!(u, a.values_f64());
        assert_eq!((a, b), before);
    }

    #[test]
    fn test_serialized_shape() {
        let outcome = TestOutcome::failed("boom");
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({"pvalue": 0.0, "exception": "boom"})
        );
        let outcome = TestOutcome::from(Statistic {
            value: 1.5,
            pvalue: None,
        });
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({"T": 1.5})
        );
    }

    #[test]
    fn test_compare_collections() {
        let config = ComparisonConfig::default();
        let a = vec![histogram("x", &gaussian()), histogram("only_a", &gaussian())];
        let b = vec![histogram("x", &gaussian()), histogram("only_b", &shifted())];

        let results = compare_collections(&a, &b, &config);
        assert_eq!(results.len(), 3);
        assert!(results["x"].contains(IDENTITY));
        assert_eq!(results["only_a"].get(COMPARABLE).unwrap().pvalue, Some(0.0));
        assert!(results["only_b"].contains(COMPARABLE));
    }

    #[tokio::test]
    async fn test_compare_with_timeout_matches_sync() {
        let config = ComparisonConfig::default().with_test_timeout(Duration::from_secs(5));
        let a = histogram("h", &gaussian());
        let b = histogram("h", &shifted());

        let sync = compare(&a, &b, &config);
        let bounded = compare_with_timeout(&a, &b, &config).await;
        assert_eq!(sync, bounded);
    }
}
