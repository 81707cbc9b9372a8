use crate::histogram::NamePolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Statistical tests the comparison engine can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatTest {
    ShapeChisq,
    NormChisq,
    KolmogorovSmirnov,
    AndersonDarling,
    CramerVonMises,
    LlhRatio,
    /// Produces `-inf` for moderate bin contents; never enabled by default
    LlhValue,
    Bhattacharyya,
}

impl StatTest {
    pub const ALL: [StatTest; 8] = [
        StatTest::ShapeChisq,
        StatTest::NormChisq,
        StatTest::KolmogorovSmirnov,
        StatTest::AndersonDarling,
        StatTest::CramerVonMises,
        StatTest::LlhRatio,
        StatTest::LlhValue,
        StatTest::Bhattacharyya,
    ];

    /// Key under which the test's outcome is reported
    pub fn key(self) -> &'static str {
        match self {
            StatTest::ShapeChisq => "shape_chisq",
            StatTest::NormChisq => "norm_chisq",
            StatTest::KolmogorovSmirnov => "ks",
            StatTest::AndersonDarling => "anderson_darling",
            StatTest::CramerVonMises => "cramer_von_mises",
            StatTest::LlhRatio => "llh_ratio",
            StatTest::LlhValue => "llh_value",
            StatTest::Bhattacharyya => "bdm",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonConfig {
    pub tests: BTreeSet<StatTest>,
    pub name_policy: NamePolicy,
    /// Scale the larger histogram down to the smaller total before testing
    pub rescale: bool,
    /// Bins that must be non-zero in both histograms for the tests to run
    pub min_common_bins: usize,
    /// Per-test bound for `compare_with_timeout`
    pub test_timeout: Duration,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            tests: StatTest::ALL
                .into_iter()
                .filter(|t| !matches!(t, StatTest::NormChisq | StatTest::LlhValue))
                .collect(),
            name_policy: NamePolicy::Require,
            rescale: true,
            min_common_bins: 11,
            test_timeout: Duration::from_secs(10),
        }
    }
}

impl ComparisonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The dashboard's rotation: shape chi-square, KS and Anderson-Darling
    pub fn dashboard() -> Self {
        Self {
            tests: [
                StatTest::ShapeChisq,
                StatTest::KolmogorovSmirnov,
                StatTest::AndersonDarling,
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        }
    }

    /// Every test, the unreliable ones included
    pub fn exhaustive() -> Self {
        Self {
            tests: StatTest::ALL.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_test(mut self, test: StatTest) -> Self {
        self.tests.insert(test);
        self
    }

    pub fn without_test(mut self, test: StatTest) -> Self {
        self.tests.remove(&test);
        self
    }

    pub fn with_name_policy(mut self, policy: NamePolicy) -> Self {
        self.name_policy = policy;
        self
    }

    pub fn with_rescale(mut self, enabled: bool) -> Self {
        self.rescale = enabled;
        self
    }

    pub fn with_min_common_bins(mut self, bins: usize) -> Self {
        self.min_common_bins = bins;
        self
    }

    pub fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }
}
