//! Two-sample consistency tests for binned data.
//!
//! Every test takes the bin contents of two histograms with identical binning
//! and returns a test statistic, plus a p-value when the statistic has a known
//! reference distribution. The formulas follow F. Porter, "Testing Consistency
//! of Two Histograms" (arXiv:0804.0380).

use crate::compare_config::StatTest;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricError {
    #[error("histogram has no entries")]
    EmptyHistogram,
    #[error("bin counts differ ({left} vs {right})")]
    LengthMismatch { left: usize, right: usize },
    #[error("{test} produced a non-finite statistic ({value})")]
    NonFinite { test: &'static str, value: f64 },
    #[error("reference distribution: {0}")]
    Distribution(String),
}

/// Test statistic with its p-value, when one is defined
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Statistic {
    pub value: f64,
    pub pvalue: Option<f64>,
}

impl Statistic {
    fn bare(value: f64) -> Self {
        Self { value, pvalue: None }
    }
}

/// Run `test` on the bin contents `u` and `v`
pub fn run(test: StatTest, u: &[f64], v: &[f64]) -> Result<Statistic, MetricError> {
    if u.len() != v.len() {
        return Err(MetricError::LengthMismatch {
            left: u.len(),
            right: v.len(),
        });
    }

    let statistic = match test {
        StatTest::ShapeChisq => shape_chisq(u, v)?,
        StatTest::NormChisq => norm_chisq(u, v)?,
        StatTest::KolmogorovSmirnov => kolmogorov_smirnov(u, v)?,
        StatTest::AndersonDarling => anderson_darling(u, v),
        StatTest::CramerVonMises => cramer_von_mises(u, v)?,
        StatTest::LlhRatio => llh_ratio(u, v)?,
        StatTest::LlhValue => llh_value(u, v),
        StatTest::Bhattacharyya => bhattacharyya(u, v),
    };

    if !statistic.value.is_finite() {
        return Err(MetricError::NonFinite {
            test: test.key(),
            value: statistic.value,
        });
    }
    Ok(statistic)
}

fn total(bins: &[f64]) -> f64 {
    bins.iter().sum()
}

/// Upper tail of the chi-square distribution with `dof` degrees of freedom
fn chisq_sf(statistic: f64, dof: usize) -> Result<Option<f64>, MetricError> {
    if dof == 0 {
        return Ok(None);
    }
    let dist = ChiSquared::new(dof as f64).map_err(|e| MetricError::Distribution(e.to_string()))?;
    Ok(Some(dist.sf(statistic)))
}

/// Chi-square on the normalised shapes, summed over bins filled in both
///
/// When either total is zero both sides are put on a single scale, which
/// reduces to the raw-count form (u - v)^2 / (u + v).
/// Degrees of freedom: nbins - 1.
pub fn shape_chisq(u: &[f64], v: &[f64]) -> Result<Statistic, MetricError> {
    let n1 = total(u);
    let n2 = total(v);
    let filled = u.iter().zip(v).filter(|(a, b)| **a > 0.0 && **b > 0.0);

    let value: f64 = if n1 == 0.0 || n2 == 0.0 {
        filled.map(|(a, b)| (a - b).powi(2) / (a + b)).sum()
    } else {
        let n1sq = n1 * n1;
        let n2sq = n2 * n2;
        filled
            .map(|(a, b)| (a / n1 - b / n2).powi(2) / (a / n1sq + b / n2sq))
            .sum()
    };

    Ok(Statistic {
        value,
        pvalue: chisq_sf(value, u.len().saturating_sub(1))?,
    })
}

/// Chi-square on the raw contents, summed over bins filled in both
///
/// Degrees of freedom: nbins.
pub fn norm_chisq(u: &[f64], v: &[f64]) -> Result<Statistic, MetricError> {
    let value: f64 = u
        .iter()
        .zip(v)
        .filter(|(a, b)| **a > 0.0 && **b > 0.0)
        .map(|(a, b)| (a - b).powi(2) / (a + b))
        .sum();

    Ok(Statistic {
        value,
        pvalue: chisq_sf(value, u.len())?,
    })
}

/// Asymptotic Kolmogorov distribution, Q_KS(lambda)
fn kolmogorov_q(lambda: f64) -> f64 {
    const EPS1: f64 = 1e-3;
    const EPS2: f64 = 1e-8;

    let a2 = -2.0 * lambda * lambda;
    let mut fac = 2.0;
    let mut sum = 0.0;
    let mut previous = 0.0;

    for j in 1..=100 {
        let j = j as f64;
        let term = fac * (a2 * j * j).exp();
        sum += term;
        if term.abs() <= EPS1 * previous || term.abs() <= EPS2 * sum {
            return sum.clamp(0.0, 1.0);
        }
        fac = -fac;
        previous = term.abs();
    }
    // no convergence: lambda is tiny and the distributions are indistinguishable
    1.0
}

/// Largest distance between the two cumulative distributions
pub fn kolmogorov_smirnov(u: &[f64], v: &[f64]) -> Result<Statistic, MetricError> {
    let nu = total(u);
    let nv = total(v);
    if nu == 0.0 || nv == 0.0 {
        return Err(MetricError::EmptyHistogram);
    }

    let mut cu = 0.0;
    let mut cv = 0.0;
    let mut distance: f64 = 0.0;
    for (a, b) in u.iter().zip(v) {
        cu += a;
        cv += b;
        distance = distance.max((cu / nu - cv / nv).abs());
    }

    let ne = nu * nv / (nu + nv);
    let sqrt_ne = ne.sqrt();
    let lambda = (sqrt_ne + 0.12 + 0.11 / sqrt_ne) * distance;

    Ok(Statistic {
        value: distance,
        pvalue: Some(kolmogorov_q(lambda)),
    })
}

/// Anderson-Darling statistic for binned samples. Zero when either side is empty.
pub fn anderson_darling(u: &[f64], v: &[f64]) -> Statistic {
    let nu = total(u);
    let nv = total(v);
    if nu == 0.0 || nv == 0.0 {
        return Statistic::bare(0.0);
    }

    let n = nu + nv;
    let mut sigma_j = 0.0;
    let mut sigma_uj = 0.0;
    let mut sigma_vj = 0.0;
    let mut result = 0.0;

    for (&a, &b) in u.iter().zip(v) {
        if a == 0.0 && b == 0.0 {
            continue;
        }
        let t = a + b;
        sigma_uj += a;
        sigma_vj += b;
        sigma_j += t;

        let denom = sigma_j * (n - sigma_j);
        if denom == 0.0 {
            continue;
        }
        let term_u = (n * sigma_uj - nu * sigma_j).powi(2) / nu;
        let term_v = (n * sigma_vj - nv * sigma_j).powi(2) / nv;
        result += t * (term_u + term_v) / denom;
    }

    Statistic::bare(result / n)
}

/// Cramer-von Mises statistic over the per-bin ECDF difference
pub fn cramer_von_mises(u: &[f64], v: &[f64]) -> Result<Statistic, MetricError> {
    let nu = total(u);
    let nv = total(v);
    if nu == 0.0 && nv == 0.0 {
        return Ok(Statistic::bare(0.0));
    }
    if nu == 0.0 || nv == 0.0 {
        return Err(MetricError::EmptyHistogram);
    }

    // ECDF up to, not including, the current bin
    let mut below_u = 0.0;
    let mut below_v = 0.0;
    let mut result = 0.0;
    for (&a, &b) in u.iter().zip(v) {
        let diff = below_u / nu - below_v / nv;
        result += (a + b) * diff * diff;
        below_u += a;
        below_v += b;
    }

    Ok(Statistic::bare(nu * nv / (nu + nv).powi(2) * result))
}

/// Binomial likelihood ratio, -2 ln(lambda)
///
/// Degrees of freedom: nbins - 1.
pub fn llh_ratio(u: &[f64], v: &[f64]) -> Result<Statistic, MetricError> {
    let nu = total(u);
    let nv = total(v);
    if nu == 0.0 && nv == 0.0 {
        return Ok(Statistic::bare(1.0));
    }
    if nu == 0.0 || nv == 0.0 {
        return Ok(Statistic::bare(0.0));
    }

    let n = nu + nv;
    let mut log_ratio = 0.0;
    for (&a, &b) in u.iter().zip(v) {
        let t = a + b;
        log_ratio += match (a == 0.0, b == 0.0) {
            (true, true) => 0.0,
            (true, false) => t * (nv / n).ln(),
            (false, true) => t * (nu / n).ln(),
            (false, false) => a * (nu * t / (n * a)).ln() + b * (nv * t / (n * b)).ln(),
        };
    }

    let value = -2.0 * log_ratio;
    Ok(Statistic {
        value,
        pvalue: chisq_sf(value.max(0.0), u.len().saturating_sub(1))?,
    })
}

/// Negative log-likelihood of `v` given the pooled bins.
///
/// The binomial coefficient is evaluated directly and overflows once a bin
/// holds more than about a thousand entries, turning the statistic infinite.
/// `run` reports that as `MetricError::NonFinite`.
pub fn llh_value(u: &[f64], v: &[f64]) -> Statistic {
    let nu = total(u);
    let nv = total(v);
    if nu == 0.0 && nv == 0.0 {
        return Statistic::bare(0.0);
    }

    let mut result = 0.0;
    for (&a, &b) in u.iter().zip(v) {
        let t = a + b;
        let binom = (ln_gamma(t + 1.0) - ln_gamma(b + 1.0) - ln_gamma(a + 1.0)).exp();
        result += binom.ln() + t * (nu / (nu + nv)).ln() + b * (nv / nu).ln();
    }
    Statistic::bare(-result)
}

/// Bhattacharyya distance measure, sqrt(sum u*v) / sqrt(N_u * N_v)
///
/// 1.0 if either histogram is empty.
pub fn bhattacharyya(u: &[f64], v: &[f64]) -> Statistic {
    let nu = total(u);
    let nv = total(v);
    if nu == 0.0 || nv == 0.0 {
        return Statistic::bare(1.0);
    }

    let dot: f64 = u.iter().zip(v).map(|(a, b)| a * b).sum();
    Statistic::bare(dot.sqrt() / (nu * nv).sqrt())
}
