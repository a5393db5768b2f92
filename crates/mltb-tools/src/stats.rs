//! Small-sample statistics.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::BTreeMap;

/// Outcome of an independent two-sample t-test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TTestResult {
    pub statistic: f64,
    /// Two-sided p-value. NaN when the test is undefined.
    pub pvalue: f64,
}

/// Arithmetic mean, NaN for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Unbiased sample variance (n - 1 denominator), NaN below two samples.
pub fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

/// Student's t-test for two independent samples with pooled variance.
pub fn ttest_ind(a: &[f64], b: &[f64]) -> TTestResult {
    let n1 = a.len() as f64;
    let n2 = b.len() as f64;
    let df = n1 + n2 - 2.0;
    if a.is_empty() || b.is_empty() || df <= 0.0 {
        return TTestResult {
            statistic: f64::NAN,
            pvalue: f64::NAN,
        };
    }

    // A single observation contributes no spread but still counts toward df.
    let ss = |values: &[f64]| -> f64 {
        let m = mean(values);
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>()
    };
    let pooled = (ss(a) + ss(b)) / df;
    let se = (pooled * (1.0 / n1 + 1.0 / n2)).sqrt();
    let statistic = (mean(a) - mean(b)) / se;
    if statistic.is_nan() {
        return TTestResult {
            statistic,
            pvalue: f64::NAN,
        };
    }

    TTestResult {
        statistic,
        pvalue: student_t_two_sided(statistic, df),
    }
}

/// Run [`ttest_ind`] on every unordered pair of entries.
///
/// Keys are paired in map order, so `{a, b, c}` yields `(a, b)`, `(a, c)`
/// and `(b, c)`.
pub fn ttest_combinations(values: &BTreeMap<String, Vec<f64>>) -> BTreeMap<(String, String), f64> {
    let entries: Vec<(&String, &Vec<f64>)> = values.iter().collect();
    let mut result = BTreeMap::new();
    for (i, (key_0, values_0)) in entries.iter().enumerate() {
        for (key_1, values_1) in &entries[i + 1..] {
            let pvalue = ttest_ind(values_0, values_1).pvalue;
            result.insert(((*key_0).clone(), (*key_1).clone()), pvalue);
        }
    }
    result
}

/// P(|T| >= |t|) for Student's t distribution with `df` degrees of freedom.
fn student_t_two_sided(t: f64, df: f64) -> f64 {
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => (2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0),
        Err(_) => f64::NAN,
    }
}
