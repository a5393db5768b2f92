//! Parameter distributions a trial can sample from.

use mltb_types::{ParamValue, StudyError, StudyResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Distribution {
    /// Continuous uniform range [low, high).
    Uniform { low: f64, high: f64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Uniform over `low, low + q, ...` up to `high`.
    DiscreteUniform { low: f64, high: f64, q: f64 },
    /// Integer range [low, high] inclusive, on a `step` grid or in log-space.
    Int {
        low: i64,
        high: i64,
        step: i64,
        log: bool,
    },
    /// Categorical choices.
    Categorical { choices: Vec<ParamValue> },
}

impl Distribution {
    /// Reject malformed ranges before anything is sampled.
    pub fn validate(&self, name: &str) -> StudyResult<()> {
        let invalid = |message: String| -> StudyResult<()> {
            Err(StudyError::InvalidDistribution {
                name: name.to_string(),
                message,
            })
        };

        match self {
            Self::Uniform { low, high } => {
                if !(low.is_finite() && high.is_finite()) || low > high {
                    return invalid(format!("low={low} must be <= high={high}"));
                }
            }
            Self::LogUniform { low, high } => {
                if !(low.is_finite() && high.is_finite()) || low > high {
                    return invalid(format!("low={low} must be <= high={high}"));
                }
                if *low <= 0.0 {
                    return invalid(format!("low={low} must be positive for log sampling"));
                }
            }
            Self::DiscreteUniform { low, high, q } => {
                if !(low.is_finite() && high.is_finite()) || low > high {
                    return invalid(format!("low={low} must be <= high={high}"));
                }
                if *q <= 0.0 || !q.is_finite() {
                    return invalid(format!("q={q} must be positive"));
                }
            }
            Self::Int {
                low,
                high,
                step,
                log,
            } => {
                if low > high {
                    return invalid(format!("low={low} must be <= high={high}"));
                }
                if *step < 1 {
                    return invalid(format!("step={step} must be >= 1"));
                }
                if *log && (*low < 1 || *step != 1) {
                    return invalid("log sampling needs low >= 1 and step == 1".to_string());
                }
            }
            Self::Categorical { choices } => {
                if choices.is_empty() {
                    return invalid("choices must not be empty".to_string());
                }
            }
        }
        Ok(())
    }

    /// Whether `value` could have been drawn from this distribution.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (Self::Uniform { low, high }, ParamValue::Float(v))
            | (Self::LogUniform { low, high }, ParamValue::Float(v))
            | (Self::DiscreteUniform { low, high, .. }, ParamValue::Float(v)) => {
                *v >= *low && *v <= *high
            }
            (
                Self::Int {
                    low, high, step, ..
                },
                ParamValue::Int(v),
            ) => {
                *v >= *low
                    && *v <= *high
                    && (i128::from(*v) - i128::from(*low)) % i128::from(*step) == 0
            }
            (Self::Categorical { choices }, v) => choices.contains(v),
            _ => false,
        }
    }

    /// Draw one value.
    ///
    /// Callers validate first; degenerate ranges (`low == high`) return `low`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamValue {
        match self {
            Self::Uniform { low, high } => {
                if low >= high {
                    ParamValue::Float(*low)
                } else {
                    ParamValue::Float(rng.random_range(*low..*high))
                }
            }
            Self::LogUniform { low, high } => {
                if low >= high {
                    return ParamValue::Float(*low);
                }
                let log_low = low.ln();
                let log_high = high.ln();
                let log_val: f64 = rng.random_range(log_low..log_high);
                ParamValue::Float(log_val.exp().clamp(*low, *high))
            }
            Self::DiscreteUniform { low, high, q } => {
                let n = ((high - low) / q + 1e-9).floor() as i64;
                let k: i64 = rng.random_range(0..=n.max(0));
                ParamValue::Float((low + k as f64 * q).min(*high))
            }
            Self::Int {
                low,
                high,
                step,
                log,
            } => {
                if *log {
                    let log_low = (*low as f64 - 0.5).ln();
                    let log_high = (*high as f64 + 0.5).ln();
                    let log_val: f64 = rng.random_range(log_low..log_high);
                    let v = log_val.exp().round() as i64;
                    ParamValue::Int(v.clamp(*low, *high))
                } else {
                    // i128 keeps the span of the full i64 range representable.
                    let (low, step) = (i128::from(*low), i128::from(*step));
                    let n = (i128::from(*high) - low) / step;
                    let k: i128 = rng.random_range(0..=n);
                    ParamValue::Int((low + k * step) as i64)
                }
            }
            Self::Categorical { choices } => {
                let idx = rng.random_range(0..choices.len());
                choices[idx].clone()
            }
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform { low, high } => {
                write!(f, "UniformDistribution(high={high:?}, low={low:?})")
            }
            Self::LogUniform { low, high } => {
                write!(f, "LogUniformDistribution(high={high:?}, low={low:?})")
            }
            Self::DiscreteUniform { low, high, q } => write!(
                f,
                "DiscreteUniformDistribution(high={high:?}, low={low:?}, q={q:?})"
            ),
            Self::Int {
                low,
                high,
                step,
                log,
            } => {
                if *log {
                    write!(f, "IntLogUniformDistribution(high={high}, low={low}, step={step})")
                } else {
                    write!(f, "IntUniformDistribution(high={high}, low={low}, step={step})")
                }
            }
            Self::Categorical { choices } => {
                let rendered: Vec<String> = choices
                    .iter()
                    .map(|c| match c {
                        ParamValue::Str(s) => format!("'{s}'"),
                        other => other.to_string(),
                    })
                    .collect();
                write!(f, "CategoricalDistribution(choices=({}))", rendered.join(", "))
            }
        }
    }
}
