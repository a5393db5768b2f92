//! Repeated, parallel evaluation of a function over a parameter map.

use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use tracing::info;

/// How much progress to report while calls run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    /// One line per parameter entry once all of its calls are done.
    #[default]
    Summary,
    /// One line per call including its result.
    Detailed,
}

/// Call `function` `iterations` times for each value in `params`.
///
/// Calls run in parallel on the global rayon pool. The result has the same
/// keys as `params`; each value holds one result per call, in call order.
pub fn multi_param_call<K, P, R, F>(
    function: F,
    params: &BTreeMap<K, P>,
    iterations: usize,
    verbosity: Verbosity,
) -> BTreeMap<K, Vec<R>>
where
    K: Ord + Clone + Display + Sync + Send,
    P: Sync,
    R: Debug + Send,
    F: Fn(&P) -> R + Sync,
{
    let jobs: Vec<(&K, &P, usize)> = params
        .iter()
        .flat_map(|(key, value)| (0..iterations).map(move |i| (key, value, i)))
        .collect();
    let total = jobs.len();

    let outputs: Vec<(K, R)> = jobs
        .into_par_iter()
        .map(|(key, value, i)| {
            let result = function(value);
            if verbosity == Verbosity::Detailed {
                info!(
                    "Done with iteration {} of {} for {}. Result: {:?}",
                    i + 1,
                    iterations,
                    key,
                    result
                );
            }
            (key.clone(), result)
        })
        .collect();

    let mut grouped: BTreeMap<K, Vec<R>> = BTreeMap::new();
    for (key, result) in outputs {
        grouped.entry(key).or_default().push(result);
    }

    if verbosity != Verbosity::Quiet {
        for key in grouped.keys() {
            info!("Done with {}", key);
        }
        info!(calls = total, "multi_param_call finished");
    }

    grouped
}

/// Like [`multi_param_call`] for functions returning several named results.
///
/// The outer map is keyed by result name, the inner map by parameter key.
pub fn multi_param_call_map<K, P, R, F>(
    function: F,
    params: &BTreeMap<K, P>,
    iterations: usize,
    verbosity: Verbosity,
) -> BTreeMap<String, BTreeMap<K, Vec<R>>>
where
    K: Ord + Clone + Display + Sync + Send,
    P: Sync,
    R: Debug + Send,
    F: Fn(&P) -> BTreeMap<String, R> + Sync,
{
    let per_key = multi_param_call(function, params, iterations, verbosity);

    let mut result: BTreeMap<String, BTreeMap<K, Vec<R>>> = BTreeMap::new();
    for (key, calls) in per_key {
        for named_results in calls {
            for (name, value) in named_results {
                result
                    .entry(name)
                    .or_default()
                    .entry(key.clone())
                    .or_default()
                    .push(value);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn scalar_results_are_grouped_per_key() {
        let mut params = BTreeMap::new();
        params.insert("small".to_string(), 2);
        params.insert("large".to_string(), 10);

        let calls = AtomicUsize::new(0);
        let result = multi_param_call(
            |p: &i32| {
                calls.fetch_add(1, Ordering::SeqCst);
                p * 3
            },
            &params,
            4,
            Verbosity::Quiet,
        );

        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert_eq!(result["small"], vec![6, 6, 6, 6]);
        assert_eq!(result["large"], vec![30, 30, 30, 30]);
    }

    #[test]
    fn zero_iterations_yield_empty_result() {
        let mut params = BTreeMap::new();
        params.insert(1u32, "a");
        let result = multi_param_call(|p: &&str| p.len(), &params, 0, Verbosity::Detailed);
        assert!(result.is_empty());
    }

    #[test]
    fn named_results_are_nested_by_name_then_key() {
        let mut params = BTreeMap::new();
        params.insert("lr_0.1".to_string(), 0.1);
        params.insert("lr_0.01".to_string(), 0.01);

        let result = multi_param_call_map(
            |lr: &f64| {
                let mut out = BTreeMap::new();
                out.insert("loss".to_string(), lr * 2.0);
                out.insert("acc".to_string(), 1.0 - lr);
                out
            },
            &params,
            3,
            Verbosity::Summary,
        );

        assert_eq!(result.len(), 2);
        assert_eq!(result["loss"]["lr_0.1"], vec![0.2, 0.2, 0.2]);
        assert_eq!(result["acc"]["lr_0.01"].len(), 3);
    }
}
