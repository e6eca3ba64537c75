//! Sweep level summaries over reconciled job states and parsed results.
//!
//! The aggregation is generic over the configuration and status types so it
//! does not need to know how the runner models either of them.

use hplsweep_ingest::ParsedResult;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// One job of a sweep as seen by the aggregator
#[derive(Debug, Clone)]
pub struct SweepEntry<'a, C, S> {
    pub configuration: &'a C,
    /// last status written to the record store
    pub persisted: S,
    /// status from a fresh reconciliation, preferred over `persisted`
    pub reconciled: Option<S>,
    pub result: Option<&'a ParsedResult>,
}

impl<'a, C, S> SweepEntry<'a, C, S> {
    pub fn status(&self) -> &S {
        self.reconciled.as_ref().unwrap_or(&self.persisted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BestResult<'a, C> {
    pub configuration: &'a C,
    pub result: &'a ParsedResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary<'a, C, S: Ord> {
    pub jobs: usize,
    pub histogram: BTreeMap<S, usize>,
    pub best: Option<BestResult<'a, C>>,
    pub passed: usize,
    pub failed: usize,
    pub incomplete: usize,
}

impl<'a, C, S: Ord> SweepSummary<'a, C, S> {
    pub fn count(&self, status: &S) -> usize {
        self.histogram.get(status).copied().unwrap_or(0)
    }
}

/// Summarize a sweep
///
/// The best result is the one with the highest throughput, earlier entries win
/// ties. Entries without a throughput are never considered.
pub fn summarize<'a, C, S, I>(entries: I) -> SweepSummary<'a, C, S>
where
    S: Ord + Clone,
    I: IntoIterator<Item = SweepEntry<'a, C, S>>,
{
    let mut summary = SweepSummary {
        jobs: 0,
        histogram: BTreeMap::new(),
        best: None,
        passed: 0,
        failed: 0,
        incomplete: 0,
    };
    let mut best_gflops = f64::NEG_INFINITY;

    for entry in entries {
        summary.jobs += 1;
        *summary.histogram.entry(entry.status().clone()).or_insert(0) += 1;

        let Some(result) = entry.result else {
            continue;
        };

        if result.passed {
            summary.passed += 1;
        } else if result.is_incomplete() {
            summary.incomplete += 1;
        } else {
            summary.failed += 1;
        }

        if let Some(gflops) = result.gflops {
            if gflops > best_gflops {
                best_gflops = gflops;
                summary.best = Some(BestResult {
                    configuration: entry.configuration,
                    result,
                });
            }
        }
    }

    debug!(
        jobs = summary.jobs,
        best_gflops = summary.best.as_ref().and_then(|best| best.result.gflops),
        "Summarized sweep"
    );

    summary
}
