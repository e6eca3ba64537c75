//! Extraction of structured metrics from HPL benchmark output.
//!
//! The output of a sweep job is the job banner printed by the batch script
//! followed by the benchmark's own report. Both are human readable and not
//! versioned, so everything here degrades field by field instead of failing.

mod parse;

pub use parse::{best_of, parse_output, parse_sections};

use serde::{Deserialize, Serialize};

/// Residual check verdict as printed by the benchmark
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Passed,
    Failed,
}

/// Metadata captured from the banner the batch script prints around the run
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct JobInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
/// Metrics extracted from one completed job
///
/// `n`, `nb`, `p` and `q` are the values the benchmark reports having run,
/// which can be compared against the submitted configuration.
pub struct ParsedResult {
    pub n: Option<u64>,
    pub nb: Option<u64>,
    pub p: Option<u64>,
    pub q: Option<u64>,
    /// wall time in seconds
    pub time: Option<f64>,
    pub gflops: Option<f64>,
    pub residual_check: Option<Verdict>,
    pub passed: bool,
    pub error_message: Option<String>,
    #[serde(default)]
    pub job_info: JobInfo,
}

impl ParsedResult {
    /// true if none of the metric fields could be extracted
    pub fn has_no_metrics(&self) -> bool {
        self.n.is_none()
            && self.nb.is_none()
            && self.p.is_none()
            && self.q.is_none()
            && self.time.is_none()
            && self.gflops.is_none()
    }

    /// No metrics and no diagnostic: the job most likely hasn't produced its report yet
    pub fn is_incomplete(&self) -> bool {
        self.has_no_metrics() && self.error_message.is_none()
    }

    /// No metrics but an explicit diagnostic line
    pub fn is_failed(&self) -> bool {
        self.has_no_metrics() && self.error_message.is_some()
    }
}
