use crate::{JobInfo, ParsedResult, Verdict};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

// banner labels printed by the sweep batch script
const JOB_ID_LABEL: &str = "Job ID:";
const HOSTNAME_LABEL: &str = "Hostname:";
const START_LABEL: &str = "Date:";
const END_LABEL: &str = "Completed at:";
const EXIT_CODE_LABEL: &str = "Exit code:";

const THROUGHPUT_HEADER: &str = "Gflops";

/// T/V tag followed by N, NB, P, Q, time and Gflops
static RESULT_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^[ \t]*W[RC]\S*[ \t]+(\d+)[ \t]+(\d+)[ \t]+(\d+)[ \t]+(\d+)[ \t]+(\d+(?:\.\d*)?)[ \t]+(\d+(?:\.\d*)?(?:[eE][+-]?\d+)?)",
    )
    .expect("result row pattern is valid")
});

static VERDICT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(passed|failed)\b").expect("verdict pattern is valid"));

static SECTION_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"={70,}").expect("separator pattern is valid"));

/// Parse the complete output of one job
///
/// Never fails: fields that can't be found stay `None`.
pub fn parse_output(content: &str) -> ParsedResult {
    let mut result = ParsedResult {
        job_info: parse_banner(content),
        ..ParsedResult::default()
    };

    parse_table(content, &mut result);

    // a verdict is taken from whichever marker shows up first
    if let Some(marker) = VERDICT.captures(content) {
        let verdict = if marker[1].eq_ignore_ascii_case("passed") {
            Verdict::Passed
        } else {
            Verdict::Failed
        };

        result.residual_check = Some(verdict);
        result.passed = verdict == Verdict::Passed;
    } else if result.gflops.is_some() {
        result.passed = true;
    }

    result.error_message = content
        .lines()
        .find(|line| line.to_lowercase().contains("error"))
        .map(|line| line.trim().to_owned());

    debug!(
        n = ?result.n,
        gflops = ?result.gflops,
        passed = result.passed,
        "Parsed benchmark output"
    );

    result
}

/// Parse output that may hold several concatenated runs, one result per table
///
/// Falls back to parsing the whole content when no section qualifies, in which
/// case the result is only kept if it carries a throughput or a diagnostic.
pub fn parse_sections(content: &str) -> Vec<ParsedResult> {
    let job_info = parse_banner(content);

    let results: Vec<ParsedResult> = SECTION_SEPARATOR
        .split(content)
        .filter(|section| section.contains(THROUGHPUT_HEADER) && RESULT_ROW.is_match(section))
        .map(|section| {
            let mut result = parse_output(section);
            result.job_info = job_info.clone();
            result
        })
        .filter(|result| result.gflops.is_some())
        .collect();

    trace!(sections = results.len(), "Split output into sections");

    if results.is_empty() {
        let result = parse_output(content);

        if result.gflops.is_some() || result.error_message.is_some() {
            return vec![result];
        }
    }

    results
}

/// Highest throughput of `results`, the first one wins on ties
pub fn best_of(results: &[ParsedResult]) -> Option<&ParsedResult> {
    results
        .iter()
        .filter_map(|result| result.gflops.map(|gflops| (gflops, result)))
        .fold(None, |best: Option<(f64, &ParsedResult)>, (gflops, result)| match best {
            Some((best_gflops, _)) if best_gflops >= gflops => best,
            _ => Some((gflops, result)),
        })
        .map(|(_, result)| result)
}

fn parse_banner(content: &str) -> JobInfo {
    let mut info = JobInfo::default();

    for line in content.lines().map(str::trim) {
        if info.job_id.is_none() {
            info.job_id = labeled(line, JOB_ID_LABEL)
                .and_then(|value| value.split_whitespace().next())
                .map(str::to_owned);
        }
        if info.hostname.is_none() {
            info.hostname = labeled(line, HOSTNAME_LABEL).map(str::to_owned);
        }
        if info.start_date.is_none() {
            info.start_date = labeled(line, START_LABEL).map(str::to_owned);
        }
        if info.end_date.is_none() {
            info.end_date = labeled(line, END_LABEL).map(str::to_owned);
        }
        if info.exit_code.is_none() {
            info.exit_code = labeled(line, EXIT_CODE_LABEL).and_then(|value| value.parse().ok());
        }
    }

    info
}

/// remainder of `line` after `label`, if any
fn labeled<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    line.strip_prefix(label)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_table(content: &str, result: &mut ParsedResult) {
    // the last complete row wins
    for row in RESULT_ROW.captures_iter(content) {
        let parsed = (
            row[1].parse(),
            row[2].parse(),
            row[3].parse(),
            row[4].parse(),
            row[5].parse(),
            row[6].parse(),
        );

        if let (Ok(n), Ok(nb), Ok(p), Ok(q), Ok(time), Ok(gflops)) = parsed {
            result.n = Some(n);
            result.nb = Some(nb);
            result.p = Some(p);
            result.q = Some(q);
            result.time = Some(time);
            result.gflops = Some(gflops);
        } else {
            debug!(row = &row[0], "Skipped malformed result row");
        }
    }
}
