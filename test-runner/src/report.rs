//! Result aggregation and baseline comparison.

use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    fmt::Write as _,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::Path,
};
use tracing::warn;

/// Why a case counts as failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FailureCause {
    /// A failure marker appeared on the console.
    Marker { marker: String, line: String },
    /// The environment could not be started.
    Launch { message: String },
    /// The process exited unsuccessfully without printing a marker.
    ExitStatus { code: Option<i32> },
    /// A structured `FAILED` record named the case.
    Record,
    /// The session ended without any structured record for the case.
    NoRecord,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Marker { marker, .. } => write!(f, "marker `{marker}`"),
            FailureCause::Launch { message } => write!(f, "launch error: {message}"),
            FailureCause::ExitStatus { code: Some(code) } => write!(f, "exit status {code}"),
            FailureCause::ExitStatus { code: None } => write!(f, "killed by signal"),
            FailureCause::Record => write!(f, "failure record"),
            FailureCause::NoRecord => write!(f, "no result record"),
        }
    }
}

/// The result of one case.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum Outcome {
    Passed,
    Failed { cause: FailureCause },
    TimedOut,
    /// The output ended with no success or failure marker.
    StreamEnded { exit_code: Option<i32> },
}

impl Outcome {
    pub fn failed(cause: FailureCause) -> Self {
        Outcome::Failed { cause }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    /// The report section this outcome belongs to. An ended stream had no
    /// success marker, so it is a failure.
    pub fn section(&self) -> Section {
        match self {
            Outcome::Passed => Section::Passed,
            Outcome::Failed { .. } | Outcome::StreamEnded { .. } => Section::Failed,
            Outcome::TimedOut => Section::TimedOut,
        }
    }

    /// Short label used in transcript file names.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed { .. } | Outcome::StreamEnded { .. } => "failed",
            Outcome::TimedOut => "timeout",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "passed"),
            Outcome::Failed { cause } => write!(f, "failed ({cause})"),
            Outcome::TimedOut => write!(f, "timed out"),
            Outcome::StreamEnded {
                exit_code: Some(code),
            } => write!(f, "stream ended (exit status {code})"),
            Outcome::StreamEnded { exit_code: None } => write!(f, "stream ended"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Passed,
    Failed,
    TimedOut,
}

/// Outcomes collected during a run, keyed by case.
#[derive(Clone, Debug, Default)]
pub struct ResultSet {
    outcomes: BTreeMap<String, Outcome>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of a case. A case is expected to be recorded once;
    /// if it shows up again, the later outcome replaces the earlier one.
    pub fn record(&mut self, case: impl Into<String>, outcome: Outcome) {
        let case = case.into();
        if let Some(previous) = self.outcomes.insert(case.clone(), outcome) {
            warn!(%case, %previous, "case recorded twice, keeping latest outcome");
        }
    }

    pub fn get(&self, case: &str) -> Option<&Outcome> {
        self.outcomes.get(case)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    fn section(&self, section: Section) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.section() == section)
            .map(|(case, _)| case.clone())
            .collect()
    }
}

/// The known-good reference a run is compared against.
#[derive(Clone, Debug, Default)]
pub struct Baseline {
    /// Cases permitted to fail or time out.
    pub allow_failing: BTreeSet<String>,
    /// Cases that must be observed passing, when known.
    pub must_pass: Option<BTreeSet<String>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub timed_out: Vec<String>,
    pub unexpected_failures: Vec<String>,
    pub missing_passes: Vec<String>,
    pub outcomes: BTreeMap<String, Outcome>,
    #[serde(skip)]
    allowed: BTreeSet<String>,
}

/// Builds the report for a run.
pub fn aggregate(results: ResultSet, baseline: &Baseline) -> Report {
    let passed = results.section(Section::Passed);
    let failed = results.section(Section::Failed);
    let timed_out = results.section(Section::TimedOut);

    let unexpected_failures = failed
        .iter()
        .chain(&timed_out)
        .filter(|case| !baseline.allow_failing.contains(*case))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let missing_passes = match &baseline.must_pass {
        Some(must_pass) => {
            let passed: BTreeSet<&String> = passed.iter().collect();
            must_pass
                .iter()
                .filter(|case| !passed.contains(case))
                .cloned()
                .collect()
        }
        None => Vec::new(),
    };

    Report {
        passed,
        failed,
        timed_out,
        unexpected_failures,
        missing_passes,
        outcomes: results.outcomes,
        allowed: baseline.allow_failing.clone(),
    }
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.unexpected_failures.is_empty() && self.missing_passes.is_empty()
    }

    /// The CI-facing status: 0 on success, 1 on any regression.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// The result file: `PASSED:`, `FAILED:` and `TIMEOUT:` sections with one
    /// sorted case key per line.
    pub fn render_result_file(&self) -> String {
        let mut out = String::new();
        for (label, cases) in [
            ("PASSED:", &self.passed),
            ("FAILED:", &self.failed),
            ("TIMEOUT:", &self.timed_out),
        ] {
            out.push_str(label);
            out.push('\n');
            for case in cases {
                out.push_str(case);
                out.push('\n');
            }
        }
        out
    }

    /// Human-readable summary: counts, every case that did not pass with its
    /// outcome, then the verdict.
    pub fn render_summary(&self) -> String {
        let rule = "=======================================";
        let mut out = String::new();
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "PASSED num: {}", self.passed.len());
        let _ = writeln!(out, "FAILED num: {}", self.failed.len());
        let _ = writeln!(out, "TIMEOUT num: {}", self.timed_out.len());
        let _ = writeln!(out, "Total tested num: {}", self.total());
        let _ = writeln!(out, "{rule}");

        let not_passed: Vec<_> = self
            .outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_passed())
            .collect();
        if !not_passed.is_empty() {
            let _ = writeln!(out, "=== Cases not passed ===");
            for (case, outcome) in not_passed {
                let allowed = if self.allowed.contains(case) {
                    " [allowed]"
                } else {
                    ""
                };
                let _ = writeln!(out, "{case}: {outcome}{allowed}");
            }
        }
        if !self.missing_passes.is_empty() {
            let _ = writeln!(out, "=== Expected passes not observed ===");
            for case in &self.missing_passes {
                let _ = writeln!(out, "{case}");
            }
        }

        if self.is_success() {
            let _ = writeln!(out, "All checked case passed!");
        } else {
            let _ = writeln!(out, "=== Failed cases ===");
            let regressions: BTreeSet<&String> = self
                .unexpected_failures
                .iter()
                .chain(&self.missing_passes)
                .collect();
            for case in regressions {
                let _ = writeln!(out, "{case}");
            }
        }
        out
    }

    pub fn write_result_file(&self, path: &Path, append: bool) -> io::Result<()> {
        let mut file = if append {
            OpenOptions::new().create(true).append(true).open(path)?
        } else {
            fs::File::create(path)?
        };
        file.write_all(self.render_result_file().as_bytes())?;
        file.sync_all()
    }

    /// Writes failed and timed-out cases, one per line. The file can serve as
    /// the next run's exception manifest.
    pub fn write_failed_list(&self, path: &Path) -> io::Result<()> {
        let cases: BTreeSet<&String> = self.failed.iter().chain(&self.timed_out).collect();
        let mut text = String::new();
        for case in cases {
            text.push_str(case);
            text.push('\n');
        }
        fs::write(path, text)
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(io::BufWriter::new(file), self).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_a() -> ResultSet {
        let mut results = ResultSet::new();
        results.record("case1", Outcome::Passed);
        results.record("case2", Outcome::failed(FailureCause::Record));
        results
    }

    #[test]
    fn failure_is_unexpected_unless_allowed() {
        let report = aggregate(scenario_a(), &Baseline::default());
        assert_eq!(report.passed, ["case1"]);
        assert_eq!(report.failed, ["case2"]);
        assert_eq!(report.unexpected_failures, ["case2"]);
        assert_eq!(report.exit_code(), 1);

        let baseline = Baseline {
            allow_failing: ["case2".to_owned()].into(),
            must_pass: None,
        };
        let report = aggregate(scenario_a(), &baseline);
        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert!(report.render_summary().contains("case2: failed (failure record) [allowed]"));
    }

    #[test]
    fn missing_passes_fail_the_run() {
        let baseline = Baseline {
            allow_failing: ["case2".to_owned()].into(),
            must_pass: Some(["case1".to_owned(), "case9".to_owned()].into()),
        };
        let report = aggregate(scenario_a(), &baseline);
        assert_eq!(report.missing_passes, ["case9"]);
        assert!(!report.is_success());
        let summary = report.render_summary();
        assert!(summary.ends_with("=== Failed cases ===\ncase9\n"), "{summary}");
    }

    #[test]
    fn timeouts_and_stream_ends_are_sorted_into_sections() {
        let mut results = ResultSet::new();
        results.record("b", Outcome::TimedOut);
        results.record("a", Outcome::StreamEnded { exit_code: Some(0) });
        results.record("c", Outcome::Passed);
        results.record("d", Outcome::TimedOut);
        let report = aggregate(results, &Baseline::default());

        assert_eq!(
            report.render_result_file(),
            "PASSED:\nc\nFAILED:\na\nTIMEOUT:\nb\nd\n"
        );
        assert_eq!(report.unexpected_failures, ["a", "b", "d"]);
    }

    #[test]
    fn empty_run_is_success() {
        let report = aggregate(ResultSet::new(), &Baseline::default());
        assert!(report.is_success());
        assert_eq!(report.render_result_file(), "PASSED:\nFAILED:\nTIMEOUT:\n");
    }

    #[test]
    fn artifacts_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut results = scenario_a();
        results.record("case3", Outcome::TimedOut);
        let report = aggregate(results, &Baseline::default());

        let failed_list = dir.path().join("failed.txt");
        report.write_failed_list(&failed_list).unwrap();
        assert_eq!(fs::read_to_string(&failed_list).unwrap(), "case2\ncase3\n");

        let json = dir.path().join("report.json");
        report.write_json(&json).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&json).unwrap()).unwrap();
        assert_eq!(value["timed_out"][0], "case3");
        assert_eq!(value["outcomes"]["case2"]["outcome"], "failed");
        assert_eq!(value["outcomes"]["case2"]["cause"]["kind"], "record");

        let result = dir.path().join("result.txt");
        report.write_result_file(&result, false).unwrap();
        report.write_result_file(&result, true).unwrap();
        let text = fs::read_to_string(&result).unwrap();
        assert_eq!(text.matches("PASSED:").count(), 2);
    }
}
