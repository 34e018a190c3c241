//! Case manifests.
//!
//! A manifest lists one case identifier per line. Lines starting with `#` are
//! comments, lines starting with `-` name cases to exclude, blank lines are
//! ignored.

use crate::errors::ManifestReadError;
use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashSet},
    fmt, fs,
    path::Path,
};

/// Separator between a suite name and a subcase in composed identifiers.
pub const SUITE_SEPARATOR: char = '.';

/// A single named regression case.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestCase {
    id: String,
}

impl TestCase {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Composes `suite.subcase`.
    pub fn in_suite(suite: &str, subcase: &str) -> Self {
        Self::new(format!("{suite}{SUITE_SEPARATOR}{subcase}"))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns true if the identifier is a wildcard filter rather than a
    /// concrete case (batch environments accept `Suite.*`).
    pub fn is_pattern(&self) -> bool {
        self.id.contains('*')
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A parsed manifest, partitioned into included and excluded cases.
///
/// Both partitions keep the order of first occurrence and contain no
/// duplicates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    included: Vec<TestCase>,
    excluded: Vec<TestCase>,
}

impl Manifest {
    /// Reads and parses a manifest file.
    pub fn load(path: &Path) -> Result<Self, ManifestReadError> {
        let text = fs::read_to_string(path).map_err(|err| ManifestReadError::Io {
            path: path.to_owned(),
            err,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut seen_included = HashSet::new();
        let mut seen_excluded = HashSet::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(negated) = line.strip_prefix('-') {
                let negated = negated.trim();
                if !negated.is_empty() && seen_excluded.insert(negated.to_owned()) {
                    excluded.push(TestCase::new(negated));
                }
            } else if seen_included.insert(line.to_owned()) {
                included.push(TestCase::new(line));
            }
        }

        Self { included, excluded }
    }

    /// Builds a manifest from explicit partitions, dropping duplicates.
    pub fn with_partitions(included: Vec<TestCase>, excluded: Vec<TestCase>) -> Self {
        let mut manifest = Self::from_cases(included);
        manifest.merge(Self {
            included: Vec::new(),
            excluded,
        });
        manifest
    }

    /// Builds a manifest with only included cases.
    pub fn from_cases(cases: impl IntoIterator<Item = TestCase>) -> Self {
        let mut seen = HashSet::new();
        let included = cases
            .into_iter()
            .filter(|case| seen.insert(case.id.clone()))
            .collect();
        Self {
            included,
            excluded: Vec::new(),
        }
    }

    /// Appends another manifest's entries, skipping ones already present.
    pub fn merge(&mut self, other: Manifest) {
        for case in other.included {
            if !self.included.contains(&case) {
                self.included.push(case);
            }
        }
        for case in other.excluded {
            if !self.excluded.contains(&case) {
                self.excluded.push(case);
            }
        }
    }

    pub fn included(&self) -> &[TestCase] {
        &self.included
    }

    pub fn excluded(&self) -> &[TestCase] {
        &self.excluded
    }

    /// Every case in the manifest, included ones first.
    pub fn cases(&self) -> impl Iterator<Item = &TestCase> {
        self.included.iter().chain(&self.excluded)
    }

    pub fn is_empty(&self) -> bool {
        self.included.is_empty() && self.excluded.is_empty()
    }

    /// Every identifier in the manifest, included or not.
    pub fn keys(&self) -> BTreeSet<String> {
        self.cases().map(|case| case.id.clone()).collect()
    }

    /// The cases to run: included cases minus this manifest's own exclusions
    /// and minus every case listed in `exceptions`.
    ///
    /// Exceptions are known-broken cases; they are dropped from the run set
    /// rather than allowed to block it. A `-case` line in the exception list
    /// names a case to skip just like a plain one.
    pub fn run_set(&self, exceptions: Option<&Manifest>) -> Vec<TestCase> {
        let mut skip: HashSet<&str> = self.excluded.iter().map(|case| case.id()).collect();
        if let Some(exceptions) = exceptions {
            skip.extend(exceptions.cases().map(TestCase::id));
        }
        self.included
            .iter()
            .filter(|case| !skip.contains(case.id()))
            .cloned()
            .collect()
    }

    /// Renders the manifest as a single filter argument for environments that
    /// run many cases in one invocation: `a,b-c,d` runs `a` and `b` but not
    /// `c` or `d`.
    pub fn batch_filter(&self) -> String {
        let mut filter = join_ids(&self.included);
        if !self.excluded.is_empty() {
            filter.push('-');
            filter.push_str(&join_ids(&self.excluded));
        }
        filter
    }
}

fn join_ids(cases: &[TestCase]) -> String {
    cases
        .iter()
        .map(TestCase::id)
        .collect::<Vec<_>>()
        .join(",")
}

/// Reads a plain key list (baselines, allow-lists). Negation markers are not
/// meaningful here, so every non-comment line counts.
pub fn load_key_set(path: &Path) -> Result<BTreeSet<String>, ManifestReadError> {
    Manifest::load(path).map(|manifest| manifest.keys())
}

#[derive(Debug, Deserialize)]
struct SuiteFile {
    #[serde(rename = "CoreTests")]
    core_tests: Vec<SuiteEntry>,
}

#[derive(Debug, Deserialize)]
struct SuiteEntry {
    #[serde(rename = "TestCaseName")]
    name: String,
    #[serde(rename = "TestArray")]
    subcases: Vec<String>,
}

/// Loads a JSON suite manifest, expanding every suite into `suite.subcase`
/// identifiers.
pub fn load_suites(path: &Path) -> Result<Manifest, ManifestReadError> {
    let text = fs::read_to_string(path).map_err(|err| ManifestReadError::Io {
        path: path.to_owned(),
        err,
    })?;
    parse_suites(&text).map_err(|err| ManifestReadError::Suites {
        path: path.to_owned(),
        err,
    })
}

fn parse_suites(text: &str) -> Result<Manifest, serde_json::Error> {
    let file: SuiteFile = serde_json::from_str(text)?;
    let cases = file.core_tests.iter().flat_map(|suite| {
        suite
            .subcases
            .iter()
            .map(|subcase| TestCase::in_suite(&suite.name, subcase))
    });
    Ok(Manifest::from_cases(cases))
}
