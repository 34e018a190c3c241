//! Classification of aggregate console logs.
//!
//! Environments that run many cases in one invocation (the kernel's built-in
//! core-test runner) print gtest-style records:
//!
//! ```text
//! [ RUN      ] Channel.Create
//! [       OK ] Channel.Create (5 ms)
//! [ RUN      ] Channel.Close
//! [  FAILED  ] Channel.Close (3 ms)
//! ```
//!
//! Color codes are stripped before any matching.

use serde::Serialize;
use std::{collections::BTreeMap, fmt::Write};

/// Removes terminal control sequences (CSI colour codes, OSC title updates)
/// and non-printing control characters other than newlines.
pub fn strip_ansi(text: &str) -> String {
    strip_ansi_escapes::strip_str(text)
}

/// A per-case verdict read from a structured result line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Passed,
    Failed,
}

/// Bracket tags that mark structured records.
#[derive(Clone, Debug)]
pub struct RecordTags {
    pub run: String,
    pub pass: String,
    pub fail: String,
}

impl Default for RecordTags {
    fn default() -> Self {
        Self {
            run: "RUN".to_owned(),
            pass: "OK".to_owned(),
            fail: "FAILED".to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Record<'a> {
    Run(&'a str),
    Pass(&'a str),
    Fail(&'a str),
}

/// Stateless classifier over complete logs.
#[derive(Clone, Debug, Default)]
pub struct Classifier {
    tags: RecordTags,
}

impl Classifier {
    pub fn new(tags: RecordTags) -> Self {
        Self { tags }
    }

    /// Maps every case key with a result record to its verdict.
    ///
    /// A case with both a passing and a failing record is failed.
    pub fn classify(&self, raw_log: &str) -> BTreeMap<String, Verdict> {
        let clean = strip_ansi(raw_log);
        let mut verdicts = BTreeMap::new();
        for line in clean.lines() {
            match self.record(line) {
                Some(Record::Pass(key)) => {
                    verdicts.entry(key.to_owned()).or_insert(Verdict::Passed);
                }
                Some(Record::Fail(key)) => {
                    verdicts.insert(key.to_owned(), Verdict::Failed);
                }
                Some(Record::Run(_)) | None => {}
            }
        }
        verdicts
    }

    /// Collects the console lines of every failing case, from its `RUN`
    /// record through its `FAILED` record. A case cut off by the next `RUN`
    /// record without any verdict is collected too.
    ///
    /// Blocks are returned in the order the failures were observed.
    pub fn failure_transcripts(&self, raw_log: &str) -> Vec<(String, Vec<String>)> {
        let clean = strip_ansi(raw_log);
        let mut out: Vec<(String, Vec<String>)> = Vec::new();
        let mut current: Option<(String, Vec<String>)> = None;

        let store = |out: &mut Vec<(String, Vec<String>)>, key: String, lines: Vec<String>| {
            match out.iter_mut().find(|(existing, _)| *existing == key) {
                Some(slot) => slot.1 = lines,
                None => out.push((key, lines)),
            }
        };

        for line in clean.lines() {
            match self.record(line) {
                Some(Record::Run(key)) => {
                    if let Some((prev, lines)) = current.take() {
                        store(&mut out, prev, lines);
                    }
                    current = Some((key.to_owned(), vec![line.to_owned()]));
                }
                Some(Record::Pass(_)) => {
                    current = None;
                }
                Some(Record::Fail(_)) => {
                    if let Some((key, mut lines)) = current.take() {
                        lines.push(line.to_owned());
                        store(&mut out, key, lines);
                    }
                }
                None => {
                    if let Some((_, lines)) = current.as_mut() {
                        lines.push(line.to_owned());
                    }
                }
            }
        }
        out
    }

    fn record<'a>(&self, line: &'a str) -> Option<Record<'a>> {
        let (tag, rest) = bracket_tag(line)?;
        let key = rest.split_whitespace().next()?;
        if tag == self.tags.run {
            Some(Record::Run(key))
        } else if tag == self.tags.pass {
            Some(Record::Pass(key))
        } else if tag == self.tags.fail && line.trim_end().ends_with(')') {
            // Summary lines such as `[  FAILED  ] 2 tests, listed below:` carry
            // no duration suffix.
            Some(Record::Fail(key))
        } else {
            None
        }
    }
}

/// Splits `[  TAG  ] rest` into `("TAG", " rest")`.
fn bracket_tag(line: &str) -> Option<(&str, &str)> {
    let inner = line.strip_prefix('[')?;
    let close = inner.find(']')?;
    let tag = inner[..close].trim();
    if tag.is_empty() {
        return None;
    }
    Some((tag, &inner[close + 1..]))
}

/// Classifies with the default gtest tags.
pub fn classify(raw_log: &str) -> BTreeMap<String, Verdict> {
    Classifier::default().classify(raw_log)
}

/// Renders failure transcripts as numbered, framed blocks.
pub fn render_transcripts(transcripts: &[(String, Vec<String>)]) -> String {
    let rule = "==============================";
    let mut out = String::new();
    for (index, (key, lines)) in transcripts.iter().enumerate() {
        let _ = writeln!(out, "{} {rule} {key} {rule}", index + 1);
        for line in lines {
            let _ = writeln!(out, "{line}");
        }
        let _ = writeln!(out, "{rule} End {rule}");
        out.push_str("\n\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GTEST_LOG: &str = "\
[==========] Running 3 tests from 2 test suites.
[ RUN      ] Channel.Create
[       OK ] Channel.Create (5 ms)
[ RUN      ] Channel.Close
../../zircon/system/utils/core-tests/channel.cc:42: Failure
[  FAILED  ] Channel.Close (3 ms)
[ RUN      ] Bti.Pin
[       OK ] Bti.Pin (1 ms)
[  FAILED  ] 1 test, listed below:
[  FAILED  ] Channel.Close
";

    fn colorize(log: &str) -> String {
        log.replace("[ RUN      ]", "\x1b[0;32m[ RUN      ]\x1b[m")
            .replace("[       OK ]", "\x1b[0;32m[       OK ]\x1b[m")
            .replace("[  FAILED  ]", "\x1b[0;31m[  FAILED  ]\x1b[m")
    }

    #[test]
    fn classifies_gtest_records() {
        let verdicts = classify(GTEST_LOG);
        assert_eq!(verdicts.len(), 3);
        assert_eq!(verdicts["Channel.Create"], Verdict::Passed);
        assert_eq!(verdicts["Channel.Close"], Verdict::Failed);
        assert_eq!(verdicts["Bti.Pin"], Verdict::Passed);
    }

    #[test]
    fn compact_tags_are_accepted() {
        let verdicts = classify("[ RUN ] case1\n[ OK ] case1 (5 ms)\n[ RUN ] case2\n[ FAILED ] case2 (3 ms)\n");
        assert_eq!(verdicts["case1"], Verdict::Passed);
        assert_eq!(verdicts["case2"], Verdict::Failed);
    }

    #[test]
    fn failed_without_suffix_is_informational() {
        let verdicts = classify("[  FAILED  ] Channel.Close\n[  FAILED  ] 2 tests, listed below:\n");
        assert!(verdicts.is_empty(), "{verdicts:?}");
    }

    #[test]
    fn failure_wins_over_pass() {
        let verdicts = classify("[  FAILED  ] A.b (1 ms)\n[       OK ] A.b (1 ms)\n");
        assert_eq!(verdicts["A.b"], Verdict::Failed);
    }

    #[test]
    fn color_codes_do_not_change_classification() {
        assert_eq!(classify(&colorize(GTEST_LOG)), classify(GTEST_LOG));
        assert_eq!(strip_ansi("\x1b[1;31mpanicked\x1b[0m at"), "panicked at");
    }

    #[test]
    fn title_sequences_are_stripped() {
        assert_eq!(strip_ansi("\x1b]0;zcore\x07x"), "x");
        let verdicts = classify("\x1b]0;zcore\x07[       OK ] A.b (1 ms)\n");
        assert_eq!(verdicts.get("A.b"), Some(&Verdict::Passed));
    }

    #[test]
    fn crlf_lines_classify() {
        let verdicts = classify("[       OK ] A.b (1 ms)\r\n[  FAILED  ] A.c (2 ms)\r\n");
        assert_eq!(verdicts["A.b"], Verdict::Passed);
        assert_eq!(verdicts["A.c"], Verdict::Failed);
    }

    #[test]
    fn transcripts_cover_failing_cases() {
        let log = format!("{GTEST_LOG}[ RUN      ] Vmo.Hang\nstill going\n[ RUN      ] Vmo.Next\n");
        let transcripts = Classifier::default().failure_transcripts(&log);
        let keys: Vec<_> = transcripts.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, ["Channel.Close", "Vmo.Hang"]);
        assert_eq!(
            transcripts[0].1,
            [
                "[ RUN      ] Channel.Close",
                "../../zircon/system/utils/core-tests/channel.cc:42: Failure",
                "[  FAILED  ] Channel.Close (3 ms)",
            ]
        );

        let rendered = render_transcripts(&transcripts);
        assert!(rendered.starts_with(
            "1 ============================== Channel.Close =============================="
        ));
        assert!(rendered.contains("2 ============================== Vmo.Hang"));
    }

    proptest! {
        #[test]
        fn classify_is_pure(lines in prop::collection::vec(
            prop_oneof![
                "[a-c]{1,3}".prop_map(|k| format!("[ RUN      ] {k}")),
                "[a-c]{1,3}".prop_map(|k| format!("[       OK ] {k} (1 ms)")),
                "[a-c]{1,3}".prop_map(|k| format!("[  FAILED  ] {k} (2 ms)")),
                "[ -~]{0,20}",
            ],
            0..32,
        )) {
            let log = lines.join("\n");
            prop_assert_eq!(classify(&log), classify(&log));
            prop_assert_eq!(classify(&colorize(&log)), classify(&log));
        }
    }
}
