//! Deadline-bound marker matching over a session's console lines.
//!
//! The watcher is a small state machine. It starts in [`WatchState::Waiting`]
//! and moves to exactly one terminal state:
//!
//! * `Matched(Success)` when a line contains a success marker,
//! * `Matched(Failure)` when a line contains a failure marker,
//! * `StreamClosed` when the stream ends first,
//! * `DeadlineExceeded` when the deadline passes first.
//!
//! Lines arrive whole through a channel. A line that is already available is
//! examined before the deadline is, and the deadline is checked again after
//! every line, so a chatty target cannot push the watch past the deadline by
//! more than one line.

use crate::{classify::strip_ansi, errors::ProfileError, tee::OutputTee};
use regex::Regex;
use std::time::Duration;
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};
use tracing::debug;

#[derive(Clone, Debug)]
enum Matcher {
    Substring(String),
    Regex(Regex),
}

impl Matcher {
    fn is_match(&self, line: &str) -> bool {
        match self {
            Matcher::Substring(needle) => line.contains(needle.as_str()),
            Matcher::Regex(regex) => regex.is_match(line),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Matcher::Substring(needle) => needle,
            Matcher::Regex(regex) => regex.as_str(),
        }
    }
}

/// Success and failure markers, tested in that order.
#[derive(Clone, Debug)]
pub struct Markers {
    success: Vec<Matcher>,
    failure: Vec<Matcher>,
}

impl Markers {
    /// Builds markers from plain substrings.
    pub fn substrings<S: AsRef<str>>(success: &[S], failure: &[S]) -> Self {
        let build = |patterns: &[S]| {
            patterns
                .iter()
                .map(|pattern| Matcher::Substring(pattern.as_ref().to_owned()))
                .collect::<Vec<_>>()
        };
        Self {
            success: build(success),
            failure: build(failure),
        }
    }

    /// Builds markers from regular expressions.
    pub fn regexes<S: AsRef<str>>(success: &[S], failure: &[S]) -> Result<Self, ProfileError> {
        let build = |patterns: &[S]| {
            patterns
                .iter()
                .map(|pattern| {
                    Regex::new(pattern.as_ref())
                        .map(Matcher::Regex)
                        .map_err(|err| ProfileError::Pattern {
                            pattern: pattern.as_ref().to_owned(),
                            err,
                        })
                })
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            success: build(success)?,
            failure: build(failure)?,
        })
    }

    /// Tests one line. Success is checked before failure, so a line carrying
    /// both only ever yields the success match.
    pub fn check(&self, line: &str) -> Option<MarkerMatch> {
        if let Some(matcher) = self.success.iter().find(|m| m.is_match(line)) {
            return Some(MarkerMatch::Success(matcher.as_str().to_owned()));
        }
        self.failure
            .iter()
            .find(|m| m.is_match(line))
            .map(|matcher| MarkerMatch::Failure(matcher.as_str().to_owned()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarkerMatch {
    Success(String),
    Failure(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchState {
    Waiting,
    Matched(MarkerMatch),
    StreamClosed,
    DeadlineExceeded,
}

impl WatchState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WatchState::Waiting)
    }
}

/// The result of watching one session.
#[derive(Debug)]
pub struct Watched {
    pub state: WatchState,
    /// The line that caused a marker match, control sequences stripped.
    pub matched_line: Option<String>,
    /// Every line consumed, as received.
    pub transcript: Vec<String>,
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
pub struct PatternWatcher {
    markers: Markers,
}

impl PatternWatcher {
    pub fn new(markers: Markers) -> Self {
        Self { markers }
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    /// Consumes `lines` until a terminal state is reached, forwarding every
    /// line to `tee`.
    ///
    /// With `echo` set, markers are only tested on lines after the one that
    /// echoes that command back; earlier lines are recorded but not matched.
    pub async fn watch(
        &self,
        lines: &mut mpsc::Receiver<String>,
        deadline: Instant,
        tee: &mut OutputTee,
        echo: Option<&str>,
    ) -> Watched {
        let start = Instant::now();
        let mut state = WatchState::Waiting;
        let mut matched_line = None;
        let mut transcript = Vec::new();
        let echo = echo.map(str::trim).filter(|command| !command.is_empty());
        let mut armed = echo.is_none();

        while !state.is_terminal() {
            let next = tokio::select! {
                biased;
                line = lines.recv() => Some(line),
                () = sleep_until(deadline) => None,
            };

            state = match next {
                Some(Some(line)) => {
                    tee.write_line(&line);
                    let clean = strip_ansi(&line);
                    let marker = if armed {
                        self.markers.check(&clean)
                    } else {
                        armed = echo.is_some_and(|command| clean.trim_end().ends_with(command));
                        None
                    };
                    let state = match marker {
                        Some(marker) => {
                            matched_line = Some(clean);
                            WatchState::Matched(marker)
                        }
                        None if Instant::now() >= deadline => WatchState::DeadlineExceeded,
                        None => WatchState::Waiting,
                    };
                    transcript.push(line);
                    state
                }
                Some(None) => WatchState::StreamClosed,
                None => WatchState::DeadlineExceeded,
            };
        }
        tee.flush();

        let elapsed = start.elapsed();
        debug!(?state, elapsed_ms = elapsed.as_millis() as u64, "watch finished");
        Watched {
            state,
            matched_line,
            transcript,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::test_helpers::SharedBuffer;

    fn watcher() -> PatternWatcher {
        PatternWatcher::new(Markers::substrings(
            &["finished!"],
            &["failed", "ERROR", "panicked"],
        ))
    }

    fn feed(lines: Vec<(u64, &'static str)>) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for (delay_ms, line) in lines {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                if tx.send(line.to_owned()).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    fn deadline_in(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn success_beats_failure_on_same_line() {
        let markers = watcher().markers().clone();
        assert_eq!(
            markers.check("test failed count 0, finished!"),
            Some(MarkerMatch::Success("finished!".to_owned()))
        );
        assert_eq!(
            markers.check("panicked at 'oops'"),
            Some(MarkerMatch::Failure("panicked".to_owned()))
        );
        assert_eq!(markers.check("booting"), None);
    }

    #[test]
    fn regex_markers_compile_or_fail() {
        let markers = Markers::regexes(&[r"/ # [\r\n]?$"], &["panicked at"]).unwrap();
        assert!(markers.check("/ # ").is_some());
        assert!(Markers::regexes(&["("], &[]).is_err());
    }

    #[tokio::test]
    async fn success_marker_terminates() {
        let echo = SharedBuffer::default();
        let mut tee = OutputTee::new();
        tee.add_sink("echo", echo.clone());

        let mut rx = feed(vec![(0, "booting"), (5, "\x1b[32mfinished!\x1b[0m"), (0, "after")]);
        let watched = watcher().watch(&mut rx, deadline_in(5_000), &mut tee, None).await;

        assert_eq!(
            watched.state,
            WatchState::Matched(MarkerMatch::Success("finished!".to_owned()))
        );
        assert_eq!(watched.matched_line.as_deref(), Some("finished!"));
        assert_eq!(watched.transcript.len(), 2);
        assert_eq!(echo.contents(), "booting\n\x1b[32mfinished!\x1b[0m\n");
    }

    #[tokio::test]
    async fn output_before_echo_is_not_matched() {
        let mut tee = OutputTee::new();
        let mut rx = feed(vec![
            (0, "finished!"),
            (0, "/ # /bin/busybox ls"),
            (0, "ERROR: no such file"),
        ]);
        let watched = watcher()
            .watch(&mut rx, deadline_in(5_000), &mut tee, Some("/bin/busybox ls"))
            .await;
        assert_eq!(
            watched.state,
            WatchState::Matched(MarkerMatch::Failure("ERROR".to_owned()))
        );
        assert_eq!(watched.transcript.len(), 3);
    }

    #[tokio::test]
    async fn missing_echo_runs_into_deadline() {
        let mut tee = OutputTee::new();
        let (tx, mut rx) = mpsc::channel(4);
        tx.send("finished!".to_owned()).await.unwrap();
        let watched = watcher()
            .watch(&mut rx, deadline_in(50), &mut tee, Some("hang"))
            .await;
        assert_eq!(watched.state, WatchState::DeadlineExceeded);
        drop(tx);
    }

    #[tokio::test]
    async fn failure_marker_terminates() {
        let mut tee = OutputTee::new();
        let mut rx = feed(vec![(0, "running"), (0, "[ERROR] page fault"), (0, "finished!")]);
        let watched = watcher().watch(&mut rx, deadline_in(5_000), &mut tee, None).await;
        assert_eq!(
            watched.state,
            WatchState::Matched(MarkerMatch::Failure("ERROR".to_owned()))
        );
    }

    #[tokio::test]
    async fn stream_end_without_marker() {
        let mut tee = OutputTee::new();
        let mut rx = feed(vec![(0, "booting"), (0, "halt")]);
        let watched = watcher().watch(&mut rx, deadline_in(5_000), &mut tee, None).await;
        assert_eq!(watched.state, WatchState::StreamClosed);
        assert_eq!(watched.transcript, ["booting", "halt"]);
    }

    #[tokio::test]
    async fn deadline_fires_on_silence() {
        let (_tx, mut rx) = mpsc::channel::<String>(1);
        let mut tee = OutputTee::new();
        let watched = watcher().watch(&mut rx, deadline_in(50), &mut tee, None).await;
        assert_eq!(watched.state, WatchState::DeadlineExceeded);
        assert!(watched.elapsed >= Duration::from_millis(50));
        assert!(watched.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn deadline_fires_on_chatty_output() {
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(async move {
            loop {
                if tx.send("tick".to_owned()).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let mut tee = OutputTee::new();
        let watched = watcher().watch(&mut rx, deadline_in(60), &mut tee, None).await;
        assert_eq!(watched.state, WatchState::DeadlineExceeded);
        assert!(watched.elapsed < Duration::from_secs(5));
    }
}
