//! Sequencing of a whole run.
//!
//! Cases run strictly one after another against a single [`Target`]. A
//! failure inside one case is recorded and the run moves on; only setup
//! errors (unreadable manifests, a malformed boot-config template) abort it.

use crate::{
    boot_config::BootConfig,
    classify::{self, Classifier, Verdict},
    config::{Profile, RunMode, TargetConfig},
    errors::{ConfigFormatError, HarnessError, LaunchError},
    manifest::{Manifest, TestCase},
    report::{self, Baseline, FailureCause, Outcome, Report, ResultSet},
    session::{
        LaunchVars, Liveness, ProcessTarget, SerialConsole, SerialSettings, Session, Target,
    },
    tee::OutputTee,
    watcher::{MarkerMatch, PatternWatcher, WatchState, Watched},
};
use anyhow::{Context, Result};
use std::{
    error::Error as _,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{info, warn};
use xxhash_rust::xxh3::xxh3_64;

/// How long a process whose output has ended gets to report its exit status.
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub timeout: Duration,
    pub fail_fast: bool,
    pub exit_status_verdict: bool,
}

pub struct Orchestrator {
    target: Target,
    watcher: PatternWatcher,
    boot: Option<(BootConfig, PathBuf)>,
    options: RunOptions,
    transcripts: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(target: Target, watcher: PatternWatcher, options: RunOptions) -> Self {
        Self {
            target,
            watcher,
            boot: None,
            options,
            transcripts: None,
        }
    }

    /// Rewrites `dest` from `config` before every session starts.
    pub fn with_boot_config(mut self, config: BootConfig, dest: PathBuf) -> Self {
        self.boot = Some((config, dest));
        self
    }

    /// Writes each case's console output to its own file under `dir`.
    pub fn with_transcripts(mut self, dir: PathBuf) -> Self {
        self.transcripts = Some(dir);
        self
    }

    /// Runs each case in its own session.
    pub async fn run_cases(
        &mut self,
        cases: &[TestCase],
        baseline: &Baseline,
        tee: &mut OutputTee,
    ) -> Result<ResultSet, ConfigFormatError> {
        let mut results = ResultSet::new();
        let total = cases.len();

        for (index, case) in cases.iter().enumerate() {
            info!(case = %case, index = index + 1, total, "starting case");
            let (outcome, elapsed) = self.run_one(case, None, tee).await?;
            info!(
                case = %case,
                outcome = %outcome,
                elapsed_ms = elapsed.as_millis() as u64,
                "case finished"
            );

            let stop = self.options.fail_fast
                && !outcome.is_passed()
                && !baseline.allow_failing.contains(case.id());
            results.record(case.id(), outcome);
            if stop {
                warn!(
                    case = %case,
                    skipped = total - index - 1,
                    "fail-fast: stopping after first unexpected failure"
                );
                break;
            }
        }
        Ok(results)
    }

    /// Runs every case in one session and classifies the structured records
    /// it prints.
    ///
    /// Concrete cases from `run_set` with no record are recorded from the
    /// session's own result: timed out if the session timed out, failed
    /// otherwise.
    pub async fn run_batch(
        &mut self,
        filter: &Manifest,
        run_set: &[TestCase],
        classifier: &Classifier,
        tee: &mut OutputTee,
    ) -> Result<ResultSet, ConfigFormatError> {
        let filter = TestCase::new(filter.batch_filter());
        info!(filter = %filter, cases = run_set.len(), "starting batch");

        let mut transcript = Vec::new();
        let (session_outcome, elapsed) = self
            .run_one(&filter, Some(&mut transcript), tee)
            .await?;
        info!(
            outcome = %session_outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "batch finished"
        );

        let verdicts = classifier.classify(&transcript.join("\n"));
        let mut results = ResultSet::new();
        for (case, verdict) in &verdicts {
            let outcome = match verdict {
                Verdict::Passed => Outcome::Passed,
                Verdict::Failed => Outcome::failed(FailureCause::Record),
            };
            results.record(case.clone(), outcome);
        }

        let fallback = match &session_outcome {
            Outcome::TimedOut => Outcome::TimedOut,
            Outcome::Failed {
                cause: cause @ FailureCause::Launch { .. },
            } => Outcome::failed(cause.clone()),
            _ => Outcome::failed(FailureCause::NoRecord),
        };
        for case in run_set {
            if !case.is_pattern() && !verdicts.contains_key(case.id()) {
                results.record(case.id(), fallback.clone());
            }
        }
        Ok(results)
    }

    /// Runs one session to completion. `capture` receives the lines the
    /// session printed.
    async fn run_one(
        &mut self,
        case: &TestCase,
        capture: Option<&mut Vec<String>>,
        tee: &mut OutputTee,
    ) -> Result<(Outcome, Duration), ConfigFormatError> {
        let config_path = match &self.boot {
            Some((config, dest)) => {
                config.write(case, dest)?;
                Some(dest.as_path())
            }
            None => None,
        };
        let vars = LaunchVars {
            case: Some(case.id()),
            filter: Some(case.id()),
            config: config_path,
        };

        let deadline = Instant::now() + self.options.timeout;
        let mut session = match self.target.start(&vars, deadline).await {
            Ok(session) => session,
            Err(err) => {
                warn!(case = %case, error = %err, "failed to start target");
                return Ok((launch_failure(&err), Duration::ZERO));
            }
        };

        let echo = session.echo_gate().map(str::to_owned);
        let watched = self
            .watcher
            .watch(session.lines(), deadline, tee, echo.as_deref())
            .await;
        let outcome = resolve(&mut session, &watched, self.options.exit_status_verdict).await;
        let liveness = session.stop().await;
        if liveness == Liveness::Killed {
            info!(case = %case, "target stopped");
        }
        let elapsed = session.started().elapsed();
        drop(session);

        if let Some(dir) = &self.transcripts {
            write_transcript(dir, case, &outcome, &watched.transcript);
        }
        if let Some(capture) = capture {
            *capture = watched.transcript;
        }
        Ok((outcome, elapsed))
    }

    pub fn close(self) {
        self.target.close();
    }
}

fn launch_failure(err: &LaunchError) -> Outcome {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    Outcome::failed(FailureCause::Launch { message })
}

/// Maps the watcher's terminal state to a case outcome.
async fn resolve(
    session: &mut Session<'_>,
    watched: &Watched,
    exit_status_verdict: bool,
) -> Outcome {
    match &watched.state {
        WatchState::Matched(MarkerMatch::Success(_)) => {
            session.ended_on(watched.matched_line.as_deref().unwrap_or_default());
            Outcome::Passed
        }
        WatchState::Matched(MarkerMatch::Failure(marker)) => Outcome::failed(FailureCause::Marker {
            marker: marker.clone(),
            line: watched.matched_line.clone().unwrap_or_default(),
        }),
        WatchState::StreamClosed => {
            let exit_code = match session.wait_exit(EXIT_GRACE).await {
                Liveness::Exited(code) => code,
                Liveness::Running | Liveness::Killed => None,
            };
            match (exit_status_verdict, exit_code) {
                (true, Some(0)) => Outcome::Passed,
                (true, code) => Outcome::failed(FailureCause::ExitStatus { code }),
                (false, exit_code) => Outcome::StreamEnded { exit_code },
            }
        }
        WatchState::DeadlineExceeded | WatchState::Waiting => Outcome::TimedOut,
    }
}

fn write_transcript(dir: &Path, case: &TestCase, outcome: &Outcome, lines: &[String]) {
    let path = dir.join(format!("{}-{}.log", outcome.label(), file_stem(case.id())));
    let mut text = lines.join("\n");
    text.push('\n');
    if let Err(err) = fs::write(&path, text) {
        warn!(path = %path.display(), error = %err, "failed to write case transcript");
    }
}

/// A file-name-safe form of a case id. Ids that had to be rewritten get a
/// hash of the original appended, so `a/b` and `a_b` stay apart.
fn file_stem(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem == id {
        return stem;
    }
    format!("{}-{:08x}", stem.trim_matches('_'), xxh3_64(id.as_bytes()) as u32)
}

/// Runs everything a profile describes and writes the result artifacts.
pub async fn run(profile: &Profile) -> Result<Report> {
    // Setup errors surface here, before any case runs.
    let (manifest, exceptions) = profile.load_cases()?;
    let baseline = profile.baseline().map_err(HarnessError::from)?;
    let boot = profile.boot_config().map_err(HarnessError::from)?;
    let markers = profile.markers().map_err(HarnessError::from)?;

    let run_set = manifest.run_set(exceptions.as_ref());
    info!(
        cases = run_set.len(),
        excluded = manifest.included().len() - run_set.len(),
        timeout_secs = profile.timeout().as_secs(),
        "loaded cases"
    );

    let target = open_target(profile).await?;
    let options = RunOptions {
        timeout: profile.timeout(),
        fail_fast: profile.fail_fast,
        exit_status_verdict: profile.exit_status_verdict,
    };
    let mut orchestrator = Orchestrator::new(target, PatternWatcher::new(markers), options);
    if let Some((config, dest)) = boot {
        orchestrator = orchestrator.with_boot_config(config, dest);
    }
    if let Some(dir) = &profile.output.transcripts {
        let dir = profile.resolve(dir);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create transcript dir `{}`", dir.display()))?;
        orchestrator = orchestrator.with_transcripts(dir);
    }

    let log_path = profile.resolve(&profile.output.log);
    let mut tee = OutputTee::new();
    if profile.echo {
        tee = tee.with_echo();
    }
    let mut tee = tee
        .with_file(&log_path, profile.output.append)
        .with_context(|| format!("failed to open output log `{}`", log_path.display()))?;

    let classifier = Classifier::default();
    let results = match profile.mode {
        RunMode::PerCase => {
            orchestrator
                .run_cases(&run_set, &baseline, &mut tee)
                .await?
        }
        RunMode::Batch => {
            let mut excluded = manifest.excluded().to_vec();
            if let Some(exceptions) = &exceptions {
                excluded.extend(exceptions.cases().cloned());
            }
            let filter = Manifest::with_partitions(run_set.clone(), excluded);
            orchestrator
                .run_batch(&filter, &run_set, &classifier, &mut tee)
                .await?
        }
    };
    tee.flush();
    drop(tee);
    orchestrator.close();

    let report = report::aggregate(results, &baseline);
    write_artifacts(profile, &report, &log_path, &classifier)?;
    Ok(report)
}

async fn open_target(profile: &Profile) -> Result<Target> {
    match &profile.target {
        TargetConfig::Process { grace_ms, .. } => {
            let command = profile
                .launch_command()
                .context("process target without a launch command")?;
            Ok(Target::Process(ProcessTarget::new(
                command,
                Duration::from_millis(*grace_ms),
            )))
        }
        TargetConfig::Serial {
            device,
            prompt,
            invocation,
            interrupt,
            settle_ms,
            await_echo,
        } => {
            let settings = SerialSettings {
                prompt: prompt.clone(),
                invocation: invocation.clone(),
                interrupt: *interrupt,
                settle: Duration::from_millis(*settle_ms),
                await_echo: *await_echo,
            };
            let console = SerialConsole::open(&profile.resolve(device), settings).await?;
            Ok(Target::Serial(console))
        }
    }
}

fn write_artifacts(
    profile: &Profile,
    report: &Report,
    log_path: &Path,
    classifier: &Classifier,
) -> Result<()> {
    let output = &profile.output;

    let result_path = profile.resolve(&output.result);
    report
        .write_result_file(&result_path, output.append)
        .with_context(|| format!("failed to write result file `{}`", result_path.display()))?;

    if let Some(path) = &output.statistics {
        let path = profile.resolve(path);
        let log = fs::read_to_string(log_path)
            .with_context(|| format!("failed to read output log `{}`", log_path.display()))?;
        let transcripts = classifier.failure_transcripts(&log);
        fs::write(&path, classify::render_transcripts(&transcripts))
            .with_context(|| format!("failed to write statistics `{}`", path.display()))?;
    }
    if let Some(path) = &output.failed_list {
        let path = profile.resolve(path);
        report
            .write_failed_list(&path)
            .with_context(|| format!("failed to write failed list `{}`", path.display()))?;
    }
    if let Some(path) = &output.json {
        let path = profile.resolve(path);
        report
            .write_json(&path)
            .with_context(|| format!("failed to write JSON report `{}`", path.display()))?;
    }
    Ok(())
}
