use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};
use test_runner::{
    classify,
    manifest::load_key_set,
    orchestrator,
    report::{self, FailureCause},
    Baseline, Outcome, Profile, Report, ResultSet, Verdict,
};

/// Exit status for setup errors that stop a run before any verdict exists.
const EXIT_FATAL: u8 = 2;

#[derive(Parser)]
#[command(name = "test-runner", about = "Kernel regression test execution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every case a profile describes
    Run {
        /// Path to the TOML run profile
        #[arg(short, long)]
        profile: PathBuf,

        /// Per-case timeout in seconds, overriding the profile
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Stop at the first failure outside the allow-list
        #[arg(long)]
        fail_fast: bool,

        /// Do not echo console output to the terminal
        #[arg(short, long)]
        quiet: bool,
    },
    /// Classify a saved batch log into per-case verdicts
    Classify {
        /// Console log with RUN/OK/FAILED records
        log: PathBuf,

        /// Write a PASSED:/FAILED: result file here
        #[arg(short, long)]
        result: Option<PathBuf>,

        /// Case list that must appear as passed
        #[arg(short, long)]
        must_pass: Option<PathBuf>,
    },
    /// Extract the console transcript of every failing case
    Failures {
        /// Console log with RUN/OK/FAILED records
        log: PathBuf,

        /// Destination of the framed transcripts
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run {
            profile,
            timeout,
            fail_fast,
            quiet,
        } => run(profile, timeout, fail_fast, quiet).await,
        Command::Classify {
            log,
            result,
            must_pass,
        } => classify_log(log, result, must_pass),
        Command::Failures { log, output } => failures(log, output).map(|()| 0),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(
    profile_path: PathBuf,
    timeout: Option<u64>,
    fail_fast: bool,
    quiet: bool,
) -> Result<u8> {
    let mut profile = Profile::load(&profile_path)?;
    if timeout.is_some() {
        profile.timeout_secs = timeout;
    }
    profile.fail_fast |= fail_fast;
    if quiet {
        profile.echo = false;
    }

    tracing::info!(
        profile = %profile_path.display(),
        environment = ?profile.environment,
        mode = ?profile.mode,
        "Starting test run"
    );

    let report = orchestrator::run(&profile).await?;
    print_summary(&report);
    Ok(report.exit_code())
}

fn classify_log(log: PathBuf, result: Option<PathBuf>, must_pass: Option<PathBuf>) -> Result<u8> {
    let text = read_log(&log)?;

    let mut results = ResultSet::new();
    for (case, verdict) in classify::classify(&text) {
        let outcome = match verdict {
            Verdict::Passed => Outcome::Passed,
            Verdict::Failed => Outcome::failed(FailureCause::Record),
        };
        results.record(case, outcome);
    }

    let baseline = Baseline {
        must_pass: must_pass.as_deref().map(load_key_set).transpose()?,
        ..Baseline::default()
    };
    let report = report::aggregate(results, &baseline);
    if let Some(path) = &result {
        report
            .write_result_file(path, false)
            .with_context(|| format!("failed to write result file `{}`", path.display()))?;
    }
    print_summary(&report);
    Ok(report.exit_code())
}

fn failures(log: PathBuf, output: PathBuf) -> Result<()> {
    let text = read_log(&log)?;
    let transcripts = classify::Classifier::default().failure_transcripts(&text);
    fs::write(&output, classify::render_transcripts(&transcripts))
        .with_context(|| format!("failed to write `{}`", output.display()))?;
    tracing::info!(
        failures = transcripts.len(),
        output = %output.display(),
        "Wrote failure transcripts"
    );
    Ok(())
}

fn read_log(path: &Path) -> Result<String> {
    // Console logs are not guaranteed to be valid UTF-8.
    let bytes =
        fs::read(path).with_context(|| format!("failed to read log `{}`", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn print_summary(report: &Report) {
    print!("{}", report.render_summary());
}
