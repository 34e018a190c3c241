//! The harness profile.
//!
//! A profile is a TOML file describing one target environment and where the
//! run reads its cases and writes its results. Relative paths are resolved
//! against the directory containing the profile.
//!
//! ```toml
//! environment = "emulator"
//! mode = "per-case"
//!
//! [target]
//! kind = "process"
//! program = "make"
//! args = ["-C", "../zCore", "baremetal-test"]
//!
//! [boot_config]
//! template = "rboot.conf"
//! destination = "../zCore/rboot.conf"
//! value = "LOG=error:console.shell=true:ROOTPROC={case}?"
//!
//! [cases]
//! all = "linux/baremetal-test-allow.txt"
//! exceptions = "linux/baremetal-test-fail.txt"
//! ```

use crate::{
    boot_config::{BootConfig, DEFAULT_MARKER},
    errors::{ConfigFormatError, HarnessError, ManifestReadError, ProfileError},
    manifest::{self, Manifest},
    report::Baseline,
    session::{LaunchCommand, SerialSettings},
    watcher::Markers,
};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// The class of environment under test. Selects default timeouts and
/// markers.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    /// A full-system emulator booting the kernel image.
    #[default]
    Emulator,
    /// The kernel running as an ordinary host process.
    Libos,
    /// Native hardware reached over a serial console.
    Hardware,
}

impl Environment {
    pub fn default_timeout(self) -> Duration {
        match self {
            Environment::Emulator => Duration::from_secs(100),
            Environment::Libos => Duration::from_secs(8),
            Environment::Hardware => Duration::from_secs(60),
        }
    }

    fn default_success(self) -> Vec<String> {
        match self {
            Environment::Emulator | Environment::Libos => vec!["finished!".to_owned()],
            // The shell prompt is the success marker on hardware.
            Environment::Hardware => Vec::new(),
        }
    }

    fn default_failure(self) -> Vec<String> {
        match self {
            Environment::Emulator | Environment::Libos => vec!["panicked".to_owned()],
            Environment::Hardware => ["failed", "ERROR", "panicked"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
        }
    }
}

/// How cases map onto sessions.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// One session per case; the watcher's outcome is the case's outcome.
    #[default]
    PerCase,
    /// One session for the whole manifest, passed as `{filter}`; per-case
    /// results are read from the captured log.
    Batch,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TargetConfig {
    Process {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        cwd: Option<PathBuf>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default = "default_grace_ms")]
        grace_ms: u64,
    },
    Serial {
        device: PathBuf,
        #[serde(default = "default_prompt")]
        prompt: String,
        #[serde(default = "default_invocation")]
        invocation: String,
        #[serde(default = "default_true")]
        interrupt: bool,
        /// Quiet period before each invocation is typed.
        #[serde(default = "default_settle_ms")]
        settle_ms: u64,
        #[serde(default = "default_true")]
        await_echo: bool,
    },
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkerConfig {
    pub success: Option<Vec<String>>,
    pub failure: Option<Vec<String>>,
    /// Treat markers as regular expressions instead of substrings.
    #[serde(default)]
    pub regex: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootConfigSection {
    pub template: PathBuf,
    pub destination: PathBuf,
    #[serde(default = "default_marker")]
    pub marker: String,
    /// Per-case value for the marker line; `{case}` is replaced by the case.
    pub value: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CasesConfig {
    #[serde(alias = "all")]
    pub manifest: Option<PathBuf>,
    pub suites: Option<PathBuf>,
    pub exceptions: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaselineConfig {
    pub allow_failing: Option<PathBuf>,
    pub must_pass: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_log")]
    pub log: PathBuf,
    #[serde(default = "default_result")]
    pub result: PathBuf,
    /// Append to existing log and result files instead of truncating them.
    #[serde(default)]
    pub append: bool,
    pub statistics: Option<PathBuf>,
    pub failed_list: Option<PathBuf>,
    pub json: Option<PathBuf>,
    /// Directory receiving one transcript file per case.
    pub transcripts: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log: default_log(),
            result: default_result(),
            append: false,
            statistics: None,
            failed_list: None,
            json: None,
            transcripts: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub mode: RunMode,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub fail_fast: bool,
    /// When the stream ends with no marker, let a zero exit status count as
    /// a pass.
    #[serde(default)]
    pub exit_status_verdict: bool,
    #[serde(default = "default_true")]
    pub echo: bool,
    pub target: TargetConfig,
    #[serde(default)]
    pub markers: MarkerConfig,
    pub boot_config: Option<BootConfigSection>,
    #[serde(default)]
    pub cases: CasesConfig,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub output: OutputConfig,

    #[serde(skip)]
    root: PathBuf,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let text = fs::read_to_string(path).map_err(|err| ProfileError::Read {
            path: path.to_owned(),
            err,
        })?;
        let root = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        Self::parse(&text, root).map_err(|err| ProfileError::Parse {
            path: path.to_owned(),
            err,
        })
    }

    pub fn parse(text: &str, root: &Path) -> Result<Self, toml::de::Error> {
        let mut profile: Profile = toml::from_str(text)?;
        profile.root = root.to_owned();
        Ok(profile)
    }

    /// Resolves a profile-relative path.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.root.join(path)
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.environment.default_timeout())
    }

    pub fn markers(&self) -> Result<Markers, ProfileError> {
        let mut success = self
            .markers
            .success
            .clone()
            .unwrap_or_else(|| self.environment.default_success());
        let failure = self
            .markers
            .failure
            .clone()
            .unwrap_or_else(|| self.environment.default_failure());

        if let TargetConfig::Serial { prompt, .. } = &self.target {
            let prompt = if self.markers.regex {
                regex::escape(prompt)
            } else {
                prompt.clone()
            };
            if !success.contains(&prompt) {
                success.push(prompt);
            }
        }

        if self.markers.regex {
            Markers::regexes(&success, &failure)
        } else {
            Ok(Markers::substrings(&success, &failure))
        }
    }

    /// The launch command for process targets, with a profile-relative
    /// working directory resolved.
    pub fn launch_command(&self) -> Option<LaunchCommand> {
        match &self.target {
            TargetConfig::Process {
                program,
                args,
                cwd,
                env,
                ..
            } => {
                let mut command = LaunchCommand::new(program.clone()).args(args.iter().cloned());
                command.cwd = Some(match cwd {
                    Some(cwd) => self.resolve(cwd),
                    None => self.root.clone(),
                });
                command.env = env.clone();
                Some(command)
            }
            TargetConfig::Serial { .. } => None,
        }
    }

    /// Loads every configured case source into one manifest, plus the
    /// exception list if any.
    pub fn load_cases(&self) -> Result<(Manifest, Option<Manifest>), HarnessError> {
        let cases = &self.cases;
        if cases.manifest.is_none() && cases.suites.is_none() {
            return Err(ProfileError::NoCases.into());
        }

        let mut manifest = Manifest::default();
        if let Some(path) = &cases.manifest {
            manifest.merge(Manifest::load(&self.resolve(path))?);
        }
        if let Some(path) = &cases.suites {
            manifest.merge(manifest::load_suites(&self.resolve(path))?);
        }
        let exceptions = cases
            .exceptions
            .as_ref()
            .map(|path| Manifest::load(&self.resolve(path)))
            .transpose()?;
        Ok((manifest, exceptions))
    }

    pub fn baseline(&self) -> Result<Baseline, ManifestReadError> {
        let mut baseline = Baseline::default();
        if let Some(path) = &self.baseline.allow_failing {
            baseline.allow_failing = manifest::load_key_set(&self.resolve(path))?;
        }
        if let Some(path) = &self.baseline.must_pass {
            baseline.must_pass = Some(manifest::load_key_set(&self.resolve(path))?);
        }
        Ok(baseline)
    }

    /// Loads and validates the boot-config template, if one is configured.
    pub fn boot_config(&self) -> Result<Option<(BootConfig, PathBuf)>, ConfigFormatError> {
        let Some(section) = &self.boot_config else {
            return Ok(None);
        };
        let config = BootConfig::load(
            &self.resolve(&section.template),
            &section.marker,
            section.value.as_deref(),
        )?;
        Ok(Some((config, self.resolve(&section.destination))))
    }
}

fn default_true() -> bool {
    true
}

fn default_grace_ms() -> u64 {
    2_000
}

fn default_settle_ms() -> u64 {
    SerialSettings::default().settle.as_millis() as u64
}

fn default_prompt() -> String {
    SerialSettings::default().prompt
}

fn default_invocation() -> String {
    SerialSettings::default().invocation
}

fn default_marker() -> String {
    DEFAULT_MARKER.to_owned()
}

fn default_log() -> PathBuf {
    PathBuf::from("test-output.txt")
}

fn default_result() -> PathBuf {
    PathBuf::from("test-result.txt")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORE_TESTS: &str = r#"
environment = "emulator"
mode = "batch"
timeout_secs = 300

[target]
kind = "process"
program = "make"
args = ["-C", "../zCore", "test", "mode=release", "test_filter={filter}"]

[cases]
manifest = "zircon/testcases.txt"

[baseline]
must_pass = "zircon/test-check-passed.txt"

[output]
log = "zircon/test-output.txt"
result = "zircon/test-result.txt"
statistics = "zircon/test-statistic.txt"
"#;

    #[test]
    fn parses_batch_profile() {
        let profile = Profile::parse(CORE_TESTS, Path::new("/ci")).unwrap();
        assert_eq!(profile.mode, RunMode::Batch);
        assert_eq!(profile.timeout(), Duration::from_secs(300));
        assert!(profile.echo);
        assert_eq!(
            profile.resolve(&profile.output.log),
            Path::new("/ci/zircon/test-output.txt")
        );

        let command = profile.launch_command().unwrap();
        assert_eq!(command.program, "make");
        assert_eq!(command.cwd.as_deref(), Some(Path::new("/ci")));
        assert_eq!(command.args.last().unwrap(), "test_filter={filter}");
    }

    #[test]
    fn environment_defaults() {
        let profile = Profile::parse(
            "environment = \"libos\"\n[target]\nkind = \"process\"\nprogram = \"cargo\"\n",
            Path::new("."),
        )
        .unwrap();
        assert_eq!(profile.timeout(), Duration::from_secs(8));
        assert_eq!(profile.mode, RunMode::PerCase);
        let markers = profile.markers().unwrap();
        assert!(markers.check("test finished!").is_some());
        assert!(markers.check("panicked at src/main.rs").is_some());
    }

    #[test]
    fn serial_prompt_is_a_success_marker() {
        let profile = Profile::parse(
            "environment = \"hardware\"\n[target]\nkind = \"serial\"\ndevice = \"/dev/ttyUSB0\"\n",
            Path::new("."),
        )
        .unwrap();
        assert_eq!(profile.timeout(), Duration::from_secs(60));
        assert!(profile.launch_command().is_none());
        assert!(matches!(
            &profile.target,
            TargetConfig::Serial { settle_ms: 300, await_echo: true, .. }
        ));
        let markers = profile.markers().unwrap();
        assert_eq!(
            markers.check("/ # "),
            Some(crate::watcher::MarkerMatch::Success("/ # ".to_owned()))
        );
        assert!(markers.check("ERROR: bad syscall").is_some());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Profile::parse(
            "timeout = 3\n[target]\nkind = \"process\"\nprogram = \"qemu\"\n",
            Path::new("."),
        );
        assert!(err.is_err());
    }

    #[test]
    fn missing_case_source_is_an_error() {
        let profile =
            Profile::parse("[target]\nkind = \"process\"\nprogram = \"qemu\"\n", Path::new("."))
                .unwrap();
        assert!(matches!(
            profile.load_cases(),
            Err(HarnessError::Profile(ProfileError::NoCases))
        ));
    }
}
