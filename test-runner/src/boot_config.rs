//! Per-case rewriting of the boot configuration handed to the target.
//!
//! The template is parsed once; each case only changes the value of the
//! single line that starts with the marker. Every other line, terminators
//! included, is carried through byte-for-byte.

use crate::{errors::ConfigFormatError, manifest::TestCase};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::debug;

pub const DEFAULT_MARKER: &str = "cmdline=";
pub const CASE_PLACEHOLDER: &str = "{case}";

#[derive(Clone, Debug)]
pub struct BootConfig {
    source: PathBuf,
    lines: Vec<String>,
    marker_line: usize,
    marker: String,
    value_template: String,
}

impl BootConfig {
    /// Loads and validates a template.
    ///
    /// `value` overrides the marker line's current value as the per-case value
    /// template.
    pub fn load(path: &Path, marker: &str, value: Option<&str>) -> Result<Self, ConfigFormatError> {
        let text = fs::read_to_string(path).map_err(|err| ConfigFormatError::Read {
            path: path.to_owned(),
            err,
        })?;
        Self::parse(path, &text, marker, value)
    }

    pub fn parse(
        source: &Path,
        text: &str,
        marker: &str,
        value: Option<&str>,
    ) -> Result<Self, ConfigFormatError> {
        let lines: Vec<String> = text.split_inclusive('\n').map(str::to_owned).collect();
        let matches: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.starts_with(marker))
            .map(|(index, _)| index)
            .collect();

        let marker_line = match matches.as_slice() {
            [index] => *index,
            [] => {
                return Err(ConfigFormatError::MarkerMissing {
                    path: source.to_owned(),
                    marker: marker.to_owned(),
                })
            }
            _ => {
                return Err(ConfigFormatError::MarkerAmbiguous {
                    path: source.to_owned(),
                    marker: marker.to_owned(),
                    count: matches.len(),
                })
            }
        };

        let value_template = match value {
            Some(value) => value.to_owned(),
            None => {
                let (body, _) = split_terminator(&lines[marker_line]);
                body[marker.len()..].to_owned()
            }
        };

        Ok(Self {
            source: source.to_owned(),
            lines,
            marker_line,
            marker: marker.to_owned(),
            value_template,
        })
    }

    /// The value the marker line carries for `case`.
    pub fn value_for(&self, case: &TestCase) -> String {
        if self.value_template.contains(CASE_PLACEHOLDER) {
            self.value_template.replace(CASE_PLACEHOLDER, case.id())
        } else {
            format!("{}{}", self.value_template, case.id())
        }
    }

    /// Renders the full document for `case`.
    pub fn apply(&self, case: &TestCase) -> String {
        let mut out = String::with_capacity(self.lines.iter().map(String::len).sum::<usize>() + 64);
        for (index, line) in self.lines.iter().enumerate() {
            if index == self.marker_line {
                let (_, terminator) = split_terminator(line);
                out.push_str(&self.marker);
                out.push_str(&self.value_for(case));
                out.push_str(terminator);
            } else {
                out.push_str(line);
            }
        }
        out
    }

    /// Writes the document for `case` to `dest`.
    ///
    /// The text goes to a temporary file next to `dest`, is synced, and is
    /// then renamed over `dest`, so a reader sees either the old or the new
    /// document and never a partial one.
    pub fn write(&self, case: &TestCase, dest: &Path) -> Result<(), ConfigFormatError> {
        let text = self.apply(case);
        let write_err = |err| ConfigFormatError::Write {
            path: dest.to_owned(),
            err,
        };

        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(text.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(dest).map_err(|err| write_err(err.error))?;

        debug!(
            case = %case,
            template = %self.source.display(),
            dest = %dest.display(),
            "wrote boot config"
        );
        Ok(())
    }
}

fn split_terminator(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RBOOT: &str = "\
# The config file for rboot.
# cmdline=commented out
physical_memory_offset=0xFFFF800000000000\r
kernel_path=\\EFI\\zCore\\zcore.elf

resolution=1024x768
cmdline=LOG=warn:userboot=test/core-standalone-test:core-tests=Old.Case
initramfs=\\EFI\\zCore\\fuchsia.zbi
";

    fn template(value: Option<&str>) -> BootConfig {
        BootConfig::parse(Path::new("rboot.conf"), RBOOT, DEFAULT_MARKER, value).unwrap()
    }

    #[test]
    fn rewrites_only_the_marker_line() {
        let config = template(Some("LOG=warn:core-tests={case}"));
        let out = config.apply(&TestCase::in_suite("Channel", "Create"));

        let expected = RBOOT.replace(
            "cmdline=LOG=warn:userboot=test/core-standalone-test:core-tests=Old.Case",
            "cmdline=LOG=warn:core-tests=Channel.Create",
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn appends_case_without_placeholder() {
        let text = "kernel_path=x\ncmdline=LOG=error:ROOTPROC=\n";
        let config = BootConfig::parse(Path::new("c"), text, DEFAULT_MARKER, None).unwrap();
        let out = config.apply(&TestCase::new("/libc-test/src/functional/argv.exe"));
        assert_eq!(
            out,
            "kernel_path=x\ncmdline=LOG=error:ROOTPROC=/libc-test/src/functional/argv.exe\n"
        );
    }

    #[test]
    fn apply_is_idempotent() {
        let config = template(Some("ROOTPROC={case}?"));
        let case = TestCase::new("/bin/busybox");
        assert_eq!(config.apply(&case), config.apply(&case));

        let other = config.apply(&TestCase::new("/bin/ls"));
        let first = config.apply(&case);
        let differing: Vec<_> = first
            .lines()
            .zip(other.lines())
            .filter(|(a, b)| a != b)
            .collect();
        assert_eq!(differing.len(), 1);
        assert!(differing[0].0.starts_with(DEFAULT_MARKER));
    }

    #[test]
    fn missing_marker_is_a_format_error() {
        let err = BootConfig::parse(Path::new("c"), "# cmdline=x\nkernel=y\n", DEFAULT_MARKER, None)
            .unwrap_err();
        assert!(matches!(err, ConfigFormatError::MarkerMissing { .. }), "{err:?}");
    }

    #[test]
    fn duplicate_marker_is_a_format_error() {
        let err = BootConfig::parse(Path::new("c"), "cmdline=a\ncmdline=b\n", DEFAULT_MARKER, None)
            .unwrap_err();
        assert!(
            matches!(err, ConfigFormatError::MarkerAmbiguous { count: 2, .. }),
            "{err:?}"
        );
    }

    #[test]
    fn write_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("rboot.conf");
        fs::write(&dest, "stale").unwrap();

        let config = template(None);
        let case = TestCase::new("New.Case");
        config.write(&case, &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), config.apply(&case));

        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1, "temporary file left behind");
    }
}
