//! Target environments and the sessions started on them.
//!
//! A [`Target`] is the single physical or virtual resource cases run against:
//! a command that boots the kernel (QEMU, the libos loader, `make test`) or a
//! serial console attached to real hardware. [`Target::start`] borrows the
//! target mutably for as long as the returned [`Session`] lives, so two
//! sessions can never share one target.
//!
//! Console output reaches the session as whole lines through a channel fed by
//! reader tasks.

use crate::errors::LaunchError;
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info, warn};

const LINE_CHANNEL_CAPACITY: usize = 1024;
const CTRL_C: u8 = 0x03;

/// Values substituted into launch templates.
#[derive(Clone, Copy, Debug, Default)]
pub struct LaunchVars<'a> {
    /// `{case}`: the case identifier.
    pub case: Option<&'a str>,
    /// `{filter}`: a batch filter covering many cases.
    pub filter: Option<&'a str>,
    /// `{config}`: where the boot configuration was written.
    pub config: Option<&'a Path>,
}

impl LaunchVars<'_> {
    pub fn render(&self, template: &str) -> String {
        let mut out = template.to_owned();
        if let Some(case) = self.case {
            out = out.replace("{case}", case);
        }
        if let Some(filter) = self.filter {
            out = out.replace("{filter}", filter);
        }
        if let Some(config) = self.config {
            out = out.replace("{config}", &config.display().to_string());
        }
        out
    }
}

/// A command template that boots the environment under test.
#[derive(Clone, Debug)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn rendered_args(&self, vars: &LaunchVars<'_>) -> Vec<String> {
        self.args.iter().map(|arg| vars.render(arg)).collect()
    }

    fn resolve_program(&self) -> Result<PathBuf, LaunchError> {
        // Anything with a separator is a path relative to the working
        // directory, not a PATH lookup.
        if self.program.contains(std::path::MAIN_SEPARATOR) || self.program.contains('/') {
            return Ok(PathBuf::from(&self.program));
        }
        which::which(&self.program).map_err(|err| LaunchError::ProgramNotFound {
            program: self.program.clone(),
            err,
        })
    }
}

/// Whether the environment behind a session is still running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(Option<i32>),
    Killed,
}

/// The resource cases run against.
pub enum Target {
    Process(ProcessTarget),
    Serial(SerialConsole),
}

impl Target {
    /// Starts a session for one case.
    pub async fn start(
        &mut self,
        vars: &LaunchVars<'_>,
        deadline: Instant,
    ) -> Result<Session<'_>, LaunchError> {
        let started = Instant::now();
        let inner = match self {
            Target::Process(target) => SessionInner::Child(target.spawn(vars)?),
            Target::Serial(console) => {
                console.begin(vars, deadline).await?;
                SessionInner::Serial(console)
            }
        };
        Ok(Session {
            inner,
            started,
            stopped: false,
        })
    }

    /// Releases the target. Only serial consoles hold resources between
    /// cases.
    pub fn close(self) {
        if let Target::Serial(console) = self {
            console.close();
        }
    }
}

pub struct ProcessTarget {
    command: LaunchCommand,
    grace: Duration,
}

impl ProcessTarget {
    pub fn new(command: LaunchCommand, grace: Duration) -> Self {
        Self { command, grace }
    }

    fn spawn(&self, vars: &LaunchVars<'_>) -> Result<ChildSession, LaunchError> {
        let program = self.command.resolve_program()?;
        let args = self.command.rendered_args(vars);

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .envs(&self.command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.command.cwd {
            cmd.current_dir(cwd);
        }
        new_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|err| LaunchError::Spawn {
            program: self.command.program.clone(),
            err,
        })?;
        debug!(program = %program.display(), ?args, pid = ?child.id(), "spawned target");

        let (tx, lines) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader("stdout", stdout, None, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader("stderr", stderr, None, tx));
        }

        Ok(ChildSession {
            pid: child.id(),
            child,
            lines,
            readers,
            grace: self.grace,
            liveness: Liveness::Running,
            group_signalled: false,
        })
    }
}

struct ChildSession {
    child: Child,
    pid: Option<u32>,
    lines: mpsc::Receiver<String>,
    readers: Vec<JoinHandle<()>>,
    grace: Duration,
    liveness: Liveness,
    group_signalled: bool,
}

impl ChildSession {
    fn poll_liveness(&mut self) -> Liveness {
        if self.liveness == Liveness::Running {
            match self.child.try_wait() {
                Ok(Some(status)) => self.liveness = Liveness::Exited(status.code()),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "failed to poll target process"),
            }
        }
        self.liveness
    }

    async fn wait_exit(&mut self, within: Duration) -> Liveness {
        if self.poll_liveness() == Liveness::Running {
            if let Ok(Ok(status)) = timeout(within, self.child.wait()).await {
                self.liveness = Liveness::Exited(status.code());
            }
        }
        self.liveness
    }

    async fn stop(&mut self) -> Liveness {
        // The leader may be gone while processes it started (an emulator
        // under `make`) still hold the group.
        if !self.group_signalled {
            kill_process_group(self.pid);
            self.group_signalled = true;
        }
        if self.poll_liveness() == Liveness::Running {
            if let Err(err) = self.child.start_kill() {
                debug!(error = %err, "start_kill failed, process likely gone");
            }
            match timeout(self.grace, self.child.wait()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(error = %err, "failed to reap target process"),
                Err(_) => warn!(
                    pid = ?self.pid,
                    grace_ms = self.grace.as_millis() as u64,
                    "target process did not exit after kill"
                ),
            }
            self.liveness = Liveness::Killed;
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        self.lines.close();
        self.liveness
    }
}

// A fresh process group lets stop() take down wrappers such as `make`
// together with the emulator they started.
#[cfg(unix)]
fn new_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn new_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) {
        // SAFETY: kill(2) takes no pointers; a stale group id only yields ESRCH.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// How cases are driven on a serial console.
#[derive(Clone, Debug)]
pub struct SerialSettings {
    /// The shell's idle prompt. It carries no trailing newline.
    pub prompt: String,
    /// Command line typed for each case, with launch placeholders.
    pub invocation: String,
    /// Send Ctrl-C when a case is abandoned before the prompt returns.
    pub interrupt: bool,
    /// Quiet period that must pass before the invocation is typed.
    pub settle: Duration,
    /// Ignore markers until the shell echoes the invocation back.
    pub await_echo: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            prompt: "/ # ".to_owned(),
            invocation: "{case}".to_owned(),
            interrupt: true,
            settle: Duration::from_millis(300),
            await_echo: true,
        }
    }
}

/// A long-lived serial console on native hardware.
///
/// The device is opened once and never restarted. Each case waits for the
/// shell's idle prompt, discards whatever else is still queued, and then
/// types the case's invocation.
pub struct SerialConsole {
    device: PathBuf,
    settings: SerialSettings,
    writer: File,
    lines: mpsc::Receiver<String>,
    reader: JoinHandle<()>,
    idle: bool,
    typed: String,
}

impl SerialConsole {
    /// Opens `device` for reading and writing. Line settings (baud rate,
    /// raw mode) are expected to be configured already.
    pub async fn open(device: &Path, settings: SerialSettings) -> Result<Self, LaunchError> {
        let open_err = |err| LaunchError::SerialOpen {
            device: device.to_owned(),
            err,
        };
        let read_half = tty_options()
            .read(true)
            .open(device)
            .await
            .map_err(open_err)?;
        let writer = tty_options()
            .write(true)
            .open(device)
            .await
            .map_err(open_err)?;

        let (tx, lines) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let reader = spawn_reader("serial", read_half, Some(settings.prompt.clone()), tx);
        info!(device = %device.display(), "opened serial console");

        Ok(Self {
            device: device.to_owned(),
            settings,
            writer,
            lines,
            reader,
            idle: false,
            typed: String::new(),
        })
    }

    async fn begin(&mut self, vars: &LaunchVars<'_>, deadline: Instant) -> Result<(), LaunchError> {
        if !self.idle {
            self.resync(deadline).await?;
        }
        self.settle(deadline).await?;

        self.typed = vars.render(&self.settings.invocation);
        let mut line = self.typed.clone();
        line.push('\n');
        self.send(line.as_bytes()).await.map_err(LaunchError::SerialWrite)?;
        self.idle = false;
        Ok(())
    }

    /// Discards queued output until the console has been quiet for the
    /// settle period. Leftover prompts from an earlier case must not reach
    /// the next case's watcher.
    async fn settle(&mut self, deadline: Instant) -> Result<(), LaunchError> {
        loop {
            let quiet = (Instant::now() + self.settings.settle).min(deadline);
            tokio::select! {
                biased;
                line = self.lines.recv() => match line {
                    Some(line) => debug!(%line, "discarding stale console output"),
                    None => return Err(LaunchError::SerialClosed),
                },
                () = sleep_until(quiet) => return Ok(()),
            }
        }
    }

    /// Whether `line` is the shell's idle prompt.
    fn is_prompt(&self, line: &str) -> bool {
        let prompt = self.settings.prompt.trim_end();
        !prompt.is_empty() && line.trim_end().ends_with(prompt)
    }

    /// Pokes the shell and discards output until the idle prompt shows up.
    async fn resync(&mut self, deadline: Instant) -> Result<(), LaunchError> {
        let started = Instant::now();
        self.send(b"\n").await.map_err(LaunchError::SerialWrite)?;
        loop {
            let line = tokio::select! {
                biased;
                line = self.lines.recv() => line,
                () = sleep_until(deadline) => {
                    return Err(LaunchError::Resync {
                        prompt: self.settings.prompt.clone(),
                        waited_secs: started.elapsed().as_secs(),
                    });
                }
            };
            match line {
                Some(line) if self.is_prompt(&line) => return Ok(()),
                Some(line) => debug!(%line, "discarding output while waiting for prompt"),
                None => return Err(LaunchError::SerialClosed),
            }
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    fn close(self) {
        self.reader.abort();
        debug!(device = %self.device.display(), "closed serial console");
    }
}

// A console device must not become the harness's controlling terminal.
#[cfg(unix)]
fn tty_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.custom_flags(libc::O_NOCTTY);
    options
}

#[cfg(not(unix))]
fn tty_options() -> OpenOptions {
    OpenOptions::new()
}

enum SessionInner<'t> {
    Child(ChildSession),
    Serial(&'t mut SerialConsole),
}

/// One environment instance bound to one case.
pub struct Session<'t> {
    inner: SessionInner<'t>,
    started: Instant,
    stopped: bool,
}

impl Session<'_> {
    pub fn lines(&mut self) -> &mut mpsc::Receiver<String> {
        match &mut self.inner {
            SessionInner::Child(child) => &mut child.lines,
            SessionInner::Serial(console) => &mut console.lines,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn liveness(&mut self) -> Liveness {
        match &mut self.inner {
            SessionInner::Child(child) => child.poll_liveness(),
            SessionInner::Serial(_) => Liveness::Running,
        }
    }

    /// Waits up to `within` for a process whose output has ended to exit on
    /// its own.
    pub async fn wait_exit(&mut self, within: Duration) -> Liveness {
        match &mut self.inner {
            SessionInner::Child(child) => child.wait_exit(within).await,
            SessionInner::Serial(_) => Liveness::Running,
        }
    }

    /// The line the target echoes back once it has accepted the case's
    /// command. Output before it belongs to an earlier case.
    pub fn echo_gate(&self) -> Option<&str> {
        match &self.inner {
            SessionInner::Serial(console) if console.settings.await_echo => {
                Some(console.typed.as_str())
            }
            _ => None,
        }
    }

    /// Records that the case ended on `line`. Only the idle prompt itself
    /// lets the next case skip re-synchronisation.
    pub fn ended_on(&mut self, line: &str) {
        if let SessionInner::Serial(console) = &mut self.inner {
            console.idle = console.is_prompt(line);
        }
    }

    /// Ends the session. Processes are killed (with their process group) if
    /// still running; a serial console that is not idle gets an interrupt.
    /// Safe to call more than once.
    pub async fn stop(&mut self) -> Liveness {
        let first = !std::mem::replace(&mut self.stopped, true);
        match &mut self.inner {
            SessionInner::Child(child) => child.stop().await,
            SessionInner::Serial(console) => {
                if first && !console.idle && console.settings.interrupt {
                    if let Err(err) = console.send(&[CTRL_C]).await {
                        warn!(error = %err, "failed to interrupt serial console");
                    }
                }
                Liveness::Running
            }
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let SessionInner::Child(child) = &mut self.inner {
            for reader in child.readers.drain(..) {
                reader.abort();
            }
        }
    }
}

/// Splits a byte stream into lines and sends them on `tx`.
///
/// Carriage returns before a newline are dropped. A pending partial line is
/// sent early once it ends with `flush_suffix`, because shell prompts are not
/// newline-terminated.
fn spawn_reader<R>(
    name: &'static str,
    reader: R,
    flush_suffix: Option<String>,
    tx: mpsc::Sender<String>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut framer = LineFramer::new(reader, flush_suffix);
        loop {
            match framer.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(stream = name, error = %err, "console read failed");
                    break;
                }
            }
        }
    })
}

struct LineFramer<R> {
    reader: R,
    buf: Vec<u8>,
    flush_suffix: Option<Vec<u8>>,
}

impl<R: AsyncRead + Unpin> LineFramer<R> {
    fn new(reader: R, flush_suffix: Option<String>) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(4096),
            flush_suffix: flush_suffix
                .filter(|suffix| !suffix.is_empty())
                .map(String::into_bytes),
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            let at_prompt = self
                .flush_suffix
                .as_ref()
                .is_some_and(|suffix| self.buf.ends_with(suffix));
            if at_prompt {
                return Ok(Some(self.take_all()));
            }
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_all()));
            }
        }
    }

    fn take_all(&mut self) -> String {
        let bytes = std::mem::take(&mut self.buf);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
