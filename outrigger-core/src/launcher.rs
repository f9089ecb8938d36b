use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::oneshot;

const SIDECAR_DIR: &str = "sidecar";
const BIN_DIR: &str = "bin";
const SIDECAR_NAME: &str = "sidecar";

/// `CREATE_NO_WINDOW`: keeps a console window from popping up for the child.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Readable byte stream attached to one of the child's output pipes.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Whether the shell runs from a source checkout or from an installed bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[serde(alias = "dev")]
    Development,
    #[serde(alias = "production", alias = "prod")]
    Packaged,
}

impl RunMode {
    /// Mode implied by the build profile when nothing else configures it.
    pub fn from_build() -> Self {
        if cfg!(debug_assertions) {
            RunMode::Development
        } else {
            RunMode::Packaged
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(RunMode::Development),
            "packaged" | "production" | "prod" => Ok(RunMode::Packaged),
            other => Err(format!(
                "Unknown run mode '{}' (expected 'development' or 'packaged')",
                other
            )),
        }
    }
}

/// File name of the sidecar executable on this platform.
pub fn sidecar_file_name() -> String {
    format!("{}{}", SIDECAR_NAME, std::env::consts::EXE_SUFFIX)
}

/// Locate the sidecar executable.
///
/// Development builds run it straight out of the checkout
/// (`<project>/sidecar/bin/sidecar`); packaged builds ship it inside the
/// bundle's resources (`<resources>/bin/sidecar`). Pure path arithmetic, no I/O.
pub fn resolve_path(mode: RunMode, project_root: &Path, resources_root: &Path) -> PathBuf {
    match mode {
        RunMode::Development => project_root
            .join(SIDECAR_DIR)
            .join(BIN_DIR)
            .join(sidecar_file_name()),
        RunMode::Packaged => resources_root.join(BIN_DIR).join(sidecar_file_name()),
    }
}

/// How the child process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        ExitInfo {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal_name(signal)),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| signal.to_string())
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> String {
    signal.to_string()
}

/// Final notification for a handle. Exactly one is delivered, so a handle
/// can never report both an exit and a launch failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidecarOutcome {
    Exited(ExitInfo),
    LaunchFailed(String),
}

/// The process-facing half of a [`SidecarHandle`].
pub struct HandleControl {
    pub outcome: oneshot::Sender<SidecarOutcome>,
    pub terminate: oneshot::Receiver<()>,
}

/// Delivers a termination request on the caller's thread. Returns whether a
/// live process was signalled.
pub type Terminator = Box<dyn FnOnce() -> bool + Send>;

/// A launched (or failed) sidecar process.
pub struct SidecarHandle {
    pid: Option<u32>,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
    outcome: Option<oneshot::Receiver<SidecarOutcome>>,
    terminate: Option<Terminator>,
}

impl SidecarHandle {
    /// Create a handle together with the control half that reports its
    /// outcome and receives the termination request.
    pub fn new(
        pid: Option<u32>,
        stdout: Option<OutputStream>,
        stderr: Option<OutputStream>,
    ) -> (Self, HandleControl) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let handle = SidecarHandle {
            pid,
            stdout,
            stderr,
            outcome: Some(outcome_rx),
            terminate: Some(Box::new(move || terminate_tx.send(()).is_ok())),
        };
        let control = HandleControl {
            outcome: outcome_tx,
            terminate: terminate_rx,
        };
        (handle, control)
    }

    /// A handle for a process that never started. Its outcome is already
    /// `LaunchFailed`.
    pub fn failed(reason: impl Into<String>) -> Self {
        let (handle, control) = Self::new(None, None, None);
        let _ = control
            .outcome
            .send(SidecarOutcome::LaunchFailed(reason.into()));
        handle
    }

    /// Replace the channel-based termination request with one that acts on
    /// the process directly.
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminate = Some(terminator);
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr.take()
    }

    pub fn take_outcome(&mut self) -> Option<oneshot::Receiver<SidecarOutcome>> {
        self.outcome.take()
    }

    /// Ask the process to exit gracefully. The request is delivered before
    /// this returns. Returns `false` if there was no live process to ask or a
    /// request was already made.
    pub fn request_termination(&mut self) -> bool {
        match self.terminate.take() {
            Some(terminate) => terminate(),
            None => false,
        }
    }

    pub fn termination_requested(&self) -> bool {
        self.terminate.is_none()
    }
}

impl fmt::Debug for SidecarHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SidecarHandle")
            .field("pid", &self.pid)
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("termination_requested", &self.termination_requested())
            .finish()
    }
}

/// Starts sidecar processes. Implementations never fail synchronously:
/// a process that cannot start is reported through the handle's outcome.
pub trait ProcessLauncher: Send + Sync + 'static {
    fn spawn(&self, path: &Path) -> SidecarHandle;
}

impl<L: ProcessLauncher + ?Sized> ProcessLauncher for Arc<L> {
    fn spawn(&self, path: &Path) -> SidecarHandle {
        (**self).spawn(path)
    }
}

/// Launches the sidecar as a real OS process. Must be called from within a
/// tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeLauncher;

impl ProcessLauncher for NativeLauncher {
    fn spawn(&self, path: &Path) -> SidecarHandle {
        spawn_command(path, &[])
    }
}

pub(crate) fn spawn_command(path: &Path, args: &[&str]) -> SidecarHandle {
    let mut command = TokioCommand::new(path);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return SidecarHandle::failed(format!("{}: {}", path.display(), e)),
    };

    let pid = child.id();
    let stdout = child.stdout.take().map(|s| Box::new(s) as OutputStream);
    let stderr = child.stderr.take().map(|s| Box::new(s) as OutputStream);
    let (mut handle, control) = SidecarHandle::new(pid, stdout, stderr);

    // Signalled straight from the caller so the request survives the runtime
    // shutting down right after it. Once the exit is reaped the pid may be
    // reused, so the request is refused from then on.
    let exited = Arc::new(AtomicBool::new(false));
    if let Some(pid) = pid {
        let exited = exited.clone();
        handle = handle.with_terminator(Box::new(move || {
            !exited.load(Ordering::Acquire) && send_terminate(pid)
        }));
    }

    tokio::spawn(watch_child(child, control.outcome, exited));
    handle
}

async fn watch_child(
    mut child: Child,
    outcome: oneshot::Sender<SidecarOutcome>,
    exited: Arc<AtomicBool>,
) {
    let status = child.wait().await;
    exited.store(true, Ordering::Release);

    let info = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            log::warn!("[supervisor] Failed to wait on sidecar: {}", e);
            ExitInfo::default()
        }
    };
    let _ = outcome.send(SidecarOutcome::Exited(info));
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(Errno::ESRCH) => {
            log::debug!("[supervisor] Sidecar (pid {}) already gone", pid);
            false
        }
        Err(e) => {
            log::warn!(
                "[supervisor] Failed to send SIGTERM to sidecar (pid {}): {}",
                pid,
                e
            );
            false
        }
    }
}

// Windows has no SIGTERM; taskkill by pid is the closest request available.
#[cfg(windows)]
fn send_terminate(pid: u32) -> bool {
    use std::os::windows::process::CommandExt;

    let pid_arg = pid.to_string();
    match std::process::Command::new("taskkill")
        .args(["/pid", pid_arg.as_str(), "/f"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW)
        .spawn()
    {
        Ok(_) => true,
        Err(e) => {
            log::warn!("[supervisor] Failed to terminate sidecar (pid {}): {}", pid, e);
            false
        }
    }
}
