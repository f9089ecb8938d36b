use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::launcher::{
    ExitInfo, NativeLauncher, OutputStream, ProcessLauncher, SidecarHandle, SidecarOutcome,
};

/// How long the output pumps get to flush after the child exits, so the exit
/// line follows the child's last output.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle notifications from the host application. Each fires once per
/// run, `Ready` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Ready,
    WillQuit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running { pid: Option<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Stdout,
    Stderr,
}

impl OutputKind {
    fn label(self) -> &'static str {
        match self {
            OutputKind::Stdout => "stdout",
            OutputKind::Stderr => "stderr",
        }
    }
}

/// Mirrors the supervisor's log lines for frontends that want to surface
/// sidecar status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Spawned { pid: u32 },
    Output { stream: OutputKind, line: String },
    Exited(ExitInfo),
    LaunchFailed { reason: String },
    TerminationRequested { pid: Option<u32> },
}

struct ActiveSidecar {
    pid: Option<u32>,
    handle: SidecarHandle,
}

#[derive(Default)]
struct Slot {
    launched: bool,
    active: Option<ActiveSidecar>,
}

#[derive(Clone)]
struct Reporter {
    event_tx: Option<mpsc::UnboundedSender<SupervisorEvent>>,
}

impl Reporter {
    fn emit(&self, event: SupervisorEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

/// Owns the single sidecar process for the lifetime of the host application.
///
/// The host drives it with [`LifecycleSignal`]s: `Ready` launches the sidecar
/// (once per run), `WillQuit` asks it to terminate without waiting for it.
/// Sidecar failures are logged and never propagate to the host.
///
/// `on_ready` must be called from within a tokio runtime.
pub struct Supervisor<L: ProcessLauncher = NativeLauncher> {
    launcher: L,
    sidecar_path: PathBuf,
    slot: Arc<Mutex<Slot>>,
    idle: Arc<watch::Sender<bool>>,
    reporter: Reporter,
}

impl<L: ProcessLauncher> Supervisor<L> {
    pub fn new(launcher: L, sidecar_path: impl Into<PathBuf>) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            launcher,
            sidecar_path: sidecar_path.into(),
            slot: Arc::new(Mutex::new(Slot::default())),
            idle: Arc::new(idle),
            reporter: Reporter { event_tx: None },
        }
    }

    /// Forward every supervisor event to `event_tx` in addition to the log.
    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        self.reporter.event_tx = Some(event_tx);
        self
    }

    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar_path
    }

    pub fn state(&self) -> SupervisorState {
        match &self.slot.lock().active {
            Some(active) => SupervisorState::Running { pid: active.pid },
            None => SupervisorState::Idle,
        }
    }

    pub fn handle_signal(&self, signal: LifecycleSignal) {
        match signal {
            LifecycleSignal::Ready => self.on_ready(),
            LifecycleSignal::WillQuit => self.on_will_quit(),
        }
    }

    pub fn on_ready(&self) {
        let mut slot = self.slot.lock();
        if slot.launched {
            log::debug!("[supervisor] Ready ignored: sidecar already launched for this run");
            return;
        }
        slot.launched = true;

        log::info!(
            "[supervisor] Spawning sidecar: {}",
            self.sidecar_path.display()
        );
        let mut handle = self.launcher.spawn(&self.sidecar_path);
        let pid = handle.pid();
        let stdout = handle.take_stdout();
        let stderr = handle.take_stderr();
        let outcome = handle.take_outcome();
        slot.active = Some(ActiveSidecar { pid, handle });
        self.idle.send_replace(false);
        drop(slot);

        if let Some(pid) = pid {
            log::info!("[supervisor] Sidecar started (pid {})", pid);
            self.reporter.emit(SupervisorEvent::Spawned { pid });
        }

        let pumps: Vec<JoinHandle<()>> = [
            (OutputKind::Stdout, stdout),
            (OutputKind::Stderr, stderr),
        ]
        .into_iter()
        .filter_map(|(kind, stream)| {
            stream.map(|s| tokio::spawn(pump_output(s, kind, self.reporter.clone())))
        })
        .collect();

        let watcher = Watcher {
            slot: self.slot.clone(),
            idle: self.idle.clone(),
            reporter: self.reporter.clone(),
        };
        tokio::spawn(watcher.run(outcome, pumps));
    }

    /// Request termination of the running sidecar and return without waiting
    /// for it to exit. The request has reached the process by the time this
    /// returns, so the host may tear down the runtime right after.
    /// A no-op when nothing is running or a request was already sent.
    pub fn on_will_quit(&self) {
        let mut slot = self.slot.lock();
        let Some(active) = slot.active.as_mut() else {
            log::debug!("[supervisor] WillQuit with no running sidecar");
            return;
        };

        let pid = active.pid;
        if active.handle.termination_requested() {
            log::debug!("[supervisor] Sidecar termination already requested");
            return;
        }
        if !active.handle.request_termination() {
            log::debug!("[supervisor] WillQuit with no live sidecar to terminate");
            return;
        }
        drop(slot);

        match pid {
            Some(pid) => log::info!("[supervisor] Sending SIGTERM to sidecar (pid {})", pid),
            None => log::info!("[supervisor] Sending SIGTERM to sidecar"),
        }
        self.reporter.emit(SupervisorEvent::TerminationRequested { pid });
    }

    /// Wait until no sidecar is running. Returns `false` if `timeout` elapsed
    /// first.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let mut idle = self.idle.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, idle.wait_for(|idle| *idle)).await,
            Ok(Ok(_))
        );
        reached
    }
}

struct Watcher {
    slot: Arc<Mutex<Slot>>,
    idle: Arc<watch::Sender<bool>>,
    reporter: Reporter,
}

impl Watcher {
    async fn run(
        self,
        outcome: Option<oneshot::Receiver<SidecarOutcome>>,
        pumps: Vec<JoinHandle<()>>,
    ) {
        let outcome = match outcome {
            Some(rx) => rx.await.unwrap_or_else(|_| {
                log::warn!("[supervisor] Sidecar watcher went away without an exit status");
                SidecarOutcome::Exited(ExitInfo::default())
            }),
            None => SidecarOutcome::LaunchFailed("sidecar handle has no outcome channel".into()),
        };

        match outcome {
            SidecarOutcome::Exited(info) => {
                let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
                    for pump in pumps {
                        let _ = pump.await;
                    }
                })
                .await;
                if drained.is_err() {
                    log::debug!("[supervisor] Sidecar output still open after exit");
                }

                if info.success() {
                    log::info!("[supervisor] Sidecar exited with {}", info);
                } else {
                    log::warn!("[supervisor] Sidecar exited with {}", info);
                }
                self.clear();
                self.reporter.emit(SupervisorEvent::Exited(info));
            }
            SidecarOutcome::LaunchFailed(reason) => {
                log::error!("{}", launch_failure_line(&reason));
                self.clear();
                self.reporter.emit(SupervisorEvent::LaunchFailed { reason });
            }
        }
    }

    fn clear(&self) {
        self.slot.lock().active = None;
        self.idle.send_replace(true);
    }
}

fn output_line(kind: OutputKind, line: &str) -> String {
    format!("[sidecar {}] {}", kind.label(), line)
}

fn launch_failure_line(reason: &str) -> String {
    format!("[supervisor] Failed to start sidecar: {}", reason)
}

async fn pump_output(stream: OutputStream, kind: OutputKind, reporter: Reporter) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end();
                if line.is_empty() {
                    continue;
                }
                match kind {
                    OutputKind::Stdout => log::info!("{}", output_line(kind, line)),
                    OutputKind::Stderr => log::error!("{}", output_line(kind, line)),
                }
                reporter.emit(SupervisorEvent::Output {
                    stream: kind,
                    line: line.to_string(),
                });
            }
            Err(e) => {
                log::debug!("[supervisor] Sidecar {} closed: {}", kind.label(), e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::HandleControl;

    const FAKE_PID: u32 = 4242;

    #[derive(Default)]
    struct FakeLauncher {
        spawned: Mutex<Vec<PathBuf>>,
        controls: Mutex<Vec<HandleControl>>,
    }

    impl FakeLauncher {
        fn spawn_count(&self) -> usize {
            self.spawned.lock().len()
        }

        fn take_control(&self) -> HandleControl {
            self.controls.lock().pop().expect("nothing was spawned")
        }
    }

    impl ProcessLauncher for FakeLauncher {
        fn spawn(&self, path: &Path) -> SidecarHandle {
            self.spawned.lock().push(path.to_path_buf());
            let (handle, control) = SidecarHandle::new(Some(FAKE_PID), None, None);
            self.controls.lock().push(control);
            handle
        }
    }

    /// Runs `/bin/sh -c <script>` in place of the sidecar.
    #[cfg(unix)]
    struct ScriptLauncher(&'static str);

    #[cfg(unix)]
    impl ProcessLauncher for ScriptLauncher {
        fn spawn(&self, _path: &Path) -> SidecarHandle {
            crate::launcher::spawn_command(Path::new("/bin/sh"), &["-c", self.0])
        }
    }

    struct FailingLauncher;

    impl ProcessLauncher for FailingLauncher {
        fn spawn(&self, path: &Path) -> SidecarHandle {
            SidecarHandle::failed(format!("{}: permission denied", path.display()))
        }
    }

    fn supervised<L: ProcessLauncher>(
        launcher: L,
    ) -> (Supervisor<L>, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(launcher, "/app/sidecar/bin/sidecar").with_events(tx);
        (supervisor, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SupervisorEvent>) -> SupervisorEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for supervisor event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn ready_twice_spawns_once() {
        let launcher = Arc::new(FakeLauncher::default());
        let (supervisor, mut rx) = supervised(launcher.clone());

        supervisor.handle_signal(LifecycleSignal::Ready);
        supervisor.handle_signal(LifecycleSignal::Ready);

        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(
            launcher.spawned.lock()[0],
            PathBuf::from("/app/sidecar/bin/sidecar")
        );
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::Spawned { pid: FAKE_PID }
        );
        assert_eq!(
            supervisor.state(),
            SupervisorState::Running {
                pid: Some(FAKE_PID)
            }
        );
    }

    #[tokio::test]
    async fn will_quit_without_sidecar_is_noop() {
        let launcher = Arc::new(FakeLauncher::default());
        let (supervisor, mut rx) = supervised(launcher.clone());

        supervisor.handle_signal(LifecycleSignal::WillQuit);

        assert_eq!(launcher.spawn_count(), 0);
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn will_quit_sends_one_termination_request() {
        let launcher = Arc::new(FakeLauncher::default());
        let (supervisor, mut rx) = supervised(launcher.clone());
        supervisor.on_ready();
        let mut control = launcher.take_control();
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::Spawned { pid: FAKE_PID }
        );

        supervisor.on_will_quit();
        supervisor.on_will_quit();

        assert!(control.terminate.try_recv().is_ok());
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::TerminationRequested {
                pid: Some(FAKE_PID)
            }
        );
        assert!(rx.try_recv().is_err());
        // Shutdown does not wait: the child has not reported an exit yet.
        assert_eq!(
            supervisor.state(),
            SupervisorState::Running {
                pid: Some(FAKE_PID)
            }
        );
    }

    #[tokio::test]
    async fn exit_clears_handle_so_will_quit_is_noop() {
        let launcher = Arc::new(FakeLauncher::default());
        let (supervisor, mut rx) = supervised(launcher.clone());
        supervisor.on_ready();
        let HandleControl {
            outcome,
            mut terminate,
        } = launcher.take_control();
        next_event(&mut rx).await;

        let info = ExitInfo {
            code: Some(1),
            signal: None,
        };
        outcome.send(SidecarOutcome::Exited(info)).unwrap();
        assert_eq!(next_event(&mut rx).await, SupervisorEvent::Exited(info));
        assert_eq!(supervisor.state(), SupervisorState::Idle);

        supervisor.on_will_quit();
        assert!(terminate.try_recv().is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ready_after_exit_does_not_restart() {
        let launcher = Arc::new(FakeLauncher::default());
        let (supervisor, mut rx) = supervised(launcher.clone());
        supervisor.on_ready();
        let control = launcher.take_control();
        next_event(&mut rx).await;

        control
            .outcome
            .send(SidecarOutcome::Exited(ExitInfo::default()))
            .unwrap();
        next_event(&mut rx).await;

        supervisor.on_ready();
        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn wait_until_idle_tracks_exit() {
        let launcher = Arc::new(FakeLauncher::default());
        let (supervisor, mut rx) = supervised(launcher.clone());
        assert!(supervisor.wait_until_idle(Duration::from_millis(10)).await);

        supervisor.on_ready();
        let control = launcher.take_control();
        next_event(&mut rx).await;
        assert!(!supervisor.wait_until_idle(Duration::from_millis(50)).await);

        control
            .outcome
            .send(SidecarOutcome::Exited(ExitInfo::default()))
            .unwrap();
        assert!(supervisor.wait_until_idle(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn launch_failure_returns_to_idle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor =
            Supervisor::new(NativeLauncher, "/nonexistent/outrigger/sidecar/bin/sidecar")
                .with_events(tx);

        supervisor.on_ready();

        match next_event(&mut rx).await {
            SupervisorEvent::LaunchFailed { reason } => {
                assert!(reason.contains("/nonexistent/outrigger"), "{}", reason)
            }
            other => panic!("expected launch failure, got {:?}", other),
        }
        assert_eq!(supervisor.state(), SupervisorState::Idle);

        supervisor.on_will_quit();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn will_quit_before_launch_failure_is_reported_sends_nothing() {
        let (supervisor, mut rx) = supervised(FailingLauncher);

        // The watcher has not run yet, so the failed handle is still in place.
        supervisor.on_ready();
        supervisor.on_will_quit();

        match next_event(&mut rx).await {
            SupervisorEvent::LaunchFailed { reason } => {
                assert_eq!(reason, "/app/sidecar/bin/sidecar: permission denied")
            }
            other => panic!("expected launch failure, got {:?}", other),
        }
        assert!(supervisor.wait_until_idle(Duration::from_secs(5)).await);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn log_lines_carry_stream_prefixes() {
        assert_eq!(
            output_line(OutputKind::Stdout, "listening on 8080"),
            "[sidecar stdout] listening on 8080"
        );
        assert_eq!(
            output_line(OutputKind::Stderr, "disk full"),
            "[sidecar stderr] disk full"
        );
        assert_eq!(
            launch_failure_line("/app/sidecar/bin/sidecar: No such file or directory"),
            "[supervisor] Failed to start sidecar: /app/sidecar/bin/sidecar: No such file or directory"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdout_then_exit_then_idle() {
        let (supervisor, mut rx) = supervised(ScriptLauncher("echo hello; exit 0"));
        supervisor.on_ready();

        assert!(matches!(
            next_event(&mut rx).await,
            SupervisorEvent::Spawned { .. }
        ));
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::Output {
                stream: OutputKind::Stdout,
                line: "hello".to_string()
            }
        );
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::Exited(ExitInfo {
                code: Some(0),
                signal: None
            })
        );
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_tagged_separately() {
        let (supervisor, mut rx) = supervised(ScriptLauncher("echo 'disk full' >&2; exit 2"));
        supervisor.on_ready();

        next_event(&mut rx).await;
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::Output {
                stream: OutputKind::Stderr,
                line: "disk full".to_string()
            }
        );
        match next_event(&mut rx).await {
            SupervisorEvent::Exited(info) => assert_eq!(info.code, Some(2)),
            other => panic!("expected exit, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn will_quit_terminates_running_sidecar() {
        let (supervisor, mut rx) = supervised(ScriptLauncher("echo ready; exec sleep 30"));
        supervisor.on_ready();

        let pid = match next_event(&mut rx).await {
            SupervisorEvent::Spawned { pid } => pid,
            other => panic!("expected spawn, got {:?}", other),
        };
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::Output {
                stream: OutputKind::Stdout,
                line: "ready".to_string()
            }
        );

        supervisor.on_will_quit();
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::TerminationRequested { pid: Some(pid) }
        );
        assert_eq!(
            next_event(&mut rx).await,
            SupervisorEvent::Exited(ExitInfo {
                code: None,
                signal: Some(15)
            })
        );
        assert!(supervisor.wait_until_idle(Duration::from_secs(1)).await);
    }

    /// True once `pid` is gone or is a zombie waiting to be reaped.
    #[cfg(target_os = "linux")]
    fn has_terminated(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn will_quit_reaches_sidecar_when_runtime_drops_immediately() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let (supervisor, _rx) = runtime.block_on(async {
            let (supervisor, rx) = supervised(ScriptLauncher("exec sleep 30"));
            supervisor.on_ready();
            (supervisor, rx)
        });
        let pid = match supervisor.state() {
            SupervisorState::Running { pid: Some(pid) } => pid,
            other => panic!("expected a running sidecar, got {:?}", other),
        };

        runtime.block_on(async { supervisor.on_will_quit() });
        drop(runtime);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !has_terminated(pid) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(has_terminated(pid), "sidecar (pid {}) outlived the shell", pid);
    }
}
