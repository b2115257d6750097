// ============================================================================
// SECTION 14: PROCESS SUPERVISOR
// ============================================================================
// Owns the lifecycle of the single supervised child:
//
//   Idle ──UP──▶ Starting ──confirm──▶ Running ──QUIT──▶ Stopping ──▶ Idle
//                   │                     │
//                   └──exit──▶ Crashed ◀──┘ exit
//
// Two single-slot token channels encode whether an UP or QUIT may be
// accepted. While a child runs the reload slot is full (UP answers "omega is
// running") and the stop slot is empty; while idle the stop slot is full
// (QUIT answers "omega is stopped") and the reload slot is empty. The stop
// slot only opens once a start is confirmed, so a QUIT during Starting is
// refused. A third single-slot channel carries the outcome back to the one
// caller admitted by the gate.
// ============================================================================

mod spawner;

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatchdogConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::pidfile::{read_pid, LockProbe, PidLock};
use crate::wire::ControlSignal;

pub use spawner::{CommandSpawner, Spawner};

/// Liveness poll period for an adopted child.
const ADOPT_POLL: Duration = Duration::from_millis(500);

/// Exit poll period while waiting for an adopted child to quit.
const QUIT_POLL: Duration = Duration::from_millis(50);

// ----------------------------------------------------------------------------
// 14.1 State
// ----------------------------------------------------------------------------

/// Observable lifecycle state of the supervised child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Idle,
    Starting,
    Running { pid: u32 },
    Stopping { pid: u32 },
    Crashed { pid: u32, status: String },
    /// Child inherited from a previous watchdog through its pid file
    Adopted { pid: u32 },
}

impl ProcessState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid }
            | ProcessState::Stopping { pid }
            | ProcessState::Crashed { pid, .. }
            | ProcessState::Adopted { pid } => Some(*pid),
            ProcessState::Idle | ProcessState::Starting => None,
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            ProcessState::Running { .. } | ProcessState::Stopping { .. } | ProcessState::Adopted { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// A child surviving this long after spawn counts as started
    pub start_confirm: Duration,
    /// Grace period between SIGQUIT and SIGKILL
    pub quit_timeout: Duration,
    /// Spawn on startup without waiting for an UP
    pub auto_start: bool,
    /// Pid lock file held by the child; used to adopt a running child
    pub child_pid_file: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_watchdog(&WatchdogConfig::default(), None)
    }
}

impl SupervisorConfig {
    /// Timing and start policy of the `[watchdog]` section.
    pub fn from_watchdog(config: &WatchdogConfig, child_pid_file: Option<PathBuf>) -> Self {
        Self {
            start_confirm: config.start_confirm,
            quit_timeout: config.quit_timeout,
            auto_start: config.auto_start,
            child_pid_file,
        }
    }
}

/// Token slot of capacity one.
#[derive(Debug)]
struct Slot<T> {
    tx: flume::Sender<T>,
    rx: flume::Receiver<T>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self { tx, rx }
    }

    fn offer(&self, value: T) -> bool {
        self.tx.try_send(value).is_ok()
    }

    fn take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

// ----------------------------------------------------------------------------
// 14.2 Supervisor
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    spawner: Arc<dyn Spawner>,
    reload: Slot<()>,
    stop: Slot<()>,
    result: Slot<SupervisorResult<u32>>,
    gate: Semaphore,
    state: watch::Sender<ProcessState>,
    closed: CancellationToken,
}

enum CycleEnd {
    /// The child is gone; the outcome, if any, answers the waiting caller
    Finished(Option<SupervisorResult<u32>>),
    Cancelled,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, spawner: Arc<dyn Spawner>) -> Arc<Self> {
        let (state, _) = watch::channel(ProcessState::Idle);
        let supervisor = Self {
            config,
            spawner,
            reload: Slot::new(),
            stop: Slot::new(),
            result: Slot::new(),
            gate: Semaphore::new(1),
            state,
            closed: CancellationToken::new(),
        };
        // Nothing runs yet, so a QUIT has nothing to stop.
        supervisor.stop.offer(());
        Arc::new(supervisor)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ProcessState) {
        debug!(target: "omega::supervisor", state = ?state, "State changed");
        self.state.send_replace(state);
    }

    /// Replace any unread outcome with `result`.
    fn publish(&self, result: SupervisorResult<u32>) {
        self.result.drain();
        self.result.offer(result);
    }

    // ------------------------------------------------------------------------
    // 14.2.1 Notify
    // ------------------------------------------------------------------------

    /// Deliver an external signal and wait for the outcome.
    ///
    /// Only one call is admitted at a time; a concurrent call fails with
    /// [`SupervisorError::Busy`] without waiting.
    pub async fn notify(&self, signal: ControlSignal) -> SupervisorResult<u32> {
        let _permit = self.gate.try_acquire().map_err(|_| SupervisorError::Busy)?;

        // Outcomes nobody waited for (auto start, crashes) are stale now.
        self.result.drain();

        match signal {
            ControlSignal::Quit => {
                if !self.stop.offer(()) {
                    return Err(SupervisorError::AlreadyStopped);
                }
            }
            ControlSignal::Up => {
                if !self.reload.offer(()) {
                    return Err(SupervisorError::AlreadyRunning);
                }
            }
        }
        info!(target: "omega::supervisor", signal = %signal, "Signal accepted");

        tokio::select! {
            result = self.result.rx.recv_async() => result.map_err(|_| SupervisorError::Closed)?,
            _ = self.closed.cancelled() => Err(SupervisorError::Closed),
        }
    }

    // ------------------------------------------------------------------------
    // 14.2.2 Run Loop
    // ------------------------------------------------------------------------

    /// Drive the lifecycle until `cancel` fires. A running child is left
    /// alive on cancellation so the next watchdog can adopt it.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> SupervisorResult<()> {
        let result = self.run_inner(&cancel).await;
        self.closed.cancel();
        result
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> SupervisorResult<()> {
        if !self.takeover(cancel).await? {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                token = self.reload.rx.recv_async() => {
                    if token.is_err() {
                        break;
                    }
                }
            }

            // Hold the reload slot for the whole cycle. The stop slot stays
            // closed until the start is confirmed.
            self.reload.offer(());

            match self.cycle(cancel).await {
                CycleEnd::Finished(outcome) => self.finish_cycle(outcome),
                CycleEnd::Cancelled => break,
            }
        }
        info!(target: "omega::supervisor", "Supervisor stopped");
        Ok(())
    }

    /// Reopen the reload slot, close the stop slot, then answer the caller.
    fn finish_cycle(&self, outcome: Option<SupervisorResult<u32>>) {
        self.reload.take();
        let stray_quit = !self.stop.offer(());
        if stray_quit {
            // A QUIT arrived after the child was already gone.
            self.stop.take();
            self.stop.offer(());
        }
        match outcome {
            Some(outcome) => self.publish(outcome),
            None if stray_quit => self.publish(Err(SupervisorError::AlreadyStopped)),
            None => {}
        }
    }

    async fn cycle(&self, cancel: &CancellationToken) -> CycleEnd {
        self.set_state(ProcessState::Starting);
        let mut child = match self.spawner.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(target: "omega::supervisor", error = %e, "Start child failure");
                self.set_state(ProcessState::Idle);
                return CycleEnd::Finished(Some(Err(e)));
            }
        };
        let pid = child.id().unwrap_or(0);

        tokio::select! {
            status = child.wait() => {
                let status = describe(&status);
                error!(target: "omega::supervisor", pid, status = %status, "Child exited during startup");
                self.set_state(ProcessState::Crashed { pid, status: status.clone() });
                return CycleEnd::Finished(Some(Err(SupervisorError::ExitedDuringStartup { pid, status })));
            }
            _ = tokio::time::sleep(self.config.start_confirm) => {
                info!(
                    target: "omega::supervisor",
                    pid,
                    program = %self.spawner.program(),
                    "Child started"
                );
                self.set_state(ProcessState::Running { pid });
                self.stop.drain();
                self.publish(Ok(pid));
            }
            _ = cancel.cancelled() => return CycleEnd::Cancelled,
        }

        let outcome = tokio::select! {
            status = child.wait() => {
                let outcome = classify(pid, status);
                let text = match &outcome {
                    Ok(_) => "exited".to_string(),
                    Err(e) => e.to_string(),
                };
                error!(target: "omega::supervisor", pid, status = %text, "Child exited unexpectedly");
                self.set_state(ProcessState::Crashed { pid, status: text });
                // A QUIT raced the exit: its caller gets the exit outcome.
                self.stop.take().map(|_| outcome)
            }
            _ = self.stop.rx.recv_async() => {
                self.set_state(ProcessState::Stopping { pid });
                let outcome = self.quit_child(&mut child, pid).await;
                self.set_state(ProcessState::Idle);
                Some(outcome)
            }
            _ = cancel.cancelled() => {
                info!(target: "omega::supervisor", pid, "Detaching from running child");
                return CycleEnd::Cancelled;
            }
        };
        CycleEnd::Finished(outcome)
    }

    /// SIGQUIT, wait for the exit, escalate to SIGKILL on timeout.
    async fn quit_child(&self, child: &mut Child, pid: u32) -> SupervisorResult<u32> {
        info!(target: "omega::supervisor", pid, "Sending SIGQUIT to child");
        if let Err(e) = send_signal(pid, Signal::SIGQUIT) {
            warn!(target: "omega::supervisor", pid, error = %e, "SIGQUIT failure, killing child");
            if let Err(e) = child.start_kill() {
                warn!(target: "omega::supervisor", pid, error = %e, "Kill child failure");
            }
        }

        match tokio::time::timeout(self.config.quit_timeout, child.wait()).await {
            Ok(status) => {
                let outcome = classify(pid, status);
                if let Err(e) = &outcome {
                    warn!(target: "omega::supervisor", pid, error = %e, "Child quit abnormally");
                }
                outcome
            }
            Err(_) => {
                error!(target: "omega::supervisor", pid, "Child ignored SIGQUIT, killing");
                if let Err(e) = child.start_kill() {
                    warn!(target: "omega::supervisor", pid, error = %e, "Kill child failure");
                }
                let _ = child.wait().await;
                Err(SupervisorError::QuitTimeout {
                    pid,
                    timeout_ms: self.config.quit_timeout.as_millis() as u64,
                })
            }
        }
    }

    // ------------------------------------------------------------------------
    // 14.3 Takeover
    // ------------------------------------------------------------------------

    /// Inspect the child's pid lock. A held lock means a child from a previous
    /// watchdog is still running; it is adopted and supervised until it exits
    /// or is quit. Returns `false` if cancelled while adopting.
    async fn takeover(&self, cancel: &CancellationToken) -> SupervisorResult<bool> {
        let path = match &self.config.child_pid_file {
            Some(path) => path.clone(),
            None => {
                if self.config.auto_start {
                    self.reload.offer(());
                }
                return Ok(true);
            }
        };

        match PidLock::probe(&path) {
            Ok(LockProbe::Held) => {
                let pid = read_pid(&path)?;
                self.adopt(pid, cancel).await
            }
            Ok(LockProbe::Free) => {
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!(target: "omega::supervisor", path = %path.display(), "Stale pid file removed"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(target: "omega::supervisor", path = %path.display(), error = %e, "Remove pid file failure"),
                }
                if self.config.auto_start {
                    self.reload.offer(());
                }
                Ok(true)
            }
            Err(e) => {
                warn!(target: "omega::supervisor", path = %path.display(), error = %e, "Probe pid file failure");
                if self.config.auto_start {
                    self.reload.offer(());
                }
                Ok(true)
            }
        }
    }

    async fn adopt(&self, pid: u32, cancel: &CancellationToken) -> SupervisorResult<bool> {
        info!(target: "omega::supervisor", pid, "Adopted running child");
        self.set_state(ProcessState::Adopted { pid });
        self.reload.offer(());
        self.stop.drain();

        let mut quit = None;
        let mut poll = tokio::time::interval(ADOPT_POLL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                _ = self.stop.rx.recv_async() => {
                    self.set_state(ProcessState::Stopping { pid });
                    quit = Some(self.quit_adopted(pid).await);
                    break;
                }
                _ = poll.tick() => {
                    if !process_alive(pid) {
                        warn!(target: "omega::supervisor", pid, "Adopted child exited");
                        break;
                    }
                }
            }
        }

        self.set_state(ProcessState::Idle);
        self.finish_cycle(quit);
        Ok(true)
    }

    async fn quit_adopted(&self, pid: u32) -> SupervisorResult<u32> {
        info!(target: "omega::supervisor", pid, "Sending SIGQUIT to adopted child");
        if let Err(e) = send_signal(pid, Signal::SIGQUIT) {
            if e == Errno::ESRCH {
                return Ok(pid);
            }
            warn!(target: "omega::supervisor", pid, error = %e, "SIGQUIT failure, killing child");
            let _ = send_signal(pid, Signal::SIGKILL);
        }

        let waited = tokio::time::timeout(self.config.quit_timeout, async {
            while process_alive(pid) {
                tokio::time::sleep(QUIT_POLL).await;
            }
        })
        .await;

        match waited {
            Ok(()) => Ok(pid),
            Err(_) => {
                error!(target: "omega::supervisor", pid, "Adopted child ignored SIGQUIT, killing");
                let _ = send_signal(pid, Signal::SIGKILL);
                Err(SupervisorError::QuitTimeout {
                    pid,
                    timeout_ms: self.config.quit_timeout.as_millis() as u64,
                })
            }
        }
    }
}

fn send_signal(pid: u32, signal: Signal) -> nix::Result<()> {
    kill(Pid::from_raw(pid as i32), signal)
}

fn process_alive(pid: u32) -> bool {
    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

fn describe(status: &io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => e.to_string(),
    }
}

/// Clean exits and deaths by our own quit signals are successes.
fn classify(pid: u32, status: io::Result<ExitStatus>) -> SupervisorResult<u32> {
    match status {
        Ok(status) if status.success() => Ok(pid),
        Ok(status) if matches!(status.signal(), Some(s) if s == Signal::SIGQUIT as i32 || s == Signal::SIGKILL as i32) => {
            Ok(pid)
        }
        Ok(status) => Err(SupervisorError::UnexpectedExit {
            pid,
            status: status.to_string(),
        }),
        Err(e) => Err(SupervisorError::UnexpectedExit {
            pid,
            status: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOOP_SCRIPT: &str = "trap 'exit 0' QUIT; while :; do sleep 0.05; done";

    fn sh(script: &str) -> Arc<dyn Spawner> {
        Arc::new(CommandSpawner::new("/bin/sh", vec!["-c".to_string(), script.to_string()]))
    }

    fn config(auto_start: bool) -> SupervisorConfig {
        SupervisorConfig {
            start_confirm: Duration::from_millis(200),
            quit_timeout: Duration::from_secs(3),
            auto_start,
            child_pid_file: None,
        }
    }

    fn start(supervisor: &Arc<Supervisor>) -> (CancellationToken, tokio::task::JoinHandle<SupervisorResult<()>>) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(supervisor).run(cancel.clone()));
        (cancel, handle)
    }

    async fn wait_state(supervisor: &Supervisor, want: impl Fn(&ProcessState) -> bool) -> ProcessState {
        let mut rx = supervisor.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| want(s)))
            .await
            .expect("state not reached")
            .unwrap()
            .clone();
        state
    }

    #[tokio::test]
    async fn test_quit_when_idle() {
        let supervisor = Supervisor::new(config(false), sh(LOOP_SCRIPT));
        let (cancel, handle) = start(&supervisor);

        let err = supervisor.notify(ControlSignal::Quit).await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyStopped));
        assert_eq!(err.to_string(), "omega is stopped");
        assert_eq!(supervisor.state(), ProcessState::Idle);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_up_quit_cycle() {
        let supervisor = Supervisor::new(config(false), sh(LOOP_SCRIPT));
        let (cancel, handle) = start(&supervisor);

        let pid = supervisor.notify(ControlSignal::Up).await.unwrap();
        assert!(pid > 0);
        assert_eq!(supervisor.state(), ProcessState::Running { pid });

        let err = supervisor.notify(ControlSignal::Up).await.unwrap_err();
        assert_eq!(err.to_string(), "omega is running");

        assert_eq!(supervisor.notify(ControlSignal::Quit).await.unwrap(), pid);
        wait_state(&supervisor, |s| *s == ProcessState::Idle).await;
        assert!(!process_alive(pid));

        assert!(matches!(
            supervisor.notify(ControlSignal::Quit).await,
            Err(SupervisorError::AlreadyStopped)
        ));

        // Reload after quit spawns a fresh child.
        let second = supervisor.notify(ControlSignal::Up).await.unwrap();
        assert_ne!(second, pid);
        assert_eq!(supervisor.notify(ControlSignal::Quit).await.unwrap(), second);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_notify_is_busy() {
        let mut cfg = config(false);
        cfg.start_confirm = Duration::from_millis(500);
        let supervisor = Supervisor::new(cfg, sh(LOOP_SCRIPT));
        let (cancel, handle) = start(&supervisor);

        let first = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.notify(ControlSignal::Up).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = supervisor.notify(ControlSignal::Quit).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Busy));

        let pid = first.await.unwrap().unwrap();
        assert_eq!(supervisor.notify(ControlSignal::Quit).await.unwrap(), pid);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let spawner: Arc<dyn Spawner> = Arc::new(CommandSpawner::new("/nonexistent/omega", Vec::new()));
        let supervisor = Supervisor::new(config(false), spawner);
        let (cancel, handle) = start(&supervisor);

        let err = supervisor.notify(ControlSignal::Up).await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
        assert!(err.to_string().starts_with("spawn '/nonexistent/omega' failure"));

        // Back to idle: QUIT refused, UP accepted again.
        wait_state(&supervisor, |s| *s == ProcessState::Idle).await;
        assert!(matches!(
            supervisor.notify(ControlSignal::Quit).await,
            Err(SupervisorError::AlreadyStopped)
        ));
        assert!(matches!(
            supervisor.notify(ControlSignal::Up).await,
            Err(SupervisorError::SpawnFailed { .. })
        ));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_exit_during_startup() {
        let supervisor = Supervisor::new(config(false), sh("exit 3"));
        let (cancel, handle) = start(&supervisor);

        match supervisor.notify(ControlSignal::Up).await {
            Err(SupervisorError::ExitedDuringStartup { status, .. }) => assert!(status.contains('3')),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(supervisor.state(), ProcessState::Crashed { .. }));
        assert!(matches!(
            supervisor.notify(ControlSignal::Quit).await,
            Err(SupervisorError::AlreadyStopped)
        ));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_crash_after_start_needs_reload() {
        let supervisor = Supervisor::new(config(false), sh("sleep 0.4; exit 1"));
        let (cancel, handle) = start(&supervisor);

        let pid = supervisor.notify(ControlSignal::Up).await.unwrap();
        let state = wait_state(&supervisor, |s| matches!(s, ProcessState::Crashed { .. })).await;
        assert_eq!(state.pid(), Some(pid));

        // No automatic restart; the stop slot is closed again.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            supervisor.notify(ControlSignal::Quit).await,
            Err(SupervisorError::AlreadyStopped)
        ));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_auto_start() {
        let supervisor = Supervisor::new(config(true), sh(LOOP_SCRIPT));
        let (cancel, handle) = start(&supervisor);

        let state = wait_state(&supervisor, |s| matches!(s, ProcessState::Running { .. })).await;
        let pid = state.pid().unwrap();
        assert_eq!(supervisor.notify(ControlSignal::Quit).await.unwrap(), pid);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_quit_while_starting_is_refused() {
        let mut cfg = config(true);
        cfg.start_confirm = Duration::from_secs(1);
        let supervisor = Supervisor::new(cfg, sh(LOOP_SCRIPT));
        let (cancel, handle) = start(&supervisor);

        wait_state(&supervisor, |s| *s == ProcessState::Starting).await;
        let err = supervisor.notify(ControlSignal::Quit).await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyStopped));

        // The refused QUIT does not leak into the confirmed child.
        let state = wait_state(&supervisor, |s| matches!(s, ProcessState::Running { .. })).await;
        let pid = state.pid().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(supervisor.state(), ProcessState::Running { pid });
        assert!(process_alive(pid));

        assert_eq!(supervisor.notify(ControlSignal::Quit).await.unwrap(), pid);
        assert!(!process_alive(pid));
        wait_state(&supervisor, |s| *s == ProcessState::Idle).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_default_config_matches_watchdog_section() {
        let defaults = SupervisorConfig::default();
        let section = WatchdogConfig::default();
        assert_eq!(defaults.start_confirm, section.start_confirm);
        assert_eq!(defaults.quit_timeout, section.quit_timeout);
        assert_eq!(defaults.quit_timeout, Duration::from_secs(2));
        assert!(defaults.auto_start);
        assert!(defaults.child_pid_file.is_none());
    }

    #[tokio::test]
    async fn test_quit_timeout_escalates_to_kill() {
        let mut cfg = config(false);
        cfg.quit_timeout = Duration::from_millis(300);
        let supervisor = Supervisor::new(cfg, sh("trap '' QUIT; while :; do sleep 0.05; done"));
        let (cancel, handle) = start(&supervisor);

        let pid = supervisor.notify(ControlSignal::Up).await.unwrap();
        match supervisor.notify(ControlSignal::Quit).await {
            Err(SupervisorError::QuitTimeout { pid: p, timeout_ms }) => {
                assert_eq!(p, pid);
                assert_eq!(timeout_ms, 300);
            }
            other => panic!("unexpected {:?}", other),
        }
        wait_state(&supervisor, |s| *s == ProcessState::Idle).await;
        assert!(!process_alive(pid));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_adopts_child_holding_pid_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("omega.pid");

        let mut orphan = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = orphan.id();
        let lock = PidLock::acquire_with_pid(&path, pid).unwrap();
        let reaper = std::thread::spawn(move || orphan.wait());

        let mut cfg = config(true);
        cfg.child_pid_file = Some(path.clone());
        let supervisor = Supervisor::new(cfg, sh(LOOP_SCRIPT));
        let (cancel, handle) = start(&supervisor);

        wait_state(&supervisor, |s| *s == ProcessState::Adopted { pid }).await;
        assert!(matches!(
            supervisor.notify(ControlSignal::Up).await,
            Err(SupervisorError::AlreadyRunning)
        ));

        assert_eq!(supervisor.notify(ControlSignal::Quit).await.unwrap(), pid);
        reaper.join().unwrap().unwrap();
        wait_state(&supervisor, |s| *s == ProcessState::Idle).await;
        assert!(matches!(
            supervisor.notify(ControlSignal::Quit).await,
            Err(SupervisorError::AlreadyStopped)
        ));

        drop(lock);
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_child_pid_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("omega.pid");
        let lock = PidLock::acquire_with_pid(&path, 1).unwrap();
        std::fs::write(&path, "garbage").unwrap();

        let mut cfg = config(true);
        cfg.child_pid_file = Some(path);
        let supervisor = Supervisor::new(cfg, sh(LOOP_SCRIPT));
        let (_cancel, handle) = start(&supervisor);

        assert!(matches!(handle.await.unwrap(), Err(SupervisorError::LoadChild { .. })));
        assert!(matches!(
            supervisor.notify(ControlSignal::Up).await,
            Err(SupervisorError::Closed)
        ));
        drop(lock);
    }

    #[tokio::test]
    async fn test_stale_pid_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("omega.pid");
        std::fs::write(&path, "99999").unwrap();

        let mut cfg = config(false);
        cfg.child_pid_file = Some(path.clone());
        let supervisor = Supervisor::new(cfg, sh(LOOP_SCRIPT));
        let (cancel, handle) = start(&supervisor);

        tokio::time::timeout(Duration::from_secs(2), async {
            while path.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(supervisor.state(), ProcessState::Idle);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
