use crate::app::wait_for_shutdown;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// State of the supervised daemon process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is not running
    Stopped,
    /// Process was spawned and the startup grace delay is running
    Starting,
    /// Process is running
    Running,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Stopped => "Stopped",
            ProcessState::Starting => "Starting",
            ProcessState::Running => "Running",
        };
        f.write_str(name)
    }
}

/// Errors from starting or stopping the daemon
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unable to start daemon, already running")]
    AlreadyRunning,
    #[error("unable to stop daemon, already stopped")]
    AlreadyStopped,
    #[error("failed to spawn daemon: {0}")]
    Spawn(io::Error),
    #[error("failed to signal daemon: {0}")]
    Signal(io::Error),
    #[error("failed waiting for daemon to exit: {0}")]
    Wait(io::Error),
}

impl SupervisorError {
    /// Start-when-running or stop-when-stopped
    pub fn is_usage(&self) -> bool {
        matches!(self, SupervisorError::AlreadyRunning | SupervisorError::AlreadyStopped)
    }
}

/// How the daemon is launched
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Working directory for the child (inherits ours when unset)
    pub working_dir: Option<PathBuf>,
    /// Command line handed to the platform shell
    pub command: String,
    /// Grace period after spawning before the daemon counts as running
    pub start_delay: Duration,
    /// How long to wait after the interrupt before force killing
    pub kill_grace_period: Duration,
}

impl SupervisorConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            working_dir: None,
            command: command.into(),
            start_delay: Duration::ZERO,
            kill_grace_period: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Owns the lifecycle of the single daemon process.
///
/// `start` and `stop` hold the same lock for the whole transition, so they
/// never interleave. The current state is published on a watch channel and
/// can be read from any task without taking that lock.
///
/// `new` returns an `Arc`: output consumers keep a handle so a read error
/// can stop the daemon.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    state_tx: watch::Sender<ProcessState>,
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, shutdown_rx: watch::Receiver<bool>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ProcessState::Stopped);
        Arc::new(Self {
            config,
            state_tx,
            child: Mutex::new(None),
            pid: AtomicU32::new(0),
            shutdown_rx,
        })
    }

    /// Current state snapshot
    pub fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    /// PID of the shell running the daemon, if one is alive
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn set_state(&self, state: ProcessState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Daemon state changed");
        }
    }

    /// Spawn the daemon and wait out the startup grace delay
    pub async fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        if self.state() != ProcessState::Stopped {
            return Err(SupervisorError::AlreadyRunning);
        }

        let mut slot = self.child.lock().await;
        if self.state() != ProcessState::Stopped {
            return Err(SupervisorError::AlreadyRunning);
        }
        self.set_state(ProcessState::Starting);

        info!(command = %self.config.command, "Starting daemon");

        let mut cmd = shell_command(&self.config.command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        // Own process group, so the interrupt reaches whatever the shell runs
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(command = %self.config.command, error = %e, "Error starting daemon");
                self.set_state(ProcessState::Stopped);
                return Err(SupervisorError::Spawn(e));
            }
        };

        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        info!(pid, "Daemon process spawned");

        if let Some(stdout) = child.stdout.take() {
            self.spawn_output_consumer(stdout, OutputStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_output_consumer(stderr, OutputStream::Stderr);
        }

        *slot = Some(child);

        let delay = self.config.start_delay;
        if !delay.is_zero() {
            info!(delay_ms = delay.as_millis() as u64, "Delaying daemon post-startup");
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    debug!("Startup delay cut short by shutdown");
                }
            }
        }

        self.set_state(ProcessState::Running);
        Ok(())
    }

    /// Interrupt the daemon, escalating to a kill, and wait for it to exit
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        if self.state() == ProcessState::Stopped {
            return Err(SupervisorError::AlreadyStopped);
        }

        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            return Err(SupervisorError::AlreadyStopped);
        };

        let pid = self.pid().unwrap_or(0);
        info!(pid, "Stopping daemon");

        if let Err(e) = interrupt(&child) {
            debug!(pid, error = %e, "Interrupt failed, killing daemon");
            if let Err(e) = force_kill(&mut child) {
                error!(pid, error = %e, "Error killing daemon");
                *slot = Some(child);
                return Err(SupervisorError::Signal(e));
            }
        }

        let grace = self.config.kill_grace_period;
        let exit = match tokio::time::timeout(grace, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    pid,
                    grace_period_ms = grace.as_millis() as u64,
                    "Daemon ignored interrupt, sending SIGKILL"
                );
                if let Err(e) = force_kill(&mut child) {
                    error!(pid, error = %e, "Error killing daemon");
                    *slot = Some(child);
                    return Err(SupervisorError::Signal(e));
                }
                child.wait().await
            }
        };

        match exit {
            Ok(status) => info!(pid, %status, "Daemon process exited"),
            Err(e) if is_already_reaped(&e) => {
                debug!(pid, error = %e, "Daemon was already reaped");
            }
            Err(e) => {
                error!(pid, error = %e, "Error waiting for daemon to stop");
                *slot = Some(child);
                return Err(SupervisorError::Wait(e));
            }
        }

        self.pid.store(0, Ordering::SeqCst);
        self.set_state(ProcessState::Stopped);
        Ok(())
    }

    /// Exit status of a daemon that exited on its own.
    ///
    /// Diagnostic only: the state is left untouched. Returns `None` while a
    /// transition holds the lock, when no child exists, or when it is alive.
    pub fn exited_status(&self) -> Option<ExitStatus> {
        let mut slot = self.child.try_lock().ok()?;
        let child = slot.as_mut()?;
        child.try_wait().ok().flatten()
    }

    /// Logs one output stream line by line until it closes or the daemon is
    /// done with. A read error stops the daemon.
    fn spawn_output_consumer<R>(self: &Arc<Self>, reader: R, stream: OutputStream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let supervisor = Arc::clone(self);
        let mut state_rx = self.state_tx.subscribe();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut line = Vec::new();

            loop {
                line.clear();
                let read = tokio::select! {
                    result = reader.read_until(b'\n', &mut line) => Some(result),
                    _ = wait_for_shutdown(&mut shutdown_rx) => {
                        debug!(%stream, "Shutdown, stopping daemon output handler");
                        None
                    }
                    _ = wait_until_stopped(&mut state_rx) => {
                        debug!(%stream, "Daemon stopped, stopping daemon output handler");
                        None
                    }
                };

                match read {
                    None => return,
                    Some(Ok(0)) => {
                        debug!(%stream, "Daemon output closed");
                        return;
                    }
                    Some(Ok(_)) => {
                        let text = String::from_utf8_lossy(&line);
                        let text = text.trim_end_matches(['\r', '\n']);
                        match stream {
                            OutputStream::Stdout => info!(target: "idlegate::daemon", %stream, "{}", text),
                            OutputStream::Stderr => warn!(target: "idlegate::daemon", %stream, "{}", text),
                        }
                    }
                    Some(Err(e)) => {
                        error!(%stream, error = %e, "Error reading daemon output");
                        match supervisor.stop().await {
                            Ok(()) | Err(SupervisorError::AlreadyStopped) => {}
                            Err(e) => error!(error = %e, "Stopping daemon after output error failed"),
                        }
                        return;
                    }
                }
            }
        })
    }
}

async fn wait_until_stopped(state_rx: &mut watch::Receiver<ProcessState>) {
    loop {
        if *state_rx.borrow_and_update() == ProcessState::Stopped {
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Build a command that runs `command_line` through the platform shell
fn shell_command(command_line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    }

    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command_line);
        cmd
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) -> io::Result<()> {
    let pid = child
        .id()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "process already finished"))?;

    // Negative PID addresses the process group created at spawn
    let result = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn interrupt(child: &Child) -> io::Result<()> {
    signal_group(child, libc::SIGINT)
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interrupt is not supported on this platform",
    ))
}

/// Kill the daemon, treating "already finished" as success
fn force_kill(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    if let Err(e) = signal_group(child, libc::SIGKILL) {
        if !is_already_finished(&e) {
            return Err(e);
        }
    }

    match child.start_kill() {
        Ok(()) => Ok(()),
        Err(e) if is_already_finished(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_already_finished(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::InvalidInput {
        return true;
    }
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::ESRCH) {
        return true;
    }
    false
}

fn is_already_reaped(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::ECHILD) {
        return true;
    }
    let _ = e;
    false
}
