//! Daemon process supervision
//!
//! Liveness comes from the daemon's PID file, health from whether its socket
//! accepts a connection. Neither is cached: every query reads the current
//! state, since the daemon may be started or killed by anyone at any time.

use crate::config::ClientConfig;
use crate::error::{HaggleError, Result, HAGGLE_ERROR};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const DAEMON_BINARY: &str = "haggle";
const INITIAL_POLL: Duration = Duration::from_millis(20);
const MAX_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    NotRunning,
    Running,
    /// The process is alive but its socket does not accept connections.
    Crashed,
}

impl DaemonStatus {
    /// Legacy integer status (0 not running, 1 running, 2 crashed).
    pub fn code(self) -> i32 {
        match self {
            DaemonStatus::NotRunning => 0,
            DaemonStatus::Running => 1,
            DaemonStatus::Crashed => 2,
        }
    }

    /// Integer status for a status query that itself failed.
    pub fn error_code() -> i32 {
        HAGGLE_ERROR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// A healthy daemon was already serving the socket; nothing was started.
    AlreadyRunning,
    Spawned { pid: u32 },
}

/// Launch progress observer.
///
/// Called with the time elapsed since the launch began, zero or more times
/// while waiting for the daemon to come up. Returning `Break` aborts the
/// launch and kills the child.
pub trait LaunchProgress: Send {
    fn on_progress(&mut self, elapsed: Duration) -> ControlFlow<()>;
}

impl<F> LaunchProgress for F
where
    F: FnMut(Duration) -> ControlFlow<()> + Send,
{
    fn on_progress(&mut self, elapsed: Duration) -> ControlFlow<()> {
        self(elapsed)
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    socket_path: PathBuf,
    pid_file: PathBuf,
    daemon_path: Option<PathBuf>,
    daemon_args: Vec<String>,
    launch_timeout: Duration,
}

impl Supervisor {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            pid_file: config.pid_file.clone(),
            daemon_path: config.daemon_path.clone(),
            daemon_args: config.daemon_args.clone(),
            launch_timeout: config.launch_timeout(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// PID of the running daemon, if its PID file names a live process.
    pub fn daemon_pid(&self) -> Option<u32> {
        let pid = haggle_protocol::read_pid_file(&self.pid_file)?;
        if process_alive(pid) {
            Some(pid)
        } else {
            debug!(pid, path = %self.pid_file.display(), "Stale daemon PID file");
            None
        }
    }

    pub fn daemon_status(&self) -> DaemonStatus {
        let socket_live = socket_accepts(&self.socket_path);
        match (self.daemon_pid(), socket_live) {
            (_, true) => DaemonStatus::Running,
            (Some(pid), false) => {
                debug!(pid, "Daemon process alive but socket is not accepting");
                DaemonStatus::Crashed
            }
            (None, false) => DaemonStatus::NotRunning,
        }
    }

    /// Start the daemon unless one is already serving the socket.
    ///
    /// Waits until the socket accepts connections or the launch timeout
    /// expires. On timeout or abort the child is killed and reaped before
    /// returning. A live daemon that has not bound its socket yet, such as
    /// one another launcher just started, gets the same timeout to come up
    /// before the launch fails; that process is never killed.
    pub async fn spawn_daemon(
        &self,
        path: Option<&Path>,
        mut progress: Option<&mut dyn LaunchProgress>,
    ) -> Result<SpawnOutcome> {
        match self.daemon_status() {
            DaemonStatus::Running => {
                debug!(socket = %self.socket_path.display(), "Daemon already running");
                return Ok(SpawnOutcome::AlreadyRunning);
            }
            DaemonStatus::Crashed => {
                if let Some(pid) = self.daemon_pid() {
                    if self.await_foreign(pid, &mut progress).await? {
                        return Ok(SpawnOutcome::AlreadyRunning);
                    }
                }
            }
            DaemonStatus::NotRunning => {}
        }

        let exe = self.resolve_binary(path);
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HaggleError::LaunchFailed(format!("{}: {}", parent.display(), e))
            })?;
        }

        debug!(
            "Spawning daemon: {} --socket {:?} --pid-file {:?} {:?}",
            exe.display(),
            self.socket_path,
            self.pid_file,
            self.daemon_args
        );

        let mut child = Command::new(&exe)
            .arg("--socket")
            .arg(&self.socket_path)
            .arg("--pid-file")
            .arg(&self.pid_file)
            .args(&self.daemon_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HaggleError::LaunchFailed(format!("{}: {}", exe.display(), e)))?;
        let pid = child.id().unwrap_or(0);
        info!(pid, "Spawned daemon process");

        let mut backoff = Backoff::new();
        loop {
            let elapsed = backoff.wait().await;

            if socket_accepts(&self.socket_path) {
                info!(pid, ?elapsed, "Daemon ready");
                return Ok(SpawnOutcome::Spawned { pid });
            }

            match child.try_wait() {
                Ok(Some(status)) => return self.exited_early(status),
                Ok(None) => {}
                Err(e) => warn!(pid, "Failed to poll daemon process: {}", e),
            }

            if let Some(observer) = progress.as_deref_mut() {
                if observer.on_progress(elapsed).is_break() {
                    info!(pid, "Daemon launch aborted");
                    self.reap(&mut child).await;
                    return Err(HaggleError::LaunchAborted);
                }
            }

            if elapsed >= self.launch_timeout {
                warn!(pid, ?elapsed, "Daemon did not become ready, killing it");
                self.reap(&mut child).await;
                return Err(HaggleError::LaunchTimeout(self.launch_timeout));
            }
        }
    }

    /// Wait for a daemon we did not start to bind its socket.
    ///
    /// `Ok(true)` once it serves, `Ok(false)` if the process went away and
    /// a fresh launch may proceed.
    async fn await_foreign(
        &self,
        pid: u32,
        progress: &mut Option<&mut dyn LaunchProgress>,
    ) -> Result<bool> {
        debug!(pid, "Daemon process alive without a socket, waiting for it");
        let mut backoff = Backoff::new();
        loop {
            let elapsed = backoff.wait().await;

            if socket_accepts(&self.socket_path) {
                info!(pid, ?elapsed, "Daemon started elsewhere is now ready");
                return Ok(true);
            }
            if !process_alive(pid) {
                debug!(pid, "Unresponsive daemon process exited");
                return Ok(false);
            }

            if let Some(observer) = progress.as_deref_mut() {
                if observer.on_progress(elapsed).is_break() {
                    return Err(HaggleError::LaunchAborted);
                }
            }

            if elapsed >= self.launch_timeout {
                return Err(HaggleError::LaunchFailed(format!(
                    "daemon process {} is alive but not answering on {}",
                    pid,
                    self.socket_path.display()
                )));
            }
        }
    }

    fn exited_early(&self, status: ExitStatus) -> Result<SpawnOutcome> {
        // Another launcher may have won the race for the socket
        if socket_accepts(&self.socket_path) {
            debug!(%status, "Spawned daemon exited but another daemon is serving");
            return Ok(SpawnOutcome::AlreadyRunning);
        }
        Err(HaggleError::LaunchFailed(format!(
            "daemon exited during startup ({})",
            status
        )))
    }

    async fn reap(&self, child: &mut Child) {
        let pid = child.id();
        if let Err(e) = child.kill().await {
            warn!(?pid, "Failed to kill daemon process: {}", e);
        }
        if pid.is_some() && haggle_protocol::read_pid_file(&self.pid_file) == pid {
            haggle_protocol::remove_pid_file(&self.pid_file);
        }
    }

    fn resolve_binary(&self, explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit.or(self.daemon_path.as_deref()) {
            return path.to_path_buf();
        }
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_BINARY)));
        match sibling {
            Some(path) if path.is_file() => path,
            _ => PathBuf::from(DAEMON_BINARY),
        }
    }
}

/// Exponential poll interval shared by the launch waits
struct Backoff {
    started: Instant,
    delay: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            delay: INITIAL_POLL,
        }
    }

    /// Sleep for the current interval and return the total time waited.
    async fn wait(&mut self) -> Duration {
        tokio::time::sleep(self.delay).await;
        self.delay = std::cmp::min(self.delay * 2, MAX_POLL);
        self.started.elapsed()
    }
}

/// Whether something is listening on `socket`.
pub fn socket_accepts(socket: &Path) -> bool {
    if !socket.exists() {
        return false;
    }
    match std::os::unix::net::UnixStream::connect(socket) {
        Ok(_) => true,
        Err(e) => {
            debug!("Socket exists but connection failed: {}", e);
            false
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence and permission
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

fn default_supervisor() -> Supervisor {
    let config = ClientConfig::from_env().unwrap_or_else(|e| {
        warn!("Ignoring invalid client environment: {}", e);
        ClientConfig::default()
    });
    Supervisor::new(&config)
}

/// PID of the daemon named by the environment's configuration.
pub fn daemon_pid() -> Option<u32> {
    default_supervisor().daemon_pid()
}

pub fn daemon_status() -> DaemonStatus {
    default_supervisor().daemon_status()
}

pub async fn spawn_daemon(
    path: Option<&Path>,
    progress: Option<&mut dyn LaunchProgress>,
) -> Result<SpawnOutcome> {
    default_supervisor().spawn_daemon(path, progress).await
}
