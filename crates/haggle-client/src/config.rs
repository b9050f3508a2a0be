//! Client configuration
//!
//! Resolution order, later wins:
//! 1. Built-in defaults (runtime directory paths, 10s launch timeout)
//! 2. TOML file passed to [`ClientConfig::load`]
//! 3. `HAGGLE_*` environment variables

use crate::error::{HaggleError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_LAUNCH_TIMEOUT_MS: u64 = 10_000;

pub const ENV_SOCKET: &str = "HAGGLE_SOCKET";
pub const ENV_PID_FILE: &str = "HAGGLE_PID_FILE";
pub const ENV_DAEMON: &str = "HAGGLE_DAEMON";
pub const ENV_LAUNCH_TIMEOUT_MS: &str = "HAGGLE_LAUNCH_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Daemon socket
    pub socket_path: PathBuf,
    /// PID file written by the daemon
    pub pid_file: PathBuf,
    /// Daemon executable; searched next to the current binary and on PATH when unset
    pub daemon_path: Option<PathBuf>,
    /// Extra arguments appended when spawning the daemon
    pub daemon_args: Vec<String>,
    pub launch_timeout_ms: u64,
    /// Upper bound on a single call round trip; unbounded when unset
    pub call_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: haggle_protocol::default_socket_path(),
            pid_file: haggle_protocol::default_pid_path(),
            daemon_path: None,
            daemon_args: Vec::new(),
            launch_timeout_ms: DEFAULT_LAUNCH_TIMEOUT_MS,
            call_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `HAGGLE_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load a TOML file, then apply the environment overlay
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| HaggleError::Config(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| HaggleError::Config(e.to_string()))
    }

    /// Overlay values from `lookup`, which maps variable names to values
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(socket) = lookup(ENV_SOCKET) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(pid_file) = lookup(ENV_PID_FILE) {
            self.pid_file = PathBuf::from(pid_file);
        }
        if let Some(daemon) = lookup(ENV_DAEMON) {
            self.daemon_path = Some(PathBuf::from(daemon));
        }
        if let Some(timeout) = lookup(ENV_LAUNCH_TIMEOUT_MS) {
            self.launch_timeout_ms = timeout.trim().parse().map_err(|_| {
                HaggleError::Config(format!(
                    "{} must be an integer number of milliseconds, got {:?}",
                    ENV_LAUNCH_TIMEOUT_MS, timeout
                ))
            })?;
        }
        Ok(())
    }

    /// Point both socket and PID file into `dir` (handy for tests and sandboxes)
    pub fn with_runtime_dir(mut self, dir: &Path) -> Self {
        self.socket_path = dir.join("haggle.sock");
        self.pid_file = dir.join("haggle.pid");
        self
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}
