use std::fs;
use std::io;
use std::path::{Path, PathBuf};

fn runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("haggle")
}

/// Default socket path for the daemon
///
/// `$XDG_RUNTIME_DIR/haggle/haggle.sock`, or `/tmp/haggle/haggle.sock`
/// when no runtime directory is available.
pub fn default_socket_path() -> PathBuf {
    runtime_dir().join("haggle.sock")
}

/// Default PID file path, next to the socket
pub fn default_pid_path() -> PathBuf {
    runtime_dir().join("haggle.pid")
}

pub fn remove_socket(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Write the current process id to `path`, creating parent directories
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, std::process::id().to_string())
}

/// Read a PID file; `None` if missing or unparseable
pub fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|contents| contents.trim().parse::<u32>().ok())
        .filter(|pid| *pid != 0)
}

pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}
