//! Pid file bookkeeping and the double-fork dance that detaches the daemon
//! from its controlling terminal.
//!
//! `tokio`'s multi-threaded runtime must not exist yet when `fork()` is
//! called — only the calling thread survives a fork, and a runtime with
//! worker threads already parked would leave the child with a broken pool.
//! So daemonizing happens in `sensorhub-cli` itself, before
//! [`sensorhub_core::Service::from_config`] or any `tokio::runtime::Builder`
//! is touched, mirroring `original_source/src/main.cpp`'s use of POSIX
//! `daemon(3)` ahead of its `io_context` construction.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

pub fn default_pid_file() -> PathBuf {
    sensorhub_core::config::default_config_dir().join("sensor_hub.pid")
}

/// The pid recorded in `path`, if the file exists and parses.
pub fn read_pid(path: &Path) -> Option<libc::pid_t> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a process with this pid is alive, probed with signal 0.
pub fn process_alive(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

pub fn write_pid(path: &Path, pid: libc::pid_t) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, format!("{pid}\n"))
}

pub fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove pid file {}: {e}", path.display());
        }
    }
}

/// Outcome of [`fork_into_background`].
pub enum ForkOutcome {
    /// This is the parent process; it should exit with `code`.
    Parent { exit_code: u8 },
    /// This is the detached child; it should continue starting the service.
    Child,
}

/// Double-fork and detach from the controlling terminal, redirecting
/// `stdin`/`stdout`/`stderr` to `/dev/null`. Returns `Err(())` on any `fork()`
/// failure, leaving `errno` for the caller to log.
pub fn fork_into_background() -> Result<ForkOutcome, ()> {
    match unsafe { libc::fork() } {
        -1 => Err(()),
        0 => {
            if unsafe { libc::setsid() } == -1 {
                return Err(());
            }
            match unsafe { libc::fork() } {
                -1 => Err(()),
                0 => {
                    unsafe { libc::umask(0o022) };
                    let _ = std::env::set_current_dir("/");
                    redirect_standard_streams();
                    Ok(ForkOutcome::Child)
                }
                _ => Ok(ForkOutcome::Parent { exit_code: 0 }),
            }
        }
        _ => Ok(ForkOutcome::Parent { exit_code: 0 }),
    }
}

fn redirect_standard_streams() {
    unsafe {
        let devnull = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if devnull >= 0 {
            libc::dup2(devnull, libc::STDIN_FILENO);
            libc::dup2(devnull, libc::STDOUT_FILENO);
            libc::dup2(devnull, libc::STDERR_FILENO);
            if devnull > libc::STDERR_FILENO {
                libc::close(devnull);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_pid_then_read_pid_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sensor_hub.pid");
        write_pid(&path, 4242).unwrap();
        assert_eq!(read_pid(&path), Some(4242));
    }

    #[test]
    fn read_pid_is_none_for_missing_file() {
        let dir = tempdir().unwrap();
        assert_eq!(read_pid(&dir.path().join("missing.pid")), None);
    }

    #[test]
    fn process_alive_is_true_for_self() {
        let pid = unsafe { libc::getpid() };
        assert!(process_alive(pid));
    }

    #[test]
    fn remove_pid_file_is_a_no_op_when_absent() {
        let dir = tempdir().unwrap();
        remove_pid_file(&dir.path().join("missing.pid"));
    }
}
