use std::path::Path;
use std::time::Duration;

use log::{error, info};

use crate::daemon;
use crate::exit_code;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SHUTDOWN_POLL_ATTEMPTS: u32 = 50;

/// Signal a running daemon to shut down and wait for it to exit.
pub fn run(pidfile: &Path) -> u8 {
    let Some(pid) = daemon::read_pid(pidfile) else {
        error!("no pid file at {}", pidfile.display());
        return exit_code::DAEMON_NOT_RUNNING;
    };
    if !daemon::process_alive(pid) {
        error!("daemon pid {pid} is not running");
        daemon::remove_pid_file(pidfile);
        return exit_code::DAEMON_NOT_RUNNING;
    }

    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        error!("failed to signal pid {pid}: {}", std::io::Error::last_os_error());
        return exit_code::STOP_FAILED;
    }

    for _ in 0..SHUTDOWN_POLL_ATTEMPTS {
        if !daemon::process_alive(pid) {
            daemon::remove_pid_file(pidfile);
            info!("daemon pid {pid} stopped");
            return exit_code::SUCCESS;
        }
        std::thread::sleep(SHUTDOWN_POLL_INTERVAL);
    }

    error!("daemon pid {pid} did not stop within {:?}", SHUTDOWN_POLL_INTERVAL * SHUTDOWN_POLL_ATTEMPTS);
    exit_code::STOP_FAILED
}
