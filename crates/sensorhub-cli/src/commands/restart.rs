use std::path::Path;

use crate::commands::{start, stop};
use crate::daemon;
use crate::exit_code;

/// Stop the running daemon, if any, then start a new one.
pub fn run(configuration: &Path, pidfile: &Path) -> u8 {
    if daemon::read_pid(pidfile).is_some() {
        let code = stop::run(pidfile);
        if code != exit_code::SUCCESS && code != exit_code::DAEMON_NOT_RUNNING {
            return code;
        }
    }
    start::run(configuration, pidfile)
}
