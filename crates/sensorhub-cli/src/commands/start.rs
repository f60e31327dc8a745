use std::path::Path;

use log::{error, info};

use sensorhub_core::config::ConfigTree;
use sensorhub_core::service::Service;

use crate::daemon::{self, ForkOutcome};
use crate::exit_code;

/// Fork into the background, load `configuration`, and run the service loop
/// until a shutdown signal arrives.
pub fn run(configuration: &Path, pidfile: &Path) -> u8 {
    if let Some(pid) = daemon::read_pid(pidfile) {
        if daemon::process_alive(pid) {
            error!("daemon already running with pid {pid}");
            return exit_code::DAEMON_ALREADY_RUNNING;
        }
        info!("removing stale pid file for dead pid {pid}");
        daemon::remove_pid_file(pidfile);
    }

    match daemon::fork_into_background() {
        Err(()) => {
            error!("fork failed: {}", std::io::Error::last_os_error());
            exit_code::FORK_FAILURE
        }
        Ok(ForkOutcome::Parent { exit_code }) => exit_code,
        Ok(ForkOutcome::Child) => run_child(configuration, pidfile),
    }
}

fn run_child(configuration: &Path, pidfile: &Path) -> u8 {
    let pid = unsafe { libc::getpid() };
    if let Err(e) = daemon::write_pid(pidfile, pid) {
        error!("failed to write pid file {}: {e}", pidfile.display());
        return exit_code::PID_FILE_ERROR;
    }

    let mut cfg = match ConfigTree::load_file(configuration) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load configuration {}: {e}", configuration.display());
            daemon::remove_pid_file(pidfile);
            return exit_code::DAEMON_INIT_FAILURE;
        }
    };
    cfg.set_defaults();

    let http_enabled = cfg.bool_or("http.enabled", true);
    let http_address = cfg.string_or("http.address", "localhost");
    let http_port = cfg.int_or("http.port", 16080) as u16;
    let modbus_enabled = cfg.bool_or("modbus.enabled", true);
    let modbus_port = cfg.int_or("modbus.port", 16502) as u16;

    let service = Service::from_config(&mut cfg);
    let state = service.state();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            daemon::remove_pid_file(pidfile);
            return exit_code::DAEMON_START_FAILURE;
        }
    };

    info!("sensor hub daemon starting, pid {pid}");
    runtime.block_on(async {
        if http_enabled {
            let state = state.clone();
            let address = http_address.clone();
            tokio::spawn(async move { sensorhub_server::run_server(state, &address, http_port).await });
        }
        if modbus_enabled {
            let state = state.clone();
            let address = http_address.clone();
            tokio::spawn(async move { sensorhub_modbus::run_server(state, &address, modbus_port).await });
        }
        service.run().await;
    });

    info!("sensor hub daemon stopped, pid {pid}");
    daemon::remove_pid_file(pidfile);
    exit_code::SUCCESS
}
