//! Command-line entry point for the sensor hub daemon.

mod commands;
mod daemon;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

/// Stable process exit codes. Kept numerically fixed across releases so
/// init scripts and monitoring can branch on them.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const INVALID_COMMAND_LINE: u8 = 10;
    pub const UNHANDLED_EXCEPTION: u8 = 11;
    pub const UNKNOWN_EXCEPTION: u8 = 12;
    pub const DAEMON_ALREADY_RUNNING: u8 = 13;
    pub const STOP_FAILED: u8 = 14;
    pub const FORK_FAILURE: u8 = 15;
    pub const DAEMON_INIT_FAILURE: u8 = 16;
    pub const DAEMON_NOT_RUNNING: u8 = 17;
    pub const PID_FILE_ERROR: u8 = 18;
    pub const DAEMON_START_FAILURE: u8 = 19;
}

#[derive(Parser)]
#[command(name = "sensor_hub")]
#[command(about = "Long-running sensor-aggregation daemon for XSens MT, u-blox UBX, and line-protocol devices")]
#[command(version = sensorhub_core::VERSION)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long = "configuration", short = 'c', global = true)]
    configuration: Option<PathBuf>,

    /// Path to the daemon's pid file.
    #[arg(long = "pidfile", short = 'p', global = true)]
    pidfile: Option<PathBuf>,

    /// Print version information
    #[arg(long = "version", short = 'v', action = clap::ArgAction::Version)]
    version: (),

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fork into the background and run the service loop
    Start,

    /// Signal a running daemon to shut down
    Stop,

    /// Stop, then start again with the same configuration
    Restart,

    /// Fill a configuration file's missing keys with their defaults and save it
    UpdateConfig,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // `--help`/`--version` surface as a clap "error" too; clap's own
            // exit_code() is 0 for those and nonzero for an actual usage error.
            let code = if e.exit_code() == 0 { exit_code::SUCCESS } else { exit_code::INVALID_COMMAND_LINE };
            return ExitCode::from(code);
        }
    };

    let configuration = cli
        .configuration
        .unwrap_or_else(sensorhub_core::config::default_config_file);
    let pidfile = cli.pidfile.unwrap_or_else(daemon::default_pid_file);

    let code = match cli.command {
        Commands::Start => commands::start::run(&configuration, &pidfile),
        Commands::Stop => commands::stop::run(&pidfile),
        Commands::Restart => commands::restart::run(&configuration, &pidfile),
        Commands::UpdateConfig => commands::update_config::run(&configuration),
    };
    ExitCode::from(code)
}
