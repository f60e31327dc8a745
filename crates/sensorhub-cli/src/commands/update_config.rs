use std::path::Path;

use log::{error, info};

use sensorhub_core::config::ConfigTree;

use crate::exit_code;

/// Load `configuration`, fill in any missing keys with their defaults, and
/// write the result back. Does not require the daemon to be running.
pub fn run(configuration: &Path) -> u8 {
    let mut cfg = match ConfigTree::load_file(configuration) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load configuration {}: {e}", configuration.display());
            return exit_code::UNHANDLED_EXCEPTION;
        }
    };
    cfg.set_defaults();
    if let Err(e) = cfg.save(configuration) {
        error!("failed to save configuration {}: {e}", configuration.display());
        return exit_code::UNHANDLED_EXCEPTION;
    }
    info!("configuration updated: {}", configuration.display());
    exit_code::SUCCESS
}
