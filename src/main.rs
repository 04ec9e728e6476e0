mod api;
mod bundles;
mod cli;
mod config;
mod database;
mod error;
mod migrate;
mod saves;
mod schema;
mod server;
mod utils;
mod verify;

use directories::ProjectDirs;
use log::error;

use crate::cli::Cli;
use crate::config::{Config, CONFIG};

fn main() {
    let Some(project_dirs) = ProjectDirs::from("dev", "pkrelay", "pkrelay") else {
        eprintln!("Could not determine the application data directory");
        std::process::exit(1);
    };

    let config = Config::load_config(&project_dirs);
    let log_spec = config.logging.spec();
    if CONFIG.set(config).is_err() {
        eprintln!("Configuration was already initialized");
        std::process::exit(1);
    }

    // The handle must stay alive for the lifetime of the process
    let _logger = match flexi_logger::Logger::try_with_str(&log_spec) {
        Ok(logger) => logger.start().ok(),
        Err(e) => {
            eprintln!("Invalid log specification '{log_spec}': {e}");
            None
        }
    };

    if let Err(err) = Cli::handle_command_line() {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
