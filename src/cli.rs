use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::info;

use crate::api::AppState;
use crate::config::{Config, CONFIG, CONFIG_PATH};
use crate::database::Database;
use crate::error::RelayError;
use crate::migrate::{MigrationOptions, Migrator};
use crate::server::WebServer;
use crate::verify::{ConsoleVerifier, Verifier};

#[derive(Parser)]
#[command(
    name = "pkrelay",
    version,
    about = "pkrelay: self-hosted relay for serialized game-save records"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay server (default if no command specified)
    Serve,

    /// Import the legacy store into the current one, then exit
    Migrate,
}

impl Cli {
    pub fn handle_command_line() -> Result<(), RelayError> {
        let args = Cli::parse();

        // Default to Serve if no command specified
        match args.command.unwrap_or(Command::Serve) {
            Command::Serve => Self::start_server(),
            Command::Migrate => Self::run_migration_command(),
        }
    }

    fn start_server() -> Result<(), RelayError> {
        let host = Config::get_server_host();
        let port = Config::get_server_port();

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| RelayError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(async {
            let db = Database::new(&Self::database_folder()?)?;
            let verifier = Self::verifier();

            let migrate_requested = CONFIG
                .get()
                .map(|c| c.migration.migrate_legacy)
                .unwrap_or(false);
            if migrate_requested {
                Self::migrate(&db, &verifier).await?;
            }

            let state = AppState {
                db,
                verifier,
            };
            WebServer::new(host, port).start(state).await
        })
    }

    fn run_migration_command() -> Result<(), RelayError> {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| RelayError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(async {
            let db = Database::new(&Self::database_folder()?)?;
            let verifier = Self::verifier();
            Self::migrate(&db, &verifier).await
        })
    }

    /// Run the legacy migration on a blocking thread, with Ctrl-C wired to
    /// the engine's interrupt token so an abandoned run rolls back cleanly.
    async fn migrate(db: &Database, verifier: &Arc<dyn Verifier>) -> Result<(), RelayError> {
        let config = CONFIG
            .get()
            .ok_or_else(|| RelayError::Error("configuration not loaded".to_string()))?;

        let options = MigrationOptions::from_config(
            &config.migration,
            CONFIG_PATH.get().cloned(),
        );
        let migrator = Migrator::new(db.clone(), Arc::clone(verifier), options);

        let interrupt_token = Arc::new(AtomicBool::new(false));
        let signal_token = Arc::clone(&interrupt_token);
        let signal_task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal_token.store(true, Ordering::Release);
            }
        });

        let result = tokio::task::spawn_blocking(move || migrator.run(&interrupt_token))
            .await
            .map_err(|e| RelayError::Error(format!("migration task panicked: {e}")))?;
        signal_task.abort();

        match result? {
            Some(_) => info!("Legacy store migration complete"),
            None => info!("No legacy store migration was needed"),
        }
        Ok(())
    }

    fn verifier() -> Arc<dyn Verifier> {
        let command = CONFIG
            .get()
            .map(|c| c.verifier.command.clone())
            .unwrap_or_else(|| "./bin/savecheck".to_string());
        Arc::new(ConsoleVerifier::new(command))
    }

    fn database_folder() -> Result<PathBuf, RelayError> {
        if let Some(config) = CONFIG.get() {
            if !config.database.path.trim().is_empty() {
                return Ok(PathBuf::from(config.database.path.trim()));
            }
        }

        let project_dirs = ProjectDirs::from("dev", "pkrelay", "pkrelay")
            .ok_or_else(|| RelayError::Error("Could not determine data directory".to_string()))?;
        Ok(project_dirs.data_local_dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_parsing_no_command_defaults_to_serve() {
        let result = Cli::try_parse_from(["pkrelay"]);
        assert!(result.is_ok(), "Should accept no command");

        let cli = result.unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(cli.command.unwrap_or(Command::Serve), Command::Serve));
    }

    #[test]
    fn test_cli_parsing_explicit_commands() {
        let cli = Cli::try_parse_from(["pkrelay", "serve"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Serve)));

        let cli = Cli::try_parse_from(["pkrelay", "migrate"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Migrate)));
    }

    #[test]
    fn test_cli_parsing_invalid_arguments() {
        assert!(Cli::try_parse_from(["pkrelay", "nonexistent-command"]).is_err());
        assert!(Cli::try_parse_from(["pkrelay", "serve", "--invalid-flag"]).is_err());
    }
}
