use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

/// Path the active configuration was loaded from. Set once at startup so
/// the migration cleanup step can persist cleared flags back to the same file.
pub static CONFIG_PATH: OnceCell<PathBuf> = OnceCell::new();

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub pkrelay: String,
    pub ureq: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const PKRELAY_LEVEL: &str = "info";
    const UREQ_LEVEL: &str = "warn";

    fn default() -> Self {
        LoggingConfig {
            pkrelay: Self::PKRELAY_LEVEL.to_string(),
            ureq: Self::UREQ_LEVEL.to_string(),
        }
    }

    /// flexi_logger specification: dependencies default to warn, the
    /// configured levels apply per module.
    pub fn spec(&self) -> String {
        format!("warn, pkrelay={}, ureq={}", self.pkrelay, self.ureq)
    }

    fn ensure_valid(&mut self) {
        let mut str_original = self.pkrelay.clone();
        self.pkrelay = self.pkrelay.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.pkrelay.as_str()) {
            eprintln!(
                "Config error: pkrelay log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::PKRELAY_LEVEL
            );
            self.pkrelay = Self::PKRELAY_LEVEL.to_owned();
        }

        str_original = self.ureq.clone();
        self.ureq = self.ureq.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.ureq.as_str()) {
            eprintln!(
                "Config error: ureq log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::UREQ_LEVEL
            );
            self.ureq = Self::UREQ_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 9000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VerifierConfig {
    /// Path to the external legality console binary. Spawned once per
    /// verification call; see `verify::ConsoleVerifier`.
    pub command: String,
}

impl VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            command: "./bin/savecheck".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MigrationConfig {
    /// One-shot: import the legacy store on next startup.
    pub migrate_legacy: bool,
    /// Re-verify every legacy record's legality flag during the import.
    pub recheck_legality: bool,
    /// Fetch an archived copy of the legacy store if none exists locally.
    pub download_archive: bool,
    pub archive_url: String,
    /// Location of the legacy store file.
    pub legacy_path: String,
    verify_threads: usize,
}

impl MigrationConfig {
    const DEFAULT_VERIFY_THREADS: usize = 30;
    const MAX_VERIFY_THREADS: usize = 128;

    pub fn verify_threads(&self) -> usize {
        self.verify_threads
    }

    fn default() -> Self {
        MigrationConfig {
            migrate_legacy: false,
            recheck_legality: false,
            download_archive: false,
            archive_url: String::new(),
            legacy_path: "legacy.db".to_string(),
            verify_threads: Self::DEFAULT_VERIFY_THREADS,
        }
    }

    fn ensure_valid(&mut self) {
        if self.verify_threads == 0 || self.verify_threads > Self::MAX_VERIFY_THREADS {
            eprintln!(
                "Config error: verify_threads of {} is invalid - using default of {}",
                self.verify_threads,
                Self::DEFAULT_VERIFY_THREADS
            );
            self.verify_threads = Self::DEFAULT_VERIFY_THREADS;
        }
        if self.download_archive && self.archive_url.trim().is_empty() {
            eprintln!("Config error: download_archive is set but archive_url is empty - disabling download");
            self.download_archive = false;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    /// Database file path. Empty means "use the app data directory".
    pub path: String,
}

impl DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub verifier: VerifierConfig,
    pub migration: MigrationConfig,
}

impl Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            verifier: VerifierConfig::default(),
            migration: MigrationConfig::default(),
        }
    }

    /// Loads the configuration from a TOML file located in the app's data
    /// directory. If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");
        let config = Self::load_config_from(&config_path);
        let _ = CONFIG_PATH.set(config_path);
        config
    }

    pub fn load_config_from(config_path: &Path) -> Self {
        let default_config = Config::default();

        // If the config file doesn't exist, write the default configuration to disk.
        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        // Build a Figment instance that uses the defaults merged with the TOML
        // file (if it exists) and PKRELAY_-prefixed environment variables.
        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("PKRELAY_").split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    /// Persist this configuration. Used after a successful legacy migration
    /// to clear the one-shot migration flags.
    pub fn save(&self, config_path: &Path) -> Result<(), RelayError> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| RelayError::Error(format!("Failed to serialize config: {e}")))?;
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(config_path, toml_string)?;
        Ok(())
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.migration.ensure_valid();
    }

    pub fn get_server_host() -> String {
        CONFIG
            .get()
            .map(|c| c.server.host.clone())
            .unwrap_or_else(|| ServerConfig::default().host)
    }

    pub fn get_server_port() -> u16 {
        CONFIG
            .get()
            .map(|c| c.server.port)
            .unwrap_or_else(|| ServerConfig::default().port)
    }

    pub fn get_verify_threads() -> usize {
        CONFIG
            .get()
            .map(|c| c.migration.verify_threads())
            .unwrap_or(MigrationConfig::DEFAULT_VERIFY_THREADS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_written_and_reloaded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_config_from(&path);
        assert!(path.exists(), "default config should be written to disk");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.migration.verify_threads(), 30);
        assert!(!config.migration.migrate_legacy);

        // Reload picks up the same values from the written file
        let reloaded = Config::load_config_from(&path);
        assert_eq!(reloaded.server.host, config.server.host);
        assert_eq!(reloaded.migration.legacy_path, "legacy.db");
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[logging]
pkrelay = "chatty"
ureq = "warn"

[migration]
verify_threads = 0
"#,
        )
        .unwrap();

        let config = Config::load_config_from(&path);
        assert_eq!(config.logging.pkrelay, "info");
        assert_eq!(config.migration.verify_threads(), 30);
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[server]\nport = 9000\n")?;
            jail.set_env("PKRELAY_SERVER__PORT", "1234");

            let config = Config::load_config_from(Path::new("config.toml"));
            assert_eq!(config.server.port, 1234);
            Ok(())
        });
    }

    #[test]
    fn test_save_round_trip_preserves_cleared_flags() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[migration]
migrate_legacy = true
recheck_legality = true
"#,
        )
        .unwrap();

        let mut config = Config::load_config_from(&path);
        assert!(config.migration.migrate_legacy);

        config.migration.migrate_legacy = false;
        config.migration.recheck_legality = false;
        config.save(&path).unwrap();

        let reloaded = Config::load_config_from(&path);
        assert!(!reloaded.migration.migrate_legacy);
        assert!(!reloaded.migration.recheck_legality);
    }
}
