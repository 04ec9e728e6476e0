use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error), // Converts io::Error into RelayError automatically

    #[error("Database error: {0}")]
    Database(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Archive fetch failed: {0}")]
    Fetch(String),

    #[error("Verifier error: {0}")]
    Verifier(String),

    #[error("Legacy data consistency error: {0}")]
    Consistency(String),

    #[error("Operation interrupted")]
    Interrupted,

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}
