use rand::Rng;
use rusqlite::{params, Connection};

use crate::error::RelayError;

/// Which table a download code must be unique within.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeKind {
    Save,
    Bundle,
}

pub struct Utils {}

impl Utils {
    /// Generate a 10-digit download code (no leading zero), retrying until it
    /// does not collide with an existing code of the same kind.
    pub fn generate_download_code(
        conn: &Connection,
        kind: CodeKind,
    ) -> Result<String, RelayError> {
        let table = match kind {
            CodeKind::Save => "saves",
            CodeKind::Bundle => "bundles",
        };

        let mut rng = rand::rng();
        loop {
            let mut code = rng.random_range(1..10u32).to_string();
            for _ in 0..9 {
                code.push_str(&rng.random_range(0..10u32).to_string());
            }

            let exists: bool = conn.query_row(
                &format!("SELECT count(*) FROM {table} WHERE download_code = ?"),
                params![code],
                |row| row.get::<_, i64>(0).map(|n| n > 0),
            )?;

            if !exists {
                return Ok(code);
            }
        }
    }

    /// Current time in the format stored in upload_time columns.
    pub fn now_rfc3339() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}
