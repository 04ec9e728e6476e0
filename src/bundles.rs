use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::RelayError;
use crate::saves::{Save, SearchFilter};

/// A named collection of saves sharing a download code, with aggregate
/// legality and generation metadata derived from its members.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Bundle {
    bundle_id: i64,
    upload_time: String,
    download_code: String,
    download_count: i64,
    legal: bool,
    min_gen: String,
    max_gen: String,
}

/// A bundle is legal only if every member save is legal.
pub fn aggregate_legal<I>(flags: I) -> bool
where
    I: IntoIterator<Item = bool>,
{
    flags.into_iter().all(|legal| legal)
}

/// Lexicographic generation bounds over a set of tags. Tags are compared as
/// strings, not numbers ("10" sorts before "2"); this matches the ordering
/// used everywhere a bundle's range is computed or queried.
pub fn gen_bounds(tags: &[String]) -> Option<(String, String)> {
    let min = tags.iter().min()?;
    let max = tags.iter().max()?;
    Some((min.clone(), max.clone()))
}

impl Bundle {
    pub fn bundle_id(&self) -> i64 {
        self.bundle_id
    }
    pub fn upload_time(&self) -> &str {
        &self.upload_time
    }
    pub fn download_code(&self) -> &str {
        &self.download_code
    }
    pub fn download_count(&self) -> i64 {
        self.download_count
    }
    pub fn legal(&self) -> bool {
        self.legal
    }
    pub fn min_gen(&self) -> &str {
        &self.min_gen
    }
    pub fn max_gen(&self) -> &str {
        &self.max_gen
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Bundle {
            bundle_id: row.get(0)?,
            upload_time: row.get(1)?,
            download_code: row.get(2)?,
            download_count: row.get(3)?,
            legal: row.get(4)?,
            min_gen: row.get(5)?,
            max_gen: row.get(6)?,
        })
    }

    const COLUMNS: &str =
        "bundle_id, upload_time, download_code, download_count, legal, min_gen, max_gen";

    pub fn get_by_code(conn: &Connection, code: &str) -> Result<Option<Self>, RelayError> {
        conn.query_row(
            &format!(
                "SELECT {} FROM bundles WHERE download_code = ?",
                Self::COLUMNS
            ),
            params![code],
            Self::from_row,
        )
        .optional()
        .map_err(RelayError::Database)
    }

    pub fn insert(
        conn: &Connection,
        upload_time: &str,
        download_code: &str,
        download_count: i64,
        legal: bool,
        min_gen: &str,
        max_gen: &str,
    ) -> Result<i64, RelayError> {
        conn.execute(
            "INSERT INTO bundles (upload_time, download_code, download_count, legal, min_gen, max_gen)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![upload_time, download_code, download_count, legal, min_gen, max_gen],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn attach_save(conn: &Connection, bundle_id: i64, save_id: i64) -> Result<(), RelayError> {
        conn.execute(
            "INSERT INTO bundle_saves (bundle_id, save_id) VALUES (?, ?)",
            params![bundle_id, save_id],
        )?;
        Ok(())
    }

    pub fn set_legal(conn: &Connection, bundle_id: i64, legal: bool) -> Result<(), RelayError> {
        conn.execute(
            "UPDATE bundles SET legal = ? WHERE bundle_id = ?",
            params![legal, bundle_id],
        )?;
        Ok(())
    }

    pub fn set_gen_bounds(
        conn: &Connection,
        bundle_id: i64,
        min_gen: &str,
        max_gen: &str,
    ) -> Result<(), RelayError> {
        conn.execute(
            "UPDATE bundles SET min_gen = ?, max_gen = ? WHERE bundle_id = ?",
            params![min_gen, max_gen, bundle_id],
        )?;
        Ok(())
    }

    /// Member saves, in attachment order.
    pub fn members(conn: &Connection, bundle_id: i64) -> Result<Vec<Save>, RelayError> {
        let mut stmt = conn.prepare(
            "SELECT s.save_id, s.upload_time, s.download_code, s.download_count,
                    s.generation, s.legal, s.payload
             FROM saves s
             JOIN bundle_saves bs ON bs.save_id = s.save_id
             WHERE bs.bundle_id = ?
             ORDER BY s.save_id",
        )?;
        let rows = stmt.query_map(params![bundle_id], Save::from_row)?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    /// Increment the bundle's download counter and every member's counter.
    pub fn increment_download_counts(conn: &Connection, bundle_id: i64) -> Result<(), RelayError> {
        let rows = conn.execute(
            "UPDATE bundles SET download_count = download_count + 1 WHERE bundle_id = ?",
            params![bundle_id],
        )?;
        if rows == 0 {
            return Err(RelayError::Error(format!(
                "Bundle id {bundle_id} not found for update"
            )));
        }
        conn.execute(
            "UPDATE saves SET download_count = download_count + 1
             WHERE save_id IN (SELECT save_id FROM bundle_saves WHERE bundle_id = ?)",
            params![bundle_id],
        )?;
        Ok(())
    }

    /// Bundles whose declared generation range falls inside the requested
    /// tags' lexicographic bounds.
    pub fn search(
        conn: &Connection,
        filter: &SearchFilter,
        page: u32,
        limit: u32,
    ) -> Result<(i64, Vec<Bundle>), RelayError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some((min, max)) = gen_bounds(&filter.generations) {
            clauses.push("min_gen >= ? AND max_gen <= ?".to_string());
            args.push(min);
            args.push(max);
        }
        if filter.legal_only {
            clauses.push("legal = 1".to_string());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let total: i64 = conn.query_row(
            &format!("SELECT count(*) FROM bundles {where_clause}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM bundles {} {} LIMIT {} OFFSET {}",
            Self::COLUMNS,
            where_clause,
            filter.order_clause(),
            limit,
            (page.saturating_sub(1)) * limit,
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), Self::from_row)?;

        let mut bundles = Vec::new();
        for row in rows {
            bundles.push(row?);
        }
        Ok((total, bundles))
    }
}
