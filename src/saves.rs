use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::RelayError;

/// A single serialized game-save record.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Save {
    save_id: i64,
    upload_time: String,
    download_code: String,
    download_count: i64,
    generation: String,
    legal: bool,
    payload: String,
}

/// Search options shared by the saves and bundles list endpoints.
#[derive(Clone, Debug, Default)]
pub struct SearchFilter {
    pub generations: Vec<String>,
    pub legal_only: bool,
    pub sort_by_popularity: bool,
    pub descending: bool,
}

impl SearchFilter {
    pub fn order_clause(&self) -> String {
        let field = if self.sort_by_popularity {
            "download_count"
        } else {
            "upload_time"
        };
        let dir = if self.descending { "DESC" } else { "ASC" };
        format!("ORDER BY {field} {dir}")
    }
}

impl Save {
    pub fn save_id(&self) -> i64 {
        self.save_id
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
    pub fn generation(&self) -> &str {
        &self.generation
    }
    pub fn legal(&self) -> bool {
        self.legal
    }
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub(crate) fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Save {
            save_id: row.get(0)?,
            upload_time: row.get(1)?,
            download_code: row.get(2)?,
            download_count: row.get(3)?,
            generation: row.get(4)?,
            legal: row.get(5)?,
            payload: row.get(6)?,
        })
    }

    const COLUMNS: &str =
        "save_id, upload_time, download_code, download_count, generation, legal, payload";

    pub fn get_by_code(conn: &Connection, code: &str) -> Result<Option<Self>, RelayError> {
        conn.query_row(
            &format!("SELECT {} FROM saves WHERE download_code = ?", Self::COLUMNS),
            params![code],
            Self::from_row,
        )
        .optional()
        .map_err(RelayError::Database)
    }

    /// Uploads are deduplicated on the payload text: an identical payload
    /// resolves to the already-stored record.
    pub fn get_by_payload(conn: &Connection, payload: &str) -> Result<Option<Self>, RelayError> {
        conn.query_row(
            &format!("SELECT {} FROM saves WHERE payload = ?", Self::COLUMNS),
            params![payload],
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
        generation: &str,
        legal: bool,
        payload: &str,
    ) -> Result<i64, RelayError> {
        conn.execute(
            "INSERT INTO saves (upload_time, download_code, download_count, generation, legal, payload)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![upload_time, download_code, download_count, generation, legal, payload],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn increment_download_count(conn: &Connection, save_id: i64) -> Result<(), RelayError> {
        let rows = conn.execute(
            "UPDATE saves SET download_count = download_count + 1 WHERE save_id = ?",
            params![save_id],
        )?;
        if rows == 0 {
            return Err(RelayError::Error(format!(
                "Save id {save_id} not found for update"
            )));
        }
        Ok(())
    }

    pub fn search(
        conn: &Connection,
        filter: &SearchFilter,
        page: u32,
        limit: u32,
    ) -> Result<(i64, Vec<Save>), RelayError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if !filter.generations.is_empty() {
            let placeholders = vec!["?"; filter.generations.len()].join(", ");
            clauses.push(format!("generation IN ({placeholders})"));
            args.extend(filter.generations.iter().cloned());
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
            &format!("SELECT count(*) FROM saves {where_clause}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {} FROM saves {} {} LIMIT {} OFFSET {}",
            Self::COLUMNS,
            where_clause,
            filter.order_clause(),
            limit,
            (page.saturating_sub(1)) * limit,
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), Self::from_row)?;

        let mut saves = Vec::new();
        for row in rows {
            saves.push(row?);
        }
        Ok((total, saves))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn insert_sample(conn: &Connection, code: &str, generation: &str, legal: bool) -> i64 {
        Save::insert(
            conn,
            "2025-06-01T00:00:00Z",
            code,
            0,
            generation,
            legal,
            &format!("payload-{code}"),
        )
        .unwrap()
    }

    #[test]
    fn test_insert_and_lookup_by_code() {
        let db = Database::new_in_memory().unwrap();
        let conn = db.conn().unwrap();

        let id = insert_sample(&conn, "1111111111", "8", true);
        let save = Save::get_by_code(&conn, "1111111111").unwrap().unwrap();
        assert_eq!(save.save_id(), id);
        assert_eq!(save.generation(), "8");
        assert!(save.legal());

        assert!(Save::get_by_code(&conn, "0000000000").unwrap().is_none());
    }

    #[test]
    fn test_payload_dedup_lookup() {
        let db = Database::new_in_memory().unwrap();
        let conn = db.conn().unwrap();

        insert_sample(&conn, "2222222222", "7.1", false);
        let found = Save::get_by_payload(&conn, "payload-2222222222")
            .unwrap()
            .unwrap();
        assert_eq!(found.download_code(), "2222222222");
    }

    #[test]
    fn test_download_count_increments() {
        let db = Database::new_in_memory().unwrap();
        let conn = db.conn().unwrap();

        let id = insert_sample(&conn, "3333333333", "9", true);
        Save::increment_download_count(&conn, id).unwrap();
        Save::increment_download_count(&conn, id).unwrap();

        let save = Save::get_by_code(&conn, "3333333333").unwrap().unwrap();
        assert_eq!(save.download_count(), 2);
    }

    #[test]
    fn test_search_filters_and_counts() {
        let db = Database::new_in_memory().unwrap();
        let conn = db.conn().unwrap();

        insert_sample(&conn, "4444444444", "8", true);
        insert_sample(&conn, "5555555555", "8", false);
        insert_sample(&conn, "6666666666", "7.1", true);

        let filter = SearchFilter {
            generations: vec!["8".to_string()],
            legal_only: true,
            ..Default::default()
        };
        let (total, saves) = Save::search(&conn, &filter, 1, 30).unwrap();
        assert_eq!(total, 1);
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].download_code(), "4444444444");

        let all = Save::search(&conn, &SearchFilter::default(), 1, 2).unwrap();
        assert_eq!(all.0, 3);
        assert_eq!(all.1.len(), 2, "limit should cap the page");
    }
}
