use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use log::info;
use rusqlite::{Connection, OpenFlags};

use crate::error::RelayError;

/// Save row as stored by the legacy relay, legacy identifier included.
#[derive(Clone, Debug)]
pub struct LegacySave {
    pub id: i64,
    pub upload_time: String,
    pub download_code: String,
    pub download_count: i64,
    pub generation: String,
    pub legal: bool,
    pub payload: String,
}

/// Bundle row as stored by the legacy relay. Field order follows the legacy
/// schema, which placed the download code ahead of the timestamp.
#[derive(Clone, Debug)]
pub struct LegacyBundle {
    pub id: i64,
    pub download_code: String,
    pub upload_time: String,
    pub download_count: i64,
    pub legal: bool,
    pub min_gen: String,
    pub max_gen: String,
}

#[derive(Clone, Copy, Debug)]
pub struct LegacyMembership {
    pub save_id: i64,
    pub bundle_id: i64,
}

/// Complete in-memory copy of the legacy store. Downstream rebinding requires
/// a closed-world snapshot, so extraction is all-or-nothing.
pub struct LegacySnapshot {
    pub saves: Vec<LegacySave>,
    pub bundles: Vec<LegacyBundle>,
    pub memberships: Vec<LegacyMembership>,
}

/// Read the three legacy record sets in full. Any scan or decode error aborts
/// the whole extraction.
pub fn read_snapshot(path: &Path) -> Result<LegacySnapshot, RelayError> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let saves = read_saves(&conn)?;
    let bundles = read_bundles(&conn)?;
    let memberships = read_memberships(&conn)?;

    info!(
        "Legacy store read: {} saves, {} bundles, {} memberships",
        saves.len(),
        bundles.len(),
        memberships.len()
    );

    Ok(LegacySnapshot {
        saves,
        bundles,
        memberships,
    })
}

fn read_saves(conn: &Connection) -> Result<Vec<LegacySave>, RelayError> {
    let mut stmt = conn.prepare("SELECT * FROM saves")?;
    let rows = stmt.query_map([], |row| {
        Ok(LegacySave {
            id: row.get(0)?,
            upload_time: row.get(1)?,
            download_code: row.get(2)?,
            download_count: row.get(3)?,
            generation: row.get(4)?,
            legal: row.get(5)?,
            payload: row.get(6)?,
        })
    })?;

    let mut saves = Vec::new();
    for row in rows {
        saves.push(row?);
    }
    Ok(saves)
}

fn read_bundles(conn: &Connection) -> Result<Vec<LegacyBundle>, RelayError> {
    let mut stmt = conn.prepare("SELECT * FROM bundles")?;
    let rows = stmt.query_map([], |row| {
        Ok(LegacyBundle {
            id: row.get(0)?,
            download_code: row.get(1)?,
            upload_time: row.get(2)?,
            download_count: row.get(3)?,
            legal: row.get(4)?,
            min_gen: row.get(5)?,
            max_gen: row.get(6)?,
        })
    })?;

    let mut bundles = Vec::new();
    for row in rows {
        bundles.push(row?);
    }
    Ok(bundles)
}

fn read_memberships(conn: &Connection) -> Result<Vec<LegacyMembership>, RelayError> {
    let mut stmt = conn.prepare("SELECT save_id, bundle_id FROM bundle_saves")?;
    let rows = stmt.query_map([], |row| {
        Ok(LegacyMembership {
            save_id: row.get(0)?,
            bundle_id: row.get(1)?,
        })
    })?;

    let mut memberships = Vec::new();
    for row in rows {
        memberships.push(row?);
    }
    Ok(memberships)
}

const FETCH_TIMEOUT: Duration = Duration::from_secs(600);

/// Download an archived copy of the legacy store. Used only when no local
/// legacy store exists and the configuration asks for it; a failure here is
/// fatal to the migration run.
pub fn fetch_archive(url: &str, dest: &Path) -> Result<(), RelayError> {
    info!("Downloading legacy store archive from {url}");

    let agent = ureq::AgentBuilder::new().timeout(FETCH_TIMEOUT).build();
    let resp = agent
        .get(url)
        .call()
        .map_err(|e| RelayError::Fetch(format!("GET {url}: {e}")))?;

    let mut reader = resp.into_reader();
    let mut file = fs::File::create(dest)?;
    if let Err(e) = io::copy(&mut reader, &mut file) {
        // Leave no partial store behind - a truncated file would otherwise be
        // picked up as a real legacy store on the next run.
        drop(file);
        let _ = fs::remove_file(dest);
        return Err(RelayError::Fetch(format!("writing {}: {e}", dest.display())));
    }

    info!("Finished downloading legacy store archive");
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use rusqlite::{params, Connection};
    use std::path::Path;

    pub const LEGACY_SCHEMA_SQL: &str = "
        CREATE TABLE saves (
            id INTEGER PRIMARY KEY,
            upload_time TEXT NOT NULL,
            download_code TEXT NOT NULL,
            download_count INTEGER NOT NULL,
            generation TEXT NOT NULL,
            legal INTEGER NOT NULL,
            payload TEXT NOT NULL
        );
        CREATE TABLE bundles (
            id INTEGER PRIMARY KEY,
            download_code TEXT NOT NULL,
            upload_time TEXT NOT NULL,
            download_count INTEGER NOT NULL,
            legal INTEGER NOT NULL,
            min_gen TEXT NOT NULL,
            max_gen TEXT NOT NULL
        );
        CREATE TABLE bundle_saves (
            save_id INTEGER NOT NULL,
            bundle_id INTEGER NOT NULL
        );
    ";

    pub fn create_legacy_store(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(LEGACY_SCHEMA_SQL).unwrap();
        conn
    }

    pub fn insert_legacy_save(
        conn: &Connection,
        id: i64,
        code: &str,
        generation: &str,
        legal: bool,
        payload: &str,
    ) {
        conn.execute(
            "INSERT INTO saves (id, upload_time, download_code, download_count, generation, legal, payload)
             VALUES (?, '2019-03-14T09:00:00Z', ?, 5, ?, ?, ?)",
            params![id, code, generation, legal, payload],
        )
        .unwrap();
    }

    pub fn insert_legacy_bundle(
        conn: &Connection,
        id: i64,
        code: &str,
        legal: bool,
        min_gen: &str,
        max_gen: &str,
    ) {
        conn.execute(
            "INSERT INTO bundles (id, download_code, upload_time, download_count, legal, min_gen, max_gen)
             VALUES (?, ?, '2019-03-14T09:00:00Z', 2, ?, ?, ?)",
            params![id, code, legal, min_gen, max_gen],
        )
        .unwrap();
    }

    pub fn insert_legacy_membership(conn: &Connection, save_id: i64, bundle_id: i64) {
        conn.execute(
            "INSERT INTO bundle_saves (save_id, bundle_id) VALUES (?, ?)",
            params![save_id, bundle_id],
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_read_snapshot_preserves_legacy_ids_and_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        let conn = create_legacy_store(&path);

        insert_legacy_save(&conn, 41, "1234512345", "7.1", false, "b64-a");
        insert_legacy_save(&conn, 42, "6789067890", "8", true, "b64-b");
        insert_legacy_bundle(&conn, 7, "5555544444", true, "1", "1");
        insert_legacy_membership(&conn, 41, 7);
        drop(conn);

        let snapshot = read_snapshot(&path).unwrap();
        assert_eq!(snapshot.saves.len(), 2);
        assert_eq!(snapshot.bundles.len(), 1);
        assert_eq!(snapshot.memberships.len(), 1);

        let save = &snapshot.saves[0];
        assert_eq!(save.id, 41);
        assert_eq!(save.download_code, "1234512345");
        assert_eq!(save.download_count, 5);
        assert_eq!(save.generation, "7.1");
        assert!(!save.legal);
        assert_eq!(save.payload, "b64-a");

        let bundle = &snapshot.bundles[0];
        assert_eq!(bundle.id, 7);
        assert_eq!(bundle.min_gen, "1");

        assert_eq!(snapshot.memberships[0].save_id, 41);
        assert_eq!(snapshot.memberships[0].bundle_id, 7);
    }

    #[test]
    fn test_read_snapshot_fails_fast_on_bad_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE saves (id INTEGER PRIMARY KEY);")
            .unwrap();
        drop(conn);

        assert!(read_snapshot(&path).is_err());
    }

    #[test]
    fn test_missing_file_is_an_open_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.db");
        // The orchestrator checks existence first; a direct read on a missing
        // file must still fail rather than create one (read-only open).
        assert!(read_snapshot(&path).is_err());
        assert!(!path.exists());
    }
}
