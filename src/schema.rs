pub const SCHEMA_VERSION: &str = "1";

pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

-- Individual serialized game-save records
CREATE TABLE IF NOT EXISTS saves (
    save_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    upload_time    TEXT NOT NULL,              -- RFC 3339; legacy rows carried verbatim
    download_code  TEXT NOT NULL UNIQUE,
    download_count INTEGER NOT NULL DEFAULT 0,
    generation     TEXT NOT NULL,              -- free-form tag, may encode sub-generations ("7.1")
    legal          BOOLEAN NOT NULL,
    payload        TEXT NOT NULL               -- base64; never decoded by the server
);

CREATE INDEX IF NOT EXISTS idx_saves_generation ON saves (generation);
CREATE INDEX IF NOT EXISTS idx_saves_payload ON saves (payload);

-- Named collections of saves sharing a download code
CREATE TABLE IF NOT EXISTS bundles (
    bundle_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    upload_time    TEXT NOT NULL,
    download_code  TEXT NOT NULL UNIQUE,
    download_count INTEGER NOT NULL DEFAULT 0,
    legal          BOOLEAN NOT NULL,           -- false if any member save is illegal
    min_gen        TEXT NOT NULL,              -- lexicographic bounds over member generations
    max_gen        TEXT NOT NULL
);

-- Many-to-many membership edges
CREATE TABLE IF NOT EXISTS bundle_saves (
    bundle_id INTEGER NOT NULL,
    save_id   INTEGER NOT NULL,
    PRIMARY KEY (bundle_id, save_id),
    FOREIGN KEY (bundle_id) REFERENCES bundles(bundle_id),
    FOREIGN KEY (save_id) REFERENCES saves(save_id)
);

CREATE INDEX IF NOT EXISTS idx_bundle_saves_save ON bundle_saves (save_id);

COMMIT;
"#;
