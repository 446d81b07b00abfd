//! Schema versioning for the SQLite store.
//!
//! The schema version lives in SQLite's own `user_version` header field, so
//! no bookkeeping table is needed. Steps run in order inside one
//! transaction; a database written by a newer build is refused rather than
//! reinterpreted.

use rusqlite::{Connection, TransactionBehavior};

use crate::error::{Result, StoreError};

/// Ordered schema steps. Step `i` moves the database to version `i + 1`.
const STEPS: &[&str] = &[SCHEMA_V1];

/// Schema version this build writes.
pub const CURRENT_VERSION: u32 = STEPS.len() as u32;

/// Bring the schema up to [`CURRENT_VERSION`]. Safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let found = schema_version(conn)?;
    if found > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{} is newer than supported v{}",
            found, CURRENT_VERSION
        )));
    }
    if found == CURRENT_VERSION {
        return Ok(());
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    for (index, sql) in STEPS.iter().enumerate().skip(found as usize) {
        let target = index as u32 + 1;
        tx.execute_batch(sql).map_err(|e| {
            StoreError::Migration(format!("schema v{} -> v{}: {}", target - 1, target, e))
        })?;
        tx.pragma_update(None, "user_version", target)?;
    }
    tx.commit()?;

    tracing::info!(from = found, to = CURRENT_VERSION, "store schema migrated");
    Ok(())
}

/// Version recorded in the database header; 0 for a fresh file.
pub fn schema_version(conn: &Connection) -> Result<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Tree, peers, transfers and conflicts.
const SCHEMA_V1: &str = r#"
    -- Tree entries, tombstones included
    CREATE TABLE entries (
        path TEXT PRIMARY KEY,            -- normalized absolute path
        parent TEXT,                      -- NULL only for '/'
        kind INTEGER NOT NULL,            -- FileKind tag
        subscribed INTEGER NOT NULL,      -- 1 = content replicated here
        deleted INTEGER NOT NULL DEFAULT 0,
        version BLOB NOT NULL,            -- CBOR version vector
        updated_at INTEGER NOT NULL
    );

    -- Known peers, one row per public key
    CREATE TABLE peers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint BLOB NOT NULL UNIQUE, -- 32 bytes, blake3 of DER key
        display_name TEXT NOT NULL,
        first_seen INTEGER NOT NULL
    );

    -- In-flight downloads
    CREATE TABLE downloads (
        path TEXT NOT NULL,
        peer INTEGER NOT NULL,
        txn INTEGER NOT NULL,
        stage_path TEXT NOT NULL,
        received INTEGER NOT NULL DEFAULT 0,
        total_size INTEGER NOT NULL,
        version BLOB NOT NULL,
        PRIMARY KEY (path, peer)
    );

    -- Last transaction id issued per key; outlives the download row
    CREATE TABLE download_txns (
        path TEXT NOT NULL,
        peer INTEGER NOT NULL,
        last_txn INTEGER NOT NULL,
        PRIMARY KEY (path, peer)
    );

    -- Conflict records
    CREATE TABLE conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL,
        peer INTEGER NOT NULL,
        local_version BLOB NOT NULL,
        remote_version BLOB NOT NULL,
        detected_at INTEGER NOT NULL
    );

    CREATE INDEX idx_entries_parent ON entries(parent);
    CREATE INDEX idx_conflicts_path ON conflicts(path);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_fresh_database_reaches_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 0);
        migrate(&mut conn).unwrap();

        let tables = tables(&conn);
        for table in ["entries", "peers", "downloads", "download_txns", "conflicts"] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_reopen_is_a_no_op() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO conflicts (path, peer, local_version, remote_version, detected_at)
             VALUES ('/x', 2, x'a0', x'a0', 0)",
            [],
        )
        .unwrap();
        migrate(&mut conn).unwrap();

        let kept: u32 = conn
            .query_row("SELECT COUNT(*) FROM conflicts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kept, 1);
    }

    #[test]
    fn test_newer_schema_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", CURRENT_VERSION + 1).unwrap();

        let err = migrate(&mut conn).unwrap_err();
        assert!(matches!(err, StoreError::Migration(ref m) if m.contains("newer")));
        assert!(tables(&conn).is_empty());
    }

    #[test]
    fn test_failed_step_names_versions_and_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        // A clashing table makes the first step fail part way.
        conn.execute_batch("CREATE TABLE peers (id INTEGER)").unwrap();

        let err = migrate(&mut conn).unwrap_err();
        assert!(matches!(err, StoreError::Migration(ref m) if m.contains("v0 -> v1")));
        assert_eq!(schema_version(&conn).unwrap(), 0);
        assert_eq!(tables(&conn), vec!["peers".to_string()]);
    }
}
