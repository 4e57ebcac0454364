//! Thin adapter over the embedded SQL engine: opening the database file,
//! integrity checking and engine-reported sizing. Statement preparation,
//! parameter binding and row iteration go through `rusqlite` directly.

use std::fs;
use std::path::Path;

use rusqlite::Connection;

use crate::Result;

/// Upper bound on distinct prepared statements the archive keeps hot.
const STATEMENT_CACHE_CAPACITY: usize = 32;

/// Open the database file at `path`, creating it and any missing parent
/// directories. Write-ahead journaling is enabled so committed blocks stay
/// visible to readers while the next one is written.
pub(crate) fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    // The pragma returns the resulting mode as a row, so it cannot go
    // through `execute`.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    Ok(conn)
}

/// Run the engine's integrity check, returning every reported issue. A
/// healthy database yields an empty list.
pub(crate) fn integrity_check(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut issues = Vec::new();
    for row in rows {
        let message = row?;
        if message != "ok" {
            issues.push(message);
        }
    }
    Ok(issues)
}

/// Database size as reported by the engine: page count times page size.
pub(crate) fn database_size(conn: &Connection) -> Result<u64> {
    let page_count: u64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let page_size: u64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
    Ok(page_count * page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("data.sqlite");
        let _conn = open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn open_enables_write_ahead_journaling() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&dir.path().join("data.sqlite")).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn fresh_database_passes_integrity_check() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&dir.path().join("data.sqlite")).unwrap();
        assert!(integrity_check(&conn).unwrap().is_empty());
    }

    #[test]
    fn database_size_is_a_whole_number_of_pages() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&dir.path().join("data.sqlite")).unwrap();
        conn.execute("CREATE TABLE t (x INT)", []).unwrap();

        let size = database_size(&conn).unwrap();
        let page_size: u64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .unwrap();
        assert!(size > 0);
        assert_eq!(size % page_size, 0);
    }
}
