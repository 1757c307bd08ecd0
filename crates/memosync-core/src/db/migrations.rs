//! Database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate(conn, 1, MIGRATION_V1)?;
    }
    if version < 2 {
        migrate(conn, 2, MIGRATION_V2)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: Option<i32> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })?;

    Ok(version.unwrap_or(0))
}

fn migrate(conn: &mut Connection, version: i32, statements: &str) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(statements)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version} (target {CURRENT_VERSION})");
    Ok(())
}

/// Version 1: memo and resource mirrors
const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS memos (
        id TEXT PRIMARY KEY,
        account_key TEXT NOT NULL,
        server_id TEXT,
        content TEXT NOT NULL,
        pinned INTEGER NOT NULL DEFAULT 0,
        row_status TEXT NOT NULL DEFAULT 'NORMAL',
        visibility TEXT NOT NULL DEFAULT 'PRIVATE',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        soft_deleted INTEGER NOT NULL DEFAULT 0,
        sync_state TEXT NOT NULL,
        last_synced_at INTEGER,
        local_revision INTEGER NOT NULL DEFAULT 0
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_memos_server_id
        ON memos(account_key, server_id) WHERE server_id IS NOT NULL;
    CREATE INDEX IF NOT EXISTS idx_memos_listing
        ON memos(account_key, soft_deleted, row_status, pinned DESC, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_memos_sync_state ON memos(account_key, sync_state);

    CREATE TABLE IF NOT EXISTS resources (
        id TEXT PRIMARY KEY,
        account_key TEXT NOT NULL,
        server_id TEXT,
        memo_id TEXT REFERENCES memos(id) ON DELETE CASCADE,
        filename TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        size INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        url TEXT,
        local_path TEXT,
        soft_deleted INTEGER NOT NULL DEFAULT 0,
        sync_state TEXT NOT NULL,
        last_synced_at INTEGER,
        local_revision INTEGER NOT NULL DEFAULT 0
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_resources_server_id
        ON resources(account_key, server_id) WHERE server_id IS NOT NULL;
    CREATE INDEX IF NOT EXISTS idx_resources_memo_id ON resources(memo_id);
    CREATE INDEX IF NOT EXISTS idx_resources_sync_state ON resources(account_key, sync_state);
";

/// Version 2: cached current-user snapshot
const MIGRATION_V2: &str = "
    CREATE TABLE IF NOT EXISTS users (
        account_key TEXT PRIMARY KEY,
        payload TEXT NOT NULL,
        refreshed_at INTEGER NOT NULL
    );
";

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrations() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();

        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
        for table in ["memos", "resources", "users"] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_server_ids_unique_per_account() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();

        let insert = "INSERT INTO memos (id, account_key, server_id, content, created_at, updated_at, sync_state)
                      VALUES (?1, ?2, 'memos/1', '', 0, 0, 'synced')";
        conn.execute(insert, ["a", "alice"]).unwrap();
        conn.execute(insert, ["b", "bob"]).unwrap();
        assert!(conn.execute(insert, ["c", "alice"]).is_err());
    }
}
