//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_secs()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(from = current, to = CURRENT_VERSION, "applied schema migrations");
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Refresh tokens at the identity provider, shared by a mytoken tree
        CREATE TABLE refresh_tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Mytokens: adjacency list over parent_id
        CREATE TABLE mytokens (
            id BLOB PRIMARY KEY,                  -- 16 bytes, uuid
            parent_id BLOB REFERENCES mytokens(id),
            rt_id INTEGER NOT NULL REFERENCES refresh_tokens(id),
            oidc_iss TEXT NOT NULL,
            oidc_sub TEXT NOT NULL,
            name TEXT,
            capabilities BLOB NOT NULL,           -- CBOR list of capability names
            subtoken_capabilities BLOB,           -- CBOR, NULL = own capabilities
            created_at INTEGER NOT NULL,
            expires_at INTEGER,                   -- NULL = never
            ip TEXT NOT NULL,                     -- address the mytoken was created from
            revoked INTEGER NOT NULL DEFAULT 0
        );

        -- Restriction clauses, ordered by idx, with their usage counters
        CREATE TABLE restrictions (
            mytoken_id BLOB NOT NULL REFERENCES mytokens(id),
            idx INTEGER NOT NULL,
            clause BLOB NOT NULL,                 -- CBOR restriction clause
            usages_at INTEGER,                    -- NULL = unlimited
            usages_other INTEGER,
            usages_at_done INTEGER NOT NULL DEFAULT 0,
            usages_other_done INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (mytoken_id, idx)
        );

        -- Append-only ledger
        CREATE TABLE events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mytoken_id BLOB NOT NULL REFERENCES mytokens(id),
            event TEXT NOT NULL,
            time INTEGER NOT NULL,
            comment TEXT,
            ip TEXT NOT NULL,
            user_agent TEXT
        );

        -- Issued access tokens (fingerprints only)
        CREATE TABLE access_tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mytoken_id BLOB NOT NULL REFERENCES mytokens(id),
            fingerprint TEXT NOT NULL,
            ip TEXT NOT NULL,
            comment TEXT,
            scopes TEXT NOT NULL,                 -- space separated
            audiences TEXT NOT NULL,              -- space separated
            created_at INTEGER NOT NULL,
            expires_at INTEGER
        );

        -- Short tokens resolving to long-form mytokens
        CREATE TABLE short_tokens (
            short_token TEXT PRIMARY KEY,
            mytoken_id BLOB NOT NULL REFERENCES mytokens(id),
            token TEXT NOT NULL
        );

        -- Polling and transfer codes
        CREATE TABLE pending_exchanges (
            code TEXT PRIMARY KEY,
            consent_code TEXT UNIQUE,             -- NULL for transfer codes
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            consent TEXT NOT NULL,                -- pending | granted | declined
            flow BLOB,                            -- CBOR flow parameters
            mytoken_id BLOB REFERENCES mytokens(id),
            token TEXT,                           -- NULL until attached, NULL again once claimed
            claimed INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX idx_mytokens_parent ON mytokens(parent_id);
        CREATE INDEX idx_mytokens_subject ON mytokens(oidc_iss, oidc_sub);
        CREATE INDEX idx_events_mytoken ON events(mytoken_id, time);
        CREATE INDEX idx_access_tokens_mytoken ON access_tokens(mytoken_id);
        "#,
    )?;

    Ok(())
}

/// Get current time in seconds.
fn now_secs() -> i64 {
    mytoken_core::unix_now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "mytokens",
            "refresh_tokens",
            "restrictions",
            "events",
            "access_tokens",
            "short_tokens",
            "pending_exchanges",
            "schema_migrations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
