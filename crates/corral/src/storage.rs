// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite persistence for credentials, sessions, and the usage log.
//!
//! All queries run on tokio-rusqlite's dedicated connection thread; callers
//! await results without blocking the runtime. Only SQL belongs inside
//! `call()` closures; hashing, cache updates, and JSON massaging happen on
//! the caller's side.

use std::path::Path;

use rusqlite::params;
use tracing::{debug, info};

use crate::credential::Credential;
use crate::session::{ContextMessage, Session};
use crate::usage::UsageEntry;

/// Storage-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> StorageError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => StorageError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => StorageError::Connection("connection closed".to_owned()),
        other => StorageError::Connection(other.to_string()),
    }
}

/// Durable store with a dedicated SQLite executor thread.
#[derive(Clone)]
pub struct Storage {
    conn: tokio_rusqlite::Connection,
    path: String,
}

impl Storage {
    /// Open (or create) the database, apply pragmas, run migrations.
    pub async fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let path_str = path.to_string_lossy().into_owned();
        let conn = tokio_rusqlite::Connection::open(path.to_path_buf())
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        conn.call(|conn| {
            run_migrations(conn)?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        info!(path = %path_str, "storage opened");
        Ok(Self { conn, path: path_str })
    }

    /// Execute a closure on the connection thread. SQL only.
    pub async fn call<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let outer = self.conn.call(move |conn| Ok(f(conn))).await;
        match outer {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the connection, waiting for pending operations.
    pub async fn close(self) -> StorageResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| StorageError::Connection(format!("failed to close: {e:?}")))?;
        info!(path = %self.path, "storage closed");
        Ok(())
    }

    // -- Credentials ----------------------------------------------------------

    pub async fn insert_credential(&self, cred: &Credential) -> StorageResult<()> {
        let cred = cred.clone();
        self.call(move |conn| {
            let permissions = serde_json::to_string(&cred.permissions)?;
            conn.execute(
                "INSERT INTO credentials
                 (id, owner_id, secret_sha256, name, permissions, hourly_ceiling,
                  active, expires_at_ms, last_used_ms, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    cred.id,
                    cred.owner_id,
                    cred.secret_sha256,
                    cred.name,
                    permissions,
                    cred.hourly_ceiling,
                    cred.active,
                    cred.expires_at_ms.map(|v| v as i64),
                    cred.last_used_ms.map(|v| v as i64),
                    cred.created_at_ms as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Load every active, unexpired credential row.
    pub async fn load_active_credentials(&self, now_ms: u64) -> StorageResult<Vec<Credential>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, secret_sha256, name, permissions, hourly_ceiling,
                        active, expires_at_ms, last_used_ms, created_at_ms
                 FROM credentials
                 WHERE active = 1 AND (expires_at_ms IS NULL OR expires_at_ms > ?1)",
            )?;
            let rows = stmt.query_map(params![now_ms as i64], row_to_credential)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn set_credential_active(&self, id: &str, active: bool) -> StorageResult<bool> {
        let id = id.to_owned();
        self.call(move |conn| {
            let n = conn.execute(
                "UPDATE credentials SET active = ?2 WHERE id = ?1",
                params![id, active],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn touch_credential_last_used(&self, id: &str, at_ms: u64) -> StorageResult<()> {
        let id = id.to_owned();
        self.call(move |conn| {
            conn.execute(
                "UPDATE credentials SET last_used_ms = ?2 WHERE id = ?1",
                params![id, at_ms as i64],
            )?;
            Ok(())
        })
        .await
    }

    // -- Sessions -------------------------------------------------------------

    pub async fn insert_session(&self, session: &Session) -> StorageResult<()> {
        let session = session.clone();
        self.call(move |conn| {
            let context = serde_json::to_string(&session.context)?;
            let metadata = serde_json::to_string(&session.metadata)?;
            conn.execute(
                "INSERT INTO sessions
                 (id, credential_id, tool_id, context, metadata, active,
                  created_at_ms, last_activity_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    session.id,
                    session.credential_id,
                    session.tool_id,
                    context,
                    metadata,
                    session.active,
                    session.created_at_ms as i64,
                    session.last_activity_ms as i64,
                    session.expires_at_ms as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        let id = id.to_owned();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, credential_id, tool_id, context, metadata, active,
                        created_at_ms, last_activity_ms, expires_at_ms
                 FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Write a full session row back (context, metadata, flags, timestamps).
    pub async fn update_session(&self, session: &Session) -> StorageResult<bool> {
        let session = session.clone();
        self.call(move |conn| {
            let context = serde_json::to_string(&session.context)?;
            let metadata = serde_json::to_string(&session.metadata)?;
            let n = conn.execute(
                "UPDATE sessions
                 SET context = ?2, metadata = ?3, active = ?4,
                     last_activity_ms = ?5, expires_at_ms = ?6
                 WHERE id = ?1",
                params![
                    session.id,
                    context,
                    metadata,
                    session.active,
                    session.last_activity_ms as i64,
                    session.expires_at_ms as i64,
                ],
            )?;
            Ok(n > 0)
        })
        .await
    }

    /// Mark every expired active session inactive; returns the affected ids.
    pub async fn sweep_expired_sessions(&self, now_ms: u64) -> StorageResult<Vec<String>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions WHERE active = 1 AND expires_at_ms <= ?1",
            )?;
            let rows = stmt.query_map(params![now_ms as i64], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            if !ids.is_empty() {
                conn.execute(
                    "UPDATE sessions SET active = 0 WHERE active = 1 AND expires_at_ms <= ?1",
                    params![now_ms as i64],
                )?;
            }
            Ok(ids)
        })
        .await
    }

    // -- Usage log ------------------------------------------------------------

    pub async fn insert_usage(&self, entry: &UsageEntry) -> StorageResult<()> {
        let entry = entry.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO usage_log
                 (request_id, credential_id, endpoint, status, input_tokens,
                  output_tokens, latency_ms, error, remote_addr, client, at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    entry.request_id,
                    entry.credential_id,
                    entry.endpoint,
                    entry.status,
                    entry.input_tokens as i64,
                    entry.output_tokens as i64,
                    entry.latency_ms as i64,
                    entry.error,
                    entry.remote_addr,
                    entry.client,
                    entry.at_ms as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn count_usage_for_request(&self, request_id: &str) -> StorageResult<u32> {
        let request_id = request_id.to_owned();
        self.call(move |conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM usage_log WHERE request_id = ?1",
                params![request_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    pub async fn list_usage_for_credential(
        &self,
        credential_id: &str,
    ) -> StorageResult<Vec<UsageEntry>> {
        let credential_id = credential_id.to_owned();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, credential_id, endpoint, status, input_tokens,
                        output_tokens, latency_ms, error, remote_addr, client, at_ms
                 FROM usage_log WHERE credential_id = ?1 ORDER BY at_ms, id",
            )?;
            let rows = stmt.query_map(params![credential_id], row_to_usage)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}

fn row_to_credential(row: &rusqlite::Row<'_>) -> rusqlite::Result<Credential> {
    let permissions_json: String = row.get(4)?;
    let permissions: Vec<String> = serde_json::from_str(&permissions_json).unwrap_or_default();
    Ok(Credential {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        secret_sha256: row.get(2)?,
        name: row.get(3)?,
        permissions,
        hourly_ceiling: row.get(5)?,
        active: row.get(6)?,
        expires_at_ms: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        last_used_ms: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
        created_at_ms: row.get::<_, i64>(9)? as u64,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let context_json: String = row.get(3)?;
    let metadata_json: String = row.get(4)?;
    let context: Vec<ContextMessage> = serde_json::from_str(&context_json).unwrap_or_default();
    let metadata: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&metadata_json).unwrap_or_default();
    Ok(Session {
        id: row.get(0)?,
        credential_id: row.get(1)?,
        tool_id: row.get(2)?,
        context,
        metadata,
        active: row.get(5)?,
        created_at_ms: row.get::<_, i64>(6)? as u64,
        last_activity_ms: row.get::<_, i64>(7)? as u64,
        expires_at_ms: row.get::<_, i64>(8)? as u64,
    })
}

fn row_to_usage(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageEntry> {
    Ok(UsageEntry {
        request_id: row.get(0)?,
        credential_id: row.get(1)?,
        endpoint: row.get(2)?,
        status: row.get(3)?,
        input_tokens: row.get::<_, i64>(4)? as u64,
        output_tokens: row.get::<_, i64>(5)? as u64,
        latency_ms: row.get::<_, i64>(6)? as u64,
        error: row.get(7)?,
        remote_addr: row.get(8)?,
        client: row.get(9)?,
        at_ms: row.get::<_, i64>(10)? as u64,
    })
}

// -- Migrations ---------------------------------------------------------------

/// Current schema version.
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations, tracked in the `migrations` table.
pub fn run_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM migrations", [], |row| row.get(0))
        .unwrap_or(0);

    debug!(current, target = CURRENT_VERSION, "running migrations");

    if current < 1 {
        migrate_v1_initial_schema(conn)?;
    }

    Ok(())
}

fn record_migration(conn: &rusqlite::Connection, version: i32, name: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        params![version, name],
    )?;
    debug!(version, name, "migration applied");
    Ok(())
}

fn migrate_v1_initial_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS credentials (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            secret_sha256 TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            permissions TEXT NOT NULL DEFAULT '[]',
            hourly_ceiling INTEGER,
            active INTEGER NOT NULL DEFAULT 1,
            expires_at_ms INTEGER,
            last_used_ms INTEGER,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            credential_id TEXT NOT NULL,
            tool_id TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            active INTEGER NOT NULL DEFAULT 1,
            created_at_ms INTEGER NOT NULL,
            last_activity_ms INTEGER NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_credential
            ON sessions(credential_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_expiry
            ON sessions(active, expires_at_ms);

        CREATE TABLE IF NOT EXISTS usage_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            credential_id TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            status INTEGER NOT NULL,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            remote_addr TEXT,
            client TEXT,
            at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_usage_credential
            ON usage_log(credential_id, at_ms);
        ",
    )?;
    record_migration(conn, 1, "initial schema")
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;
