// Shared key/value stores backing the notice slot.
//
// `update` is the arbiter: it reads, decides and writes as one atomic
// step, so two publishers can never both see an empty slot and both write.
// The in-memory store serves one process; the SQLite store is shared by
// every process pointing at the same file.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::broadcast;

use crate::lock;

const CHANGE_CAPACITY: usize = 64;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Atomically replace the value of `key`. `apply` sees the current
    /// value and returns the replacement, or `None` to leave it as is.
    /// Returns whether a write happened.
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<&str>) -> Option<String>,
    ) -> Result<bool>;

    /// Keys changed through this store handle, if it can notify.
    fn subscribe(&self) -> Option<broadcast::Receiver<String>>;
}

fn notify(changes: &broadcast::Sender<String>, key: &str) {
    // No receivers is fine; the reconcile tick covers missed notifications.
    let _ = changes.send(key.to_string());
}

// ── In-memory ───────────────────────────────────────────────────────

/// Process-local store. Clones share the same map and change channel.
#[derive(Clone)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
    changes: broadcast::Sender<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self { values: Arc::default(), changes }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.values).insert(key.to_string(), value.to_string());
        notify(&self.changes, key);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<&str>) -> Option<String>,
    ) -> Result<bool> {
        let written = {
            let mut values = lock(&self.values);
            match apply(values.get(key).map(String::as_str)) {
                Some(next) => {
                    values.insert(key.to_string(), next);
                    true
                }
                None => false,
            }
        };
        if written {
            notify(&self.changes, key);
        }
        Ok(written)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.changes.subscribe())
    }
}

// ── SQLite ──────────────────────────────────────────────────────────

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE shared_kv (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

/// File-backed store shared across processes.
///
/// Writers serialize on `BEGIN IMMEDIATE`. Change notifications only cover
/// writes made through this handle; other processes are picked up by the
/// reconcile tick.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<String>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create mailbox store directory `{}`", parent.display())
            })?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open mailbox store at `{}`", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set mailbox store busy timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite pragmas for mailbox store")?;

        ensure_migration_table(&conn)?;
        apply_pending_migrations(&mut conn)?;

        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Ok(Self { conn: Mutex::new(conn), changes })
    }

    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&lock(&self.conn))
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        read_value(&lock(&self.conn), key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        write_value(&lock(&self.conn), key, value)?;
        notify(&self.changes, key);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<&str>) -> Option<String>,
    ) -> Result<bool> {
        let written = {
            let mut conn = lock(&self.conn);
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start mailbox store transaction")?;
            let current = read_value(&tx, key)?;
            match apply(current.as_deref()) {
                Some(next) => {
                    write_value(&tx, key, &next)?;
                    tx.commit().context("failed to commit mailbox store update")?;
                    true
                }
                None => false,
            }
        };
        if written {
            notify(&self.changes, key);
        }
        Ok(written)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.changes.subscribe())
    }
}

fn read_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM shared_kv WHERE key = ?1", params![key], |row| row.get(0))
        .optional()
        .with_context(|| format!("failed to read `{key}` from mailbox store"))
}

fn write_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO shared_kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value],
    )
    .with_context(|| format!("failed to write `{key}` to mailbox store"))?;
    Ok(())
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let current_version = current_schema_version(conn)?;
    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start migration transaction")?;
        // Another process may have migrated while we waited for the lock.
        if current_schema_version(&tx)? >= *version {
            continue;
        }
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply mailbox store migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
    }
    Ok(())
}
