//! SQLite-backed coordination store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite library
//! is required.  Every async trait method moves its work onto
//! `tokio::task::spawn_blocking`, since a conditional update can sit in
//! `busy_timeout` for seconds while a peer holds the write lock.
//!
//! Conditional updates run inside a `BEGIN IMMEDIATE` transaction: SQLite
//! takes the write lock before the old value is read, so any concurrent
//! claimant (another connection, usually another process) blocks on
//! `busy_timeout` until the first one commits and then reads the new value.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::store::{now_iso8601, ConditionalUpdate, SettingsStore};

/// Coordination store backed by a SQLite database file shared by the fleet.
pub struct SqliteSettingsStore {
    /// The database connection, shared with blocking tasks.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSettingsStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates a private in-memory database (useful for
    /// single-process tests only; peers cannot share it).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        // journal_mode returns a row, so it cannot go through execute_batch.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            "
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the settings table if it does not already exist. Idempotent.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS settings (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| anyhow::anyhow!("Mutex poisoned: {e}"))?;
            f(&mut conn)
        })
        .await?
    }

    fn upsert(conn: &Connection, key: &str, value: &str, now: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )
    }
}

impl SettingsStore for SqliteSettingsStore {
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(self.blocking(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        }))
    }

    fn get_many(
        &self,
        keys: &[&str],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HashMap<String, String>>> + Send + '_>> {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        Box::pin(self.blocking(move |conn| {
            // A deferred read transaction gives one snapshot for all keys.
            let tx = conn.transaction()?;
            let mut values = HashMap::new();
            {
                let mut stmt = tx.prepare("SELECT value FROM settings WHERE key = ?1")?;
                for key in keys {
                    let value: Option<String> =
                        stmt.query_row(params![key], |row| row.get(0)).optional()?;
                    if let Some(value) = value {
                        values.insert(key, value);
                    }
                }
            }
            tx.commit()?;
            Ok(values)
        }))
    }

    fn seed(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(self.blocking(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, now_iso8601()],
            )?;
            Ok(inserted > 0)
        }))
    }

    fn set(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(self.blocking(move |conn| {
            Self::upsert(conn, &key, &value, &now_iso8601())?;
            Ok(())
        }))
    }

    fn try_conditional_update(
        &self,
        update: ConditionalUpdate,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        Box::pin(self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: Option<String> = tx
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![update.key],
                    |row| row.get(0),
                )
                .optional()?;

            if !update.matches(current.as_deref().unwrap_or("")) {
                // Dropping the transaction rolls it back and releases the lock.
                return Ok(false);
            }

            let now = now_iso8601();
            Self::upsert(&tx, &update.key, &update.new_value, &now)?;
            for (key, value) in &update.companions {
                Self::upsert(&tx, key, value, &now)?;
            }
            tx.commit()?;
            Ok(true)
        }))
    }
}
