//! SQLite response sink.
//!
//! Every flushed batch is written inside a single transaction into the
//! `responses` table.  Each row is stamped with the flush time; the time an
//! answer was submitted never reaches disk.
//!
//! Because `rusqlite::Connection` is `!Send`, it is wrapped in a
//! `std::sync::Mutex` behind an `Arc` and every database operation runs on
//! `tokio::task::spawn_blocking`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use super::sink::{ResponseSink, StoredResponse};
use crate::coordination::store::now_iso8601;
use crate::dss::response::SurveyId;

/// SQLite-backed durable response storage.
pub struct SqliteResponseSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResponseSink {
    /// Open (or create) the database at `db_path` and initialise the
    /// `responses` table.
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)?;

        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            "PRAGMA busy_timeout=5000;\
             PRAGMA synchronous=NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS responses (\
                 id            INTEGER PRIMARY KEY AUTOINCREMENT,\
                 survey_id     INTEGER NOT NULL,\
                 question_id   INTEGER NOT NULL,\
                 question_type TEXT NOT NULL,\
                 answer        TEXT NOT NULL,\
                 persisted_at  TEXT NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_responses_survey ON responses(survey_id);",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl ResponseSink for SqliteResponseSink {
    fn persist_batch(
        &self,
        survey_id: SurveyId,
        responses: Vec<StoredResponse>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + '_>> {
        let conn = Arc::clone(&self.conn);
        Box::pin(async move {
            if responses.is_empty() {
                return Ok(0);
            }
            tokio::task::spawn_blocking(move || {
                let mut conn = conn.lock().map_err(|e| anyhow::anyhow!("Mutex poisoned: {e}"))?;
                let persisted_at = now_iso8601();
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO responses (survey_id, question_id, question_type, answer, persisted_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for response in &responses {
                        stmt.execute(params![
                            survey_id,
                            response.question_id,
                            response.question_type.as_str(),
                            response.answer,
                            persisted_at,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok::<usize, anyhow::Error>(responses.len())
            })
            .await?
        })
    }

    fn count_responses(
        &self,
        survey_id: SurveyId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let conn = Arc::clone(&self.conn);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().map_err(|e| anyhow::anyhow!("Mutex poisoned: {e}"))?;
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM responses WHERE survey_id = ?1",
                    params![survey_id],
                    |row| row.get(0),
                )?;
                Ok::<u64, anyhow::Error>(count as u64)
            })
            .await?
        })
    }
}
