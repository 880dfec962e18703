//! SQLite-backed job store.
//!
//! Records live in a single table keyed by job id. A live in-process queue
//! per queue type carries freshly-inserted jobs to the stream; recovered
//! rows are read once when the stream starts and delivered first. Inserts
//! made while the recovery read is in flight can show up on both paths, so
//! the live side filters out ids the recovery read already produced.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::DateTime;
use courier_sync::AsyncQueue;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use sqlx::{Pool, Row, Sqlite};

use super::{InsertOptions, JobStore};
use crate::error::StoreError;
use crate::job::StoredJob;

/// A [`JobStore`] persisting to SQLite via an `sqlx` pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    table_name: String,
    /// One live queue per queue type, created when its stream starts.
    /// Inserts before that are DB-only; the recovery read picks them up.
    live: Arc<Mutex<HashMap<String, Arc<AsyncQueue<StoredJob>>>>>,
}

impl SqliteStore {
    pub fn new(pool: Pool<Sqlite>, table_name: &str) -> Self {
        Self {
            pool,
            table_name: table_name.to_string(),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates the jobs table and index if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let table = &self.table_name;
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                queue_type TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                data TEXT NOT NULL
            )"
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_queue_type
             ON {table} (queue_type, timestamp)"
        );
        sqlx::query(&index)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;

        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncQueue<StoredJob>>>> {
        match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert(&self, job: &StoredJob, options: InsertOptions) -> Result<(), StoreError> {
        if options.should_persist {
            let query = format!(
                "INSERT INTO {} (id, queue_type, timestamp, data) VALUES (?1, ?2, ?3, ?4)",
                self.table_name
            );
            sqlx::query(&query)
                .bind(&job.id)
                .bind(&job.queue_type)
                .bind(job.timestamp.timestamp_millis())
                .bind(job.data.to_string())
                .execute(&self.pool)
                .await
                .map_err(backend_error)?;
        }

        let live = self.lock();
        match live.get(&job.queue_type) {
            Some(queue) => queue.add(job.clone()),
            // No consumer yet: the recovery read will deliver this row. An
            // unpersisted job inserted before streaming starts is lost,
            // which is the documented trade of `should_persist: false`.
            None => {
                if !options.should_persist {
                    tracing::warn!(
                        job_id = %job.id,
                        queue_type = %job.queue_type,
                        "unpersisted job inserted before streaming started; it will not run"
                    );
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let query = format!("DELETE FROM {} WHERE id = ?1", self.table_name);
        sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    fn stream(&self, queue_type: &str) -> BoxStream<'static, StoredJob> {
        let queue = {
            let mut live = self.lock();
            Arc::clone(live.entry(queue_type.to_string()).or_default())
        };

        let pool = self.pool.clone();
        let table = self.table_name.clone();
        let queue_type = queue_type.to_string();
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let seen_for_filter = Arc::clone(&seen);

        let recovered = async move {
            let query = format!(
                "SELECT id, queue_type, timestamp, data FROM {table}
                 WHERE queue_type = ?1 ORDER BY timestamp ASC, id ASC"
            );
            let rows = match sqlx::query(&query).bind(&queue_type).fetch_all(&pool).await {
                Ok(rows) => rows,
                Err(error) => {
                    tracing::error!(%queue_type, error = %error, "failed to read stored jobs");
                    Vec::new()
                }
            };

            let mut jobs = Vec::with_capacity(rows.len());
            for row in rows {
                match decode_row(&row) {
                    Ok(job) => {
                        if let Ok(mut seen) = seen.lock() {
                            seen.insert(job.id.clone());
                        }
                        jobs.push(job);
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "skipping undecodable job row");
                    }
                }
            }
            jobs
        };

        stream::once(recovered)
            .map(stream::iter)
            .flatten()
            .chain(queue.stream().filter(move |job| {
                let fresh = seen_for_filter
                    .lock()
                    .map(|seen| !seen.contains(&job.id))
                    .unwrap_or(true);
                futures_util::future::ready(fresh)
            }))
            .boxed()
    }
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredJob, StoreError> {
    let id: String = row.get("id");
    let queue_type: String = row.get("queue_type");
    let timestamp_ms: i64 = row.get("timestamp");
    let data_text: String = row.get("data");

    let timestamp = DateTime::from_timestamp_millis(timestamp_ms)
        .ok_or_else(|| StoreError::Backend(format!("job {id} has invalid timestamp")))?;
    let data = serde_json::from_str(&data_text)?;

    Ok(StoredJob {
        id,
        timestamp,
        queue_type,
        data,
    })
}

fn backend_error(error: sqlx::Error) -> StoreError {
    StoreError::Backend(error.to_string())
}
